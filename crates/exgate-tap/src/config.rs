/*
[INPUT]:  YAML configuration file
[OUTPUT]: Parsed tap configuration and the WsConfig derived from it
[POS]:    Configuration layer - stream and subscription setup
[UPDATE]: When adding new configuration options
*/

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use exgate_adapter::{WsConfig, default_chan_caps};
use serde::{Deserialize, Serialize};
use url::Url;

/// Top-level configuration for the tap
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TapConfig {
    /// Seconds allowed for the WebSocket handshake
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// HTTP proxy used to tunnel every connection
    #[serde(default)]
    pub proxy: Option<String>,
    /// Output queue capacity overrides, merged over the built-in table
    #[serde(default = "default_chan_caps")]
    pub chan_caps: HashMap<String, usize>,
    /// Endpoints to connect to
    pub streams: Vec<StreamConfig>,
}

/// One WebSocket endpoint and the topics read from it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default = "default_market_type")]
    pub market_type: String,
    /// Message field whose value names the topic (e.g. "stream")
    #[serde(default = "default_topic_field")]
    pub topic_field: String,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// A topic to print, plus the request that starts it
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriptionConfig {
    pub topic: String,
    /// Sent once after connecting; omitted for endpoints that push unasked
    #[serde(default)]
    pub request: Option<serde_json::Value>,
    /// Correlation id of the confirmation the server sends back
    #[serde(default)]
    pub job_id: Option<String>,
}

fn default_handshake_timeout_secs() -> u64 {
    15
}

fn default_market_type() -> String {
    "spot".to_string()
}

fn default_topic_field() -> String {
    "stream".to_string()
}

impl TapConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("parse config yaml")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            bail!("config has no streams");
        }
        if self.handshake_timeout_secs == 0 {
            bail!("handshake_timeout_secs must be positive");
        }
        if let Some(proxy) = &self.proxy {
            Url::parse(proxy).with_context(|| format!("invalid proxy url {proxy}"))?;
        }
        for stream in &self.streams {
            let url = Url::parse(&stream.url)
                .with_context(|| format!("invalid stream url {}", stream.url))?;
            if !matches!(url.scheme(), "ws" | "wss") {
                bail!("stream url {} must use ws or wss", stream.url);
            }
            if stream.topic_field.is_empty() {
                bail!("stream {} has an empty topic_field", stream.url);
            }
            for sub in &stream.subscriptions {
                if sub.topic.is_empty() {
                    bail!("stream {} has a subscription without topic", stream.url);
                }
                if sub.job_id.as_deref().is_some_and(str::is_empty) {
                    bail!("subscription {} has an empty job_id", sub.topic);
                }
                if sub.job_id.is_some() && sub.request.is_none() {
                    bail!("subscription {} has a job_id but no request", sub.topic);
                }
            }
        }
        Ok(())
    }

    pub fn subscription_count(&self) -> usize {
        self.streams.iter().map(|s| s.subscriptions.len()).sum()
    }

    pub fn to_ws_config(&self) -> Result<WsConfig> {
        let mut config = WsConfig::default()
            .with_handshake_timeout(Duration::from_secs(self.handshake_timeout_secs))
            .with_chan_caps(self.chan_caps.clone());
        if let Some(proxy) = &self.proxy {
            config = config.with_proxy(Url::parse(proxy).context("parse proxy url")?);
        }
        Ok(config)
    }
}
