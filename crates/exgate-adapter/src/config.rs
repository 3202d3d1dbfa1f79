/*
[INPUT]:  Connection options (handshake timeout, proxy, queue capacities, connector)
[OUTPUT]: Configuration consumed when a client is created
[POS]:    Configuration layer - client/exchange options
[UPDATE]: When adding connection options or changing defaults
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::ws::WsConnector;

/// Outbound queue capacity per client, in frames
pub const DEFAULT_SEND_CAPACITY: usize = 1024;

/// Handshake timeout used when none is configured
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

/// Output queue capacities seeded into every config
pub fn default_chan_caps() -> HashMap<String, usize> {
    HashMap::from([("@depth".to_string(), 1000)])
}

/// WebSocket client configuration
#[derive(Clone)]
pub struct WsConfig {
    pub handshake_timeout: Duration,
    pub proxy: Option<Url>,
    /// Per-key output queue capacity; keys are matched exactly or as a substring
    pub chan_caps: HashMap<String, usize>,
    pub send_capacity: usize,
    /// Replaces the network dialer, mainly for tests
    pub connector: Option<Arc<dyn WsConnector>>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            proxy: None,
            chan_caps: default_chan_caps(),
            send_capacity: DEFAULT_SEND_CAPACITY,
            connector: None,
        }
    }
}

impl fmt::Debug for WsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsConfig")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("proxy", &self.proxy.as_ref().map(Url::as_str))
            .field("chan_caps", &self.chan_caps)
            .field("send_capacity", &self.send_capacity)
            .field("connector", &self.connector.is_some())
            .finish()
    }
}

impl WsConfig {
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: Url) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Merge capacity overrides on top of the current map
    pub fn with_chan_caps<I, K>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = (K, usize)>,
        K: Into<String>,
    {
        for (key, cap) in caps {
            self.chan_caps.insert(key.into(), cap);
        }
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn WsConnector>) -> Self {
        self.connector = Some(connector);
        self
    }
}

/// Resolve the configured capacity for `key`.
///
/// An exact key wins; otherwise the longest configured pattern contained in
/// the key is used. Returns 0 when nothing matches.
pub fn lookup_chan_cap(caps: &HashMap<String, usize>, key: &str) -> usize {
    if let Some(cap) = caps.get(key) {
        return *cap;
    }
    caps.iter()
        .filter(|(pattern, _)| !pattern.is_empty() && key.contains(pattern.as_str()))
        .max_by_key(|(pattern, _)| pattern.len())
        .map(|(_, cap)| *cap)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WsConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(15));
        assert_eq!(config.send_capacity, 1024);
        assert_eq!(config.chan_caps.get("@depth"), Some(&1000));
        assert!(config.proxy.is_none());
        assert!(config.connector.is_none());
    }

    #[test]
    fn test_overrides_merge_over_defaults() {
        let config = WsConfig::default().with_chan_caps([("@trade", 50), ("@depth", 10)]);
        assert_eq!(config.chan_caps.get("@trade"), Some(&50));
        assert_eq!(config.chan_caps.get("@depth"), Some(&10));
    }

    #[test]
    fn test_lookup_chan_cap() {
        let caps = WsConfig::default()
            .with_chan_caps([("@depth20", 20), ("wss://a#exact", 7)])
            .chan_caps;
        assert_eq!(lookup_chan_cap(&caps, "wss://a#exact"), 7);
        assert_eq!(lookup_chan_cap(&caps, "wss://a#btcusdt@depth"), 1000);
        assert_eq!(lookup_chan_cap(&caps, "wss://a#btcusdt@depth20"), 20);
        assert_eq!(lookup_chan_cap(&caps, "wss://a#btcusdt@trade"), 0);
    }
}
