/*
[INPUT]:  TapConfig streams and subscriptions, shutdown token
[OUTPUT]: JSON lines for every routed stream message
[POS]:    Tap runtime - subscribe, route by topic, print
[UPDATE]: When changing routing, printing, or teardown
*/

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use exgate_adapter::{
    ChanRegistry, ExgateError, OutChan, WsConfig, WsExchange, WsHandler, WsJob, WsMsg, chan_key,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TapConfig;

/// Routes each message to `<url>#<topic>`, taking the topic from the
/// stream's configured field
pub struct TopicRouter {
    topic_fields: HashMap<String, String>,
    chans: Arc<ChanRegistry>,
}

impl TopicRouter {
    pub fn new(config: &TapConfig, chans: Arc<ChanRegistry>) -> Self {
        let topic_fields = config
            .streams
            .iter()
            .map(|stream| (stream.url.clone(), stream.topic_field.clone()))
            .collect();
        Self {
            topic_fields,
            chans,
        }
    }

    pub fn route_key(&self, url: &str, msg: &WsMsg) -> Option<String> {
        let field = self.topic_fields.get(url)?;
        let topic = msg.get(field).filter(|topic| !topic.is_empty())?;
        Some(chan_key(url, topic))
    }
}

#[async_trait]
impl WsHandler for TopicRouter {
    async fn on_message(&self, url: &str, msg: WsMsg) {
        let Some(key) = self.route_key(url, &msg) else {
            debug!(url, "message without topic, dropped");
            return;
        };
        self.chans.write_out(&key, msg).await;
    }

    fn on_close(&self, url: &str, err: Option<&ExgateError>) {
        match err {
            Some(err) => warn!(url, error = %err, "stream disconnected"),
            None => info!(url, "stream closed"),
        }
    }
}

/// One subscribed topic and the queue it is printed from
#[derive(Debug, Clone)]
pub struct Feed {
    pub key: String,
    pub chan: OutChan<WsMsg>,
}

pub struct Tap {
    config: TapConfig,
    exchange: WsExchange,
    subscriber_id: String,
}

impl Tap {
    pub fn new(config: TapConfig) -> Result<Self> {
        let ws_config = config.to_ws_config()?;
        Ok(Self::with_ws_config(config, ws_config))
    }

    pub fn with_ws_config(config: TapConfig, ws_config: WsConfig) -> Self {
        let chans = Arc::new(ChanRegistry::with_caps(ws_config.chan_caps.clone()));
        let router = Arc::new(TopicRouter::new(&config, chans.clone()));
        Self {
            config,
            exchange: WsExchange::with_chans(ws_config, chans, router),
            subscriber_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn exchange(&self) -> &WsExchange {
        &self.exchange
    }

    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Connect every stream, register its queues and send the subscribe requests
    pub async fn subscribe_all(&self) -> Result<Vec<Feed>> {
        let mut feeds = Vec::with_capacity(self.config.subscription_count());
        for stream in &self.config.streams {
            let client = self
                .exchange
                .get_client(&stream.url, &stream.market_type)
                .await
                .with_context(|| format!("connect {}", stream.url))?;

            for sub in &stream.subscriptions {
                let key = chan_key(&stream.url, &sub.topic);
                // Registered before the request goes out so no early message is lost.
                let chan = self
                    .exchange
                    .chans()
                    .subscribe::<WsMsg, _, _, _>(
                        &key,
                        [self.subscriber_id.as_str()],
                        OutChan::new,
                        None,
                    )
                    .with_context(|| format!("register {key}"))?;

                if let Some(request) = &sub.request {
                    let job = sub
                        .job_id
                        .as_deref()
                        .map(|id| confirmation_job(id, &sub.topic));
                    client
                        .write(request, job)
                        .await
                        .with_context(|| format!("send subscribe request for {key}"))?;
                }
                info!(key = %key, capacity = chan.capacity(), "subscribed");
                feeds.push(Feed { key, chan });
            }
        }
        Ok(feeds)
    }

    /// Drop this tap's references and close every connection
    pub async fn shutdown(&self, feeds: &[Feed]) -> usize {
        for feed in feeds {
            self.exchange
                .chans()
                .del_refs(&feed.key, [self.subscriber_id.as_str()]);
        }
        self.exchange.close_all().await
    }
}

fn confirmation_job(id: &str, topic: &str) -> WsJob {
    WsJob::new(id)
        .with_context(json!({ "topic": topic }))
        .with_method(|url: &str, msg: &WsMsg, job: &WsJob| {
            let topic = job
                .context
                .get("topic")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            info!(
                url,
                job_id = %job.id,
                topic,
                result = msg.get("result").map(String::as_str).unwrap_or_default(),
                "subscription confirmed"
            );
        })
}

pub fn format_line(ts: DateTime<Utc>, key: &str, msg: &WsMsg) -> Result<String> {
    let line = json!({
        "ts": ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        "key": key,
        "msg": msg,
    });
    serde_json::to_string(&line).context("encode output line")
}

/// Print a feed's messages as JSON lines until its queue closes or shutdown
pub fn spawn_printer(
    feed: Feed,
    lines: mpsc::UnboundedSender<String>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = feed.chan.recv() => msg,
            };
            let Some(msg) = msg else {
                debug!(key = %feed.key, "feed closed");
                break;
            };
            match format_line(Utc::now(), &feed.key, &msg) {
                Ok(line) => {
                    if lines.send(line).is_err() {
                        break;
                    }
                }
                Err(err) => warn!(key = %feed.key, error = %err, "drop unprintable message"),
            }
        }
    })
}

/// Write lines to `out` until every printer is gone, `max_messages` lines
/// were written, or shutdown. Returns the number written.
pub async fn pump_lines<W: Write>(
    mut lines: mpsc::UnboundedReceiver<String>,
    out: &mut W,
    max_messages: Option<u64>,
    shutdown: &CancellationToken,
) -> Result<u64> {
    let mut written = 0u64;
    while max_messages.is_none_or(|max| written < max) {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            break;
        };
        writeln!(out, "{line}").context("write output line")?;
        written += 1;
    }
    out.flush().context("flush output")?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn router() -> TopicRouter {
        let config = TapConfig::from_yaml(
            "streams:\n  - url: wss://a/ws\n  - url: wss://b/ws\n    topic_field: channel\n",
        )
        .unwrap();
        TopicRouter::new(&config, Arc::new(ChanRegistry::new()))
    }

    #[test]
    fn test_route_key_uses_stream_topic_field() {
        let router = router();
        let msg: WsMsg = [("stream".to_string(), "btcusdt@trade".to_string())].into();
        assert_eq!(
            router.route_key("wss://a/ws", &msg).as_deref(),
            Some("wss://a/ws#btcusdt@trade")
        );
        assert_eq!(router.route_key("wss://b/ws", &msg), None);
        assert_eq!(router.route_key("wss://unknown/ws", &msg), None);

        let channel: WsMsg = [("channel".to_string(), "tickers".to_string())].into();
        assert_eq!(
            router.route_key("wss://b/ws", &channel).as_deref(),
            Some("wss://b/ws#tickers")
        );
    }

    #[test]
    fn test_format_line() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let msg: WsMsg = [("p".to_string(), "1.5".to_string())].into();
        let line = format_line(ts, "u#t", &msg).unwrap();
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["ts"], "2026-01-02T03:04:05.000Z");
        assert_eq!(value["key"], "u#t");
        assert_eq!(value["msg"]["p"], "1.5");
    }

    #[tokio::test]
    async fn test_pump_lines_stops_at_max() {
        let (tx, rx) = mpsc::unbounded_channel();
        for n in 0..5 {
            tx.send(format!("line {n}")).unwrap();
        }
        let mut out = Vec::new();
        let written = pump_lines(rx, &mut out, Some(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(String::from_utf8(out).unwrap(), "line 0\nline 1\n");
    }

    #[tokio::test]
    async fn test_pump_lines_stops_when_senders_gone() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("only".to_string()).unwrap();
        drop(tx);
        let mut out = Vec::new();
        let written = pump_lines(rx, &mut out, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(written, 1);
    }
}
