/*
[INPUT]:  One WsConn, outbound payloads, optional jobs for tagged replies
[OUTPUT]: In-order dispatch of inbound payloads to jobs and handlers
[POS]:    WebSocket layer - per-connection multiplexer with serial read/write loops
[UPDATE]: When changing dispatch rules, batching, or shutdown protocol
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::conn::WsConn;
use super::job::{JobRegistry, WsJob};
use super::message::{WsMsg, check_error, decode_frame};
use crate::config::{WsConfig, lookup_chan_cap};
use crate::error::{ExgateError, Result};

const RAW_LOG_MAX_BYTES: usize = 1024;

/// Receives everything a client reads that is not claimed by a job.
///
/// All three callbacks run on the client's read loop, one at a time and in
/// arrival order. `on_message` may await (e.g. on a full output queue); that
/// stalls reading for the whole connection.
#[async_trait]
pub trait WsHandler: Send + Sync {
    async fn on_message(&self, url: &str, msg: WsMsg);

    /// Malformed frames and error/status payloads
    fn on_error(&self, url: &str, err: &ExgateError) {
        warn!(url, error = %err, "ws error");
    }

    /// Called once per client, when its read loop stops
    fn on_close(&self, url: &str, err: Option<&ExgateError>) {
        match err {
            Some(err) => info!(url, error = %err, "ws closed"),
            None => info!(url, "ws closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    /// Caller asks the write loop to send a close frame and stop
    DoClose,
    /// Read loop reports the connection is gone
    Closed,
}

/// Multiplexer owning one connection and its read and write loops
pub struct WsClient {
    url: String,
    market_type: String,
    send_tx: mpsc::Sender<String>,
    control_tx: mpsc::Sender<Control>,
    jobs: Arc<JobRegistry>,
    chan_caps: HashMap<String, usize>,
    connected: Arc<AtomicBool>,
}

impl fmt::Debug for WsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClient")
            .field("url", &self.url)
            .field("market_type", &self.market_type)
            .field("connected", &self.is_connected())
            .field("pending_jobs", &self.jobs.len())
            .finish()
    }
}

impl WsClient {
    /// Take ownership of `conn` and spawn the read and write loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        url: impl Into<String>,
        market_type: impl Into<String>,
        conn: Arc<dyn WsConn>,
        handler: Arc<dyn WsHandler>,
        config: &WsConfig,
    ) -> Self {
        let url = url.into();
        let (send_tx, send_rx) = mpsc::channel(config.send_capacity.max(1));
        let (control_tx, control_rx) = mpsc::channel(1);
        let jobs = Arc::new(JobRegistry::default());
        let connected = Arc::new(AtomicBool::new(true));

        let dispatcher = Dispatcher {
            url: url.clone(),
            jobs: jobs.clone(),
            handler,
        };
        tokio::spawn(read_loop(
            conn.clone(),
            dispatcher,
            control_tx.clone(),
            connected.clone(),
        ));
        tokio::spawn(write_loop(url.clone(), conn, send_rx, control_rx));

        Self {
            url,
            market_type: market_type.into(),
            send_tx,
            control_tx,
            jobs,
            chan_caps: config.chan_caps.clone(),
            connected,
        }
    }

    /// Serialize `msg` and queue it for sending.
    ///
    /// A job is registered before the payload is queued, so its reply can never
    /// arrive first. Waits while the outbound queue is full.
    pub async fn write<T>(&self, msg: &T, job: Option<WsJob>) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_string(msg)?;
        if let Some(job) = job {
            if job.id.is_empty() {
                return Err(ExgateError::ParamRequired("WsJob.id".to_string()));
            }
            let id = job.id.clone();
            if !self.jobs.register(job) {
                debug!(url = %self.url, id = %id, "ws job already registered");
            }
        }
        self.send_tx.send(data).await.map_err(|_| ExgateError::Closed {
            url: self.url.clone(),
        })
    }

    /// Ask the write loop to send a close frame and shut the connection down
    pub async fn close(&self) {
        if self.control_tx.send(Control::DoClose).await.is_err() {
            debug!(url = %self.url, "ws client already stopped");
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn market_type(&self) -> &str {
        &self.market_type
    }

    /// False once the connection terminated; the client is then inert
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Configured output queue capacity for a subscription key (0 if none)
    pub fn chan_cap(&self, key: &str) -> usize {
        lookup_chan_cap(&self.chan_caps, key)
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn has_job(&self, id: &str) -> bool {
        self.jobs.contains(id)
    }
}

struct Dispatcher {
    url: String,
    jobs: Arc<JobRegistry>,
    handler: Arc<dyn WsHandler>,
}

impl Dispatcher {
    async fn handle_raw_msg(&self, text: &str) {
        match decode_frame(text) {
            Ok(msgs) => {
                for msg in msgs {
                    self.handle_msg(msg).await;
                }
            }
            Err(err) => {
                warn!(
                    url = %self.url,
                    error = %err,
                    msg = %truncate_for_log(text, RAW_LOG_MAX_BYTES),
                    "invalid ws msg"
                );
                self.handler.on_error(&self.url, &err);
            }
        }
    }

    async fn handle_msg(&self, msg: WsMsg) {
        if let Some(err) = check_error(&msg) {
            if let Some(id) = msg.get("id")
                && self.jobs.remove(id).is_some()
            {
                debug!(url = %self.url, id = %id, "ws job answered with error");
            }
            self.handler.on_error(&self.url, &err);
            return;
        }

        if let Some(job) = msg.get("id").and_then(|id| self.jobs.take_with_method(id)) {
            if let Some(method) = job.method.clone() {
                method.on_result(&self.url, msg, &job).await;
            }
            return;
        }

        self.handler.on_message(&self.url, msg).await;
    }
}

// Messages are handled inline, never on spawned tasks: delivery order across
// every consumer of this connection must equal arrival order.
async fn read_loop(
    conn: Arc<dyn WsConn>,
    dispatcher: Dispatcher,
    control_tx: mpsc::Sender<Control>,
    connected: Arc<AtomicBool>,
) {
    let url = dispatcher.url.clone();
    loop {
        match conn.read_msg().await {
            Ok(Some(text)) => dispatcher.handle_raw_msg(&text).await,
            Ok(None) => {
                info!(url = %url, "ws stream ended");
                dispatcher.handler.on_close(&url, None);
                break;
            }
            Err(err) => {
                error!(url = %url, error = %err, "read fail, ws closed");
                dispatcher.handler.on_close(&url, Some(&err));
                break;
            }
        }
    }
    // Cleared only after on_close, so the directory never hands out a
    // replacement while the old client's cleanup is still pending.
    connected.store(false, Ordering::SeqCst);
    // The write loop may already be gone.
    let _ = control_tx.send(Control::Closed).await;
}

async fn write_loop(
    url: String,
    conn: Arc<dyn WsConn>,
    mut send_rx: mpsc::Receiver<String>,
    mut control_rx: mpsc::Receiver<Control>,
) {
    pump_outbound(&url, conn.as_ref(), &mut send_rx, &mut control_rx).await;

    // Closing the transport ends the read loop, which marks the client disconnected.
    debug!(url = %url, "stop write ws");
    if let Err(err) = conn.close().await {
        error!(url = %url, error = %err, "close ws error");
    }
}

async fn pump_outbound(
    url: &str,
    conn: &dyn WsConn,
    send_rx: &mut mpsc::Receiver<String>,
    control_rx: &mut mpsc::Receiver<Control>,
) {
    loop {
        tokio::select! {
            biased;
            control = control_rx.recv() => {
                match control {
                    Some(Control::DoClose) => {
                        if let Err(err) = conn.write_close().await {
                            error!(url, error = %err, "write ws close error");
                        }
                    }
                    Some(Control::Closed) | None => {}
                }
                return;
            }
            outbound = send_rx.recv() => {
                let Some(first) = outbound else {
                    if let Err(err) = conn.write_close().await {
                        error!(url, error = %err, "write ws close error");
                    }
                    info!(url, "ws send queue closed");
                    return;
                };
                if let Err(err) = write_batch(url, conn, first, send_rx).await {
                    error!(url, error = %err, "write ws batch failed");
                    return;
                }
            }
        }
    }
}

/// Write `first` plus everything queued right now through one frame sink
async fn write_batch(
    url: &str,
    conn: &dyn WsConn,
    first: String,
    send_rx: &mut mpsc::Receiver<String>,
) -> Result<usize> {
    let mut writer = conn.next_writer().await?;
    if let Err(err) = writer.write(first).await {
        warn!(url, error = %err, "write ws fail");
    }

    let mut count = 1;
    let pending = send_rx.len();
    for _ in 0..pending {
        let Ok(next) = send_rx.try_recv() else {
            break;
        };
        if let Err(err) = writer.write(next).await {
            warn!(url, error = %err, "write ws fail");
        }
        count += 1;
    }

    writer.finish().await?;
    Ok(count)
}

fn truncate_for_log(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        return value.to_string();
    }
    let mut end = max_len;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    let mut out = String::with_capacity(end + 3);
    out.push_str(&value[..end]);
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::memory::MemoryConn;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<WsMsg>>,
        errors: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WsHandler for Recorder {
        async fn on_message(&self, _url: &str, msg: WsMsg) {
            self.messages.lock().push(msg);
        }

        fn on_error(&self, _url: &str, err: &ExgateError) {
            self.errors.lock().push(err.to_string());
        }
    }

    fn dispatcher(handler: Arc<Recorder>) -> Dispatcher {
        Dispatcher {
            url: "mem://unit".to_string(),
            jobs: Arc::new(JobRegistry::default()),
            handler,
        }
    }

    #[tokio::test]
    async fn test_error_payload_skips_dispatch_and_drops_job() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(recorder.clone());
        dispatcher.jobs.register(WsJob::new("9"));

        dispatcher
            .handle_raw_msg(r#"{"id":"9","error":{"code":2,"msg":"no"}}"#)
            .await;

        assert!(recorder.messages.lock().is_empty());
        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(!dispatcher.jobs.contains("9"));
    }

    #[tokio::test]
    async fn test_job_without_method_falls_through() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = dispatcher(recorder.clone());
        dispatcher.jobs.register(WsJob::new("5"));

        dispatcher.handle_raw_msg(r#"{"id":"5","result":null}"#).await;

        assert_eq!(recorder.messages.lock().len(), 1);
        assert!(dispatcher.jobs.contains("5"));
    }

    #[tokio::test]
    async fn test_write_requires_job_id() {
        let (conn, _peer) = MemoryConn::pair();
        let client = WsClient::start(
            "mem://unit",
            "spot",
            Arc::new(conn),
            Arc::new(Recorder::default()),
            &WsConfig::default(),
        );
        let err = client
            .write(&serde_json::json!({"method": "SUBSCRIBE"}), Some(WsJob::new("")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExgateError::ParamRequired(_)));
        assert_eq!(client.pending_jobs(), 0);
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("abc", 10), "abc");
        assert_eq!(truncate_for_log("abcdef", 3), "abc...");
        assert_eq!(truncate_for_log("ééé", 3), "é...");
    }
}
