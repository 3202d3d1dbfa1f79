/*
[INPUT]:  Handler callbacks fired by clients under test
[OUTPUT]: Recorded events and polling helpers shared by integration tests
[POS]:    Integration tests - shared fixtures
[UPDATE]: When handler signatures change
*/

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use exgate_adapter::{ExgateError, MemoryConnector, WsConfig, WsExchange, WsHandler, WsJob, WsMsg};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(WsMsg),
    Job { id: String, msg: WsMsg },
    Error(String),
    Close(Option<String>),
}

/// Handler that forwards every callback to a channel
pub struct Recorder {
    tx: mpsc::UnboundedSender<Event>,
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }

    /// Job whose callback reports into the same event stream
    pub fn job(&self, id: &str) -> WsJob {
        let tx = self.tx.clone();
        WsJob::new(id).with_method(move |_url: &str, msg: &WsMsg, job: &WsJob| {
            let _ = tx.send(Event::Job {
                id: job.id.clone(),
                msg: msg.clone(),
            });
        })
    }
}

#[async_trait]
impl WsHandler for Recorder {
    async fn on_message(&self, _url: &str, msg: WsMsg) {
        let _ = self.tx.send(Event::Message(msg));
    }

    fn on_error(&self, _url: &str, err: &ExgateError) {
        let _ = self.tx.send(Event::Error(err.to_string()));
    }

    fn on_close(&self, _url: &str, err: Option<&ExgateError>) {
        let _ = self.tx.send(Event::Close(err.map(ToString::to_string)));
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Assert nothing else arrives within a short grace period
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Ok(event) = rx.try_recv() {
        panic!("unexpected event: {event:?}");
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn msg(pairs: &[(&str, &str)]) -> WsMsg {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn memory_exchange() -> (
    WsExchange,
    Arc<MemoryConnector>,
    mpsc::UnboundedReceiver<Event>,
) {
    let connector = Arc::new(MemoryConnector::new());
    let (recorder, rx) = Recorder::new();
    let config = WsConfig::default().with_connector(connector.clone());
    (WsExchange::new(config, recorder), connector, rx)
}
