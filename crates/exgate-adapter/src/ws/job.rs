/*
[INPUT]:  Requests submitted with a correlation id
[OUTPUT]: One-shot completion callbacks matched by inbound frames
[POS]:    WebSocket layer - request/response correlation
[UPDATE]: When changing job lifecycle or callback signature
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::message::WsMsg;

/// Completion callback for a job, awaited on the client's read loop
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn on_result(&self, url: &str, msg: WsMsg, job: &WsJob);
}

#[async_trait]
impl<F> JobHandler for F
where
    F: Fn(&str, &WsMsg, &WsJob) + Send + Sync,
{
    async fn on_result(&self, url: &str, msg: WsMsg, job: &WsJob) {
        self(url, &msg, job)
    }
}

/// A pending request awaiting a tagged, one-time response
#[derive(Clone)]
pub struct WsJob {
    pub id: String,
    pub method: Option<Arc<dyn JobHandler>>,
    /// Caller data handed back to the callback
    pub context: serde_json::Value,
}

impl WsJob {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: None,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_method(mut self, method: impl JobHandler + 'static) -> Self {
        self.method = Some(Arc::new(method));
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

impl fmt::Debug for WsJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsJob")
            .field("id", &self.id)
            .field("method", &self.method.is_some())
            .field("context", &self.context)
            .finish()
    }
}

/// Outstanding jobs of one client, keyed by id
#[derive(Debug, Default)]
pub(crate) struct JobRegistry {
    jobs: Mutex<HashMap<String, WsJob>>,
}

impl JobRegistry {
    /// Returns false when the id was already registered; the old job is kept
    pub(crate) fn register(&self, job: WsJob) -> bool {
        let mut jobs = self.jobs.lock();
        if jobs.contains_key(&job.id) {
            return false;
        }
        jobs.insert(job.id.clone(), job);
        true
    }

    /// Remove and return the job for `id` if it carries a callback
    pub(crate) fn take_with_method(&self, id: &str) -> Option<WsJob> {
        let mut jobs = self.jobs.lock();
        if jobs.get(id).is_some_and(|job| job.method.is_some()) {
            return jobs.remove(id);
        }
        None
    }

    pub(crate) fn remove(&self, id: &str) -> Option<WsJob> {
        self.jobs.lock().remove(id)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.jobs.lock().contains_key(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.lock().len()
    }
}
