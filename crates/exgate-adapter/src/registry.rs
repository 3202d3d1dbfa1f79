/*
[INPUT]:  Subscription keys ("<url>#<topic>"), subscriber ids, routed messages
[OUTPUT]: Typed output queues with reference-counted lifetimes
[POS]:    Routing layer - per-exchange map from subscription key to consumer queue
[UPDATE]: When changing queue lifetime rules or capacity resolution
*/

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{default_chan_caps, lookup_chan_cap};
use crate::error::{ExgateError, Result};

/// Build the conventional subscription key for a topic on an endpoint
pub fn chan_key(url: &str, topic: &str) -> String {
    format!("{url}#{topic}")
}

enum OutTx<T> {
    Bounded(mpsc::Sender<T>),
    Unbounded(mpsc::UnboundedSender<T>),
}

impl<T> Clone for OutTx<T> {
    fn clone(&self) -> Self {
        match self {
            OutTx::Bounded(tx) => OutTx::Bounded(tx.clone()),
            OutTx::Unbounded(tx) => OutTx::Unbounded(tx.clone()),
        }
    }
}

enum OutRx<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

struct OutInner<T> {
    tx: Mutex<Option<OutTx<T>>>,
    rx: tokio::sync::Mutex<OutRx<T>>,
    /// Wakes senders parked on a full queue
    closed: CancellationToken,
    capacity: usize,
}

/// Output queue handle; clones share one queue.
///
/// Capacity 0 means unbounded. After `close`, buffered items can still be
/// received and `recv` then yields `None`.
pub struct OutChan<T> {
    inner: Arc<OutInner<T>>,
}

impl<T> Clone for OutChan<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for OutChan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutChan")
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.inner.tx.lock().is_none())
            .finish()
    }
}

impl<T: Send + 'static> OutChan<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = if capacity == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (OutTx::Unbounded(tx), OutRx::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(capacity);
            (OutTx::Bounded(tx), OutRx::Bounded(rx))
        };
        Self {
            inner: Arc::new(OutInner {
                tx: Mutex::new(Some(tx)),
                rx: tokio::sync::Mutex::new(rx),
                closed: CancellationToken::new(),
                capacity,
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Push a value, waiting while a bounded queue is full.
    ///
    /// Hands the value back if the queue is closed, including while waiting.
    pub async fn send(&self, value: T) -> std::result::Result<(), T> {
        let tx = self.inner.tx.lock().clone();
        match tx {
            Some(OutTx::Bounded(tx)) => {
                let permit = tokio::select! {
                    biased;
                    _ = self.inner.closed.cancelled() => return Err(value),
                    permit = tx.reserve() => permit,
                };
                match permit {
                    Ok(permit) => {
                        permit.send(value);
                        Ok(())
                    }
                    Err(_) => Err(value),
                }
            }
            Some(OutTx::Unbounded(tx)) => tx.send(value).map_err(|err| err.0),
            None => Err(value),
        }
    }

    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.inner.rx.lock().await;
        match &mut *rx {
            OutRx::Bounded(rx) => rx.recv().await,
            OutRx::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Non-blocking receive; `None` when empty or another task is receiving
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.inner.rx.try_lock().ok()?;
        match &mut *rx {
            OutRx::Bounded(rx) => rx.try_recv().ok(),
            OutRx::Unbounded(rx) => rx.try_recv().ok(),
        }
    }

    pub fn close(&self) {
        self.inner.tx.lock().take();
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// True if both handles point at the same queue
    pub fn same_channel(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

trait ErasedChan: Send + Sync {
    fn close(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<T: Send + 'static> ErasedChan for OutChan<T> {
    fn close(&self) {
        OutChan::close(self);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Default)]
struct RegistryState {
    chans: HashMap<String, Box<dyn ErasedChan>>,
    refs: HashMap<String, HashSet<String>>,
}

impl RegistryState {
    fn get_or_create<T, F>(
        &mut self,
        key: &str,
        create: F,
        cap: usize,
    ) -> Result<OutChan<T>>
    where
        T: Send + 'static,
        F: FnOnce(usize) -> OutChan<T>,
    {
        if let Some(existing) = self.chans.get(key) {
            return existing
                .as_any()
                .downcast_ref::<OutChan<T>>()
                .cloned()
                .ok_or_else(|| ExgateError::ChanTypeMismatch {
                    key: key.to_string(),
                });
        }
        let chan = create(cap);
        self.chans.insert(key.to_string(), Box::new(chan.clone()));
        debug!(key, cap, "create out chan");
        Ok(chan)
    }

    fn add_refs<I, S>(&mut self, key: &str, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ids = ids.into_iter().map(Into::into).peekable();
        if ids.peek().is_none() {
            return;
        }
        self.refs.entry(key.to_string()).or_default().extend(ids);
    }

    fn remove_chan(&mut self, key: &str) -> bool {
        match self.chans.remove(key) {
            Some(chan) => {
                chan.close();
                true
            }
            None => false,
        }
    }
}

/// Map from subscription key to output queue plus its subscriber set.
///
/// Every operation takes one lock, so creating, referencing and removing an
/// entry are atomic with respect to each other.
pub struct ChanRegistry {
    state: Mutex<RegistryState>,
    caps: HashMap<String, usize>,
}

impl Default for ChanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChanRegistry")
            .field("chans", &state.chans.len())
            .field("refs", &state.refs)
            .field("caps", &self.caps)
            .finish()
    }
}

impl ChanRegistry {
    /// Registry with the default capacity table (`@depth` = 1000)
    pub fn new() -> Self {
        Self::with_caps(default_chan_caps())
    }

    pub fn with_caps(caps: HashMap<String, usize>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            caps,
        }
    }

    /// Capacity a new queue for `key` gets when no override is passed
    pub fn default_cap(&self, key: &str) -> usize {
        lookup_chan_cap(&self.caps, key)
    }

    /// Return the queue for `key`, creating it with `create(cap)` if absent.
    ///
    /// `cap` is `cap_override`, else the configured default for the key, else 0.
    /// `create` runs under the registry lock.
    pub fn get_or_create<T, F>(
        &self,
        key: &str,
        create: F,
        cap_override: Option<usize>,
    ) -> Result<OutChan<T>>
    where
        T: Send + 'static,
        F: FnOnce(usize) -> OutChan<T>,
    {
        let cap = cap_override.unwrap_or_else(|| self.default_cap(key));
        self.state.lock().get_or_create(key, create, cap)
    }

    /// Create-or-get the queue and add subscribers in one step
    pub fn subscribe<T, F, I, S>(
        &self,
        key: &str,
        ids: I,
        create: F,
        cap_override: Option<usize>,
    ) -> Result<OutChan<T>>
    where
        T: Send + 'static,
        F: FnOnce(usize) -> OutChan<T>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cap = cap_override.unwrap_or_else(|| self.default_cap(key));
        let mut state = self.state.lock();
        let chan = state.get_or_create(key, create, cap)?;
        state.add_refs(key, ids);
        Ok(chan)
    }

    /// Push `value` to the queue for `key`.
    ///
    /// Returns false (and drops the value) when no queue exists, the queue
    /// holds another type, or it was closed meanwhile.
    pub async fn write_out<T: Send + 'static>(&self, key: &str, value: T) -> bool {
        let chan = {
            let state = self.state.lock();
            match state.chans.get(key) {
                Some(chan) => chan.as_any().downcast_ref::<OutChan<T>>().cloned(),
                None => {
                    warn!(key, "write ws out chan fail");
                    return false;
                }
            }
        };
        let Some(chan) = chan else {
            warn!(key, "ws out chan holds a different type");
            return false;
        };
        if chan.send(value).await.is_err() {
            debug!(key, "ws out chan closed before write");
            return false;
        }
        true
    }

    pub fn add_refs<I, S>(&self, key: &str, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state.lock().add_refs(key, ids);
    }

    /// Remove subscribers; the last one out closes and removes the queue.
    ///
    /// Returns the remaining subscriber count, or `None` for an unknown key.
    pub fn del_refs<I, S>(&self, key: &str, ids: I) -> Option<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock();
        let refs = state.refs.get_mut(key)?;
        for id in ids {
            refs.remove(id.as_ref());
        }
        let remaining = refs.len();
        if remaining == 0 {
            state.refs.remove(key);
            if state.remove_chan(key) {
                info!(key, "remove chan");
            }
        }
        Some(remaining)
    }

    /// Close and remove every queue whose key starts with `prefix`,
    /// whatever its subscriber count. Returns the number of queues closed.
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.lock();
        state.refs.retain(|key, _| !key.starts_with(prefix));
        let keys: Vec<String> = state
            .chans
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        let mut removed = 0;
        for key in &keys {
            if state.remove_chan(key) {
                removed += 1;
            }
        }
        removed
    }

    /// Close and remove everything
    pub fn clear(&self) -> usize {
        self.remove_prefix("")
    }

    /// True if a queue exists for `key`
    pub fn contains(&self, key: &str) -> bool {
        self.state.lock().chans.contains_key(key)
    }

    pub fn ref_count(&self, key: &str) -> Option<usize> {
        self.state.lock().refs.get(key).map(HashSet::len)
    }

    pub fn len(&self) -> usize {
        self.state.lock().chans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().chans.keys().cloned().collect();
        keys.sort();
        keys
    }
}
