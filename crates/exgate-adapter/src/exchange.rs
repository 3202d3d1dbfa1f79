/*
[INPUT]:  Endpoint URLs requested by adapters, shared handlers and config
[OUTPUT]: One live WsClient per URL plus the output channel registry
[POS]:    Directory layer - per-exchange client lookup and disconnect cleanup
[UPDATE]: When changing client creation, reuse, or cleanup-on-close rules
*/

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::WsConfig;
use crate::error::{ExgateError, Result};
use crate::registry::ChanRegistry;
use crate::ws::{TungsteniteConnector, WsClient, WsConnector, WsHandler, WsMsg};

struct DirEntry {
    generation: u64,
    client: Arc<WsClient>,
}

type Directory = Arc<Mutex<HashMap<String, DirEntry>>>;

/// Per-exchange state: the client directory and the output channel registry.
///
/// Nothing here is global; two exchanges never share clients or channels.
pub struct WsExchange {
    config: WsConfig,
    clients: Directory,
    dial_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    chans: Arc<ChanRegistry>,
    handler: Arc<dyn WsHandler>,
}

impl fmt::Debug for WsExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let urls: Vec<String> = self.clients.lock().keys().cloned().collect();
        f.debug_struct("WsExchange")
            .field("config", &self.config)
            .field("clients", &urls)
            .field("chans", &self.chans)
            .finish()
    }
}

impl WsExchange {
    pub fn new(config: WsConfig, handler: Arc<dyn WsHandler>) -> Self {
        let chans = Arc::new(ChanRegistry::with_caps(config.chan_caps.clone()));
        Self::with_chans(config, chans, handler)
    }

    /// Use a registry built by the caller, typically one the handler also routes into
    pub fn with_chans(
        config: WsConfig,
        chans: Arc<ChanRegistry>,
        handler: Arc<dyn WsHandler>,
    ) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
            dial_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            chans,
            handler,
        }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn chans(&self) -> &Arc<ChanRegistry> {
        &self.chans
    }

    /// Return the live client for `url`, dialing a new one if needed.
    ///
    /// A live client is returned without waiting on dials in progress.
    /// Concurrent calls for the same URL share one dial. A dial failure is
    /// returned and leaves no client behind.
    pub async fn get_client(&self, url: &str, market_type: &str) -> Result<Arc<WsClient>> {
        if let Some(client) = self.client(url) {
            return Ok(client);
        }
        let _dial = self.dial_lock.lock().await;
        if let Some(client) = self.client(url) {
            return Ok(client);
        }

        let conn = match &self.config.connector {
            Some(connector) => connector.connect(url, &self.config).await?,
            None => TungsteniteConnector.connect(url, &self.config).await?,
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let handler = Arc::new(DirectoryHandler {
            generation,
            clients: self.clients.clone(),
            chans: self.chans.clone(),
            inner: self.handler.clone(),
        });
        let client = Arc::new(WsClient::start(
            url,
            market_type,
            conn,
            handler,
            &self.config,
        ));
        self.clients.lock().insert(
            url.to_string(),
            DirEntry {
                generation,
                client: client.clone(),
            },
        );
        info!(url, market_type, generation, "ws client created");
        Ok(client)
    }

    /// The live client for `url`, if any
    pub fn client(&self, url: &str) -> Option<Arc<WsClient>> {
        self.clients
            .lock()
            .get(url)
            .filter(|entry| entry.client.is_connected())
            .map(|entry| entry.client.clone())
    }

    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.clients.lock().keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Close every client and forget it, closing its output queues first.
    /// Returns how many clients were asked to close.
    pub async fn close_all(&self) -> usize {
        let clients: Vec<Arc<WsClient>> = {
            let mut directory = self.clients.lock();
            let clients: Vec<Arc<WsClient>> =
                directory.drain().map(|(_, entry)| entry.client).collect();
            for client in &clients {
                let num = self.chans.remove_prefix(&format!("{}#", client.url()));
                debug!(url = client.url(), num, "closed out chan for ws client");
            }
            clients
        };
        for client in &clients {
            client.close().await;
        }
        info!(count = clients.len(), "ws clients closed");
        clients.len()
    }
}

/// Wraps the exchange's handler to clean up after a client's connection dies
struct DirectoryHandler {
    generation: u64,
    clients: Directory,
    chans: Arc<ChanRegistry>,
    inner: Arc<dyn WsHandler>,
}

#[async_trait]
impl WsHandler for DirectoryHandler {
    async fn on_message(&self, url: &str, msg: WsMsg) {
        self.inner.on_message(url, msg).await;
    }

    fn on_error(&self, url: &str, err: &ExgateError) {
        self.inner.on_error(url, err);
    }

    fn on_close(&self, url: &str, err: Option<&ExgateError>) {
        {
            // "<url>#" keys belong to the registered client only; close_all
            // has already cleaned up after the clients it drained.
            let mut clients = self.clients.lock();
            if clients
                .get(url)
                .is_some_and(|entry| entry.generation == self.generation)
            {
                clients.remove(url);
                let num = self.chans.remove_prefix(&format!("{url}#"));
                info!(url, num, generation = self.generation, "closed out chan for ws client");
            } else {
                debug!(url, generation = self.generation, "stale ws client closed, no cleanup");
            }
        }
        self.inner.on_close(url, err);
    }
}
