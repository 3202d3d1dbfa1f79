/*
[INPUT]:  Frames scripted by a test (text, binary, transport failures)
[OUTPUT]: In-memory WsConn plus a peer handle that observes writes and closes
[POS]:    WebSocket layer - test double for the transport
[UPDATE]: When the WsConn capability set changes
*/

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};

use super::conn::{FrameWriter, WsConn, WsConnector};
use crate::config::WsConfig;
use crate::error::{ExgateError, Result};

#[derive(Debug)]
enum MemoryFrame {
    Text(String),
    Binary(Vec<u8>),
    Fail(String),
    Eof,
}

#[derive(Debug)]
struct MemoryState {
    written: parking_lot::Mutex<Vec<String>>,
    written_tx: mpsc::UnboundedSender<String>,
    flushes: AtomicUsize,
    close_frames: AtomicUsize,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

/// Client side of an in-memory connection
#[derive(Debug)]
pub struct MemoryConn {
    inbound: Mutex<mpsc::UnboundedReceiver<MemoryFrame>>,
    loopback: mpsc::UnboundedSender<MemoryFrame>,
    state: Arc<MemoryState>,
}

/// Server side of an in-memory connection, driven by tests
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    tx: mpsc::UnboundedSender<MemoryFrame>,
    written_rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    state: Arc<MemoryState>,
}

impl MemoryConn {
    pub fn pair() -> (MemoryConn, MemoryPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (closed_tx, _closed_rx) = watch::channel(false);
        let state = Arc::new(MemoryState {
            written: parking_lot::Mutex::new(Vec::new()),
            written_tx,
            flushes: AtomicUsize::new(0),
            close_frames: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            closed_tx,
        });
        let conn = MemoryConn {
            inbound: Mutex::new(rx),
            loopback: tx.clone(),
            state: state.clone(),
        };
        let peer = MemoryPeer {
            tx,
            written_rx: Arc::new(Mutex::new(written_rx)),
            state,
        };
        (conn, peer)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ExgateError::WebSocket("memory connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl WsConn for MemoryConn {
    async fn close(&self) -> Result<()> {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            let _ = self.loopback.send(MemoryFrame::Eof);
            self.state.closed_tx.send_replace(true);
        }
        Ok(())
    }

    async fn write_close(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.close_frames.fetch_add(1, Ordering::SeqCst);
        // The peer answers a close frame by ending the stream.
        let _ = self.loopback.send(MemoryFrame::Eof);
        Ok(())
    }

    async fn next_writer(&self) -> Result<Box<dyn FrameWriter>> {
        self.ensure_open()?;
        Ok(Box::new(MemoryWriter {
            state: self.state.clone(),
            batch: Vec::new(),
        }))
    }

    async fn read_msg(&self) -> Result<Option<String>> {
        let mut inbound = self.inbound.lock().await;
        loop {
            match inbound.recv().await {
                Some(MemoryFrame::Text(text)) => return Ok(Some(text)),
                Some(MemoryFrame::Binary(_)) => continue,
                Some(MemoryFrame::Fail(reason)) => return Err(ExgateError::ReadFail(reason)),
                Some(MemoryFrame::Eof) | None => return Ok(None),
            }
        }
    }
}

struct MemoryWriter {
    state: Arc<MemoryState>,
    batch: Vec<String>,
}

#[async_trait]
impl FrameWriter for MemoryWriter {
    async fn write(&mut self, text: String) -> Result<()> {
        self.batch.push(text);
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(ExgateError::WebSocket("memory connection closed".to_string()));
        }
        let mut written = self.state.written.lock();
        for text in self.batch.drain(..) {
            let _ = self.state.written_tx.send(text.clone());
            written.push(text);
        }
        self.state.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.tx.send(MemoryFrame::Text(text.into()));
    }

    pub fn send_binary(&self, bytes: impl Into<Vec<u8>>) {
        let _ = self.tx.send(MemoryFrame::Binary(bytes.into()));
    }

    /// Make the client's next read fail with a transport error
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self.tx.send(MemoryFrame::Fail(reason.into()));
    }

    /// End the stream cleanly
    pub fn hang_up(&self) {
        let _ = self.tx.send(MemoryFrame::Eof);
    }

    /// Wait for the next frame the client flushed
    pub async fn next_written(&self) -> Option<String> {
        self.written_rx.lock().await.recv().await
    }

    pub fn written(&self) -> Vec<String> {
        self.state.written.lock().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state.flushes.load(Ordering::SeqCst)
    }

    pub fn close_frames(&self) -> usize {
        self.state.close_frames.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Wait until the client closed its end
    pub async fn closed(&self) {
        let mut rx = self.state.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Connector handing out in-memory connections, one fresh pair per dial
#[derive(Debug, Default)]
pub struct MemoryConnector {
    peers: parking_lot::Mutex<HashMap<String, MemoryPeer>>,
    refused: parking_lot::Mutex<HashMap<String, String>>,
    dials: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peer of the most recent connection dialed for `url`
    pub fn peer(&self, url: &str) -> Option<MemoryPeer> {
        self.peers.lock().get(url).cloned()
    }

    /// Make every dial of `url` fail until `accept` is called
    pub fn refuse(&self, url: impl Into<String>, reason: impl Into<String>) {
        self.refused.lock().insert(url.into(), reason.into());
    }

    pub fn accept(&self, url: &str) {
        self.refused.lock().remove(url);
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WsConnector for MemoryConnector {
    async fn connect(&self, url: &str, _config: &WsConfig) -> Result<Arc<dyn WsConn>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.refused.lock().get(url) {
            return Err(ExgateError::Connect(reason.clone()));
        }
        let (conn, peer) = MemoryConn::pair();
        self.peers.lock().insert(url.to_string(), peer);
        Ok(Arc::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_skips_binary_frames() {
        let (conn, peer) = MemoryConn::pair();
        peer.send_binary(vec![1u8, 2, 3]);
        peer.send_text("{\"a\":1}");
        assert_eq!(conn.read_msg().await.unwrap(), Some("{\"a\":1}".to_string()));
    }

    #[tokio::test]
    async fn test_read_failure_and_eof() {
        let (conn, peer) = MemoryConn::pair();
        peer.fail("reset by peer");
        assert!(matches!(
            conn.read_msg().await,
            Err(ExgateError::ReadFail(reason)) if reason == "reset by peer"
        ));
        peer.hang_up();
        assert_eq!(conn.read_msg().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_writer_flushes_batch() {
        let (conn, peer) = MemoryConn::pair();
        let mut writer = conn.next_writer().await.unwrap();
        writer.write("a".into()).await.unwrap();
        writer.write("b".into()).await.unwrap();
        assert!(peer.written().is_empty());
        writer.finish().await.unwrap();
        assert_eq!(peer.written(), vec!["a", "b"]);
        assert_eq!(peer.flush_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_final() {
        let (conn, peer) = MemoryConn::pair();
        conn.close().await.unwrap();
        assert!(peer.is_closed());
        assert!(conn.next_writer().await.is_err());
        assert!(conn.write_close().await.is_err());
        assert_eq!(conn.read_msg().await.unwrap(), None);
    }
}
