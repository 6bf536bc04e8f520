//! Transport abstraction for the group channel.
//!
//! A transport owns at most one open socket. `recv()` blocks until a datagram
//! arrives or `close()` is called, in which case it fails with
//! [`TransportError::Closed`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use node_proto::Message;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transport is not open")]
    NotOpen,
    #[error("transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Bind to the group. Opening an already open transport is a no-op.
    async fn open(&self) -> Result<()>;

    /// Fire-and-forget a datagram to every group member.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Wait for the next datagram.
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Release the socket and wake any pending `recv()`.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Mock transport for testing: records sent datagrams and replays scripted inbound ones.
pub struct MockTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: watch::Sender<bool>,
    opens: AtomicUsize,
    fail_open: AtomicBool,
    fail_send: AtomicBool,
    recv_failures: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(true);
        Self {
            sent: Mutex::new(Vec::new()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            closed,
            opens: AtomicUsize::new(0),
            fail_open: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            recv_failures: AtomicUsize::new(0),
        }
    }

    /// Queue a datagram for the next `recv()`.
    pub fn push_inbound(&self, payload: impl Into<Vec<u8>>) {
        self.inbound_tx.send(payload.into()).ok();
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    /// Sent datagrams decoded back into messages, oldest first.
    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|payload| Message::decode(payload).ok())
            .collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Number of times the transport went from closed to open.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Make subsequent `open()` calls fail as if the port were taken.
    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `send()` calls fail without recording anything.
    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `recv()` fail with an I/O error.
    pub fn fail_next_recvs(&self, count: usize) {
        self.recv_failures.store(count, Ordering::SeqCst);
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "mock address in use",
            )));
        }
        if self.is_open() {
            return Ok(());
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.closed.send_replace(false);
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NetworkUnreachable,
                "mock network unreachable",
            )));
        }
        self.sent.lock().unwrap().push(payload.to_vec());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        let already_closed = *closed.borrow_and_update();
        if already_closed {
            return Err(TransportError::Closed);
        }
        let failing = self
            .recv_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "mock receive failure",
            )));
        }
        let mut inbound = self.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            payload = inbound.recv() => payload.ok_or(TransportError::Closed),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}
