//! In-process multicast bus.
//!
//! Every open endpoint receives every datagram published on the bus, the
//! sender included, the same way a multicast socket with loopback enabled
//! does. Used to run several nodes inside one test without a network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::trace;

use crate::transport::{Result, Transport, TransportError};

type Inbox = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>;

#[derive(Default)]
pub struct MemoryBus {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fresh, closed endpoint attached to this bus.
    pub fn endpoint(self: &Arc<Self>) -> BusTransport {
        let (closed, _) = watch::channel(true);
        BusTransport {
            bus: self.clone(),
            subscription: Mutex::new(None),
            closed,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Datagrams published since the bus was created.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().unwrap().remove(&id);
    }

    /// Deliver to every subscriber while holding the lock, so all endpoints
    /// observe publications in the same order.
    fn publish(&self, payload: &[u8]) -> usize {
        let subscribers = self.subscribers.lock().unwrap();
        self.published.fetch_add(1, Ordering::SeqCst);
        for tx in subscribers.values() {
            tx.send(payload.to_vec()).ok();
        }
        subscribers.len()
    }
}

struct Subscription {
    id: u64,
    inbox: Inbox,
}

/// One node's view of a [`MemoryBus`].
pub struct BusTransport {
    bus: Arc<MemoryBus>,
    subscription: Mutex<Option<Subscription>>,
    closed: watch::Sender<bool>,
}

impl BusTransport {
    fn inbox(&self) -> Option<Inbox> {
        self.subscription
            .lock()
            .unwrap()
            .as_ref()
            .map(|sub| sub.inbox.clone())
    }
}

#[async_trait::async_trait]
impl Transport for BusTransport {
    async fn open(&self) -> Result<()> {
        let mut subscription = self.subscription.lock().unwrap();
        if subscription.is_some() {
            return Ok(());
        }
        let (id, rx) = self.bus.subscribe();
        *subscription = Some(Subscription {
            id,
            inbox: Arc::new(tokio::sync::Mutex::new(rx)),
        });
        self.closed.send_replace(false);
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let delivered = self.bus.publish(payload);
        trace!("bus delivered {} bytes to {delivered} endpoints", payload.len());
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        let mut closed = self.closed.subscribe();
        let already_closed = *closed.borrow_and_update();
        let inbox = match self.inbox() {
            Some(inbox) if !already_closed => inbox,
            _ => return Err(TransportError::Closed),
        };
        let mut inbox = inbox.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            payload = inbox.recv() => payload.ok_or(TransportError::Closed),
        }
    }

    fn close(&self) {
        if let Some(sub) = self.subscription.lock().unwrap().take() {
            self.bus.unsubscribe(sub.id);
        }
        self.closed.send_replace(true);
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}
