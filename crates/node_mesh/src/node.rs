//! Node controller: lifecycle, outbound commands and the listener task.
//!
//! The membership table lives behind one `RwLock` shared by the controller
//! and the listener. The listener only runs while the node is joined: `join()`
//! spawns it after opening the transport, and `leave()` closes the transport
//! and waits for it to observe [`TransportError::Closed`] before the table is
//! cleared.

use std::sync::Arc;
use std::time::Duration;

use node_proto::{Message, NodeId, Priority};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::group::{GroupEvent, GroupRules};
use crate::membership::{MembershipTable, MembershipView, TieBreak};
use crate::transport::{Transport, TransportError};

const DEFAULT_JOIN_SETTLE: Duration = Duration::from_millis(1000);

/// Pause before the listener retries after `failures` consecutive receive errors.
fn recv_backoff(failures: u32) -> Duration {
    const BASE_MS: u64 = 25;
    const MAX_EXPONENT: u32 = 5;
    const MAX_DELAY_MS: u64 = 500;
    let delay_ms = BASE_MS.saturating_mul(1u64 << failures.min(MAX_EXPONENT));
    Duration::from_millis(delay_ms.min(MAX_DELAY_MS))
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("peer {0} is not in the group")]
    UnknownPeer(NodeId),
}

pub type Result<T> = std::result::Result<T, NodeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotJoined,
    Joined,
}

/// Result of a command that may be a reported no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    AlreadyJoined,
    NotJoined,
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// How long `join()` waits for WELCOME replies before reporting the view.
    pub join_settle: Duration,
    pub expected_group_size: Option<usize>,
    pub tie_break: TieBreak,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            join_settle: DEFAULT_JOIN_SETTLE,
            expected_group_size: None,
            tie_break: TieBreak::default(),
        }
    }
}

pub struct GroupNode {
    identity: NodeIdentity,
    settings: NodeSettings,
    transport: Arc<dyn Transport>,
    table: Arc<RwLock<MembershipTable>>,
    events: mpsc::UnboundedSender<GroupEvent>,
    state: LifecycleState,
    listener: Option<JoinHandle<()>>,
}

impl GroupNode {
    pub fn new(
        identity: NodeIdentity,
        transport: Arc<dyn Transport>,
        settings: NodeSettings,
    ) -> (Self, mpsc::UnboundedReceiver<GroupEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let table = MembershipTable::with_tie_break(settings.tie_break);
        let node = Self {
            identity,
            settings,
            transport,
            table: Arc::new(RwLock::new(table)),
            events,
            state: LifecycleState::NotJoined,
            listener: None,
        };
        (node, rx)
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_joined(&self) -> bool {
        self.state == LifecycleState::Joined
    }

    pub async fn join(&mut self) -> Result<Outcome> {
        if self.is_joined() {
            debug!("join ignored: node {} already joined", self.identity.id);
            return Ok(Outcome::AlreadyJoined);
        }

        self.transport.open().await?;
        self.table
            .write()
            .await
            .upsert(self.identity.id, self.identity.priority);
        self.listener = Some(tokio::spawn(listen(
            self.transport.clone(),
            self.table.clone(),
            self.rules(),
            self.events.clone(),
        )));

        let join = Message::Join {
            sender: self.identity.id,
            priority: self.identity.priority,
        };
        if let Err(e) = self.transport.send(&join.encode()).await {
            warn!("failed to announce join: {e}");
            self.teardown().await;
            return Err(e.into());
        }

        self.state = LifecycleState::Joined;
        info!(
            id = self.identity.id,
            priority = self.identity.priority,
            "joined the group"
        );

        if !self.settings.join_settle.is_zero() {
            tokio::time::sleep(self.settings.join_settle).await;
        }
        let view = self.view().await;
        self.publish(GroupEvent::View(view));
        Ok(Outcome::Done)
    }

    /// Announce departure and release the transport.
    ///
    /// The local teardown always completes. A failed LEAVE broadcast is
    /// returned afterwards.
    pub async fn leave(&mut self) -> Result<Outcome> {
        if !self.is_joined() {
            debug!("leave ignored: node {} is not joined", self.identity.id);
            return Ok(Outcome::NotJoined);
        }

        let leave = Message::Leave {
            sender: self.identity.id,
        };
        let announced = self.transport.send(&leave.encode()).await;
        self.teardown().await;
        info!(id = self.identity.id, "left the group");

        announced?;
        Ok(Outcome::Done)
    }

    pub async fn send_chat(&self, text: &str) -> Result<Outcome> {
        if !self.is_joined() {
            return Ok(Outcome::NotJoined);
        }
        let chat = Message::Chat {
            sender: self.identity.id,
            text: text.to_string(),
        };
        self.transport.send(&chat.encode()).await?;
        Ok(Outcome::Done)
    }

    pub async fn send_direct(&self, target: NodeId, text: &str) -> Result<Outcome> {
        if !self.is_joined() {
            return Ok(Outcome::NotJoined);
        }
        if !self.table.read().await.contains(target) {
            return Err(NodeError::UnknownPeer(target));
        }
        let direct = Message::DirectChat {
            sender: self.identity.id,
            target,
            text: text.to_string(),
        };
        self.transport.send(&direct.encode()).await?;
        Ok(Outcome::Done)
    }

    pub async fn view(&self) -> MembershipView {
        self.table.read().await.view(self.identity.id)
    }

    pub async fn members(&self) -> Vec<(NodeId, Priority)> {
        self.table.read().await.snapshot()
    }

    pub async fn master(&self) -> NodeId {
        self.table.read().await.master(self.identity.id)
    }

    /// Release the transport without announcing LEAVE.
    pub async fn shutdown(&mut self) {
        if self.is_joined() {
            self.teardown().await;
            info!(id = self.identity.id, "shut down without leaving");
        }
    }

    fn rules(&self) -> GroupRules {
        GroupRules {
            id: self.identity.id,
            priority: self.identity.priority,
            expected_group_size: self.settings.expected_group_size,
        }
    }

    fn publish(&self, event: GroupEvent) {
        if self.events.send(event).is_err() {
            trace!("event receiver dropped");
        }
    }

    async fn teardown(&mut self) {
        self.transport.close();
        if let Some(listener) = self.listener.take() {
            if let Err(e) = listener.await {
                warn!("listener task ended abnormally: {e}");
            }
        }
        self.table.write().await.clear();
        self.state = LifecycleState::NotJoined;
    }
}

impl Drop for GroupNode {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        self.transport.close();
    }
}

/// Receive, decode and apply datagrams until the transport closes.
async fn listen(
    transport: Arc<dyn Transport>,
    table: Arc<RwLock<MembershipTable>>,
    rules: GroupRules,
    events: mpsc::UnboundedSender<GroupEvent>,
) {
    let mut failures = 0u32;
    loop {
        let datagram = match transport.recv().await {
            Ok(datagram) => {
                failures = 0;
                datagram
            }
            Err(TransportError::Closed) | Err(TransportError::NotOpen) => {
                debug!("transport closed, listener stopping");
                return;
            }
            Err(e) => {
                let delay = recv_backoff(failures);
                failures = failures.saturating_add(1);
                warn!(failures, "receive failed, retrying in {delay:?}: {e}");
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        let message = match Message::decode(&datagram) {
            Ok(message) => message,
            Err(e) => {
                debug!("dropping datagram: {e}");
                continue;
            }
        };
        trace!(from = message.sender(), kind = message.kind(), "received {message}");

        let reaction = {
            let mut table = table.write().await;
            rules.apply(&mut table, message)
        };

        if let Some(reply) = reaction.reply {
            if let Err(e) = transport.send(&reply.encode()).await {
                warn!("failed to send {}: {e}", reply.kind());
            }
        }
        for event in reaction.events {
            if events.send(event).is_err() {
                trace!("event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn settings() -> NodeSettings {
        NodeSettings {
            join_settle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn node(
        id: NodeId,
        priority: Priority,
    ) -> (
        GroupNode,
        Arc<MockTransport>,
        mpsc::UnboundedReceiver<GroupEvent>,
    ) {
        let transport = Arc::new(MockTransport::new());
        let (node, events) = GroupNode::new(
            NodeIdentity { id, priority },
            transport.clone(),
            settings(),
        );
        (node, transport, events)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<GroupEvent>) -> GroupEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn join_announces_and_inserts_self() {
        let (mut node, transport, mut events) = node(1, 5);

        assert_eq!(node.join().await.unwrap(), Outcome::Done);
        assert_eq!(node.state(), LifecycleState::Joined);
        assert!(transport.is_open());
        assert_eq!(node.members().await, vec![(1, 5)]);
        assert_eq!(
            transport.sent_messages(),
            vec![Message::Join {
                sender: 1,
                priority: 5
            }]
        );
        assert!(matches!(next_event(&mut events).await, GroupEvent::View(_)));
    }

    #[tokio::test]
    async fn second_join_is_reported_noop() {
        let (mut node, transport, _events) = node(1, 5);
        node.join().await.unwrap();

        assert_eq!(node.join().await.unwrap(), Outcome::AlreadyJoined);
        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.sent_count(), 1);
        assert_eq!(node.members().await, vec![(1, 5)]);
    }

    #[tokio::test]
    async fn leave_without_join_is_reported_noop() {
        let (mut node, transport, _events) = node(1, 5);

        assert_eq!(node.leave().await.unwrap(), Outcome::NotJoined);
        assert_eq!(transport.open_count(), 0);
        assert_eq!(transport.sent_count(), 0);
        assert!(node.members().await.is_empty());
    }

    #[tokio::test]
    async fn leave_announces_closes_and_clears() {
        let (mut node, transport, _events) = node(1, 5);
        node.join().await.unwrap();
        transport.take_sent();

        assert_eq!(node.leave().await.unwrap(), Outcome::Done);
        assert_eq!(
            transport.sent_messages(),
            vec![Message::Leave { sender: 1 }]
        );
        assert!(!transport.is_open());
        assert!(node.members().await.is_empty());
        assert_eq!(node.state(), LifecycleState::NotJoined);
        assert_eq!(node.master().await, 1);
    }

    #[tokio::test]
    async fn rejoin_after_leave() {
        let (mut node, transport, _events) = node(1, 5);
        node.join().await.unwrap();
        node.leave().await.unwrap();
        node.join().await.unwrap();

        assert_eq!(transport.open_count(), 2);
        assert_eq!(node.members().await, vec![(1, 5)]);
    }

    #[tokio::test]
    async fn failed_open_stays_not_joined() {
        let (mut node, transport, _events) = node(1, 5);
        transport.set_fail_open(true);

        let result = node.join().await;
        assert!(matches!(result, Err(NodeError::Transport(_))));
        assert_eq!(node.state(), LifecycleState::NotJoined);
        assert!(node.members().await.is_empty());
    }

    #[tokio::test]
    async fn failed_join_broadcast_rolls_back() {
        let (mut node, transport, _events) = node(1, 5);
        transport.set_fail_send(true);

        let result = node.join().await;
        assert!(matches!(result, Err(NodeError::Transport(_))));
        assert_eq!(node.state(), LifecycleState::NotJoined);
        assert!(node.members().await.is_empty());
        assert!(!transport.is_open());
        assert_eq!(transport.sent_count(), 0);

        transport.set_fail_send(false);
        assert_eq!(node.join().await.unwrap(), Outcome::Done);
        assert_eq!(node.members().await, vec![(1, 5)]);
    }

    #[tokio::test]
    async fn failed_leave_broadcast_still_tears_down() {
        let (mut node, transport, _events) = node(1, 5);
        node.join().await.unwrap();
        transport.push_inbound("WELCOME:2:9");
        while node.members().await.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.set_fail_send(true);

        let result = node.leave().await;
        assert!(matches!(result, Err(NodeError::Transport(_))));
        assert_eq!(node.state(), LifecycleState::NotJoined);
        assert!(node.members().await.is_empty());
        assert!(!transport.is_open());
        assert_eq!(node.leave().await.unwrap(), Outcome::NotJoined);
    }

    #[test]
    fn recv_backoff_grows_and_is_capped() {
        assert_eq!(recv_backoff(0), Duration::from_millis(25));
        assert_eq!(recv_backoff(1), Duration::from_millis(50));
        assert_eq!(recv_backoff(3), Duration::from_millis(200));
        assert_eq!(recv_backoff(5), Duration::from_millis(500));
        assert_eq!(recv_backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn listener_backs_off_on_receive_errors() {
        let (mut node, transport, mut events) = node(1, 5);
        transport.fail_next_recvs(3);
        transport.push_inbound("MESSAGE:2:after the storm");

        let started = tokio::time::Instant::now();
        node.join().await.unwrap();
        let chat = loop {
            let event = next_event(&mut events).await;
            if matches!(event, GroupEvent::Chat { .. }) {
                break event;
            }
        };

        assert_eq!(
            chat,
            GroupEvent::Chat {
                from: 2,
                text: "after the storm".into()
            }
        );
        let expected = recv_backoff(0) + recv_backoff(1) + recv_backoff(2);
        assert!(started.elapsed() >= expected);
        assert!(node.is_joined());
    }

    #[tokio::test]
    async fn inbound_join_is_welcomed() {
        let (mut node, transport, mut events) = node(1, 5);
        node.join().await.unwrap();
        next_event(&mut events).await;
        transport.take_sent();

        transport.push_inbound("JOIN:2:9");
        assert_eq!(
            next_event(&mut events).await,
            GroupEvent::PeerJoined { id: 2, priority: 9 }
        );
        next_event(&mut events).await;

        assert_eq!(node.master().await, 2);
        assert_eq!(
            transport.sent_messages(),
            vec![Message::Welcome {
                sender: 1,
                priority: 5
            }]
        );
    }

    #[tokio::test]
    async fn malformed_datagrams_do_not_stop_listener() {
        let (mut node, transport, mut events) = node(1, 5);
        node.join().await.unwrap();
        next_event(&mut events).await;

        transport.push_inbound("garbage");
        transport.push_inbound("PING:1:2");
        transport.push_inbound(vec![0xff, 0x00, 0x3a]);
        transport.push_inbound("MESSAGE:3:still here");

        assert_eq!(
            next_event(&mut events).await,
            GroupEvent::Chat {
                from: 3,
                text: "still here".into()
            }
        );
    }

    #[tokio::test]
    async fn chat_requires_join() {
        let (node, transport, _events) = node(1, 5);
        assert_eq!(node.send_chat("hi").await.unwrap(), Outcome::NotJoined);
        assert_eq!(
            node.send_direct(2, "hi").await.unwrap(),
            Outcome::NotJoined
        );
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn direct_to_unknown_peer_sends_nothing() {
        let (mut node, transport, _events) = node(1, 5);
        node.join().await.unwrap();
        transport.take_sent();

        let result = node.send_direct(99, "hi").await;
        assert!(matches!(result, Err(NodeError::UnknownPeer(99))));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn direct_to_known_peer_is_sent() {
        let (mut node, transport, mut events) = node(1, 5);
        node.join().await.unwrap();
        next_event(&mut events).await;
        transport.push_inbound("WELCOME:2:9");
        next_event(&mut events).await;
        transport.take_sent();

        assert_eq!(node.send_direct(2, "psst").await.unwrap(), Outcome::Done);
        assert_eq!(
            transport.sent_messages(),
            vec![Message::DirectChat {
                sender: 1,
                target: 2,
                text: "psst".into()
            }]
        );
    }

    #[tokio::test]
    async fn shutdown_releases_without_leave() {
        let (mut node, transport, _events) = node(1, 5);
        node.join().await.unwrap();
        transport.take_sent();

        node.shutdown().await;
        assert!(!transport.is_open());
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(node.state(), LifecycleState::NotJoined);
    }

    #[tokio::test]
    async fn drop_releases_transport() {
        let (mut node, transport, _events) = node(1, 5);
        node.join().await.unwrap();
        drop(node);
        assert!(!transport.is_open());
    }
}
