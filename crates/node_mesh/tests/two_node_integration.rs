//! Integration test: two nodes sharing an in-memory multicast bus.
//!
//! Node A joins first, node B joins and is welcomed.
//! Chats are seen by both nodes, the sender included.
//! B leaves and A drops it from its table.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;

use node_mesh::{GroupEvent, GroupNode, MemoryBus, NodeIdentity, NodeSettings, Outcome};

fn spawn_node(
    bus: &Arc<MemoryBus>,
    id: i64,
    priority: i64,
) -> (GroupNode, UnboundedReceiver<GroupEvent>) {
    let settings = NodeSettings {
        join_settle: Duration::from_millis(20),
        ..Default::default()
    };
    GroupNode::new(
        NodeIdentity { id, priority },
        Arc::new(bus.endpoint()),
        settings,
    )
}

async fn wait_for_members(node: &GroupNode, expected: &[(i64, i64)]) {
    let mut expected = expected.to_vec();
    expected.sort();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let mut members = node.members().await;
        members.sort();
        if members == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "node {} has {members:?}, expected {expected:?}",
            node.identity().id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_chat(events: &mut UnboundedReceiver<GroupEvent>) -> GroupEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, GroupEvent::Chat { .. } | GroupEvent::Direct { .. }) {
            return event;
        }
    }
}

#[tokio::test]
async fn two_nodes_discover_each_other() {
    let bus = MemoryBus::new();
    let (mut a, _a_events) = spawn_node(&bus, 1, 5);
    let (mut b, _b_events) = spawn_node(&bus, 2, 9);

    assert_eq!(a.join().await.unwrap(), Outcome::Done);
    assert_eq!(b.join().await.unwrap(), Outcome::Done);

    wait_for_members(&a, &[(1, 5), (2, 9)]).await;
    wait_for_members(&b, &[(1, 5), (2, 9)]).await;
    assert_eq!(a.master().await, 2);
    assert_eq!(b.master().await, 2);
}

#[tokio::test]
async fn chat_reaches_every_member_including_sender() {
    let bus = MemoryBus::new();
    let (mut a, mut a_events) = spawn_node(&bus, 1, 5);
    let (mut b, mut b_events) = spawn_node(&bus, 2, 9);
    a.join().await.unwrap();
    b.join().await.unwrap();
    wait_for_members(&a, &[(1, 5), (2, 9)]).await;

    a.send_chat("hello group").await.unwrap();

    let expected = GroupEvent::Chat {
        from: 1,
        text: "hello group".into(),
    };
    assert_eq!(next_chat(&mut a_events).await, expected);
    assert_eq!(next_chat(&mut b_events).await, expected);
}

#[tokio::test]
async fn leaving_node_is_forgotten() {
    let bus = MemoryBus::new();
    let (mut a, _a_events) = spawn_node(&bus, 1, 5);
    let (mut b, _b_events) = spawn_node(&bus, 2, 9);
    a.join().await.unwrap();
    b.join().await.unwrap();
    wait_for_members(&a, &[(1, 5), (2, 9)]).await;

    assert_eq!(b.leave().await.unwrap(), Outcome::Done);
    assert!(b.members().await.is_empty());
    assert_eq!(bus.subscriber_count(), 1);

    wait_for_members(&a, &[(1, 5)]).await;
    assert_eq!(a.master().await, 1);

    b.join().await.unwrap();
    wait_for_members(&a, &[(1, 5), (2, 9)]).await;
    wait_for_members(&b, &[(1, 5), (2, 9)]).await;
}
