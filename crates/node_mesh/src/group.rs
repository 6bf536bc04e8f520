//! Inbound message handling for a joined node.
//!
//! [`GroupRules::apply`] is synchronous and does no I/O: it mutates the
//! membership table, and returns the reply to broadcast (if any) together with
//! the events to display. Every applied message ends with a fresh
//! [`GroupEvent::View`]; own membership echoes are not applied. The listener
//! task owns the I/O around it.

use node_proto::{Message, NodeId, Priority};
use tracing::{debug, info, trace};

use crate::membership::{MembershipTable, MembershipView};

/// Something the console should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    PeerJoined { id: NodeId, priority: Priority },
    PeerLeft { id: NodeId },
    /// Members and master right after an inbound message was applied.
    View(MembershipView),
    /// The table reached the configured group size.
    GroupComplete { size: usize },
    Chat { from: NodeId, text: String },
    Direct { from: NodeId, text: String },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reaction {
    pub reply: Option<Message>,
    pub events: Vec<GroupEvent>,
}

#[derive(Debug, Clone)]
pub struct GroupRules {
    pub id: NodeId,
    pub priority: Priority,
    pub expected_group_size: Option<usize>,
}

impl GroupRules {
    pub fn apply(&self, table: &mut MembershipTable, message: Message) -> Reaction {
        let mut reaction = Reaction::default();
        match message {
            Message::Join { sender, priority } => {
                if sender == self.id {
                    trace!("ignoring echo of own JOIN");
                    return reaction;
                }
                let inserted = table.upsert(sender, priority);
                info!(peer = sender, priority, "peer joined the group");
                reaction
                    .events
                    .push(GroupEvent::PeerJoined { id: sender, priority });
                reaction.reply = Some(Message::Welcome {
                    sender: self.id,
                    priority: self.priority,
                });
                self.report_view(table, inserted, &mut reaction);
            }
            Message::Welcome { sender, priority } => {
                if sender == self.id {
                    trace!("ignoring echo of own WELCOME");
                    return reaction;
                }
                let inserted = table.upsert(sender, priority);
                if inserted {
                    debug!(peer = sender, priority, "discovered peer through WELCOME");
                }
                self.report_view(table, inserted, &mut reaction);
            }
            Message::Leave { sender } => {
                if sender == self.id {
                    trace!("ignoring echo of own LEAVE");
                    return reaction;
                }
                if table.remove(sender).is_some() {
                    info!(peer = sender, "peer left the group");
                    reaction.events.push(GroupEvent::PeerLeft { id: sender });
                }
                self.report_view(table, false, &mut reaction);
            }
            Message::Chat { sender, text } => {
                reaction.events.push(GroupEvent::Chat { from: sender, text });
                self.report_view(table, false, &mut reaction);
            }
            Message::DirectChat {
                sender,
                target,
                text,
            } => {
                if target == self.id {
                    reaction
                        .events
                        .push(GroupEvent::Direct { from: sender, text });
                } else {
                    trace!(from = sender, target, "direct message for another peer");
                }
                self.report_view(table, false, &mut reaction);
            }
        }
        reaction
    }

    fn report_view(&self, table: &MembershipTable, grew: bool, reaction: &mut Reaction) {
        let view = table.view(self.id);
        debug!(master = view.master, members = view.members.len(), "master re-derived");
        reaction.events.push(GroupEvent::View(view));

        if grew && self.expected_group_size == Some(table.len()) {
            reaction
                .events
                .push(GroupEvent::GroupComplete { size: table.len() });
        }
    }
}
