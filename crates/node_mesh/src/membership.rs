//! Membership table: peer id -> declared priority, in first-seen order.
//!
//! The master is never stored. It is recomputed from the table on every query
//! so it cannot drift from the entries it is derived from.

use node_proto::{NodeId, Priority};
use serde::Deserialize;

/// How equal priorities are resolved when picking the master.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// The entry inserted earliest wins.
    #[default]
    FirstSeen,
    /// The numerically lowest id wins.
    LowestId,
}

impl std::fmt::Display for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FirstSeen => write!(f, "first-seen"),
            Self::LowestId => write!(f, "lowest-id"),
        }
    }
}

/// Read-only picture of the table at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    pub members: Vec<(NodeId, Priority)>,
    pub master: NodeId,
    /// `None` when the table is empty and the master is the local node by default.
    pub master_priority: Option<Priority>,
}

#[derive(Debug, Clone, Default)]
pub struct MembershipTable {
    entries: Vec<(NodeId, Priority)>,
    tie_break: TieBreak,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tie_break(tie_break: TieBreak) -> Self {
        Self {
            entries: Vec::new(),
            tie_break,
        }
    }

    /// Insert or overwrite a priority. Returns true if the id was not present.
    ///
    /// An existing entry keeps its original position.
    pub fn upsert(&mut self, id: NodeId, priority: Priority) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|(peer, _)| *peer == id) {
            entry.1 = priority;
            return false;
        }
        self.entries.push((id, priority));
        true
    }

    pub fn remove(&mut self, id: NodeId) -> Option<Priority> {
        let pos = self.entries.iter().position(|(peer, _)| *peer == id)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, id: NodeId) -> Option<Priority> {
        self.entries
            .iter()
            .find(|(peer, _)| *peer == id)
            .map(|(_, priority)| *priority)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<(NodeId, Priority)> {
        self.entries.clone()
    }

    /// The id with the highest priority, or `local` when the table is empty.
    pub fn master(&self, local: NodeId) -> NodeId {
        self.master_entry().map(|(id, _)| id).unwrap_or(local)
    }

    pub fn view(&self, local: NodeId) -> MembershipView {
        let master = self.master_entry();
        MembershipView {
            members: self.snapshot(),
            master: master.map(|(id, _)| id).unwrap_or(local),
            master_priority: master.map(|(_, priority)| priority),
        }
    }

    fn master_entry(&self) -> Option<(NodeId, Priority)> {
        let mut best: Option<(NodeId, Priority)> = None;
        for &(id, priority) in &self.entries {
            let wins = match best {
                None => true,
                Some((best_id, best_priority)) => match self.tie_break {
                    TieBreak::FirstSeen => priority > best_priority,
                    TieBreak::LowestId => {
                        priority > best_priority || (priority == best_priority && id < best_id)
                    }
                },
            };
            if wins {
                best = Some((id, priority));
            }
        }
        best
    }
}
