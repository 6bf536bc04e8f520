//! Group membership, master election and the transports that carry them.
//!
//! - [`membership`]: the membership table and master derivation.
//! - [`group`]: reaction to inbound protocol messages.
//! - [`node`]: the controller driving join/leave/chat and the listener task.
//! - [`transport`], [`multicast_transport`], [`memory_transport`]: the channel.

pub mod group;
pub mod membership;
pub mod memory_transport;
pub mod multicast_transport;
pub mod node;
pub mod transport;

pub use group::{GroupEvent, GroupRules, Reaction};
pub use membership::{MembershipTable, MembershipView, TieBreak};
pub use memory_transport::{BusTransport, MemoryBus};
pub use multicast_transport::{MulticastConfig, MulticastTransport};
pub use node::{GroupNode, LifecycleState, NodeError, NodeIdentity, NodeSettings, Outcome};
pub use transport::{MockTransport, Transport, TransportError};
