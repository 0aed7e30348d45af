//! Masterless replicated-log consensus.
//!
//! A fixed set of nodes agree on a sequence of opaque [`Carry`] values without
//! a leader. Any node may propose. Nodes merge the carries they hear for a
//! slot and echo each merged set once. A slot commits at a node once every
//! node it still considers reachable holds the same set, provided those nodes
//! are a majority of the configuration. Competing proposals in one slot are
//! committed together, in carry order.
//!
//! The engine ([`CalmConsensuser`]) is generic over two seams:
//!
//! - [`Dispatcher`] moves messages and decides which inbound ones are
//!   admitted, using the per-node [`LogicalClock`]. [`LocalDispatcher`] queues
//!   them in memory for the [`LocalNetwork`] simulator; [`TcpDispatcher`] sends
//!   them to real peers.
//! - [`Committer`] receives each committed carry, in log order.
//!
//! # Modules
//!
//! - [`carry`], [`clock`], [`message`], [`configuration`]: data model
//! - [`dispatcher`], [`committer`]: the engine's collaborators
//! - [`consensuser`]: the protocol engine
//! - [`simulation`], [`checker`]: deterministic testing support
//! - [`transport`], [`runtime`], [`protocol`]: running nodes over TCP

pub mod carry;
pub mod checker;
pub mod clock;
pub mod committer;
pub mod configuration;
pub mod consensuser;
pub mod dispatcher;
pub mod message;
pub mod protocol;
pub mod runtime;
pub mod simulation;
pub mod transport;

pub use carry::{Carries, Carry};
pub use checker::{verify_committed_once, verify_prefix_agreement, verify_replicated};
pub use clock::{Admission, LogicalClock, NodeId, Stamp, StepId};
pub use committer::{ChannelCommitter, CommitLog, Committer};
pub use configuration::MasterlessConfiguration;
pub use consensuser::{CalmConsensuser, Consensuser, Phase};
pub use dispatcher::Dispatcher;
pub use message::Message;
pub use runtime::{spawn_node, NodeConfig, NodeHandle, NodeStatus};
pub use simulation::{Delivery, LocalDispatcher, LocalNetwork, LocalNode};
pub use transport::TcpDispatcher;
