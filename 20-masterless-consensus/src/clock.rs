//! Node identities and the two logical clocks used for message admission.
//!
//! Every broadcast is tagged with:
//! - a **Stamp**: the sender's own counter, bumped per broadcast. Receivers keep
//!   a per-sender watermark and drop anything at or below it.
//! - a **StepId**: the sender's current round. A round ends when the node
//!   commits a slot, so the StepId is also the index of the slot being decided.
//!
//! [`LogicalClock`] bundles both clocks for one node, produces stamped
//! [`Message`]s and decides whether an inbound message may reach the
//! consensus engine. Both dispatcher implementations delegate to it.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::carry::Carries;
use crate::message::Message;

/// Identifier of a replica, in `[0, N)` for a configuration of size N.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Position of this node in per-node tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-node round counter. Advanced by one on every commit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StepId(pub u64);

impl StepId {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-sender broadcast counter. The first broadcast of a node carries `Stamp(1)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Stamp(pub u64);

impl Stamp {
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of running an inbound message through [`LogicalClock::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Hand the message to the consensus engine.
    Accepted,
    /// The receiving node is stopped.
    Paused,
    /// The sender is not part of the configuration.
    UnknownSender,
    /// The message belongs to a round this node has not reached. There is no
    /// catch-up mechanism, so the message is lost for this node.
    Future,
    /// Stamp at or below the sender's watermark: duplicate or overtaken.
    Stale,
    /// The message belongs to a round this node already committed.
    Superseded,
}

impl Admission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Admission::Accepted)
    }
}

/// Logical clocks and admission state of a single node.
#[derive(Debug, Clone)]
pub struct LogicalClock {
    node_id: NodeId,
    step: StepId,
    stamp: Stamp,
    watermarks: Vec<Stamp>,
    running: bool,
}

impl LogicalClock {
    pub fn new(node_id: NodeId, cluster_size: usize) -> Self {
        Self {
            node_id,
            step: StepId::default(),
            stamp: Stamp::default(),
            watermarks: vec![Stamp::default(); cluster_size],
            running: true,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn step(&self) -> StepId {
        self.step
    }

    /// Stamp of the last message this node produced.
    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Highest stamp accepted so far from `sender`.
    pub fn watermark(&self, sender: NodeId) -> Stamp {
        self.watermarks
            .get(sender.index())
            .copied()
            .unwrap_or_default()
    }

    /// Wraps `carries` into a message carrying the next stamp and the current
    /// step. Returns `None` once the node is paused.
    pub fn stamp_carries(&mut self, carries: Carries) -> Option<Message> {
        if !self.running {
            return None;
        }
        self.stamp = self.stamp.next();
        Some(Message::new(self.node_id, self.stamp, self.step, carries))
    }

    pub fn inc_step(&mut self) {
        self.step = self.step.next();
    }

    /// Stops the node for good. There is no resume.
    pub fn pause(&mut self) {
        self.running = false;
    }

    pub fn is_stale(&self, message: &Message) -> bool {
        message.stamp() <= self.watermark(message.sender())
    }

    pub fn is_future(&self, message: &Message) -> bool {
        message.step() > self.step
    }

    pub fn is_superseded(&self, message: &Message) -> bool {
        self.step > message.step()
    }

    /// Decides whether `message` reaches the consensus engine, raising the
    /// sender's watermark when it does.
    pub fn admit(&mut self, message: &Message) -> Admission {
        if !self.running {
            return Admission::Paused;
        }

        let sender = message.sender();
        if sender.index() >= self.watermarks.len() {
            warn!(node = %self.node_id, %sender, "dropping message from unknown sender");
            return Admission::UnknownSender;
        }

        if self.is_future(message) {
            warn!(
                node = %self.node_id,
                %sender,
                message_step = %message.step(),
                local_step = %self.step,
                "step is outdated, dropping message from a future round"
            );
            return Admission::Future;
        }

        if self.is_stale(message) {
            trace!(node = %self.node_id, %sender, stamp = %message.stamp(), "dropping stale message");
            return Admission::Stale;
        }

        if self.is_superseded(message) {
            trace!(node = %self.node_id, %sender, step = %message.step(), "dropping message from a committed round");
            return Admission::Superseded;
        }

        self.watermarks[sender.index()] = message.stamp();
        Admission::Accepted
    }
}
