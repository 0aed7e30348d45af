//! The per-node consensus engine.
//!
//! Each slot of the replicated log is decided by one leaderless round over
//! sets of carries:
//!
//! 1. A node proposes a carry: its candidate set becomes `{carry}` and it
//!    broadcasts the set.
//! 2. A node that hears carries it does not hold merges them into its
//!    candidate set and broadcasts the merged set. Sets only grow within a
//!    slot, so this settles. A node hearing a single uncontested carry echoes
//!    it exactly once.
//! 3. Every node remembers the latest set each peer sent. The slot commits
//!    once every reachable peer's latest set equals the node's own and the
//!    reachable nodes are still a majority of the configuration. The carries
//!    go to the [`Committer`] one by one in carry order, then the
//!    [`Dispatcher`] moves to the next round.
//!
//! Two nodes that stay reachable to each other commit the same set: each has
//! seen the other's final set equal its own. Competing proposals in one slot
//! are committed together rather than blocking each other, and the majority
//! floor stops two halves of a partition that declared each other gone from
//! both committing.
//!
//! Two extra broadcasts keep rounds moving without any catch-up protocol. A
//! node that hears a peer's set missing carries it holds sends its own set
//! again, and a node entering a new slot announces its empty set so that peers
//! already there resend what it dropped while it was behind.
//!
//! The merged set is always broadcast before the commit check, so it still
//! travels in the round it belongs to.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use tracing::{debug, info, trace, warn};

use crate::carry::{Carries, Carry};
use crate::clock::{Admission, NodeId, StepId};
use crate::committer::Committer;
use crate::configuration::MasterlessConfiguration;
use crate::dispatcher::Dispatcher;
use crate::message::Message;

/// Entry points of a consensus node.
pub trait Consensuser {
    /// Submits a new value. Fails if this node already holds carries for the
    /// current slot or has been stopped.
    fn propose(&mut self, carry: Carry) -> Result<()>;

    /// Handles a message that passed dispatcher admission.
    fn on_broadcast(&mut self, message: Message);

    /// Marks `node` as unreachable. Idempotent.
    fn on_disconnect(&mut self, node: NodeId);
}

/// Where the node stands in the current slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Holds no carry yet. The only phase in which `propose` is accepted.
    #[default]
    Idle,
    /// Proposed a carry of its own in this slot.
    Proposed,
    /// Holds only carries learned from peers.
    Echoing,
}

#[derive(Debug, Default)]
struct Round {
    phase: Phase,
    carries: Carries,
    views: BTreeMap<NodeId, Carries>,
}

impl Round {
    /// Adds the carries this round does not hold yet. Returns whether there
    /// were any.
    fn merge(&mut self, carries: &Carries) -> bool {
        let before = self.carries.len();
        self.carries.extend(carries.iter().cloned());
        self.carries.len() > before
    }
}

pub struct CalmConsensuser<D, C> {
    id: NodeId,
    config: MasterlessConfiguration,
    dispatcher: D,
    committer: C,
    reachable: BTreeSet<NodeId>,
    slot: StepId,
    round: Round,
}

impl<D: Dispatcher, C: Committer> CalmConsensuser<D, C> {
    pub fn new(id: NodeId, config: MasterlessConfiguration, dispatcher: D, committer: C) -> Self {
        Self {
            id,
            config,
            dispatcher,
            committer,
            reachable: config.node_ids().collect(),
            slot: StepId::default(),
            round: Round::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &MasterlessConfiguration {
        &self.config
    }

    /// Index of the slot being decided; equals the number of rounds committed.
    pub fn slot(&self) -> StepId {
        self.slot
    }

    pub fn phase(&self) -> Phase {
        self.round.phase
    }

    pub fn is_idle(&self) -> bool {
        self.round.phase == Phase::Idle
    }

    /// Carries this node holds for the current slot.
    pub fn candidate(&self) -> &Carries {
        &self.round.carries
    }

    /// Latest set heard from `node` in the current slot.
    pub fn view(&self, node: NodeId) -> Option<&Carries> {
        self.round.views.get(&node)
    }

    /// Reachable nodes known to hold exactly this node's candidate, itself
    /// included. Empty while idle.
    pub fn supporters(&self) -> Vec<NodeId> {
        if self.round.carries.is_empty() {
            return Vec::new();
        }
        self.reachable
            .iter()
            .copied()
            .filter(|node| *node == self.id || self.view(*node) == Some(&self.round.carries))
            .collect()
    }

    pub fn reachable(&self) -> &BTreeSet<NodeId> {
        &self.reachable
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    pub fn committer(&self) -> &C {
        &self.committer
    }

    /// Runs dispatcher admission and forwards accepted messages to
    /// [`Consensuser::on_broadcast`].
    pub fn receive(&mut self, message: Message) -> Admission {
        let admission = self.dispatcher.on_receive(&message);
        if admission.is_accepted() {
            self.on_broadcast(message);
        }
        admission
    }

    /// Stops this node. See [`Dispatcher::pause`].
    pub fn pause(&mut self) {
        self.dispatcher.pause();
    }

    fn try_commit(&mut self) {
        let supporters = self.supporters().len();
        if supporters == 0 || supporters < self.reachable.len() {
            return;
        }
        if self.reachable.len() < self.config.majority() {
            trace!(
                node = %self.id,
                reachable = self.reachable.len(),
                "agreed, but too few nodes in reach to commit"
            );
            return;
        }
        self.commit();
    }

    fn commit(&mut self) {
        let round = std::mem::take(&mut self.round);
        for carry in round.carries {
            info!(node = %self.id, slot = %self.slot, %carry, "committed");
            self.committer.on_commit(carry);
        }
        self.dispatcher.inc_step();
        self.slot = self.slot.next();

        // Peers already in the new slot answer with what this node dropped
        // while it was behind.
        self.dispatcher.broadcast(Carries::new());
    }
}

impl<D: Dispatcher, C: Committer> Consensuser for CalmConsensuser<D, C> {
    fn propose(&mut self, carry: Carry) -> Result<()> {
        if !self.dispatcher.is_running() {
            bail!("node {} is stopped", self.id);
        }
        if !self.round.carries.is_empty() {
            bail!(
                "node {} is already deciding slot {} with {} carries",
                self.id,
                self.slot,
                self.round.carries.len()
            );
        }

        debug!(node = %self.id, slot = %self.slot, %carry, "proposing");
        self.round.carries.insert(carry);
        self.round.phase = Phase::Proposed;
        self.dispatcher.broadcast(self.round.carries.clone());
        self.try_commit();
        Ok(())
    }

    fn on_broadcast(&mut self, message: Message) {
        let sender = message.sender();
        if sender == self.id {
            return;
        }
        if message.step() != self.slot {
            trace!(node = %self.id, %sender, step = %message.step(), slot = %self.slot, "message for another slot");
            return;
        }
        if !self.reachable.contains(&sender) {
            debug!(node = %self.id, %sender, "ignoring message from disconnected peer");
            return;
        }

        let theirs = message.into_carries();
        let learned = self.round.merge(&theirs);
        let lagging = theirs != self.round.carries;
        self.round.views.insert(sender, theirs);

        if learned {
            if self.round.phase == Phase::Idle {
                self.round.phase = Phase::Echoing;
            }
            debug!(
                node = %self.id,
                slot = %self.slot,
                %sender,
                held = self.round.carries.len(),
                "echoing merged carries"
            );
            self.dispatcher.broadcast(self.round.carries.clone());
        } else if lagging {
            trace!(node = %self.id, slot = %self.slot, %sender, "peer is missing carries, resending");
            self.dispatcher.broadcast(self.round.carries.clone());
        }

        self.try_commit();
    }

    fn on_disconnect(&mut self, node: NodeId) {
        if node == self.id {
            warn!(node = %self.id, "ignoring disconnect notification about self");
            return;
        }
        if !self.config.contains(node) {
            warn!(node = %self.id, peer = %node, "ignoring disconnect of unknown node");
            return;
        }
        if !self.reachable.remove(&node) {
            return;
        }

        info!(
            node = %self.id,
            peer = %node,
            reachable = self.reachable.len(),
            "peer disconnected"
        );
        if self.dispatcher.is_running() {
            self.try_commit();
        }
    }
}
