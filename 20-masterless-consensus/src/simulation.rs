//! Deterministic in-memory cluster for driving the protocol by hand.
//!
//! Every node gets a [`LocalDispatcher`] that queues its broadcasts per
//! destination instead of sending them. Nothing moves until the test (or the
//! randomized driver) says so, which makes interleavings reproducible:
//!
//! ```
//! use masterless_consensus::{Carry, LocalNetwork, MasterlessConfiguration, NodeId};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut network = LocalNetwork::new(MasterlessConfiguration::new(2)?);
//! network.propose(NodeId(0), Carry::from("a"))?;
//! network.deliver_first(NodeId(0), NodeId(1))?;
//! network.deliver_first(NodeId(1), NodeId(0))?;
//! assert_eq!(network.committed(NodeId(0))?, vec![Carry::from("a")]);
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;

use anyhow::{bail, ensure, Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::trace;

use crate::carry::{Carries, Carry};
use crate::clock::{Admission, LogicalClock, NodeId, StepId};
use crate::committer::CommitLog;
use crate::configuration::MasterlessConfiguration;
use crate::consensuser::{CalmConsensuser, Consensuser};
use crate::dispatcher::Dispatcher;
use crate::message::Message;

/// Dispatcher that parks outbound messages in one FIFO queue per destination.
#[derive(Debug)]
pub struct LocalDispatcher {
    clock: LogicalClock,
    outbox: Vec<VecDeque<Message>>,
}

impl LocalDispatcher {
    pub fn new(id: NodeId, size: usize) -> Self {
        Self {
            clock: LogicalClock::new(id, size),
            outbox: vec![VecDeque::new(); size],
        }
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn queue_len(&self, to: NodeId) -> usize {
        self.outbox.get(to.index()).map_or(0, VecDeque::len)
    }

    pub fn in_flight(&self) -> usize {
        self.outbox.iter().map(VecDeque::len).sum()
    }

    fn pop(&mut self, to: NodeId) -> Option<Message> {
        self.outbox.get_mut(to.index())?.pop_front()
    }

    /// Swaps the two oldest messages queued for `to`, if there are two.
    fn swap_front(&mut self, to: NodeId) {
        if let Some(queue) = self.outbox.get_mut(to.index()) {
            if queue.len() >= 2 {
                queue.swap(0, 1);
            }
        }
    }

    fn destinations(&self) -> Vec<NodeId> {
        self.outbox
            .iter()
            .enumerate()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(index, _)| NodeId(index as u32))
            .collect()
    }

    fn clear(&mut self) {
        self.outbox.iter_mut().for_each(VecDeque::clear);
    }
}

impl Dispatcher for LocalDispatcher {
    fn broadcast(&mut self, carries: Carries) {
        let Some(message) = self.clock.stamp_carries(carries) else {
            return;
        };
        let me = self.clock.node_id().index();
        for (to, queue) in self.outbox.iter_mut().enumerate() {
            if to != me {
                queue.push_back(message.clone());
            }
        }
    }

    fn inc_step(&mut self) {
        self.clock.inc_step();
    }

    fn pause(&mut self) {
        self.clock.pause();
    }

    fn on_receive(&mut self, message: &Message) -> Admission {
        self.clock.admit(message)
    }

    fn is_running(&self) -> bool {
        self.clock.is_running()
    }

    fn step(&self) -> StepId {
        self.clock.step()
    }
}

pub type LocalNode = CalmConsensuser<LocalDispatcher, CommitLog>;

/// A message handed to a node and what its dispatcher made of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    pub admission: Admission,
}

/// Registry of simulated nodes, indexed by [`NodeId`].
pub struct LocalNetwork {
    config: MasterlessConfiguration,
    nodes: Vec<LocalNode>,
}

impl LocalNetwork {
    pub fn new(config: MasterlessConfiguration) -> Self {
        let nodes = config
            .node_ids()
            .map(|id| {
                CalmConsensuser::new(
                    id,
                    config,
                    LocalDispatcher::new(id, config.size()),
                    CommitLog::new(),
                )
            })
            .collect();
        Self { config, nodes }
    }

    pub fn config(&self) -> &MasterlessConfiguration {
        &self.config
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> Result<&LocalNode> {
        self.nodes
            .get(id.index())
            .with_context(|| format!("unknown node {id}"))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut LocalNode> {
        self.nodes
            .get_mut(id.index())
            .with_context(|| format!("unknown node {id}"))
    }

    pub fn is_running(&self, id: NodeId) -> bool {
        self.nodes
            .get(id.index())
            .is_some_and(|node| node.dispatcher().is_running())
    }

    pub fn propose(&mut self, id: NodeId, carry: Carry) -> Result<()> {
        self.node_mut(id)?.propose(carry)
    }

    /// Stops `id`. Its queued messages stay where they are.
    pub fn stop(&mut self, id: NodeId) -> Result<()> {
        self.node_mut(id)?.pause();
        Ok(())
    }

    /// Tells node `at` that `id` is gone.
    pub fn notify_disconnect(&mut self, at: NodeId, id: NodeId) -> Result<()> {
        self.node_mut(at)?.on_disconnect(id);
        Ok(())
    }

    /// Stops `id` and notifies every node that is still running.
    pub fn disconnect(&mut self, id: NodeId) -> Result<()> {
        self.stop(id)?;
        for node in self.nodes.iter_mut() {
            if node.id() != id && node.dispatcher().is_running() {
                node.on_disconnect(id);
            }
        }
        Ok(())
    }

    /// Hands the oldest message queued from `from` to `to` over to `to`.
    ///
    /// The sender does not have to be running: a message already on the wire
    /// when its sender crashed may still arrive.
    pub fn deliver_first(&mut self, from: NodeId, to: NodeId) -> Result<Delivery> {
        self.node(to)?;
        let Some(message) = self.node_mut(from)?.dispatcher_mut().pop(to) else {
            bail!("no message queued from node {from} to node {to}");
        };
        let admission = self.nodes[to.index()].receive(message.clone());
        trace!(%from, %to, ?admission, "delivered");
        Ok(Delivery { message, admission })
    }

    /// Hands `message` to `to` directly, bypassing the queues.
    pub fn deliver(&mut self, to: NodeId, message: Message) -> Result<Admission> {
        Ok(self.node_mut(to)?.receive(message))
    }

    /// Delivers the oldest message of every non-empty queue of `from`. With
    /// probability `swap_probability` the two oldest messages of a queue swap
    /// places first. Returns whether anything was delivered; a stopped sender
    /// delivers nothing.
    ///
    /// # Errors
    ///
    /// Fails if `swap_probability` is not within `[0, 1]`.
    pub fn deliver_random<R: Rng>(
        &mut self,
        from: NodeId,
        rng: &mut R,
        swap_probability: f64,
    ) -> Result<bool> {
        ensure!(
            (0.0..=1.0).contains(&swap_probability),
            "swap probability must be within [0, 1], got {swap_probability}"
        );
        if !self.node(from)?.dispatcher().is_running() {
            return Ok(false);
        }

        let destinations = self.nodes[from.index()].dispatcher().destinations();
        for &to in &destinations {
            if rng.gen_bool(swap_probability) {
                self.nodes[from.index()].dispatcher_mut().swap_front(to);
            }
            self.deliver_first(from, to)?;
        }
        Ok(!destinations.is_empty())
    }

    /// One [`deliver_random`](Self::deliver_random) pass per sender, in id order.
    pub fn deliver_round<R: Rng>(
        &mut self,
        rng: &mut R,
        swap_probability: f64,
    ) -> Result<bool> {
        let senders: Vec<NodeId> = self.config.node_ids().collect();
        self.deliver_from(senders, rng, swap_probability)
    }

    /// Like [`deliver_round`](Self::deliver_round) with senders in random order.
    pub fn deliver_shuffled_round<R: Rng>(
        &mut self,
        rng: &mut R,
        swap_probability: f64,
    ) -> Result<bool> {
        let mut senders: Vec<NodeId> = self.config.node_ids().collect();
        senders.shuffle(rng);
        self.deliver_from(senders, rng, swap_probability)
    }

    fn deliver_from<R: Rng>(
        &mut self,
        senders: Vec<NodeId>,
        rng: &mut R,
        swap_probability: f64,
    ) -> Result<bool> {
        let mut delivered = false;
        for from in senders {
            delivered |= self.deliver_random(from, rng, swap_probability)?;
        }
        Ok(delivered)
    }

    /// Drops everything `from` has queued.
    pub fn clear_queues(&mut self, from: NodeId) -> Result<()> {
        self.node_mut(from)?.dispatcher_mut().clear();
        Ok(())
    }

    /// Messages still queued by running senders.
    pub fn in_flight(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.dispatcher().is_running())
            .map(|node| node.dispatcher().in_flight())
            .sum()
    }

    pub fn queue_len(&self, from: NodeId, to: NodeId) -> usize {
        self.nodes
            .get(from.index())
            .map_or(0, |node| node.dispatcher().queue_len(to))
    }

    pub fn committed(&self, id: NodeId) -> Result<Vec<Carry>> {
        Ok(self.node(id)?.committer().entries())
    }

    /// Committed logs of all nodes, indexed by node id.
    pub fn logs(&self) -> Vec<Vec<Carry>> {
        self.nodes
            .iter()
            .map(|node| node.committer().entries())
            .collect()
    }

    /// Running nodes that hold nothing for their current slot and so may
    /// propose.
    pub fn idle_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.dispatcher().is_running() && node.is_idle())
            .map(CalmConsensuser::id)
            .collect()
    }

    /// First node of [`idle_nodes`](Self::idle_nodes).
    pub fn find_idle(&self) -> Option<NodeId> {
        self.idle_nodes().first().copied()
    }
}
