//! Runs one consensus node on the Tokio runtime.
//!
//! [`spawn_node`] starts three tasks:
//!
//! - **worker**: owns the [`CalmConsensuser`] and handles client requests and
//!   peer messages one at a time, so the engine itself needs no locks
//! - **listener**: accepts peer connections and feeds decoded messages to the
//!   worker
//! - **sender**: drains the dispatcher's outbound queue onto peer connections
//!
//! Callers talk to the worker through a [`NodeHandle`]; committed carries come
//! out of the channel returned next to it.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use anyhow::{anyhow, ensure, Context, Result};
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::carry::Carry;
use crate::clock::{NodeId, StepId};
use crate::committer::ChannelCommitter;
use crate::configuration::MasterlessConfiguration;
use crate::consensuser::{CalmConsensuser, Consensuser, Phase};
use crate::dispatcher::Dispatcher;
use crate::message::Message;
use crate::transport::{self, TcpDispatcher};

/// Identity of a node and the addresses of every member, itself included.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    pub peers: BTreeMap<NodeId, SocketAddr>,
}

impl NodeConfig {
    /// Membership implied by `peers`, which must be numbered `0..N` and
    /// contain this node.
    pub fn configuration(&self) -> Result<MasterlessConfiguration> {
        let size = u32::try_from(self.peers.len()).context("too many peers")?;
        let config = MasterlessConfiguration::new(size)?;
        ensure!(
            self.peers.keys().copied().eq(config.node_ids()),
            "peer ids must be numbered 0..{size}, got {:?}",
            self.peers.keys().collect::<Vec<_>>()
        );
        ensure!(
            config.contains(self.id),
            "node id {} missing from peers map",
            self.id
        );
        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.peers
            .get(&self.id)
            .copied()
            .ok_or_else(|| anyhow!("node id {} missing from peers map", self.id))
    }
}

/// Snapshot of a node, as reported by [`NodeHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub step: StepId,
    pub phase: Phase,
    pub reachable: BTreeSet<NodeId>,
    pub running: bool,
}

/// Cloneable handle to a running node's worker.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    request_tx: UnboundedSender<ClientRequest>,
}

impl NodeHandle {
    /// Proposes `carry` for the current slot. Returns once the proposal has
    /// been broadcast, not once it commits.
    pub async fn propose(&self, carry: Carry) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(ClientRequest::Propose { carry, respond_to })?;
        response.await.context("propose response channel closed")?
    }

    /// Tells the node that `peer` is unreachable.
    pub async fn disconnect(&self, peer: NodeId) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.send(ClientRequest::Disconnect { peer, respond_to })?;
        response.await.context("disconnect response channel closed")
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (respond_to, response) = oneshot::channel();
        self.send(ClientRequest::Status { respond_to })?;
        response.await.context("status response channel closed")
    }

    /// Stops the node. It stops sending and receiving, and its tasks exit.
    pub fn shutdown(&self) -> Result<()> {
        self.send(ClientRequest::Shutdown)
    }

    fn send(&self, request: ClientRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .map_err(|_| anyhow!("node worker has shut down"))
    }
}

#[derive(Debug)]
enum ClientRequest {
    Propose {
        carry: Carry,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        peer: NodeId,
        respond_to: oneshot::Sender<()>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Binds the node's address and spawns its tasks.
///
/// # Errors
///
/// Fails if the peer map is not a valid membership or the listen address
/// cannot be bound.
pub async fn spawn_node(config: NodeConfig) -> Result<(NodeHandle, UnboundedReceiver<Carry>)> {
    let membership = config.configuration()?;
    let addr = config.listen_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let (request_tx, request_rx) = unbounded_channel();
    let (inbound_tx, inbound_rx) = unbounded_channel();
    let (outbound_tx, outbound_rx) = unbounded_channel();
    let (commit_tx, commit_rx) = unbounded_channel();

    let remotes = config
        .peers
        .iter()
        .filter(|(id, _)| **id != config.id)
        .map(|(&id, &addr)| (id, addr))
        .collect();
    let tasks = vec![
        tokio::spawn(transport::run_listener(listener, inbound_tx)),
        tokio::spawn(transport::run_sender(remotes, outbound_rx)),
    ];

    let node = CalmConsensuser::new(
        config.id,
        membership,
        TcpDispatcher::new(config.id, membership, outbound_tx),
        ChannelCommitter::new(commit_tx),
    );
    info!(node = %config.id, %addr, size = membership.size(), "node listening");

    let worker = Worker {
        node,
        request_rx,
        inbound_rx,
        tasks,
    };
    tokio::spawn(worker.run());

    Ok((NodeHandle { request_tx }, commit_rx))
}

struct Worker {
    node: CalmConsensuser<TcpDispatcher, ChannelCommitter>,
    request_rx: UnboundedReceiver<ClientRequest>,
    inbound_rx: UnboundedReceiver<Message>,
    tasks: Vec<JoinHandle<()>>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            select! {
                request = self.request_rx.recv() => match request {
                    Some(request) => {
                        if !self.handle_request(request) {
                            break;
                        }
                    }
                    None => break,
                },
                message = self.inbound_rx.recv() => match message {
                    Some(message) => {
                        self.node.receive(message);
                    }
                    None => {
                        warn!(node = %self.node.id(), "listener stopped");
                        break;
                    }
                },
            }
        }

        self.node.pause();
        for task in &self.tasks {
            task.abort();
        }
        info!(node = %self.node.id(), "node stopped");
    }

    /// Returns `false` when the worker should stop.
    fn handle_request(&mut self, request: ClientRequest) -> bool {
        match request {
            ClientRequest::Propose { carry, respond_to } => {
                let _ = respond_to.send(self.node.propose(carry));
            }
            ClientRequest::Disconnect { peer, respond_to } => {
                self.node.on_disconnect(peer);
                let _ = respond_to.send(());
            }
            ClientRequest::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node.id(),
            step: self.node.dispatcher().step(),
            phase: self.node.phase(),
            reachable: self.node.reachable().clone(),
            running: self.node.dispatcher().is_running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(ports: &[u16]) -> BTreeMap<NodeId, SocketAddr> {
        ports
            .iter()
            .enumerate()
            .map(|(id, port)| {
                let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
                (NodeId(id as u32), addr)
            })
            .collect()
    }

    #[test]
    fn config_requires_dense_ids_containing_self() {
        let ok = NodeConfig {
            id: NodeId(1),
            peers: peers(&[7001, 7002, 7003]),
        };
        assert_eq!(ok.configuration().unwrap().size(), 3);
        assert_eq!(ok.listen_addr().unwrap().port(), 7002);

        let outsider = NodeConfig {
            id: NodeId(3),
            ..ok.clone()
        };
        assert!(outsider.configuration().is_err());
        assert!(outsider.listen_addr().is_err());

        let mut gap = ok.peers.clone();
        let addr = gap.remove(&NodeId(2)).unwrap();
        gap.insert(NodeId(5), addr);
        let sparse = NodeConfig { id: NodeId(0), peers: gap };
        assert!(sparse.configuration().is_err());

        let empty = NodeConfig {
            id: NodeId(0),
            peers: BTreeMap::new(),
        };
        assert!(empty.configuration().is_err());
    }

    #[tokio::test]
    async fn single_node_commits_its_own_proposal() -> Result<()> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        drop(listener);

        let (handle, mut commits) = spawn_node(NodeConfig {
            id: NodeId(0),
            peers: BTreeMap::from([(NodeId(0), addr)]),
        })
        .await?;

        handle.propose(Carry::from("solo")).await?;
        assert_eq!(commits.recv().await, Some(Carry::from("solo")));

        let status = handle.status().await?;
        assert_eq!(status.step, StepId(1));
        assert_eq!(status.phase, Phase::Idle);
        assert!(status.running);

        handle.shutdown()?;
        assert_eq!(commits.recv().await, None);
        Ok(())
    }
}
