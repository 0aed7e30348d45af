//! TCP transport: JSON-lines messages over one persistent connection per peer.
//!
//! The dispatcher itself never touches a socket. [`TcpDispatcher::broadcast`]
//! pushes `(peer, message)` pairs onto a channel and returns; [`run_sender`]
//! fans them out to one link task per peer, so messages to the same peer keep
//! their order. [`run_listener`] accepts peer connections and forwards every
//! decoded message to the node's worker.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::carry::Carries;
use crate::clock::{Admission, LogicalClock, NodeId, StepId};
use crate::configuration::MasterlessConfiguration;
use crate::dispatcher::Dispatcher;
use crate::message::{read_message, write_message, Message};

pub type Outbound = (NodeId, Message);

pub struct TcpDispatcher {
    clock: LogicalClock,
    peers: Vec<NodeId>,
    outbound: UnboundedSender<Outbound>,
}

impl TcpDispatcher {
    pub fn new(
        id: NodeId,
        config: MasterlessConfiguration,
        outbound: UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            clock: LogicalClock::new(id, config.size()),
            peers: config.node_ids().filter(|peer| *peer != id).collect(),
            outbound,
        }
    }
}

impl Dispatcher for TcpDispatcher {
    fn broadcast(&mut self, carries: Carries) {
        let Some(message) = self.clock.stamp_carries(carries) else {
            return;
        };
        for &peer in &self.peers {
            if self.outbound.send((peer, message.clone())).is_err() {
                warn!(node = %self.clock.node_id(), "sender task is gone, dropping broadcast");
                return;
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

/// How long a dial may take before the message that triggered it is dropped.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Routes queued messages to one link task per peer until the channel closes.
///
/// Each link owns its connection and its own queue, so a peer that is slow to
/// answer or down only delays messages addressed to itself. Per-peer order is
/// kept because every message to a peer goes through the same link.
pub async fn run_sender(
    peers: BTreeMap<NodeId, SocketAddr>,
    mut outbound: UnboundedReceiver<Outbound>,
) {
    let mut links = JoinSet::new();
    let mut queues = HashMap::new();
    for (peer, addr) in peers {
        let (tx, rx) = unbounded_channel();
        queues.insert(peer, tx);
        links.spawn(run_link(peer, addr, rx));
    }

    while let Some((peer, message)) = outbound.recv().await {
        let Some(queue) = queues.get(&peer) else {
            warn!(%peer, "no address for peer, dropping message");
            continue;
        };
        if queue.send(message).is_err() {
            warn!(%peer, "link task is gone, dropping message");
        }
    }

    drop(queues);
    while links.join_next().await.is_some() {}
    debug!("outbound channel closed, sender stopping");
}

/// Writes messages for one peer in order. A failed dial or write drops that
/// message and the connection; the next message dials again.
async fn run_link(peer: NodeId, addr: SocketAddr, mut queue: UnboundedReceiver<Message>) {
    let mut stream = None;
    while let Some(message) = queue.recv().await {
        if let Err(err) = send_to(&mut stream, addr, &message).await {
            warn!(%peer, %addr, error = %err, "failed to send message");
            stream = None;
        }
    }
}

async fn send_to(
    stream: &mut Option<TcpStream>,
    addr: SocketAddr,
    message: &Message,
) -> io::Result<()> {
    let stream = match stream {
        Some(stream) => stream,
        None => {
            let connected = connect(addr).await?;
            debug!(%addr, "connected to peer");
            stream.insert(connected)
        }
    };
    write_message(stream, message).await
}

async fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| {
            io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connecting to {addr} timed out"),
            )
        })??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Accepts peer connections forever, forwarding every message to `inbound`.
pub async fn run_listener(listener: TcpListener, inbound: UnboundedSender<Message>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let inbound = inbound.clone();
                tokio::spawn(async move {
                    if let Err(err) = read_connection(stream, inbound).await {
                        warn!(peer = %addr, error = ?err, "peer connection closed with error");
                    }
                });
            }
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
}

async fn read_connection(stream: TcpStream, inbound: UnboundedSender<Message>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    while let Some(message) = read_message::<_, Message>(&mut reader).await? {
        if inbound.send(message).is_err() {
            break;
        }
    }
    Ok(())
}
