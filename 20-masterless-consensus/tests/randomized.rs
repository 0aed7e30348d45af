//! Randomized delivery schedules on the in-memory network, seeded for
//! reproducibility.

use anyhow::{bail, ensure, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use masterless_consensus::{
    verify_committed_once, verify_prefix_agreement, verify_replicated, Carry, LocalNetwork,
    MasterlessConfiguration, NodeId,
};

const SEED: u64 = 42;
const SWAP_PROBABILITY: f64 = 0.1;
const DISCONNECT_PROBABILITY: f64 = 0.01;
const PROPOSE_PROBABILITY: f64 = 0.3;
const MAX_ROUNDS: usize = 100_000;

/// Who proposes after each delivery round.
#[derive(Clone, Copy)]
enum Proposals {
    /// The first idle node proposes the next carry.
    OneAtATime,
    /// Every idle node proposes the next carry with [`PROPOSE_PROBABILITY`],
    /// so several nodes routinely compete for the same slot.
    Contended,
}

struct Run {
    network: LocalNetwork,
    carries: Vec<Carry>,
    rng: StdRng,
    proposed: usize,
    proposals: Proposals,
}

impl Run {
    fn new(nodes: u32, carries: usize, proposals: Proposals) -> Result<Self> {
        Ok(Self {
            network: LocalNetwork::new(MasterlessConfiguration::new(nodes)?),
            carries: Carry::batch(carries),
            rng: StdRng::seed_from_u64(SEED),
            proposed: 0,
            proposals,
        })
    }

    fn exhausted(&self) -> bool {
        self.proposed == self.carries.len()
    }

    /// Hands out the next carries to idle nodes. Returns whether a proposal
    /// was made.
    fn propose_next(&mut self) -> Result<bool> {
        let mut proposed = false;
        for id in self.network.idle_nodes() {
            if self.exhausted() {
                break;
            }
            if let Proposals::Contended = self.proposals {
                if !self.rng.gen_bool(PROPOSE_PROBABILITY) {
                    continue;
                }
            }
            self.network.propose(id, self.carries[self.proposed].clone())?;
            self.proposed += 1;
            proposed = true;
            if let Proposals::OneAtATime = self.proposals {
                break;
            }
        }
        Ok(proposed)
    }

    /// Interleaves proposals with shuffled delivery rounds until no message is
    /// left and nothing more can be proposed. `before_round` runs first in
    /// every round.
    fn drive(
        &mut self,
        mut before_round: impl FnMut(&mut LocalNetwork, &mut StdRng) -> Result<()>,
    ) -> Result<()> {
        for _ in 0..MAX_ROUNDS {
            before_round(&mut self.network, &mut self.rng)?;
            let delivered = self
                .network
                .deliver_shuffled_round(&mut self.rng, SWAP_PROBABILITY)?;
            let proposed = self.propose_next()?;
            let stuck = self.exhausted() || self.network.idle_nodes().is_empty();
            if !delivered && !proposed && self.network.in_flight() == 0 && stuck {
                return Ok(());
            }
        }
        bail!("no quiescence after {MAX_ROUNDS} rounds");
    }

    /// No node commits a carry twice or out of proposal order.
    fn check_order(&self) -> Result<()> {
        let logs = self.network.logs();
        verify_committed_once(&logs, &self.carries)?;
        for (node, log) in logs.iter().enumerate() {
            ensure!(
                log.windows(2).all(|pair| pair[0] < pair[1]),
                "node {node} committed carries out of proposal order: {log:?}"
            );
        }
        Ok(())
    }
}

/// Without disconnects every carry is proposed and every node ends up with
/// all of them, in proposal order.
fn run_random(nodes: u32, carries: usize, proposals: Proposals) -> Result<()> {
    let mut run = Run::new(nodes, carries, proposals)?;
    run.drive(|_, _| Ok(()))?;

    ensure!(run.exhausted(), "only {} carries were proposed", run.proposed);
    run.check_order()?;
    verify_replicated(&run.network.logs(), &run.carries)
}

/// Stops up to `failures` random nodes along the way. The nodes left running
/// must agree, and must have kept committing.
fn run_random_disconnects(
    nodes: u32,
    carries: usize,
    failures: usize,
    proposals: Proposals,
) -> Result<()> {
    let mut run = Run::new(nodes, carries, proposals)?;
    let mut doomed: Vec<NodeId> = (0..nodes).map(NodeId).collect();
    doomed.shuffle(&mut run.rng);
    doomed.truncate(failures);

    run.drive(|network, rng| {
        if !doomed.is_empty() && rng.gen_bool(DISCONNECT_PROBABILITY) {
            let victim = doomed.remove(0);
            network.disconnect(victim)?;
        }
        Ok(())
    })?;
    run.check_order()?;

    // A node that crashed right after committing a slot may hold fewer
    // carries of that slot than the survivors went on to commit.
    let survivors: Vec<Vec<Carry>> = (0..nodes)
        .map(NodeId)
        .filter(|id| run.network.is_running(*id))
        .map(|id| run.network.committed(id))
        .collect::<Result<_>>()?;
    verify_prefix_agreement(&survivors)?;
    ensure!(
        survivors.iter().all(|log| !log.is_empty()),
        "a surviving node committed nothing"
    );
    Ok(())
}

#[test]
fn random_two_nodes_one_carry() -> Result<()> {
    run_random(2, 1, Proposals::OneAtATime)
}

#[test]
fn random_five_nodes_ten_carries() -> Result<()> {
    run_random(5, 10, Proposals::OneAtATime)
}

#[test]
fn random_five_nodes_hundred_carries() -> Result<()> {
    run_random(5, 100, Proposals::OneAtATime)
}

#[test]
fn random_ten_nodes_ten_carries() -> Result<()> {
    run_random(10, 10, Proposals::OneAtATime)
}

#[test]
fn random_ten_nodes_hundred_carries() -> Result<()> {
    run_random(10, 100, Proposals::OneAtATime)
}

#[test]
fn random_contended_three_nodes() -> Result<()> {
    run_random(3, 30, Proposals::Contended)
}

#[test]
fn random_contended_five_nodes() -> Result<()> {
    run_random(5, 50, Proposals::Contended)
}

#[test]
fn random_contended_ten_nodes() -> Result<()> {
    run_random(10, 100, Proposals::Contended)
}

#[test]
fn random_disconnects_five_nodes() -> Result<()> {
    run_random_disconnects(5, 10, 2, Proposals::OneAtATime)
}

#[test]
fn random_disconnects_five_nodes_hundred_carries() -> Result<()> {
    run_random_disconnects(5, 100, 2, Proposals::OneAtATime)
}

#[test]
fn random_disconnects_ten_nodes() -> Result<()> {
    run_random_disconnects(10, 10, 4, Proposals::OneAtATime)
}

#[test]
fn random_disconnects_ten_nodes_hundred_carries() -> Result<()> {
    run_random_disconnects(10, 100, 4, Proposals::OneAtATime)
}

#[test]
fn random_contended_disconnects_five_nodes() -> Result<()> {
    run_random_disconnects(5, 50, 2, Proposals::Contended)
}

#[test]
fn random_contended_disconnects_ten_nodes() -> Result<()> {
    run_random_disconnects(10, 100, 4, Proposals::Contended)
}

/// With every message drained before the next proposal, each slot holds
/// exactly one carry.
#[test]
fn quiescent_proposals_replicate_everywhere() -> Result<()> {
    let mut network = LocalNetwork::new(MasterlessConfiguration::new(5)?);
    let carries = Carry::batch(20);
    let mut rng = StdRng::seed_from_u64(SEED);

    for (slot, carry) in carries.iter().enumerate() {
        let proposer = NodeId(rng.gen_range(0..5));
        network.propose(proposer, carry.clone())?;
        while network.deliver_shuffled_round(&mut rng, SWAP_PROBABILITY)? {}
        ensure!(network.in_flight() == 0, "messages left after slot {slot}");
        ensure!(
            network.node(proposer)?.slot().0 == slot as u64 + 1,
            "slot {slot} took more than one carry"
        );
    }

    verify_replicated(&network.logs(), &carries)
}

#[test]
fn in_order_rounds_replicate_everywhere() -> Result<()> {
    let mut network = LocalNetwork::new(MasterlessConfiguration::new(3)?);
    let carries = Carry::batch(10);
    let mut rng = StdRng::seed_from_u64(SEED);

    for carry in &carries {
        network.propose(NodeId(0), carry.clone())?;
        while network.deliver_round(&mut rng, 0.0)? {}
    }

    verify_replicated(&network.logs(), &carries)
}
