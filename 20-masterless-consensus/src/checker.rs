//! Consistency checks over committed logs, indexed by node id.

use std::collections::BTreeSet;

use anyhow::{bail, ensure, Result};

use crate::carry::Carry;

/// Fails unless every pair of logs agrees on their common prefix.
///
/// Logs of different lengths are fine: a node that stopped early or fell
/// behind simply holds a shorter prefix of the same sequence.
pub fn verify_prefix_agreement(logs: &[Vec<Carry>]) -> Result<()> {
    for (left, left_log) in logs.iter().enumerate() {
        for (right, right_log) in logs.iter().enumerate().skip(left + 1) {
            let diverged = left_log
                .iter()
                .zip(right_log)
                .position(|(a, b)| a != b);
            if let Some(entry) = diverged {
                bail!(
                    "nodes {left} and {right} disagree at entry {entry}: {} vs {}",
                    left_log[entry],
                    right_log[entry]
                );
            }
        }
    }
    Ok(())
}

/// Fails unless every committed carry was `proposed` and no log holds a carry
/// twice.
pub fn verify_committed_once(logs: &[Vec<Carry>], proposed: &[Carry]) -> Result<()> {
    let proposed: BTreeSet<&Carry> = proposed.iter().collect();
    for (node, log) in logs.iter().enumerate() {
        let mut seen = BTreeSet::new();
        for carry in log {
            ensure!(
                proposed.contains(carry),
                "node {node} committed {carry}, which nobody proposed"
            );
            ensure!(seen.insert(carry), "node {node} committed {carry} twice");
        }
    }
    Ok(())
}

/// Fails unless every log equals `expected`.
pub fn verify_replicated(logs: &[Vec<Carry>], expected: &[Carry]) -> Result<()> {
    for (node, log) in logs.iter().enumerate() {
        ensure!(
            log.as_slice() == expected,
            "node {node} committed {} carries, expected {}: {log:?}",
            log.len(),
            expected.len()
        );
    }
    Ok(())
}
