//! Sinks for committed carries.
//!
//! The engine calls [`Committer::on_commit`] once per committed carry, in log
//! order: slot by slot, and in carry order within a slot that decided several.
//! What happens next is up to the application:
//! - [`CommitLog`] keeps the sequence in memory behind a cloneable handle,
//!   which is what the simulation and the checkers read.
//! - [`ChannelCommitter`] hands each carry to another task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

use crate::carry::Carry;

pub trait Committer {
    fn on_commit(&mut self, carry: Carry);
}

/// Append-only in-memory log of committed carries.
///
/// Clones share the same log, so a test can keep one handle while the
/// engine owns another.
#[derive(Debug, Clone, Default)]
pub struct CommitLog {
    entries: Arc<Mutex<Vec<Carry>>>,
}

impl CommitLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the committed sequence.
    pub fn entries(&self) -> Vec<Carry> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn last(&self) -> Option<Carry> {
        self.lock().last().cloned()
    }

    // A panic while holding the lock cannot leave a half-appended entry.
    fn lock(&self) -> MutexGuard<'_, Vec<Carry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Committer for CommitLog {
    fn on_commit(&mut self, carry: Carry) {
        self.lock().push(carry);
    }
}

/// Forwards committed carries to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelCommitter {
    tx: UnboundedSender<Carry>,
}

impl ChannelCommitter {
    pub fn new(tx: UnboundedSender<Carry>) -> Self {
        Self { tx }
    }
}

impl Committer for ChannelCommitter {
    fn on_commit(&mut self, carry: Carry) {
        if let Err(err) = self.tx.send(carry) {
            warn!(carry = %err.0, "commit receiver dropped, carry not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_log() {
        let log = CommitLog::new();
        let mut writer = log.clone();
        writer.on_commit(Carry::from("a"));
        writer.on_commit(Carry::from("b"));

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries(), vec![Carry::from("a"), Carry::from("b")]);
        assert_eq!(log.last(), Some(Carry::from("b")));
    }

    #[test]
    fn channel_committer_forwards_in_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut committer = ChannelCommitter::new(tx);
        committer.on_commit(Carry::from("a"));
        committer.on_commit(Carry::from("b"));

        assert_eq!(rx.try_recv().unwrap(), Carry::from("a"));
        assert_eq!(rx.try_recv().unwrap(), Carry::from("b"));
    }

    #[test]
    fn closed_channel_is_not_fatal() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let mut committer = ChannelCommitter::new(tx);
        committer.on_commit(Carry::from("lost"));
    }
}
