//! Opaque values that replicas agree upon.
//!
//! The consensus core never looks inside a [`Carry`]: it only clones, compares
//! and orders them. Applications decide what the bytes mean.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque application value submitted for agreement.
///
/// When several carries are decided in the same slot they are committed in
/// `Ord` order, which is plain byte order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Carry(Vec<u8>);

/// The carries a node holds for one slot. Only ever grows within a slot.
pub type Carries = BTreeSet<Carry>;

impl Carry {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// A distinguishable carry for tests and demos: `carry-<index>`, zero
    /// padded so that byte order matches index order.
    pub fn numbered(index: usize) -> Self {
        Self::new(format!("carry-{index:05}"))
    }

    /// `count` distinct numbered carries, in proposal order.
    pub fn batch(count: usize) -> Vec<Self> {
        (0..count).map(Self::numbered).collect()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<&str> for Carry {
    fn from(value: &str) -> Self {
        Self::new(value.as_bytes())
    }
}

impl From<String> for Carry {
    fn from(value: String) -> Self {
        Self::new(value.into_bytes())
    }
}

impl From<Vec<u8>> for Carry {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl fmt::Display for Carry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}
