//! Diagnostic identifiers for clients and server connections
//!
//! Identifiers are only used to correlate log lines. Each one carries a short
//! prefix naming its kind (`c` for clients, `s` for servers, `a` for internal
//! auth query clients) followed by a hex-encoded value that is unique within
//! the generator that produced it.

use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of bytes of per-generator seed in every identifier
const SEED_LEN: usize = 4;

/// Number of bytes of sequence number in every identifier
const SEQ_LEN: usize = 6;

/// Diagnostic identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Id {
    prefix: &'static str,
    value: [u8; SEED_LEN + SEQ_LEN],
}

impl Id {
    /// Kind prefix of the identifier
    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    /// Raw identifier value without the prefix
    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.prefix, hex::encode(self.value))
    }
}

/// Identifier generator
///
/// A generator mixes a random seed drawn at construction with a monotonic
/// sequence, so identifiers never repeat for the lifetime of the generator and
/// rarely collide across processes.
#[derive(Debug)]
pub struct IdGenerator {
    seed: [u8; SEED_LEN],
    sequence: AtomicU64,
}

impl IdGenerator {
    /// Create a generator with a random seed
    pub fn new() -> Self {
        Self::with_seed(rand::thread_rng().gen())
    }

    /// Create a generator with a fixed seed
    pub fn with_seed(seed: [u8; SEED_LEN]) -> Self {
        Self {
            seed,
            sequence: AtomicU64::new(0),
        }
    }

    /// Generate a new identifier with the given kind prefix
    pub fn generate(&self, prefix: &'static str) -> Id {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut value = [0u8; SEED_LEN + SEQ_LEN];
        value[..SEED_LEN].copy_from_slice(&self.seed);
        value[SEED_LEN..].copy_from_slice(&sequence.to_be_bytes()[8 - SEQ_LEN..]);

        Id { prefix, value }
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
