//! Request-ID and reference-number generation.
//!
//! The protocol draws random 32-bit IDs for requests and transfer
//! reference numbers. The source is injected so production uses a
//! secure stream while tests pin an exact sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Source of 32-bit transaction IDs and transfer reference numbers.
pub trait IdSource: Send {
    /// Draw the next ID.
    fn next_id(&mut self) -> u32;
}

/// Production ID source backed by a CSPRNG seeded from the OS.
pub struct RandomIds(StdRng);

impl RandomIds {
    /// Create a new entropy-seeded source.
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for RandomIds {
    fn next_id(&mut self) -> u32 {
        self.0.gen()
    }
}

/// Deterministic ID source that replays a fixed sequence, cycling when
/// exhausted. Used by tests that assert exact wire bytes.
pub struct SeqIds {
    seq: Vec<u32>,
    pos: usize,
}

impl SeqIds {
    /// Create a source replaying `seq`.
    pub fn new(seq: Vec<u32>) -> Self {
        assert!(!seq.is_empty(), "SeqIds needs at least one value");
        Self { seq, pos: 0 }
    }

    /// The sequence the reference test vectors assume (a deterministic
    /// generator seeded with 1).
    pub fn reference() -> Self {
        Self::new(vec![0x9acb_0442, 0xf0c5_341e, 0x52fd_fc07, 0x8166_1aef, 0x2693_2c21])
    }
}

impl IdSource for SeqIds {
    fn next_id(&mut self) -> u32 {
        let id = self.seq[self.pos % self.seq.len()];
        self.pos += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seq_ids_replay_and_cycle() {
        let mut ids = SeqIds::new(vec![1, 2]);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_reference_sequence() {
        let mut ids = SeqIds::reference();
        assert_eq!(ids.next_id(), 0x9acb_0442);
        assert_eq!(ids.next_id(), 0xf0c5_341e);
        assert_eq!(ids.next_id(), 0x52fd_fc07);
    }

    #[test]
    fn test_random_ids_vary() {
        let mut ids = RandomIds::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();
        // Three identical draws from a CSPRNG would be astonishing.
        assert!(a != b || b != c);
    }
}
