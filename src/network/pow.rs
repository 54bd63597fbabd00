//! Proof-of-work connection gate
//!
//! A deliberately expensive puzzle solved once per outbound handshake to
//! throttle automated mass-connection abuse. The puzzle input is the 24-byte
//! buffer `nonce(8) | salt(8) | timestamp(8)`; a solution is accepted when
//! the first `difficulty` bytes of its SHA-256 digest are zero.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Leading zero bytes required of the digest.
pub const DEFAULT_DIFFICULTY: usize = 2;

/// Permitted distance between a proof's timestamp and the verifier's own
/// record of when the connection started.
pub const DEFAULT_MAX_SKEW_MS: i64 = 1000;

/// How many nonces are tried between cancellation checks.
const CANCEL_CHECK_INTERVAL: u64 = 256;

/// Reasons a proof is rejected. All are fatal to the handshake.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofError {
    #[error("proof timestamp {got} outside allowed skew of connection start {expected}")]
    TimestampSkew { expected: i64, got: i64 },
    #[error("proof salt already seen")]
    ReplayedSalt,
    #[error("proof digest does not meet difficulty")]
    BadNonce,
}

/// Verifier state. One instance lives on the peer manager; the seen-salt
/// set is append-only for the process run.
pub struct ProofOfWork {
    difficulty: usize,
    max_skew_ms: i64,
    seen_salts: Mutex<HashSet<u64>>,
}

impl ProofOfWork {
    pub fn new(difficulty: usize, max_skew_ms: i64) -> Self {
        Self {
            difficulty,
            max_skew_ms,
            seen_salts: Mutex::new(HashSet::new()),
        }
    }

    /// Digest of the 24-byte puzzle buffer.
    pub fn digest(timestamp: i64, salt: u64, nonce: u64) -> [u8; 32] {
        let mut buf = [0u8; 24];
        buf[..8].copy_from_slice(&nonce.to_be_bytes());
        buf[8..16].copy_from_slice(&salt.to_be_bytes());
        buf[16..].copy_from_slice(&timestamp.to_be_bytes());
        Sha256::digest(buf).into()
    }

    /// Whether the digest's first `difficulty` bytes are all zero.
    pub fn meets_difficulty(digest: &[u8], difficulty: usize) -> bool {
        digest.iter().take(difficulty).all(|byte| *byte == 0)
    }

    /// The acceptance predicate alone, with no bookkeeping.
    pub fn check(&self, timestamp: i64, salt: u64, nonce: u64) -> bool {
        Self::meets_difficulty(&Self::digest(timestamp, salt, nonce), self.difficulty)
    }

    /// Fresh random salt for an outbound proof.
    pub fn random_salt() -> u64 {
        rand::random()
    }

    /// Search nonces sequentially from zero until the predicate holds.
    /// Returns `None` if the cancellation flag is raised; the flag is
    /// polled every [`CANCEL_CHECK_INTERVAL`] iterations so shutdown stays
    /// responsive.
    pub fn solve(&self, timestamp: i64, salt: u64, cancel: &AtomicBool) -> Option<u64> {
        let mut nonce: u64 = 0;
        loop {
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
                return None;
            }
            if self.check(timestamp, salt, nonce) {
                return Some(nonce);
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Full verification of an inbound-originated proof: timestamp skew,
    /// salt replay, then the digest predicate. The salt is recorded as seen
    /// only on acceptance.
    pub fn verify(
        &self,
        connection_start: i64,
        timestamp: i64,
        salt: u64,
        nonce: u64,
    ) -> Result<(), ProofError> {
        self.check_skew(connection_start, timestamp)?;

        let mut seen = lock(&self.seen_salts);
        if seen.contains(&salt) {
            return Err(ProofError::ReplayedSalt);
        }
        if !self.check(timestamp, salt, nonce) {
            return Err(ProofError::BadNonce);
        }
        seen.insert(salt);
        log::debug!("proof accepted, {} salts seen this run", seen.len());
        Ok(())
    }

    /// Verification of the echoed confirmation on the outbound side: skew
    /// and predicate only. Salt bookkeeping belongs to the inbound check.
    pub fn verify_echo(
        &self,
        connection_start: i64,
        timestamp: i64,
        salt: u64,
        nonce: u64,
    ) -> Result<(), ProofError> {
        self.check_skew(connection_start, timestamp)?;
        if !self.check(timestamp, salt, nonce) {
            return Err(ProofError::BadNonce);
        }
        Ok(())
    }

    fn check_skew(&self, connection_start: i64, timestamp: i64) -> Result<(), ProofError> {
        if (timestamp - connection_start).abs() > self.max_skew_ms {
            return Err(ProofError::TimestampSkew {
                expected: connection_start,
                got: timestamp,
            });
        }
        Ok(())
    }

    /// Number of salts recorded since startup.
    pub fn seen_salts(&self) -> usize {
        lock(&self.seen_salts).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000_000;

    fn pow(difficulty: usize) -> ProofOfWork {
        ProofOfWork::new(difficulty, DEFAULT_MAX_SKEW_MS)
    }

    #[test]
    fn test_predicate_matches_digest() {
        let pow = pow(1);
        let cancel = AtomicBool::new(false);
        let salt = 42;
        let nonce = pow.solve(T0, salt, &cancel).unwrap();

        assert!(pow.check(T0, salt, nonce));
        let digest = ProofOfWork::digest(T0, salt, nonce);
        assert!(ProofOfWork::meets_difficulty(&digest, 1));

        // Any of the three inputs changing invalidates the solution with
        // overwhelming probability.
        assert!(!pow.check(T0 + 1, salt, nonce) || !pow.check(T0, salt + 1, nonce));
    }

    #[test]
    fn test_zero_difficulty_accepts_any_nonce() {
        let pow = pow(0);
        assert!(pow.check(T0, 1, 0));
    }

    #[test]
    fn test_verify_accepts_then_rejects_replayed_salt() {
        let pow = pow(1);
        let cancel = AtomicBool::new(false);
        let salt = 7;
        let nonce = pow.solve(T0, salt, &cancel).unwrap();

        assert_eq!(pow.verify(T0, T0, salt, nonce), Ok(()));
        assert_eq!(pow.seen_salts(), 1);

        // Same salt with a still-valid nonce is a replay.
        assert_eq!(pow.verify(T0, T0, salt, nonce), Err(ProofError::ReplayedSalt));
    }

    #[test]
    fn test_verify_rejects_timestamp_skew() {
        let pow = pow(1);
        let cancel = AtomicBool::new(false);
        let timestamp = T0 + DEFAULT_MAX_SKEW_MS + 1;
        let nonce = pow.solve(timestamp, 9, &cancel).unwrap();

        let err = pow.verify(T0, timestamp, 9, nonce).unwrap_err();
        assert!(matches!(err, ProofError::TimestampSkew { .. }));
        // A skewed proof leaves no salt behind.
        assert_eq!(pow.seen_salts(), 0);

        // The same proof inside the window passes.
        assert_eq!(pow.verify(timestamp, timestamp, 9, nonce), Ok(()));
    }

    #[test]
    fn test_bad_nonce_does_not_burn_the_salt() {
        let pow = pow(2);
        let cancel = AtomicBool::new(false);
        let salt = 11;

        // Find a nonce that fails the predicate.
        let mut bad = 0;
        while pow.check(T0, salt, bad) {
            bad += 1;
        }
        assert_eq!(pow.verify(T0, T0, salt, bad), Err(ProofError::BadNonce));
        assert_eq!(pow.seen_salts(), 0);

        let nonce = pow.solve(T0, salt, &cancel).unwrap();
        assert_eq!(pow.verify(T0, T0, salt, nonce), Ok(()));
    }

    #[test]
    fn test_echo_verification_skips_replay_check() {
        let pow = pow(1);
        let cancel = AtomicBool::new(false);
        let salt = 13;
        let nonce = pow.solve(T0, salt, &cancel).unwrap();

        assert_eq!(pow.verify(T0, T0, salt, nonce), Ok(()));
        // The echo path accepts the same salt again.
        assert_eq!(pow.verify_echo(T0, T0, salt, nonce), Ok(()));
    }

    #[test]
    fn test_solve_observes_cancellation() {
        // Difficulty 8 is unsolvable in any reasonable time, so only the
        // cancellation flag can end the search.
        let pow = pow(8);
        let cancel = AtomicBool::new(true);
        assert_eq!(pow.solve(T0, 1, &cancel), None);
    }
}
