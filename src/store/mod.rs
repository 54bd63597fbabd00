//! Known-peer persistence
//!
//! The networking layer reads dial candidates from, and reports attempt
//! and success timestamps back to, a [`PeerStore`]. The store owns its own
//! transactional discipline; the manager never caches records longer than
//! one maintenance tick.

pub mod file;

pub use file::FilePeerStore;

use crate::network::address::PeerAddress;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Storage errors. The manager treats these as collaborator failures:
/// logged, never fatal to the process.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One known peer address with its connection bookkeeping. Timestamps are
/// Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: PeerAddress,
    pub first_seen: i64,
    pub last_attempt: Option<i64>,
    pub last_success: Option<i64>,
}

impl PeerRecord {
    pub fn new(address: PeerAddress, first_seen: i64) -> Self {
        Self {
            address,
            first_seen,
            last_attempt: None,
            last_success: None,
        }
    }
}

/// Persistence collaborator consumed by the peer manager.
///
/// `record_attempt` and `record_success` insert the address when it is not
/// yet known, so bookkeeping never races address discovery.
pub trait PeerStore: Send + Sync + 'static {
    /// Every known address with its bookkeeping.
    fn known_peers(&self) -> Result<Vec<PeerRecord>, StoreError>;

    /// Add an address if new; existing bookkeeping is kept.
    fn upsert(&self, address: &PeerAddress, now: i64) -> Result<(), StoreError>;

    /// Stamp a dial attempt; gates the backoff window.
    fn record_attempt(&self, address: &PeerAddress, timestamp: i64) -> Result<(), StoreError>;

    /// Stamp a completed outbound handshake.
    fn record_success(&self, address: &PeerAddress, timestamp: i64) -> Result<(), StoreError>;
}

/// In-memory store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryPeerStore {
    records: Mutex<HashMap<PeerAddress, PeerRecord>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PeerStore for MemoryPeerStore {
    fn known_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(lock(&self.records).values().cloned().collect())
    }

    fn upsert(&self, address: &PeerAddress, now: i64) -> Result<(), StoreError> {
        lock(&self.records)
            .entry(address.clone())
            .or_insert_with(|| PeerRecord::new(address.clone(), now));
        Ok(())
    }

    fn record_attempt(&self, address: &PeerAddress, timestamp: i64) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        let record = records
            .entry(address.clone())
            .or_insert_with(|| PeerRecord::new(address.clone(), timestamp));
        record.last_attempt = Some(timestamp);
        Ok(())
    }

    fn record_success(&self, address: &PeerAddress, timestamp: i64) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        let record = records
            .entry(address.clone())
            .or_insert_with(|| PeerRecord::new(address.clone(), timestamp));
        record.last_success = Some(timestamp);
        Ok(())
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_keeps_existing_bookkeeping() {
        let store = MemoryPeerStore::new();
        let address = PeerAddress::new("10.0.0.1", 9784);

        store.upsert(&address, 100).unwrap();
        store.record_attempt(&address, 200).unwrap();
        store.upsert(&address, 300).unwrap();

        let records = store.known_peers().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_seen, 100);
        assert_eq!(records[0].last_attempt, Some(200));
        assert_eq!(records[0].last_success, None);
    }

    #[test]
    fn test_bookkeeping_inserts_unknown_addresses() {
        let store = MemoryPeerStore::new();
        let address = PeerAddress::new("10.0.0.2", 9784);

        store.record_success(&address, 500).unwrap();

        let records = store.known_peers().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].last_success, Some(500));
    }
}
