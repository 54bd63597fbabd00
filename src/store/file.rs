//! File-backed peer store
//!
//! Keeps the working set in memory and mirrors every mutation to a JSON
//! document, written to a temporary file and atomically renamed into
//! place.

use super::{lock, PeerRecord, PeerStore, StoreError};
use crate::network::address::PeerAddress;
use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File name inside the data directory.
const PEERS_FILE: &str = "peers.json";

/// JSON-persisted peer store.
pub struct FilePeerStore {
    path: PathBuf,
    records: Mutex<HashMap<PeerAddress, PeerRecord>>,
}

impl FilePeerStore {
    /// Open (or create) the store inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(PEERS_FILE);

        let records = if path.exists() {
            let file = fs::File::open(&path)?;
            let reader = BufReader::new(file);
            let loaded: Vec<PeerRecord> = serde_json::from_reader(reader)?;
            log::info!("loaded {} known peers from {}", loaded.len(), path.display());
            loaded
                .into_iter()
                .map(|record| (record.address.clone(), record))
                .collect()
        } else {
            HashMap::new()
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Write the full record set to a temporary file, then rename it over
    /// the live document.
    fn save(&self, records: &HashMap<PeerAddress, PeerRecord>) -> Result<(), StoreError> {
        let temp_path = self.path.with_extension("tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);

        let mut listed: Vec<&PeerRecord> = records.values().collect();
        listed.sort_by_key(|record| record.first_seen);
        serde_json::to_writer_pretty(writer, &listed)?;

        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

impl PeerStore for FilePeerStore {
    fn known_peers(&self) -> Result<Vec<PeerRecord>, StoreError> {
        Ok(lock(&self.records).values().cloned().collect())
    }

    fn upsert(&self, address: &PeerAddress, now: i64) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        if records.contains_key(address) {
            return Ok(());
        }
        records.insert(address.clone(), PeerRecord::new(address.clone(), now));
        self.save(&records)
    }

    fn record_attempt(&self, address: &PeerAddress, timestamp: i64) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        let record = records
            .entry(address.clone())
            .or_insert_with(|| PeerRecord::new(address.clone(), timestamp));
        record.last_attempt = Some(timestamp);
        self.save(&records)
    }

    fn record_success(&self, address: &PeerAddress, timestamp: i64) -> Result<(), StoreError> {
        let mut records = lock(&self.records);
        let record = records
            .entry(address.clone())
            .or_insert_with(|| PeerRecord::new(address.clone(), timestamp));
        record.last_success = Some(timestamp);
        self.save(&records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let address = PeerAddress::new("node.example.com", 9784);

        {
            let store = FilePeerStore::open(dir.path()).unwrap();
            store.upsert(&address, 100).unwrap();
            store.record_attempt(&address, 200).unwrap();
            store.record_success(&address, 300).unwrap();
        }

        let store = FilePeerStore::open(dir.path()).unwrap();
        let records = store.known_peers().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].address, address);
        assert_eq!(records[0].first_seen, 100);
        assert_eq!(records[0].last_attempt, Some(200));
        assert_eq!(records[0].last_success, Some(300));
    }

    #[test]
    fn test_open_on_empty_directory_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePeerStore::open(dir.path()).unwrap();
        assert!(store.known_peers().unwrap().is_empty());
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePeerStore::open(dir.path()).unwrap();
        store
            .upsert(&PeerAddress::new("10.0.0.9", 9784), 1)
            .unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![PEERS_FILE.to_string()]);
    }
}
