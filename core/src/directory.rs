// Peer directory: append-only announcement log with a change stream
//
// Lets several coordinator processes learn about each other's peers. It is a
// distribution mechanism only; session state never lives here.

use crate::{now_ms, PeerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Malformed record: {0}")]
    Malformed(String),
}

impl From<sled::Error> for DirectoryError {
    fn from(e: sled::Error) -> Self {
        DirectoryError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for DirectoryError {
    fn from(e: serde_json::Error) -> Self {
        DirectoryError::Malformed(e.to_string())
    }
}

/// One announced peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    /// Position in the log; increases with every append
    pub offset: u64,
    pub peer_id: PeerId,
    /// Coordinator instance that wrote the record
    pub origin: String,
    /// Unix millis
    pub recorded_at: u64,
}

pub trait Directory: Send + Sync {
    /// Identity of this writer
    fn origin(&self) -> &str;
    fn append(&self, peer_id: &str) -> Result<DirectoryRecord, DirectoryError>;
    /// Every record, oldest first
    fn records(&self) -> Result<Vec<DirectoryRecord>, DirectoryError>;
    /// Records appended from now on, by any writer
    fn watch(&self) -> mpsc::UnboundedReceiver<DirectoryRecord>;
}

#[derive(Default)]
struct MemoryLog {
    records: Vec<DirectoryRecord>,
    watchers: Vec<mpsc::UnboundedSender<DirectoryRecord>>,
}

/// In-process directory. Clones made with [`MemoryDirectory::view`] share
/// one log, standing in for several processes.
#[derive(Clone)]
pub struct MemoryDirectory {
    origin: String,
    log: Arc<Mutex<MemoryLog>>,
}

impl MemoryDirectory {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            log: Arc::new(Mutex::new(MemoryLog::default())),
        }
    }

    /// Another writer on the same log
    pub fn view(&self, origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            log: self.log.clone(),
        }
    }
}

impl Directory for MemoryDirectory {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn append(&self, peer_id: &str) -> Result<DirectoryRecord, DirectoryError> {
        let mut log = self.log.lock();
        let record = DirectoryRecord {
            offset: log.records.len() as u64 + 1,
            peer_id: peer_id.to_string(),
            origin: self.origin.clone(),
            recorded_at: now_ms(),
        };
        log.records.push(record.clone());
        log.watchers.retain(|w| w.send(record.clone()).is_ok());
        Ok(record)
    }

    fn records(&self) -> Result<Vec<DirectoryRecord>, DirectoryError> {
        Ok(self.log.lock().records.clone())
    }

    fn watch(&self) -> mpsc::UnboundedReceiver<DirectoryRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.log.lock().watchers.push(tx);
        rx
    }
}

const PEER_TREE: &str = "directory_peers";

/// Directory on a sled database; any process opening the same path sees
/// the same log.
pub struct SledDirectory {
    origin: String,
    db: sled::Db,
    tree: sled::Tree,
}

impl SledDirectory {
    pub fn open(path: impl AsRef<Path>, origin: impl Into<String>) -> Result<Self, DirectoryError> {
        let db = sled::open(path)?;
        Self::from_db(db, origin)
    }

    /// Share an already opened database (sled allows one opener per path)
    pub fn from_db(db: sled::Db, origin: impl Into<String>) -> Result<Self, DirectoryError> {
        let tree = db.open_tree(PEER_TREE)?;
        Ok(Self {
            origin: origin.into(),
            db,
            tree,
        })
    }

    pub fn flush(&self) -> Result<(), DirectoryError> {
        self.tree.flush()?;
        Ok(())
    }

    fn decode(value: &[u8]) -> Result<DirectoryRecord, DirectoryError> {
        Ok(serde_json::from_slice(value)?)
    }
}

impl Directory for SledDirectory {
    fn origin(&self) -> &str {
        &self.origin
    }

    fn append(&self, peer_id: &str) -> Result<DirectoryRecord, DirectoryError> {
        // generate_id is monotonic across the database, so keys sort by append order
        let offset = self.db.generate_id()?;
        let record = DirectoryRecord {
            offset,
            peer_id: peer_id.to_string(),
            origin: self.origin.clone(),
            recorded_at: now_ms(),
        };
        let value = serde_json::to_vec(&record)?;
        self.tree.insert(offset.to_be_bytes(), value)?;
        debug!(peer_id = %peer_id, offset, "Directory record appended");
        Ok(record)
    }

    fn records(&self) -> Result<Vec<DirectoryRecord>, DirectoryError> {
        let mut records = Vec::new();
        for item in self.tree.iter() {
            let (_, value) = item?;
            records.push(Self::decode(&value)?);
        }
        Ok(records)
    }

    /// Must be called from within a tokio runtime.
    fn watch(&self) -> mpsc::UnboundedReceiver<DirectoryRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscriber = Box::pin(self.tree.watch_prefix(Vec::<u8>::new()));

        tokio::spawn(async move {
            while let Some(event) = subscriber.as_mut().await {
                let sled::Event::Insert { value, .. } = event else {
                    continue;
                };
                match Self::decode(&value) {
                    Ok(record) => {
                        if tx.send(record).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping malformed directory record"),
                }
            }
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_append_assigns_offsets() {
        let directory = MemoryDirectory::new("node-a");
        let first = directory.append("p1").unwrap();
        let second = directory.append("p2").unwrap();
        assert_eq!(first.offset, 1);
        assert_eq!(second.offset, 2);
        assert_eq!(second.origin, "node-a");

        let ids: Vec<_> = directory
            .records()
            .unwrap()
            .into_iter()
            .map(|r| r.peer_id)
            .collect();
        assert_eq!(ids, vec!["p1".to_string(), "p2".to_string()]);
    }

    #[tokio::test]
    async fn test_memory_views_share_one_log() {
        let a = MemoryDirectory::new("node-a");
        let b = a.view("node-b");
        let mut changes = a.watch();

        b.append("remote-peer").unwrap();
        let record = changes.recv().await.unwrap();
        assert_eq!(record.peer_id, "remote-peer");
        assert_eq!(record.origin, "node-b");
        assert_eq!(a.records().unwrap().len(), 1);
    }
}
