//! Operation Log
//!
//! Append-only record of trie mutations, replayed in order on restart.
//! Each record is a bincode-encoded [`Operation`] stored next to its CRC32 so a
//! torn or corrupted write is detected instead of silently replayed.

use crate::trie::Configuration;
use anyhow::{bail, Context};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A single logged mutation. `sub_key` is set when the mutation targets the
/// sub-trie stored at `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put {
        key: Vec<u8>,
        sub_key: Option<Vec<u8>>,
        value: Vec<u8>,
        timestamp: i64,
    },
    Delete {
        key: Vec<u8>,
        sub_key: Option<Vec<u8>>,
    },
    Tombstone {
        key: Vec<u8>,
        sub_key: Option<Vec<u8>>,
        timestamp: i64,
    },
    /// Clear the sub-trie at `key`. The top-level clear truncates the log instead.
    Clear {
        key: Vec<u8>,
        timestamp: i64,
    },
    Kill {
        key: Vec<u8>,
    },
    Configure {
        key: Option<Vec<u8>>,
        configuration: Configuration,
    },
}

/// Storage medium for [`Operation`]s.
pub trait OperationLog: Send + Sync {
    fn record(&self, operation: &Operation) -> anyhow::Result<()>;

    /// All recorded operations, oldest first.
    fn replay(&self) -> anyhow::Result<Vec<Operation>>;

    /// Forget everything recorded so far.
    fn truncate(&self) -> anyhow::Result<()>;
}

/// [`OperationLog`] backed by a SQLite table.
pub struct SqliteOperationLog {
    path: PathBuf,
    conn: Mutex<Connection>,
}

impl SqliteOperationLog {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open operation log {}", path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS __operation_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload BLOB NOT NULL,
                checksum INTEGER NOT NULL
            )",
            [],
        )?;

        tracing::info!("operation log opened, path={}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM __operation_log", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> anyhow::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl OperationLog for SqliteOperationLog {
    fn record(&self, operation: &Operation) -> anyhow::Result<()> {
        let payload = bincode::serialize(operation)?;
        let checksum = crc32fast::hash(&payload);
        self.conn.lock().execute(
            "INSERT INTO __operation_log (payload, checksum) VALUES (?1, ?2)",
            params![payload, checksum],
        )?;
        Ok(())
    }

    fn replay(&self) -> anyhow::Result<Vec<Operation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id, payload, checksum FROM __operation_log ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, u32>(2)?,
            ))
        })?;

        let mut operations = Vec::new();
        for row in rows {
            let (id, payload, checksum) = row?;
            if crc32fast::hash(&payload) != checksum {
                bail!("operation log record {} failed checksum verification", id);
            }
            operations.push(bincode::deserialize(&payload)?);
        }
        Ok(operations)
    }

    fn truncate(&self) -> anyhow::Result<()> {
        self.conn.lock().execute("DELETE FROM __operation_log", [])?;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn put(key: &[u8], timestamp: i64) -> Operation {
        Operation::Put {
            key: key.to_vec(),
            sub_key: None,
            value: b"v".to_vec(),
            timestamp,
        }
    }

    #[test]
    fn test_record_and_replay_in_order() {
        let temp = NamedTempFile::new().unwrap();
        let log = SqliteOperationLog::open(temp.path()).unwrap();
        log.record(&put(b"a", 1)).unwrap();
        log.record(&Operation::Delete {
            key: b"a".to_vec(),
            sub_key: None,
        })
        .unwrap();
        log.record(&put(b"b", 2)).unwrap();

        let replayed = log.replay().unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[0], put(b"a", 1));
        assert_eq!(replayed[2], put(b"b", 2));
    }

    #[test]
    fn test_truncate() {
        let temp = NamedTempFile::new().unwrap();
        let log = SqliteOperationLog::open(temp.path()).unwrap();
        log.record(&put(b"a", 1)).unwrap();
        assert!(!log.is_empty().unwrap());
        log.truncate().unwrap();
        assert!(log.is_empty().unwrap());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let temp = NamedTempFile::new().unwrap();
        {
            let log = SqliteOperationLog::open(temp.path()).unwrap();
            log.record(&put(b"a", 1)).unwrap();
        }
        let log = SqliteOperationLog::open(temp.path()).unwrap();
        assert_eq!(log.replay().unwrap(), vec![put(b"a", 1)]);
        assert_eq!(log.path(), temp.path());
    }

    #[test]
    fn test_corrupted_record_is_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let log = SqliteOperationLog::open(temp.path()).unwrap();
        log.record(&put(b"a", 1)).unwrap();
        log.conn
            .lock()
            .execute("UPDATE __operation_log SET checksum = checksum + 1", [])
            .unwrap();
        assert!(log.replay().is_err());
    }
}
