//! Relational persistence of learned background grids.
//!
//! Snapshots are append-only history: a sensor's "current" grid is simply
//! its row with the largest `taken_unix_nanos`. The store is shared across
//! sensor pipelines, so writes are serialised behind a mutex.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("SqliteError: {source}")]
    SqliteError {
        #[from]
        source: rusqlite::Error,
    },
    #[error("snapshot store mutex poisoned")]
    Poisoned,
}

/// A snapshot to be inserted; the store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSnapshot {
    pub sensor_id: String,
    pub taken_unix_nanos: i64,
    pub rings: u16,
    pub azimuth_bins: u16,
    pub params_json: Option<String>,
    /// Opaque compressed cell array; the store never interprets it.
    pub grid_blob: Vec<u8>,
    pub changed_cells_count: i64,
    pub reason: Option<String>,
}

/// A stored snapshot row.
#[derive(Debug, Clone, PartialEq)]
pub struct BgSnapshotRow {
    pub snapshot_id: i64,
    pub sensor_id: String,
    pub taken_unix_nanos: i64,
    pub rings: u16,
    pub azimuth_bins: u16,
    pub params_json: Option<String>,
    pub grid_blob: Vec<u8>,
    pub changed_cells_count: i64,
    pub reason: Option<String>,
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS bg_snapshots (
    snapshot_id INTEGER PRIMARY KEY,
    sensor_id TEXT NOT NULL,
    taken_unix_nanos INTEGER NOT NULL,
    rings INTEGER NOT NULL,
    azimuth_bins INTEGER NOT NULL,
    params_json TEXT,
    grid_blob BLOB NOT NULL,
    changed_cells_count INTEGER NOT NULL,
    snapshot_reason TEXT
);
CREATE INDEX IF NOT EXISTS bg_snapshots_sensor_time
    ON bg_snapshots (sensor_id, taken_unix_nanos);";

pub struct BgSnapshotStore {
    conn: Mutex<Connection>,
}

impl BgSnapshotStore {
    /// Open (and if necessary create) the store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        debug!("snapshot store open at {}", path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// An in-memory store, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a snapshot, returning its assigned id. Duplicate
    /// `(sensor_id, taken_unix_nanos)` pairs are allowed; this is history,
    /// not identity.
    pub fn insert(&self, snapshot: &NewSnapshot) -> Result<i64> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO bg_snapshots (sensor_id, taken_unix_nanos, rings, azimuth_bins, \
             params_json, grid_blob, changed_cells_count, snapshot_reason) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                snapshot.sensor_id,
                snapshot.taken_unix_nanos,
                snapshot.rings,
                snapshot.azimuth_bins,
                snapshot.params_json,
                snapshot.grid_blob,
                snapshot.changed_cells_count,
                snapshot.reason,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// The snapshot with the largest `taken_unix_nanos` for this sensor,
    /// if any.
    pub fn get_latest(&self, sensor_id: &str) -> Result<Option<BgSnapshotRow>> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let row = conn
            .query_row(
                "SELECT snapshot_id, sensor_id, taken_unix_nanos, rings, azimuth_bins, \
                 params_json, grid_blob, changed_cells_count, snapshot_reason \
                 FROM bg_snapshots WHERE sensor_id = ?1 \
                 ORDER BY taken_unix_nanos DESC, snapshot_id DESC LIMIT 1",
                rusqlite::params![sensor_id],
                |row| {
                    Ok(BgSnapshotRow {
                        snapshot_id: row.get(0)?,
                        sensor_id: row.get(1)?,
                        taken_unix_nanos: row.get(2)?,
                        rings: row.get(3)?,
                        azimuth_bins: row.get(4)?,
                        params_json: row.get(5)?,
                        grid_blob: row.get(6)?,
                        changed_cells_count: row.get(7)?,
                        reason: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(sensor: &str, nanos: i64, blob: &[u8]) -> NewSnapshot {
        NewSnapshot {
            sensor_id: sensor.to_string(),
            taken_unix_nanos: nanos,
            rings: 40,
            azimuth_bins: 1800,
            params_json: Some("{\"update_fraction\":0.02}".to_string()),
            grid_blob: blob.to_vec(),
            changed_cells_count: 12,
            reason: Some("periodic_update".to_string()),
        }
    }

    #[test]
    fn insert_and_get_latest() {
        let store = BgSnapshotStore::open_in_memory().unwrap();
        assert!(store.get_latest("lidar0").unwrap().is_none());

        let id1 = store.insert(&snapshot("lidar0", 100, b"one")).unwrap();
        let id2 = store.insert(&snapshot("lidar0", 300, b"three")).unwrap();
        let id3 = store.insert(&snapshot("lidar0", 200, b"two")).unwrap();
        assert!(id1 < id2 && id2 < id3);

        // latest by capture time, not by insertion order
        let latest = store.get_latest("lidar0").unwrap().unwrap();
        assert_eq!(latest.snapshot_id, id2);
        assert_eq!(latest.taken_unix_nanos, 300);
        assert_eq!(latest.grid_blob, b"three");
        assert_eq!(latest.rings, 40);
        assert_eq!(latest.azimuth_bins, 1800);

        assert!(store.get_latest("lidar1").unwrap().is_none());
    }

    #[test]
    fn duplicate_timestamps_get_distinct_ids() {
        let store = BgSnapshotStore::open_in_memory().unwrap();
        let id1 = store.insert(&snapshot("lidar0", 500, b"a")).unwrap();
        let id2 = store.insert(&snapshot("lidar0", 500, b"b")).unwrap();
        assert_ne!(id1, id2);

        // The later insert wins the tie.
        let latest = store.get_latest("lidar0").unwrap().unwrap();
        assert_eq!(latest.snapshot_id, id2);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshots.sqlite");

        {
            let store = BgSnapshotStore::open(&path).unwrap();
            store.insert(&snapshot("lidar0", 42, b"blob")).unwrap();
        }

        let store = BgSnapshotStore::open(&path).unwrap();
        let latest = store.get_latest("lidar0").unwrap().unwrap();
        assert_eq!(latest.taken_unix_nanos, 42);
        assert_eq!(latest.reason.as_deref(), Some("periodic_update"));
    }
}
