//! SQLite-backed bus state store.
//!
//! One row per account key. The connection sits behind a `parking_lot`
//! mutex so the guard is never held across an `.await`.

use parking_lot::Mutex as SyncMutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::error::{BusError, Result};
use crate::state::{now_secs, BusState, StateStore};

pub struct SqliteStateStore {
    conn: SyncMutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> BusError {
    BusError::PersistenceFailure(e.to_string())
}

impl SqliteStateStore {
    /// Open (or create) the state database at `dir/bus_state.db`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            BusError::PersistenceFailure(format!(
                "Failed to create state dir {}: {e}",
                dir.display()
            ))
        })?;
        let conn = Connection::open(dir.join("bus_state.db")).map_err(db_err)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             CREATE TABLE IF NOT EXISTS bus_state (
                account_key        TEXT PRIMARY KEY,
                last_processed_at  INTEGER NOT NULL,
                gateway_started_at INTEGER NOT NULL,
                recent_event_ids   TEXT NOT NULL,
                updated_at         INTEGER NOT NULL
             );",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: SyncMutex::new(conn),
        })
    }
}

impl StateStore for SqliteStateStore {
    fn read(&self, account_key: &str) -> Result<Option<BusState>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT last_processed_at, gateway_started_at, recent_event_ids
                 FROM bus_state WHERE account_key = ?1",
                params![account_key],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((last, started, ids_json)) = row else {
            return Ok(None);
        };
        let recent_event_ids: Vec<String> = serde_json::from_str(&ids_json)
            .map_err(|e| BusError::PersistenceFailure(format!("Corrupt recent_event_ids: {e}")))?;

        Ok(Some(BusState {
            last_processed_at: last.max(0) as u64,
            gateway_started_at: started.max(0) as u64,
            recent_event_ids,
        }))
    }

    fn write(&self, account_key: &str, state: &BusState) -> Result<()> {
        let ids_json = serde_json::to_string(&state.recent_event_ids)
            .map_err(|e| BusError::PersistenceFailure(e.to_string()))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bus_state
                (account_key, last_processed_at, gateway_started_at, recent_event_ids, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(account_key) DO UPDATE SET
                last_processed_at  = excluded.last_processed_at,
                gateway_started_at = excluded.gateway_started_at,
                recent_event_ids   = excluded.recent_event_ids,
                updated_at         = excluded.updated_at",
            params![
                account_key,
                state.last_processed_at as i64,
                state.gateway_started_at as i64,
                ids_json,
                now_secs() as i64,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(last: u64) -> BusState {
        BusState {
            last_processed_at: last,
            gateway_started_at: 100,
            recent_event_ids: vec!["e1".into(), "e2".into(), "e3".into()],
        }
    }

    #[test]
    fn absent_key_reads_none() {
        let store = SqliteStateStore::in_memory().unwrap();
        assert_eq!(store.read("nip29-x").unwrap(), None);
    }

    #[test]
    fn write_read_and_overwrite() {
        let store = SqliteStateStore::in_memory().unwrap();
        store.write("nip29-x", &sample(200)).unwrap();
        assert_eq!(store.read("nip29-x").unwrap(), Some(sample(200)));

        store.write("nip29-x", &sample(300)).unwrap();
        assert_eq!(store.read("nip29-x").unwrap().unwrap().last_processed_at, 300);
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = SqliteStateStore::open(dir.path()).unwrap();
            store.write("k", &sample(42)).unwrap();
        }
        let store = SqliteStateStore::open(dir.path()).unwrap();
        assert_eq!(store.read("k").unwrap(), Some(sample(42)));
    }
}
