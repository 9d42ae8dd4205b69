// src/sqlite_persistence.rs
// Optional SQLite-backed ContactPersistence, built the way the host
// application's own database layer is built: WAL mode, one row per record,
// `rusqlite` with bundled SQLite so no system library is required.

use std::path::PathBuf;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use crate::contact_store::{ContactPersistence, ContactRecord, MessageMeta, PendingState};
use crate::error::ContactStoreError;

fn to_store_err(e: rusqlite::Error) -> ContactStoreError {
    ContactStoreError::Persistence(e.to_string())
}

pub struct SqliteContactPersistence {
    conn: Mutex<Connection>,
}

impl SqliteContactPersistence {
    /// Default on-disk location for the contacts database, mirroring the
    /// host application's local-data-dir convention.
    pub fn default_path() -> PathBuf {
        let app_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("peerns");
        std::fs::create_dir_all(&app_dir).ok();
        app_dir.join("contacts.db")
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ContactStoreError> {
        let conn = Connection::open(path.into()).map_err(to_store_err)?;
        let store = SqliteContactPersistence {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, ContactStoreError> {
        let conn = Connection::open_in_memory().map_err(to_store_err)?;
        let store = SqliteContactPersistence {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), ContactStoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(to_store_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS contacts (
                persistent_id TEXT PRIMARY KEY,
                friendly_name TEXT NOT NULL,
                discovery_id TEXT,
                discovery_uuid TEXT NOT NULL,
                public_key TEXT,
                on_network INTEGER NOT NULL DEFAULT 0,
                network_discovery_id TEXT,
                last_seen INTEGER NOT NULL DEFAULT 0,
                pending TEXT NOT NULL DEFAULT 'none',
                pending_fingerprint TEXT,
                pending_verified INTEGER NOT NULL DEFAULT 0,
                history_json TEXT NOT NULL DEFAULT '[]'
            )",
            [],
        )
        .map_err(to_store_err)?;
        Ok(())
    }
}

fn pending_to_str(p: PendingState) -> &'static str {
    match p {
        PendingState::None => "none",
        PendingState::Outgoing => "outgoing",
        PendingState::Incoming => "incoming",
    }
}

fn pending_from_str(s: &str) -> PendingState {
    match s {
        "outgoing" => PendingState::Outgoing,
        "incoming" => PendingState::Incoming,
        _ => PendingState::None,
    }
}

impl ContactPersistence for SqliteContactPersistence {
    fn load_all(&self) -> Result<Vec<ContactRecord>, ContactStoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT persistent_id, friendly_name, discovery_id, discovery_uuid, public_key,
                        on_network, network_discovery_id, last_seen, pending, pending_fingerprint,
                        pending_verified, history_json
                 FROM contacts",
            )
            .map_err(to_store_err)?;

        let rows = stmt
            .query_map([], |row| {
                let history_json: String = row.get(11)?;
                let history: Vec<MessageMeta> =
                    serde_json::from_str(&history_json).unwrap_or_default();
                let pending_str: String = row.get(8)?;
                Ok(ContactRecord {
                    persistent_id: row.get(0)?,
                    friendly_name: row.get(1)?,
                    discovery_id: row.get(2)?,
                    discovery_uuid: row.get(3)?,
                    public_key: row.get(4)?,
                    on_network: row.get::<_, i64>(5)? != 0,
                    network_discovery_id: row.get(6)?,
                    last_seen: row.get(7)?,
                    pending: pending_from_str(&pending_str),
                    pending_fingerprint: row.get(9)?,
                    pending_verified: row.get::<_, i64>(10)? != 0,
                    history,
                })
            })
            .map_err(to_store_err)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(to_store_err)?);
        }
        Ok(out)
    }

    fn upsert(&self, record: &ContactRecord) -> Result<(), ContactStoreError> {
        let conn = self.conn.lock().unwrap();
        let history_json = serde_json::to_string(&record.history)
            .map_err(|e| ContactStoreError::Persistence(e.to_string()))?;
        conn.execute(
            "INSERT INTO contacts (
                persistent_id, friendly_name, discovery_id, discovery_uuid, public_key,
                on_network, network_discovery_id, last_seen, pending, pending_fingerprint,
                pending_verified, history_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(persistent_id) DO UPDATE SET
                friendly_name = excluded.friendly_name,
                discovery_id = excluded.discovery_id,
                discovery_uuid = excluded.discovery_uuid,
                public_key = excluded.public_key,
                on_network = excluded.on_network,
                network_discovery_id = excluded.network_discovery_id,
                last_seen = excluded.last_seen,
                pending = excluded.pending,
                pending_fingerprint = excluded.pending_fingerprint,
                pending_verified = excluded.pending_verified,
                history_json = excluded.history_json",
            params![
                record.persistent_id,
                record.friendly_name,
                record.discovery_id,
                record.discovery_uuid,
                record.public_key,
                record.on_network as i64,
                record.network_discovery_id,
                record.last_seen,
                pending_to_str(record.pending),
                record.pending_fingerprint,
                record.pending_verified as i64,
                history_json,
            ],
        )
        .map_err(to_store_err)?;
        Ok(())
    }

    fn remove(&self, persistent_id: &str) -> Result<(), ContactStoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM contacts WHERE persistent_id = ?1",
            params![persistent_id],
        )
        .map_err(to_store_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pid: &str) -> ContactRecord {
        let mut c = ContactRecord::new(pid, format!("uuid-{pid}"));
        c.friendly_name = "alice".to_string();
        c.public_key = Some("pk-a".to_string());
        c.history.push(MessageMeta {
            id: "m1".to_string(),
            ts: 100,
        });
        c
    }

    #[test]
    fn upsert_then_load_round_trips() {
        let store = SqliteContactPersistence::open_in_memory().unwrap();
        store.upsert(&sample("p1")).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].persistent_id, "p1");
        assert_eq!(loaded[0].public_key.as_deref(), Some("pk-a"));
        assert_eq!(loaded[0].history.len(), 1);
    }

    #[test]
    fn upsert_is_idempotent_on_conflict() {
        let store = SqliteContactPersistence::open_in_memory().unwrap();
        let mut record = sample("p1");
        store.upsert(&record).unwrap();
        record.friendly_name = "alice-renamed".to_string();
        store.upsert(&record).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].friendly_name, "alice-renamed");
    }

    #[test]
    fn remove_deletes_the_row() {
        let store = SqliteContactPersistence::open_in_memory().unwrap();
        store.upsert(&sample("p1")).unwrap();
        store.remove("p1").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
