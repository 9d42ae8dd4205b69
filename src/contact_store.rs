// src/contact_store.rs
// Contact Store: the durable map from persistent ID to contact record.
//
// The map itself lives in memory; durability is delegated to a
// `ContactPersistence` implementation the host application supplies. This
// keeps the store's invariants (public-key immutability, merge-on-migrate,
// dedup) testable without a database in the loop.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ContactStoreError;

/// Pending handshake state for a contact, per the persistent-session flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingState {
    None,
    Outgoing,
    Incoming,
}

/// Lightweight record of a historical message, enough to prove merge/dedup
/// invariants without this crate owning message bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub ts: i64,
}

/// A contact, keyed externally by persistent ID.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactRecord {
    pub persistent_id: String,
    pub friendly_name: String,
    pub discovery_id: Option<String>,
    pub discovery_uuid: String,
    pub public_key: Option<String>,
    pub on_network: bool,
    pub network_discovery_id: Option<String>,
    pub last_seen: i64,
    pub pending: PendingState,
    pub pending_fingerprint: Option<String>,
    pub pending_verified: bool,
    pub history: Vec<MessageMeta>,
}

impl ContactRecord {
    pub fn new(persistent_id: impl Into<String>, discovery_uuid: impl Into<String>) -> Self {
        ContactRecord {
            persistent_id: persistent_id.into(),
            friendly_name: String::new(),
            discovery_id: None,
            discovery_uuid: discovery_uuid.into(),
            public_key: None,
            on_network: false,
            network_discovery_id: None,
            last_seen: 0,
            pending: PendingState::None,
            pending_fingerprint: None,
            pending_verified: false,
            history: Vec::new(),
        }
    }
}

/// Broadcast by the store when two records merge under a new persistent ID.
#[derive(Debug, Clone)]
pub enum ContactEvent {
    Migrated { old: String, new: String },
}

/// Durability hook the store calls opportunistically. Implementations must
/// tolerate being asked to persist a record more than once.
pub trait ContactPersistence: Send + Sync {
    fn load_all(&self) -> Result<Vec<ContactRecord>, ContactStoreError>;
    fn upsert(&self, record: &ContactRecord) -> Result<(), ContactStoreError>;
    fn remove(&self, persistent_id: &str) -> Result<(), ContactStoreError>;
}

/// No-op persistence: every contact lives only as long as the process.
pub struct NullPersistence;

impl ContactPersistence for NullPersistence {
    fn load_all(&self) -> Result<Vec<ContactRecord>, ContactStoreError> {
        Ok(Vec::new())
    }
    fn upsert(&self, _record: &ContactRecord) -> Result<(), ContactStoreError> {
        Ok(())
    }
    fn remove(&self, _persistent_id: &str) -> Result<(), ContactStoreError> {
        Ok(())
    }
}

/// In-memory contact map with a pluggable durability backend.
pub struct ContactStore {
    contacts: Mutex<HashMap<String, ContactRecord>>,
    persistence: Box<dyn ContactPersistence>,
    events_tx: broadcast::Sender<ContactEvent>,
}

impl ContactStore {
    pub fn new(persistence: Box<dyn ContactPersistence>) -> Result<Self, ContactStoreError> {
        let loaded = persistence.load_all()?;
        let mut map = HashMap::new();
        for record in loaded {
            map.insert(record.persistent_id.clone(), record);
        }
        let (events_tx, _rx) = broadcast::channel(64);
        Ok(ContactStore {
            contacts: Mutex::new(map),
            persistence,
            events_tx,
        })
    }

    pub fn with_null_persistence() -> Self {
        Self::new(Box::new(NullPersistence)).expect("NullPersistence never fails")
    }

    pub fn events(&self) -> broadcast::Receiver<ContactEvent> {
        self.events_tx.subscribe()
    }

    /// Insert or replace a contact record. The public key, once set on a
    /// stored record, cannot be changed by a later `put` — callers that need
    /// to change it should `migrate` instead.
    pub fn put(&self, record: ContactRecord) -> Result<(), ContactStoreError> {
        let mut contacts = self.contacts.lock().unwrap();
        if let Some(existing) = contacts.get(&record.persistent_id) {
            if let (Some(old_pk), Some(new_pk)) = (&existing.public_key, &record.public_key) {
                if old_pk != new_pk {
                    return Err(ContactStoreError::PublicKeyImmutable);
                }
            }
        }
        self.persistence.upsert(&record)?;
        contacts.insert(record.persistent_id.clone(), record);
        Ok(())
    }

    pub fn get(&self, persistent_id: &str) -> Option<ContactRecord> {
        self.contacts.lock().unwrap().get(persistent_id).cloned()
    }

    pub fn delete(&self, persistent_id: &str) -> Result<(), ContactStoreError> {
        self.persistence.remove(persistent_id)?;
        self.contacts.lock().unwrap().remove(persistent_id);
        Ok(())
    }

    /// Find a contact by public key, optionally excluding one persistent ID
    /// from the search (used when a contact is re-deriving its own key).
    pub fn find_by_public_key(&self, public_key: &str, exclude: Option<&str>) -> Option<ContactRecord> {
        let contacts = self.contacts.lock().unwrap();
        contacts
            .values()
            .find(|c| {
                c.public_key.as_deref() == Some(public_key)
                    && exclude.map_or(true, |ex| c.persistent_id != ex)
            })
            .cloned()
    }

    /// Move a contact's record from `old_pid` to `new_pid`, merging chat
    /// history (dedup by message id, sort by timestamp) and moving the
    /// cached public key. Emits `ContactEvent::Migrated`.
    pub fn migrate(&self, old_pid: &str, new_pid: &str) -> Result<ContactRecord, ContactStoreError> {
        let mut contacts = self.contacts.lock().unwrap();
        let old_record = contacts
            .remove(old_pid)
            .ok_or_else(|| ContactStoreError::NotFound(old_pid.to_string()))?;

        let merged = if let Some(mut existing) = contacts.remove(new_pid) {
            existing.history.extend(old_record.history.iter().cloned());
            dedup_and_sort_history(&mut existing.history);
            if existing.public_key.is_none() {
                existing.public_key = old_record.public_key.clone();
            }
            existing.persistent_id = new_pid.to_string();
            existing
        } else {
            let mut migrated = old_record;
            migrated.persistent_id = new_pid.to_string();
            dedup_and_sort_history(&mut migrated.history);
            migrated
        };

        self.persistence.upsert(&merged)?;
        self.persistence.remove(old_pid)?;
        contacts.insert(new_pid.to_string(), merged.clone());
        drop(contacts);

        let _ = self.events_tx.send(ContactEvent::Migrated {
            old: old_pid.to_string(),
            new: new_pid.to_string(),
        });

        Ok(merged)
    }

    /// Snapshot every contact record currently held. Used by callers (e.g.
    /// namespace registry-merge resolution) that need to scan the whole set
    /// rather than look up one persistent ID at a time.
    pub fn all(&self) -> Vec<ContactRecord> {
        self.contacts.lock().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.contacts.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn dedup_and_sort_history(history: &mut Vec<MessageMeta>) {
    let mut seen = std::collections::HashSet::new();
    history.retain(|m| seen.insert(m.id.clone()));
    history.sort_by_key(|m| m.ts);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact(pid: &str, pk: Option<&str>) -> ContactRecord {
        let mut c = ContactRecord::new(pid, format!("uuid-{pid}"));
        c.public_key = pk.map(|s| s.to_string());
        c
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = ContactStore::with_null_persistence();
        store.put(contact("p1", Some("pk-a"))).unwrap();
        let got = store.get("p1").unwrap();
        assert_eq!(got.public_key.as_deref(), Some("pk-a"));
    }

    #[test]
    fn public_key_is_immutable_once_recorded() {
        let store = ContactStore::with_null_persistence();
        store.put(contact("p1", Some("pk-a"))).unwrap();
        let err = store.put(contact("p1", Some("pk-b"))).unwrap_err();
        assert!(matches!(err, ContactStoreError::PublicKeyImmutable));
    }

    #[test]
    fn find_by_public_key_respects_exclude() {
        let store = ContactStore::with_null_persistence();
        store.put(contact("p1", Some("pk-a"))).unwrap();
        assert!(store.find_by_public_key("pk-a", Some("p1")).is_none());
        assert!(store.find_by_public_key("pk-a", None).is_some());
    }

    #[test]
    fn migrate_merges_history_deduped_and_sorted() {
        let store = ContactStore::with_null_persistence();
        let mut old = contact("p1", Some("pk-a"));
        old.history = vec![
            MessageMeta { id: "m2".into(), ts: 200 },
            MessageMeta { id: "m1".into(), ts: 100 },
        ];
        store.put(old).unwrap();

        let mut new = contact("p2", None);
        new.history = vec![MessageMeta { id: "m1".into(), ts: 100 }, MessageMeta { id: "m3".into(), ts: 300 }];
        store.put(new).unwrap();

        let merged = store.migrate("p1", "p2").unwrap();
        assert_eq!(merged.persistent_id, "p2");
        assert_eq!(merged.public_key.as_deref(), Some("pk-a"));
        let ids: Vec<_> = merged.history.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);

        assert!(store.get("p1").is_none());
        assert!(store.find_by_public_key("pk-a", None).unwrap().persistent_id == "p2");
    }

    #[test]
    fn migrate_emits_event() {
        let store = ContactStore::with_null_persistence();
        let mut rx = store.events();
        store.put(contact("p1", Some("pk-a"))).unwrap();
        store.migrate("p1", "p2").unwrap();

        let event = rx.try_recv().unwrap();
        match event {
            ContactEvent::Migrated { old, new } => {
                assert_eq!(old, "p1");
                assert_eq!(new, "p2");
            }
        }
    }

    #[test]
    fn migrate_missing_contact_errors() {
        let store = ContactStore::with_null_persistence();
        let err = store.migrate("nope", "p2").unwrap_err();
        assert!(matches!(err, ContactStoreError::NotFound(_)));
    }
}
