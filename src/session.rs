// src/session.rs
// Session Manager: pairing handshake, persistent per-contact sessions, and
// message delivery state tracking. Generic over `SignalingAdapter` so it
// runs unmodified against the in-process adapter in tests and against
// whatever real transport a host application wires up.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::contact_store::{ContactRecord, ContactStore, MessageMeta, PendingState};
use crate::crypto::{EncryptedEnvelope, Identity, SharedKey};
use crate::error::SessionError;
use crate::signaling::{SignalingAdapter, SignalingChannel};
use crate::wire::Message;

pub mod timing {
    use std::time::Duration;

    pub const MAX_CONNECT_RETRIES: u32 = 3;

    /// Linear backoff for persistent-session reconnects: 5s, 10s, 15s, ...
    /// Distinct from `signaling::backoff`'s exponential curve, matching the
    /// original design's per-contact retry policy.
    pub fn retry_delay(attempt: u32) -> Duration {
        Duration::from_secs(5 * (attempt as u64 + 1))
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Waiting,
    Sent,
    Delivered,
    Failed,
}

/// Placeholder content stored and surfaced in place of a message whose e2e
/// envelope failed to decrypt or verify, so the conversation history shows
/// that something arrived without trusting its contents.
pub const TAMPERED_SENTINEL: &[u8] = b"[message could not be verified]";

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected { persistent_id: String },
    Disconnected { persistent_id: String },
    MessageReceived { persistent_id: String, plaintext: Vec<u8> },
    /// A `message` envelope's signature or AEAD tag did not verify. The
    /// channel stays open (only a handshake-signature failure drops it);
    /// the message is recorded with sentinel content, not dropped silently.
    TamperedMessage { persistent_id: String, id: String },
    RetriesExhausted { persistent_id: String },
}

struct QueuedMessage {
    id: String,
    ts: i64,
    plaintext: Vec<u8>,
}

struct SessionState {
    outbox: Option<mpsc::UnboundedSender<Message>>,
    send_queue: VecDeque<QueuedMessage>,
    shared_key: Option<SharedKey>,
    pending: HashMap<String, DeliveryStatus>,
}

impl SessionState {
    fn new() -> Self {
        SessionState {
            outbox: None,
            send_queue: VecDeque::new(),
            shared_key: None,
            pending: HashMap::new(),
        }
    }
}

/// Owns the persistent-session lifecycle for every contact: pairing,
/// reconnect-with-backoff, encrypt/decrypt, delivery tracking, and the
/// per-contact outbound queue that drains on reconnect.
pub struct SessionManager<A: SignalingAdapter> {
    identity: Identity,
    friendly_name: Mutex<String>,
    contacts: std::sync::Arc<ContactStore>,
    adapter: A,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl<A: SignalingAdapter> SessionManager<A> {
    pub fn new(identity: Identity, friendly_name: impl Into<String>, contacts: std::sync::Arc<ContactStore>, adapter: A) -> Self {
        SessionManager {
            identity,
            friendly_name: Mutex::new(friendly_name.into()),
            contacts,
            adapter,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn friendly_name(&self) -> String {
        self.friendly_name.lock().unwrap().clone()
    }

    pub fn set_friendly_name(&self, name: impl Into<String>) {
        *self.friendly_name.lock().unwrap() = name.into();
    }

    /// Broadcast a `name-update` to every currently connected session and
    /// leave it queued for the rest; this is the re-checkin/name-broadcast
    /// step the namespace engine's registry relies on to stay current.
    pub fn broadcast_name_update(&self) {
        let name = self.friendly_name();
        let sessions = self.sessions.lock().unwrap();
        for state in sessions.values() {
            if let Some(outbox) = &state.outbox {
                let _ = outbox.send(Message::NameUpdate { name: name.clone() });
            }
        }
    }

    /// Called by the namespace driver once registry merge resolves a known
    /// contact's current on-network address.
    pub fn note_network_presence(&self, persistent_id: &str, network_discovery_id: Option<String>) {
        if let Some(mut record) = self.contacts.get(persistent_id) {
            record.on_network = network_discovery_id.is_some();
            record.network_discovery_id = network_discovery_id;
            let _ = self.contacts.put(record);
        }
    }

    // -- Pairing --

    /// Initiate pairing by connecting directly to a contact's endpoint
    /// (typically obtained out of band, e.g. a scanned code).
    pub async fn pair_outgoing(
        &self,
        endpoint: &str,
        my_persistent_id: &str,
    ) -> Result<ContactRecord, SessionError> {
        let mut channel = self.adapter.connect(endpoint).await?;
        let ts = now_ts();
        let signature = self.identity.sign(format!("{my_persistent_id}|{ts}").as_bytes())?;
        channel
            .send(Message::Request {
                friendly_name: self.friendly_name(),
                public_key: self.identity.public_key_base64()?,
                persistent_id: my_persistent_id.to_string(),
                ts,
                signature,
            })
            .await?;

        match channel.recv().await {
            Some(Message::Accepted { persistent_id, discovery_uuid }) => {
                channel
                    .send(Message::Confirm {
                        persistent_id: my_persistent_id.to_string(),
                        friendly_name: self.friendly_name(),
                        discovery_uuid: discovery_uuid.clone(),
                        public_key: self.identity.public_key_base64()?,
                    })
                    .await?;
                let mut record = ContactRecord::new(persistent_id, discovery_uuid);
                record.pending = PendingState::Outgoing;
                self.contacts.put(record.clone())?;
                Ok(record)
            }
            Some(Message::Rejected {}) => Err(SessionError::HandshakeFailed(format!("'{endpoint}' rejected pairing"))),
            _ => Err(SessionError::HandshakeFailed(format!("'{endpoint}' sent an unexpected reply"))),
        }
    }

    /// Respond to an inbound pairing request arriving on an already-accepted
    /// channel (e.g. from a namespace-level `InboundConnection`).
    pub async fn accept_incoming(
        &self,
        mut channel: A::Channel,
        my_persistent_id: &str,
        my_discovery_uuid: &str,
    ) -> Result<ContactRecord, SessionError> {
        let request = channel
            .recv()
            .await
            .ok_or_else(|| SessionError::HandshakeFailed("channel closed before request".to_string()))?;

        let (peer_persistent_id, peer_friendly_name, peer_public_key, ts, signature) = match request {
            Message::Request {
                persistent_id,
                friendly_name,
                public_key,
                ts,
                signature,
            } => (persistent_id, friendly_name, public_key, ts, signature),
            _ => {
                let _ = channel.send(Message::Rejected {}).await;
                return Err(SessionError::HandshakeFailed("expected a pairing request".to_string()));
            }
        };

        let payload = format!("{peer_persistent_id}|{ts}");
        if crate::crypto::verify(&peer_public_key, payload.as_bytes(), &signature).is_err() {
            let _ = channel.send(Message::Rejected {}).await;
            return Err(SessionError::HandshakeFailed("request signature did not verify".to_string()));
        }

        channel
            .send(Message::Accepted {
                persistent_id: my_persistent_id.to_string(),
                discovery_uuid: my_discovery_uuid.to_string(),
            })
            .await?;

        let confirm = channel
            .recv()
            .await
            .ok_or_else(|| SessionError::HandshakeFailed("channel closed before confirm".to_string()))?;
        match confirm {
            Message::Confirm { discovery_uuid, .. } => {
                let mut record = ContactRecord::new(peer_persistent_id, discovery_uuid);
                record.friendly_name = peer_friendly_name;
                record.public_key = Some(peer_public_key);
                record.pending = PendingState::None;
                self.contacts.put(record.clone())?;
                Ok(record)
            }
            _ => Err(SessionError::HandshakeFailed("expected a confirm".to_string())),
        }
    }

    // -- Persistent session loop --

    /// Drive one contact's persistent session until retries are exhausted.
    /// Intended to be spawned as its own task per contact.
    pub async fn run_session(&self, persistent_id: String, events_tx: mpsc::UnboundedSender<SessionEvent>) {
        let mut attempt = 0u32;
        loop {
            let endpoint = match self.contacts.get(&persistent_id).and_then(|c| c.network_discovery_id) {
                Some(endpoint) => endpoint,
                None => {
                    self.fail_pending(&persistent_id);
                    let _ = events_tx.send(SessionEvent::RetriesExhausted { persistent_id: persistent_id.clone() });
                    return;
                }
            };

            if let Ok(channel) = self.adapter.connect(&endpoint).await {
                attempt = 0;
                let _ = events_tx.send(SessionEvent::Connected { persistent_id: persistent_id.clone() });
                self.drive_channel(persistent_id.clone(), channel, &events_tx).await;
                let _ = events_tx.send(SessionEvent::Disconnected { persistent_id: persistent_id.clone() });
            }

            if attempt >= timing::MAX_CONNECT_RETRIES - 1 {
                self.fail_pending(&persistent_id);
                let _ = events_tx.send(SessionEvent::RetriesExhausted { persistent_id: persistent_id.clone() });
                return;
            }
            let delay = timing::retry_delay(attempt);
            attempt += 1;
            tokio::time::sleep(delay).await;
        }
    }

    /// Flag every message still `waiting`/`sent` for this contact as
    /// `failed`, per the "after which queued messages are flagged failed"
    /// retry-exhaustion rule. Leaves the queue itself in place so a later
    /// reconnect still has the plaintext to hand, but the delivery status
    /// no longer claims the message is in flight.
    fn fail_pending(&self, persistent_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(state) = sessions.get_mut(persistent_id) {
            for status in state.pending.values_mut() {
                if matches!(status, DeliveryStatus::Waiting | DeliveryStatus::Sent) {
                    *status = DeliveryStatus::Failed;
                }
            }
        }
    }

    async fn drive_channel(&self, persistent_id: String, mut channel: A::Channel, events_tx: &mpsc::UnboundedSender<SessionEvent>) {
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
        let queued: Vec<QueuedMessage> = {
            let mut sessions = self.sessions.lock().unwrap();
            let state = sessions.entry(persistent_id.clone()).or_insert_with(SessionState::new);
            state.outbox = Some(outbox_tx.clone());
            state.send_queue.drain(..).collect()
        };
        for qm in queued {
            if let Some(msg) = self.build_text_message(&persistent_id, &qm.id, qm.ts, &qm.plaintext) {
                let _ = outbox_tx.send(msg);
            }
        }

        let hello = Message::Hello {
            friendly_name: self.friendly_name(),
            public_key: self.identity.public_key_base64().unwrap_or_default(),
            ts: now_ts(),
            signature: self.identity.sign(persistent_id.as_bytes()).unwrap_or_default(),
        };
        if channel.send(hello).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                outgoing = outbox_rx.recv() => {
                    match outgoing {
                        Some(msg) => { if channel.send(msg).await.is_err() { break; } }
                        None => break,
                    }
                }
                incoming = channel.recv() => {
                    match incoming {
                        Some(msg) => self.handle_incoming(&persistent_id, msg, &channel, events_tx).await,
                        None => break,
                    }
                }
            }
        }

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(state) = sessions.get_mut(&persistent_id) {
            state.outbox = None;
        }
    }

    async fn handle_incoming(
        &self,
        persistent_id: &str,
        message: Message,
        channel: &A::Channel,
        events_tx: &mpsc::UnboundedSender<SessionEvent>,
    ) {
        match message {
            Message::Hello { public_key, .. } => self.ensure_shared_key(persistent_id, &public_key),
            Message::Text { id, ts, e2e, iv, ct, sig, content } => {
                let was_e2e = e2e == Some(true);
                match self.resolve_plaintext(persistent_id, e2e, iv, ct, sig, content) {
                    Some(plaintext) => {
                        self.record_inbound(persistent_id, &id, ts);
                        let _ = channel.send(Message::MessageAck { id }).await;
                        let _ = events_tx.send(SessionEvent::MessageReceived {
                            persistent_id: persistent_id.to_string(),
                            plaintext,
                        });
                    }
                    None if was_e2e => {
                        log::warn!("message {id} from {persistent_id} failed e2e verification; storing sentinel");
                        self.record_inbound(persistent_id, &id, ts);
                        let _ = channel.send(Message::MessageAck { id }).await;
                        let _ = events_tx.send(SessionEvent::TamperedMessage {
                            persistent_id: persistent_id.to_string(),
                            id,
                        });
                    }
                    None => {
                        // Non-e2e message with no content at all: malformed, not
                        // a tamper attempt. Drop it; the sender's bug, not ours.
                    }
                }
            }
            Message::MessageAck { id } => self.mark_delivered(persistent_id, &id),
            Message::MessageEdit { id, ts, .. } => self.touch_history(persistent_id, &id, ts),
            Message::MessageDelete { id } => self.remove_history(persistent_id, &id),
            Message::NameUpdate { name } => self.update_friendly_name(persistent_id, &name),
            _ => {}
        }
    }

    /// Handle a `hello`'s public key: derive the shared key for this
    /// session, and if the key is already on record under a *different*
    /// persistent ID (the contact regenerated its identity and reconnected),
    /// migrate that contact's history onto the current one.
    fn ensure_shared_key(&self, persistent_id: &str, peer_public_key: &str) {
        if let Ok(key) = self.identity.derive_shared_key(peer_public_key) {
            let mut sessions = self.sessions.lock().unwrap();
            let state = sessions.entry(persistent_id.to_string()).or_insert_with(SessionState::new);
            state.shared_key = Some(key);
        }

        if let Some(existing) = self.contacts.find_by_public_key(peer_public_key, Some(persistent_id)) {
            log::info!(
                "contact at {} reconnected under new persistent id {persistent_id}; migrating",
                existing.persistent_id
            );
            let _ = self.contacts.migrate(&existing.persistent_id, persistent_id);
            return;
        }

        if let Some(mut record) = self.contacts.get(persistent_id) {
            if record.public_key.is_none() {
                record.public_key = Some(peer_public_key.to_string());
                let _ = self.contacts.put(record);
            }
        }
    }

    fn resolve_plaintext(
        &self,
        persistent_id: &str,
        e2e: Option<bool>,
        iv: Option<String>,
        ct: Option<String>,
        sig: Option<String>,
        content: Option<String>,
    ) -> Option<Vec<u8>> {
        if e2e == Some(true) {
            let (iv, ct, sig) = (iv?, ct?, sig?);
            let peer_public_key = self.contacts.get(persistent_id)?.public_key?;
            let sessions = self.sessions.lock().unwrap();
            let key = sessions.get(persistent_id)?.shared_key.clone()?;
            drop(sessions);
            key.decrypt(&EncryptedEnvelope { iv, ct, sig }, &peer_public_key).ok()
        } else {
            content.map(|c| c.into_bytes())
        }
    }

    fn build_text_message(&self, persistent_id: &str, id: &str, ts: i64, plaintext: &[u8]) -> Option<Message> {
        let sessions = self.sessions.lock().unwrap();
        let shared_key = sessions.get(persistent_id).and_then(|s| s.shared_key.clone());
        drop(sessions);

        match shared_key {
            Some(key) => {
                let envelope = key.encrypt(plaintext, &self.identity).ok()?;
                Some(Message::Text {
                    id: id.to_string(),
                    ts,
                    e2e: Some(true),
                    iv: Some(envelope.iv),
                    ct: Some(envelope.ct),
                    sig: Some(envelope.sig),
                    content: None,
                })
            }
            None => Some(Message::Text {
                id: id.to_string(),
                ts,
                e2e: Some(false),
                iv: None,
                ct: None,
                sig: None,
                content: Some(String::from_utf8_lossy(plaintext).into_owned()),
            }),
        }
    }

    /// Queue a plaintext message to a contact. Sent immediately if the
    /// session is live; otherwise held until the next reconnect.
    pub fn send_text(&self, persistent_id: &str, plaintext: &[u8]) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = now_ts();

        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions.entry(persistent_id.to_string()).or_insert_with(SessionState::new);
        state.pending.insert(id.clone(), DeliveryStatus::Waiting);

        if let Some(outbox) = state.outbox.clone() {
            drop(sessions);
            if let Some(msg) = self.build_text_message(persistent_id, &id, ts, plaintext) {
                if outbox.send(msg).is_ok() {
                    let mut sessions = self.sessions.lock().unwrap();
                    if let Some(state) = sessions.get_mut(persistent_id) {
                        state.pending.insert(id.clone(), DeliveryStatus::Sent);
                    }
                    return id;
                }
            }
        } else {
            state.send_queue.push_back(QueuedMessage {
                id: id.clone(),
                ts,
                plaintext: plaintext.to_vec(),
            });
        }
        id
    }

    pub fn delivery_status(&self, persistent_id: &str, message_id: &str) -> Option<DeliveryStatus> {
        self.sessions
            .lock()
            .unwrap()
            .get(persistent_id)
            .and_then(|s| s.pending.get(message_id))
            .copied()
    }

    fn mark_delivered(&self, persistent_id: &str, message_id: &str) {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(state) = sessions.get_mut(persistent_id) {
            state.pending.insert(message_id.to_string(), DeliveryStatus::Delivered);
        }
    }

    fn record_inbound(&self, persistent_id: &str, message_id: &str, ts: i64) {
        if let Some(mut record) = self.contacts.get(persistent_id) {
            record.history.push(MessageMeta {
                id: message_id.to_string(),
                ts,
            });
            record.last_seen = ts;
            let _ = self.contacts.put(record);
        }
    }

    fn touch_history(&self, persistent_id: &str, message_id: &str, ts: i64) {
        if let Some(mut record) = self.contacts.get(persistent_id) {
            if let Some(entry) = record.history.iter_mut().find(|m| m.id == message_id) {
                entry.ts = ts;
                let _ = self.contacts.put(record);
            }
        }
    }

    fn remove_history(&self, persistent_id: &str, message_id: &str) {
        if let Some(mut record) = self.contacts.get(persistent_id) {
            record.history.retain(|m| m.id != message_id);
            let _ = self.contacts.put(record);
        }
    }

    fn update_friendly_name(&self, persistent_id: &str, name: &str) {
        if let Some(mut record) = self.contacts.get(persistent_id) {
            record.friendly_name = name.to_string();
            let _ = self.contacts.put(record);
        }
    }
}
