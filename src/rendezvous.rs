// src/rendezvous.rs
// Rendezvous Scheduler: recovers contacts that fell off the namespace
// registry (IP change, reinstall, new device) by meeting them in a
// private, time-windowed namespace only the two of them can compute.
//
// The scheduling decision (`tick`) is sans-I/O, same as the namespace
// engine: no wall clock, no socket. The caller supplies both a monotonic
// `Instant` for timer bookkeeping and the current UNIX time for window
// computation, since the two peers must derive the same window without
// exchanging it.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::crypto::{Identity, SharedKey};
use crate::error::RendezvousError;
use crate::wire::Message;

pub mod timing {
    use std::time::Duration;

    pub const INITIAL_DELAY: Duration = Duration::from_secs(30);
    pub const SWEEP_IV: Duration = Duration::from_secs(5 * 60);
    pub const WINDOW_SECS: u64 = 10 * 60;
}

pub type TimerId = u64;

#[derive(Debug, Clone)]
pub enum RendezvousEvent {
    TimerFired(TimerId),
    /// The in-flight attempt for this contact finished, successfully or not;
    /// frees the single active slot for the next queued contact.
    Completed { persistent_id: String },
}

#[derive(Debug, Clone)]
pub enum RendezvousAction {
    /// Join the private rendezvous namespace for this contact at the given
    /// slug. The driver is expected to run a `NamespaceEngine` configured
    /// with `NamespaceConfig::Rendezvous { slug }` and, once a peer appears
    /// in its registry, exchange signed `rvz-exchange` envelopes.
    JoinRendezvousNamespace { persistent_id: String, slug: String },
    ArmTimer { timer_id: TimerId, after: Duration },
}

/// FIFO queue of contacts awaiting rendezvous, one active attempt at a time.
pub struct RendezvousScheduler {
    queue: VecDeque<String>,
    in_queue: HashSet<String>,
    shared_keys: std::collections::HashMap<String, SharedKey>,
    active: Option<String>,
    next_timer_id: TimerId,
    current_sweep_timer: Option<TimerId>,
}

impl RendezvousScheduler {
    pub fn new() -> Self {
        RendezvousScheduler {
            queue: VecDeque::new(),
            in_queue: HashSet::new(),
            shared_keys: std::collections::HashMap::new(),
            active: None,
            next_timer_id: 0,
            current_sweep_timer: None,
        }
    }

    /// Arm the first sweep, 30s after startup.
    pub fn start(&mut self) -> Vec<RendezvousAction> {
        self.arm_sweep(timing::INITIAL_DELAY)
    }

    fn arm_sweep(&mut self, after: Duration) -> Vec<RendezvousAction> {
        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;
        self.current_sweep_timer = Some(timer_id);
        vec![RendezvousAction::ArmTimer { timer_id, after }]
    }

    /// Queue a contact for rendezvous. No-op if already queued or active.
    pub fn enqueue(&mut self, persistent_id: impl Into<String>, shared_key: SharedKey) {
        let persistent_id = persistent_id.into();
        if self.active.as_deref() == Some(persistent_id.as_str()) || self.in_queue.contains(&persistent_id) {
            return;
        }
        self.in_queue.insert(persistent_id.clone());
        self.shared_keys.insert(persistent_id.clone(), shared_key);
        self.queue.push_back(persistent_id);
    }

    pub fn is_queued(&self, persistent_id: &str) -> bool {
        self.in_queue.contains(persistent_id) || self.active.as_deref() == Some(persistent_id)
    }

    pub fn tick(&mut self, event: RendezvousEvent, unix_seconds: i64) -> Vec<RendezvousAction> {
        match event {
            RendezvousEvent::TimerFired(timer_id) => {
                if self.current_sweep_timer != Some(timer_id) {
                    return Vec::new();
                }
                let mut actions = self.maybe_start_next(unix_seconds);
                actions.extend(self.arm_sweep(timing::SWEEP_IV));
                actions
            }
            RendezvousEvent::Completed { persistent_id } => {
                if self.active.as_deref() == Some(persistent_id.as_str()) {
                    self.active = None;
                }
                Vec::new()
            }
        }
    }

    fn maybe_start_next(&mut self, unix_seconds: i64) -> Vec<RendezvousAction> {
        if self.active.is_some() {
            return Vec::new();
        }
        while let Some(persistent_id) = self.queue.pop_front() {
            self.in_queue.remove(&persistent_id);
            if let Some(key) = self.shared_keys.get(&persistent_id) {
                let window = (unix_seconds.max(0) as u64) / timing::WINDOW_SECS;
                let slug = key.rendezvous_slug(window);
                self.active = Some(persistent_id.clone());
                return vec![RendezvousAction::JoinRendezvousNamespace { persistent_id, slug }];
            }
        }
        Vec::new()
    }
}

impl Default for RendezvousScheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the signed `rvz-exchange` envelope sent once a rendezvous peer is
/// found in the private namespace's registry.
pub fn build_exchange(
    identity: &Identity,
    persistent_id: &str,
    friendly_name: &str,
    now_ts: i64,
) -> Result<Message, RendezvousError> {
    let payload = format!("{persistent_id}|{now_ts}");
    let signature = identity.sign(payload.as_bytes())?;
    Ok(Message::RvzExchange {
        persistent_id: persistent_id.to_string(),
        friendly_name: friendly_name.to_string(),
        public_key: identity.public_key_base64()?,
        ts: now_ts,
        signature,
    })
}

/// Verify a received `rvz-exchange` envelope's signature. Returns the
/// sender's claimed persistent ID and public key on success.
pub fn verify_exchange(msg: &Message) -> Result<(String, String), RendezvousError> {
    match msg {
        Message::RvzExchange {
            persistent_id,
            ts,
            public_key,
            signature,
            ..
        } => {
            let payload = format!("{persistent_id}|{ts}");
            crate::crypto::verify(public_key, payload.as_bytes(), signature)?;
            Ok((persistent_id.clone(), public_key.clone()))
        }
        _ => Err(RendezvousError::InvalidExchange),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SharedKey {
        SharedKey::from_raw([7u8; 32])
    }

    #[test]
    fn start_arms_initial_sweep() {
        let mut s = RendezvousScheduler::new();
        let actions = s.start();
        assert!(matches!(
            actions.as_slice(),
            [RendezvousAction::ArmTimer { after, .. }] if *after == timing::INITIAL_DELAY
        ));
    }

    #[test]
    fn sweep_starts_queued_contact_and_rearms() {
        let mut s = RendezvousScheduler::new();
        let sweep_timer = match s.start().remove(0) {
            RendezvousAction::ArmTimer { timer_id, .. } => timer_id,
            _ => unreachable!(),
        };
        s.enqueue("p1", key());

        let actions = s.tick(RendezvousEvent::TimerFired(sweep_timer), 1_000_000);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RendezvousAction::JoinRendezvousNamespace { persistent_id, .. } if persistent_id == "p1")));
        assert!(actions
            .iter()
            .any(|a| matches!(a, RendezvousAction::ArmTimer { after, .. } if *after == timing::SWEEP_IV)));
    }

    #[test]
    fn only_one_contact_active_at_a_time() {
        let mut s = RendezvousScheduler::new();
        let sweep_timer = match s.start().remove(0) {
            RendezvousAction::ArmTimer { timer_id, .. } => timer_id,
            _ => unreachable!(),
        };
        s.enqueue("p1", key());
        s.enqueue("p2", key());

        let actions = s.tick(RendezvousEvent::TimerFired(sweep_timer), 1_000_000);
        assert_eq!(
            actions
                .iter()
                .filter(|a| matches!(a, RendezvousAction::JoinRendezvousNamespace { .. }))
                .count(),
            1
        );
        assert!(s.is_queued("p2"));
    }

    #[test]
    fn completed_frees_the_active_slot_for_the_next_sweep() {
        let mut s = RendezvousScheduler::new();
        let sweep_timer = match s.start().remove(0) {
            RendezvousAction::ArmTimer { timer_id, .. } => timer_id,
            _ => unreachable!(),
        };
        s.enqueue("p1", key());
        s.enqueue("p2", key());
        let actions = s.tick(RendezvousEvent::TimerFired(sweep_timer), 1_000_000);
        let next_timer = actions
            .iter()
            .find_map(|a| match a {
                RendezvousAction::ArmTimer { timer_id, .. } => Some(*timer_id),
                _ => None,
            })
            .unwrap();

        s.tick(RendezvousEvent::Completed { persistent_id: "p1".to_string() }, 1_000_600);
        let actions = s.tick(RendezvousEvent::TimerFired(next_timer), 1_000_600);
        assert!(actions
            .iter()
            .any(|a| matches!(a, RendezvousAction::JoinRendezvousNamespace { persistent_id, .. } if persistent_id == "p2")));
    }

    #[test]
    fn exchange_round_trips_and_verifies() {
        let identity = Identity::generate().unwrap();
        let msg = build_exchange(&identity, "persist-1", "alice", 1_700_000_000).unwrap();
        let (pid, pk) = verify_exchange(&msg).unwrap();
        assert_eq!(pid, "persist-1");
        assert_eq!(pk, identity.public_key_base64().unwrap());
    }

    #[test]
    fn exchange_with_wrong_message_type_is_rejected() {
        let err = verify_exchange(&Message::Ping {}).unwrap_err();
        assert!(matches!(err, RendezvousError::InvalidExchange));
    }
}
