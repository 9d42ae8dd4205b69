// src/namespace.rs
// Namespace Engine: the reusable per-namespace state machine covering
// router election, registry maintenance, reverse-connect, failover/cascade,
// and monitor-triggered migration.
//
// Sans-I/O by design: `NamespaceEngine::handle` takes an event and the
// current monotonic time and returns the actions a driver must perform. No
// socket, timer, or clock is touched inside this module, which keeps the
// hardest part of the system unit-testable without real I/O.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::wire::{Message, RegistryPeer};

/// Durations and attempt limits named throughout the algorithm.
pub mod timing {
    use std::time::Duration;

    pub const PING_IV: Duration = Duration::from_secs(60);
    pub const TTL: Duration = Duration::from_secs(90);
    pub const TTL_GRACE: Duration = Duration::from_secs(10);
    pub const MONITOR_IV: Duration = Duration::from_secs(30);
    pub const PEER_SLOT_PROBE_IV: Duration = Duration::from_secs(5);
    pub const PEER_SLOT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const PEER_SLOT_RETRY_MIN: Duration = Duration::from_secs(3);
    pub const PEER_SLOT_RETRY_MAX: Duration = Duration::from_secs(5);
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(8);
    pub const JOIN_RETRY_GAP: Duration = Duration::from_millis(1500);
    pub const MAX_JOIN_ATTEMPTS: u32 = 3;
    pub const MAX_LEVEL: u8 = 5;
    pub const FAILOVER_JITTER_MAX: Duration = Duration::from_secs(3);
    pub const MIGRATE_JITTER_MAX: Duration = Duration::from_secs(2);
    pub const MIGRATE_BEFORE_TEARDOWN: Duration = Duration::from_millis(600);
}

use timing::MAX_LEVEL;

/// Namespace kind: differs from the others only in its three endpoint
/// string builders, per the original design's "three pure functions over a
/// slug" model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceConfig {
    Public { ip: String },
    Custom { slug: String, advanced: bool },
    Rendezvous { slug: String },
}

impl NamespaceConfig {
    fn slug(&self) -> String {
        match self {
            NamespaceConfig::Public { ip } => ip.replace('.', "-"),
            NamespaceConfig::Custom { slug, advanced } => {
                if *advanced {
                    slug.clone()
                } else {
                    sanitize(slug)
                }
            }
            NamespaceConfig::Rendezvous { slug } => slug.clone(),
        }
    }

    fn build(&self, prefix: &str, suffix: &str) -> String {
        match self {
            NamespaceConfig::Public { .. } => format!("{prefix}-{}-{suffix}", self.slug()),
            NamespaceConfig::Custom { advanced: true, .. } => format!("{}-{suffix}", self.slug()),
            NamespaceConfig::Custom { advanced: false, .. } => {
                format!("{prefix}-ns-{}-{suffix}", self.slug())
            }
            NamespaceConfig::Rendezvous { .. } => format!("{prefix}-rvz-{}-{suffix}", self.slug()),
        }
    }

    pub fn router_id(&self, prefix: &str, level: u8) -> String {
        self.build(prefix, &level.to_string())
    }

    pub fn discovery_id(&self, prefix: &str, uuid: &str) -> String {
        self.build(prefix, uuid)
    }

    pub fn peer_slot_id(&self, prefix: &str) -> String {
        self.build(prefix, "p1")
    }
}

fn sanitize(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

fn random_duration(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span_ms = (max - min).as_millis() as u64;
    let extra = rand::thread_rng().gen_range(0..=span_ms);
    min + Duration::from_millis(extra)
}

pub type RequestId = u64;
pub type TimerId = u64;
pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    None,
    Peer,
    Router,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JoinStatus {
    Idle,
    Joining { level: u8, attempt: u32 },
    PeerSlot { level: u8 },
}

/// One entry in a namespace's registry, keyed externally by discovery ID.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub discovery_id: String,
    pub friendly_name: String,
    pub last_seen: Instant,
    pub is_me: bool,
    pub persistent_id: Option<String>,
    pub public_key: Option<String>,
    channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceStatus {
    Electing { level: u8 },
    Router { level: u8 },
    Peer { level: u8 },
    PeerListUpdated,
    DiscoveryOffline,
    Offline,
}

/// Events fed into the engine: timer fires, I/O results, and user commands.
/// Claims and connects are correlated back to the action that requested
/// them via `RequestId`; the driver is responsible for performing the real
/// I/O and reporting the outcome.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Join,
    Leave,
    TimerFired(TimerId),
    ClaimGranted { request_id: RequestId },
    ClaimAlreadyTaken { request_id: RequestId },
    ClaimFailed { request_id: RequestId },
    ConnectOpened { request_id: RequestId, channel_id: ChannelId },
    ConnectUnreachable { request_id: RequestId },
    InboundConnection { request_id: RequestId, channel_id: ChannelId },
    ChannelData { channel_id: ChannelId, message: Message },
    ChannelClosed { channel_id: ChannelId },
}

/// Actions the driver must perform in response to an event.
#[derive(Debug, Clone)]
pub enum EngineAction {
    ClaimEndpoint { request_id: RequestId, endpoint: String },
    ConnectEndpoint { request_id: RequestId, endpoint: String },
    ReleaseClaim { request_id: RequestId },
    SendMessage { channel_id: ChannelId, message: Message },
    CloseChannel { channel_id: ChannelId },
    ArmTimer { timer_id: TimerId, after: Duration },
    CancelTimer { timer_id: TimerId },
    EmitStatus(NamespaceStatus),
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    ElectClaim { level: u8 },
    DiscoveryClaim,
    JoinConnect { level: u8, attempt: u32 },
    PeerSlotClaim { level: u8 },
    PeerSlotProbeConnect,
    MonitorConnect,
}

#[derive(Debug, Clone, Copy)]
enum TimerPurpose {
    JoinTimeout { level: u8, attempt: u32 },
    JoinRetry { level: u8, attempt: u32 },
    Ping,
    Monitor,
    PeerSlotProbe,
    PeerSlotTimeout,
    PeerSlotRetry { level: u8 },
    FailoverJitter { target_level: u8 },
    MigrateJitter,
}

#[derive(Debug, Clone)]
enum ChannelRole {
    RouterChannel,
    PendingPeerCheckin,
    PeerChannel { discovery_id: String },
    PeerSlotInbound,
}

/// The per-namespace state machine. One instance per joined namespace.
pub struct NamespaceEngine {
    prefix: String,
    config: NamespaceConfig,
    local_uuid: String,
    friendly_name: String,
    public_key: String,

    role: Role,
    level: u8,
    registry: HashMap<String, RegistryEntry>,

    router_channel: Option<ChannelId>,
    router_claim_request: Option<RequestId>,
    discovery_claim_request: Option<RequestId>,
    peer_slot_claim_request: Option<RequestId>,
    peer_slot_level: Option<u8>,
    pending_migrate_target: Option<u8>,

    join_status: JoinStatus,

    pending: HashMap<RequestId, Pending>,
    timers: HashMap<TimerId, TimerPurpose>,
    channel_roles: HashMap<ChannelId, ChannelRole>,

    next_request_id: RequestId,
    next_timer_id: TimerId,
}

impl NamespaceEngine {
    pub fn new(
        prefix: impl Into<String>,
        config: NamespaceConfig,
        local_uuid: impl Into<String>,
        friendly_name: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        NamespaceEngine {
            prefix: prefix.into(),
            config,
            local_uuid: local_uuid.into(),
            friendly_name: friendly_name.into(),
            public_key: public_key.into(),
            role: Role::None,
            level: 0,
            registry: HashMap::new(),
            router_channel: None,
            router_claim_request: None,
            discovery_claim_request: None,
            peer_slot_claim_request: None,
            peer_slot_level: None,
            pending_migrate_target: None,
            join_status: JoinStatus::Idle,
            pending: HashMap::new(),
            timers: HashMap::new(),
            channel_roles: HashMap::new(),
            next_request_id: 0,
            next_timer_id: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn peers(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.registry.values().filter(|e| !e.is_me)
    }

    /// The discovery ID a contact with the given discovery UUID would have
    /// claimed in this namespace. Used as the discovery-UUID fallback match
    /// in [`resolve_registry_against_contacts`] when a registry entry can't
    /// be resolved by public key.
    pub fn discovery_id_for_uuid(&self, uuid: &str) -> String {
        self.config.discovery_id(&self.prefix, uuid)
    }

    fn next_request_id(&mut self) -> RequestId {
        self.next_request_id += 1;
        self.next_request_id
    }

    fn next_timer_id(&mut self) -> TimerId {
        self.next_timer_id += 1;
        self.next_timer_id
    }

    fn cancel_timers_matching(&mut self, pred: impl Fn(&TimerPurpose) -> bool) -> Vec<EngineAction> {
        let ids: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, p)| pred(p))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.timers.remove(id);
        }
        ids.into_iter()
            .map(|timer_id| EngineAction::CancelTimer { timer_id })
            .collect()
    }

    fn insert_self_entry(&mut self, now: Instant) {
        let discovery_id = self.config.discovery_id(&self.prefix, &self.local_uuid);
        self.registry.insert(
            discovery_id.clone(),
            RegistryEntry {
                discovery_id,
                friendly_name: self.friendly_name.clone(),
                last_seen: now,
                is_me: true,
                persistent_id: None,
                public_key: Some(self.public_key.clone()),
                channel_id: None,
            },
        );
    }

    /// Drive the state machine with one event. Returns the actions the
    /// driver must perform as a result.
    pub fn handle(&mut self, event: EngineEvent, now: Instant) -> Vec<EngineAction> {
        match event {
            EngineEvent::Join => self.start_election(1),
            EngineEvent::Leave => {
                let mut actions = self.teardown();
                actions.push(EngineAction::EmitStatus(NamespaceStatus::Offline));
                actions
            }
            EngineEvent::TimerFired(timer_id) => self.on_timer_fired(timer_id, now),
            EngineEvent::ClaimGranted { request_id } => self.on_claim_granted(request_id, now),
            EngineEvent::ClaimAlreadyTaken { request_id } => self.on_claim_already_taken(request_id),
            EngineEvent::ClaimFailed { request_id } => {
                self.pending.remove(&request_id);
                Vec::new()
            }
            EngineEvent::ConnectOpened { request_id, channel_id } => {
                self.on_connect_opened(request_id, channel_id, now)
            }
            EngineEvent::ConnectUnreachable { request_id } => self.on_connect_unreachable(request_id),
            EngineEvent::InboundConnection { request_id, channel_id } => {
                self.on_inbound_connection(request_id, channel_id)
            }
            EngineEvent::ChannelData { channel_id, message } => {
                self.on_channel_data(channel_id, message, now)
            }
            EngineEvent::ChannelClosed { channel_id } => self.on_channel_closed(channel_id, now),
        }
    }

    fn start_election(&mut self, level: u8) -> Vec<EngineAction> {
        if level > MAX_LEVEL {
            return self.level_exhausted();
        }
        self.level = level;
        self.role = Role::None;
        self.join_status = JoinStatus::Idle;
        let endpoint = self.config.router_id(&self.prefix, level);
        let request_id = self.next_request_id();
        self.pending.insert(request_id, Pending::ElectClaim { level });
        vec![
            EngineAction::EmitStatus(NamespaceStatus::Electing { level }),
            EngineAction::ClaimEndpoint { request_id, endpoint },
        ]
    }

    fn level_exhausted(&mut self) -> Vec<EngineAction> {
        let mut actions = self.teardown();
        actions.push(EngineAction::EmitStatus(NamespaceStatus::DiscoveryOffline));
        actions
    }

    fn on_claim_granted(&mut self, request_id: RequestId, now: Instant) -> Vec<EngineAction> {
        match self.pending.remove(&request_id) {
            Some(Pending::ElectClaim { level }) => self.become_router(level, request_id, now),
            Some(Pending::DiscoveryClaim) => {
                self.discovery_claim_request = Some(request_id);
                Vec::new()
            }
            Some(Pending::PeerSlotClaim { level }) => self.on_peer_slot_granted(level, request_id, now),
            _ => Vec::new(),
        }
    }

    fn on_claim_already_taken(&mut self, request_id: RequestId) -> Vec<EngineAction> {
        match self.pending.remove(&request_id) {
            Some(Pending::ElectClaim { level }) => self.attempt_join(level, 0),
            Some(Pending::PeerSlotClaim { level }) => {
                let timer_id = self.next_timer_id();
                self.timers.insert(timer_id, TimerPurpose::PeerSlotRetry { level });
                let delay = random_duration(timing::PEER_SLOT_RETRY_MIN, timing::PEER_SLOT_RETRY_MAX);
                vec![EngineAction::ArmTimer { timer_id, after: delay }]
            }
            Some(Pending::DiscoveryClaim) => {
                // Extremely unlikely (uuid-derived); regenerate is a host
                // concern. Nothing to do from the engine's perspective.
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn become_router(&mut self, level: u8, request_id: RequestId, now: Instant) -> Vec<EngineAction> {
        self.role = Role::Router;
        self.level = level;
        self.router_claim_request = Some(request_id);
        self.registry.clear();
        self.insert_self_entry(now);

        let mut actions = vec![EngineAction::EmitStatus(NamespaceStatus::Router { level })];

        let ping_timer = self.next_timer_id();
        self.timers.insert(ping_timer, TimerPurpose::Ping);
        actions.push(EngineAction::ArmTimer {
            timer_id: ping_timer,
            after: timing::PING_IV,
        });

        let probe_timer = self.next_timer_id();
        self.timers.insert(probe_timer, TimerPurpose::PeerSlotProbe);
        actions.push(EngineAction::ArmTimer {
            timer_id: probe_timer,
            after: timing::PEER_SLOT_PROBE_IV,
        });

        if level > 1 {
            let monitor_timer = self.next_timer_id();
            self.timers.insert(monitor_timer, TimerPurpose::Monitor);
            actions.push(EngineAction::ArmTimer {
                timer_id: monitor_timer,
                after: timing::MONITOR_IV,
            });
        }

        let discovery_request = self.next_request_id();
        self.pending.insert(discovery_request, Pending::DiscoveryClaim);
        actions.push(EngineAction::ClaimEndpoint {
            request_id: discovery_request,
            endpoint: self.config.discovery_id(&self.prefix, &self.local_uuid),
        });

        actions
    }

    fn attempt_join(&mut self, level: u8, attempt: u32) -> Vec<EngineAction> {
        self.join_status = JoinStatus::Joining { level, attempt };
        let endpoint = self.config.router_id(&self.prefix, level);
        let request_id = self.next_request_id();
        self.pending.insert(request_id, Pending::JoinConnect { level, attempt });

        let timer_id = self.next_timer_id();
        self.timers
            .insert(timer_id, TimerPurpose::JoinTimeout { level, attempt });

        vec![
            EngineAction::ConnectEndpoint { request_id, endpoint },
            EngineAction::ArmTimer {
                timer_id,
                after: timing::JOIN_TIMEOUT,
            },
        ]
    }

    fn on_connect_opened(&mut self, request_id: RequestId, channel_id: ChannelId, now: Instant) -> Vec<EngineAction> {
        match self.pending.remove(&request_id) {
            Some(Pending::JoinConnect { level, attempt }) => {
                self.on_join_opened(level, attempt, channel_id, now)
            }
            Some(Pending::PeerSlotProbeConnect) => {
                // The peer reuses this same channel as its router channel
                // and checks in on it (see `on_reverse_welcome`); treat it
                // exactly like an inbound checkin channel so it gets
                // registered and broadcast like any other join.
                self.channel_roles
                    .insert(channel_id, ChannelRole::PendingPeerCheckin);
                vec![EngineAction::SendMessage {
                    channel_id,
                    message: Message::ReverseWelcome {},
                }]
            }
            Some(Pending::MonitorConnect) => self.on_monitor_opened(channel_id),
            _ => vec![EngineAction::CloseChannel { channel_id }],
        }
    }

    fn on_join_opened(&mut self, level: u8, _attempt: u32, channel_id: ChannelId, now: Instant) -> Vec<EngineAction> {
        let mut actions = self.cancel_timers_matching(|p| matches!(p, TimerPurpose::JoinTimeout { .. }));

        self.channel_roles.insert(channel_id, ChannelRole::RouterChannel);
        self.role = Role::Peer;
        self.level = level;
        self.router_channel = Some(channel_id);
        self.join_status = JoinStatus::Idle;
        self.insert_self_entry(now);

        actions.push(EngineAction::SendMessage {
            channel_id,
            message: Message::Checkin {
                discovery_id: self.config.discovery_id(&self.prefix, &self.local_uuid),
                friendly_name: self.friendly_name.clone(),
                public_key: self.public_key.clone(),
            },
        });

        let discovery_request = self.next_request_id();
        self.pending.insert(discovery_request, Pending::DiscoveryClaim);
        actions.push(EngineAction::ClaimEndpoint {
            request_id: discovery_request,
            endpoint: self.config.discovery_id(&self.prefix, &self.local_uuid),
        });

        if level > 1 {
            let monitor_timer = self.next_timer_id();
            self.timers.insert(monitor_timer, TimerPurpose::Monitor);
            actions.push(EngineAction::ArmTimer {
                timer_id: monitor_timer,
                after: timing::MONITOR_IV,
            });
        }

        actions.push(EngineAction::EmitStatus(NamespaceStatus::Peer { level }));
        actions
    }

    fn on_connect_unreachable(&mut self, request_id: RequestId) -> Vec<EngineAction> {
        match self.pending.remove(&request_id) {
            Some(Pending::JoinConnect { level, attempt }) => self.on_join_failed(level, attempt),
            Some(Pending::MonitorConnect) => self.on_monitor_refused(),
            Some(Pending::PeerSlotProbeConnect) => Vec::new(),
            _ => Vec::new(),
        }
    }

    /// The monitor's probe to `routerID(1)` found nobody home. A router at
    /// L>1 reclaims the level-1 slot for itself rather than waiting for a
    /// peer to notice; a peer at L>1 just keeps monitoring.
    fn on_monitor_refused(&mut self) -> Vec<EngineAction> {
        if self.role != Role::Router || self.level <= 1 {
            return Vec::new();
        }
        let mut actions = self.teardown();
        actions.extend(self.start_election(1));
        actions
    }

    fn on_join_failed(&mut self, level: u8, attempt: u32) -> Vec<EngineAction> {
        let mut actions = self.cancel_timers_matching(|p| {
            matches!(p, TimerPurpose::JoinTimeout { level: l, attempt: a } if *l == level && *a == attempt)
        });
        if attempt + 1 < timing::MAX_JOIN_ATTEMPTS {
            let timer_id = self.next_timer_id();
            self.timers.insert(
                timer_id,
                TimerPurpose::JoinRetry {
                    level,
                    attempt: attempt + 1,
                },
            );
            actions.push(EngineAction::ArmTimer {
                timer_id,
                after: timing::JOIN_RETRY_GAP,
            });
        } else {
            actions.extend(self.attempt_peer_slot(level));
        }
        actions
    }

    fn attempt_peer_slot(&mut self, level: u8) -> Vec<EngineAction> {
        self.join_status = JoinStatus::PeerSlot { level };
        let endpoint = self.config.peer_slot_id(&self.prefix);
        let request_id = self.next_request_id();
        self.pending.insert(request_id, Pending::PeerSlotClaim { level });
        vec![EngineAction::ClaimEndpoint { request_id, endpoint }]
    }

    fn on_peer_slot_granted(&mut self, level: u8, request_id: RequestId, _now: Instant) -> Vec<EngineAction> {
        self.peer_slot_claim_request = Some(request_id);
        self.peer_slot_level = Some(level);
        let timer_id = self.next_timer_id();
        self.timers.insert(timer_id, TimerPurpose::PeerSlotTimeout);
        vec![EngineAction::ArmTimer {
            timer_id,
            after: timing::PEER_SLOT_TIMEOUT,
        }]
    }

    fn on_inbound_connection(&mut self, request_id: RequestId, channel_id: ChannelId) -> Vec<EngineAction> {
        if Some(request_id) == self.router_claim_request {
            self.channel_roles.insert(channel_id, ChannelRole::PendingPeerCheckin);
        } else if Some(request_id) == self.peer_slot_claim_request {
            self.channel_roles.insert(channel_id, ChannelRole::PeerSlotInbound);
        }
        Vec::new()
    }

    fn on_channel_data(&mut self, channel_id: ChannelId, message: Message, now: Instant) -> Vec<EngineAction> {
        let role = match self.channel_roles.get(&channel_id).cloned() {
            Some(r) => r,
            None => return Vec::new(),
        };
        match role {
            ChannelRole::RouterChannel => self.on_router_channel_data(channel_id, message, now),
            ChannelRole::PendingPeerCheckin => self.on_pending_checkin_data(channel_id, message, now),
            ChannelRole::PeerChannel { discovery_id } => {
                self.on_peer_channel_data(discovery_id, message, now)
            }
            ChannelRole::PeerSlotInbound => self.on_peer_slot_inbound_data(channel_id, message, now),
        }
    }

    fn on_router_channel_data(&mut self, channel_id: ChannelId, message: Message, now: Instant) -> Vec<EngineAction> {
        match message {
            Message::Registry { peers } => self.registry_merge(peers, now),
            Message::Ping {} => vec![EngineAction::SendMessage {
                channel_id,
                message: Message::Pong {},
            }],
            Message::Migrate { level } => self.handle_migrate(level),
            _ => Vec::new(),
        }
    }

    fn on_pending_checkin_data(&mut self, channel_id: ChannelId, message: Message, now: Instant) -> Vec<EngineAction> {
        match message {
            Message::Checkin {
                discovery_id,
                friendly_name,
                public_key,
            } => self.router_accept_checkin(channel_id, discovery_id, friendly_name, public_key, now),
            _ => Vec::new(),
        }
    }

    fn on_peer_channel_data(&mut self, discovery_id: String, message: Message, now: Instant) -> Vec<EngineAction> {
        if let Message::Pong {} = message {
            if let Some(entry) = self.registry.get_mut(&discovery_id) {
                entry.last_seen = now;
            }
        }
        Vec::new()
    }

    fn on_peer_slot_inbound_data(&mut self, channel_id: ChannelId, message: Message, now: Instant) -> Vec<EngineAction> {
        match message {
            Message::ReverseWelcome {} => self.on_reverse_welcome(channel_id, now),
            _ => Vec::new(),
        }
    }

    fn on_reverse_welcome(&mut self, channel_id: ChannelId, now: Instant) -> Vec<EngineAction> {
        let mut actions = self.cancel_timers_matching(|p| matches!(p, TimerPurpose::PeerSlotTimeout));
        if let Some(req) = self.peer_slot_claim_request.take() {
            actions.push(EngineAction::ReleaseClaim { request_id: req });
        }
        let level = self.peer_slot_level.take().unwrap_or(self.level.max(1));

        self.channel_roles.remove(&channel_id);
        self.role = Role::Peer;
        self.level = level;
        self.router_channel = Some(channel_id);
        self.join_status = JoinStatus::Idle;
        self.insert_self_entry(now);

        actions.push(EngineAction::SendMessage {
            channel_id,
            message: Message::Checkin {
                discovery_id: self.config.discovery_id(&self.prefix, &self.local_uuid),
                friendly_name: self.friendly_name.clone(),
                public_key: self.public_key.clone(),
            },
        });

        let discovery_request = self.next_request_id();
        self.pending.insert(discovery_request, Pending::DiscoveryClaim);
        actions.push(EngineAction::ClaimEndpoint {
            request_id: discovery_request,
            endpoint: self.config.discovery_id(&self.prefix, &self.local_uuid),
        });

        if level > 1 {
            let monitor_timer = self.next_timer_id();
            self.timers.insert(monitor_timer, TimerPurpose::Monitor);
            actions.push(EngineAction::ArmTimer {
                timer_id: monitor_timer,
                after: timing::MONITOR_IV,
            });
        }

        actions.push(EngineAction::EmitStatus(NamespaceStatus::Peer { level }));
        actions
    }

    fn router_accept_checkin(
        &mut self,
        channel_id: ChannelId,
        discovery_id: String,
        friendly_name: String,
        public_key: String,
        now: Instant,
    ) -> Vec<EngineAction> {
        self.registry
            .retain(|_, e| e.is_me || e.public_key.as_deref() != Some(public_key.as_str()));
        self.registry.insert(
            discovery_id.clone(),
            RegistryEntry {
                discovery_id: discovery_id.clone(),
                friendly_name,
                last_seen: now,
                is_me: false,
                persistent_id: None,
                public_key: Some(public_key),
                channel_id: Some(channel_id),
            },
        );
        self.channel_roles
            .insert(channel_id, ChannelRole::PeerChannel { discovery_id });
        self.broadcast_registry()
    }

    fn broadcast_registry(&self) -> Vec<EngineAction> {
        let peers: Vec<RegistryPeer> = self
            .registry
            .values()
            .filter(|e| !e.is_me)
            .map(|e| RegistryPeer {
                discovery_id: e.discovery_id.clone(),
                friendly_name: e.friendly_name.clone(),
                public_key: e.public_key.clone(),
            })
            .collect();
        let message = Message::Registry { peers };
        self.registry
            .values()
            .filter(|e| !e.is_me)
            .filter_map(|e| e.channel_id)
            .map(|channel_id| EngineAction::SendMessage {
                channel_id,
                message: message.clone(),
            })
            .collect()
    }

    fn registry_merge(&mut self, peers: Vec<RegistryPeer>, now: Instant) -> Vec<EngineAction> {
        let self_entry = self.registry.values().find(|e| e.is_me).cloned();
        self.registry.clear();
        if let Some(entry) = self_entry {
            self.registry.insert(entry.discovery_id.clone(), entry);
        }

        let mut seen_public_keys = std::collections::HashSet::new();
        for peer in peers {
            if let Some(pk) = &peer.public_key {
                if !seen_public_keys.insert(pk.clone()) {
                    continue;
                }
            }
            self.registry.insert(
                peer.discovery_id.clone(),
                RegistryEntry {
                    discovery_id: peer.discovery_id,
                    friendly_name: peer.friendly_name,
                    last_seen: now,
                    is_me: false,
                    persistent_id: None,
                    public_key: peer.public_key,
                    channel_id: None,
                },
            );
        }
        vec![EngineAction::EmitStatus(NamespaceStatus::PeerListUpdated)]
    }

    fn handle_migrate(&mut self, level: u8) -> Vec<EngineAction> {
        self.pending_migrate_target = Some(level);
        let timer_id = self.next_timer_id();
        self.timers.insert(timer_id, TimerPurpose::MigrateJitter);
        vec![EngineAction::ArmTimer {
            timer_id,
            after: random_duration(Duration::ZERO, timing::MIGRATE_JITTER_MAX),
        }]
    }

    fn on_monitor_opened(&mut self, channel_id: ChannelId) -> Vec<EngineAction> {
        let mut actions = vec![EngineAction::CloseChannel { channel_id }];
        if self.role == Role::Router {
            actions.extend(self.broadcast_message(Message::Migrate { level: 1 }));
        }
        self.pending_migrate_target = Some(1);
        let timer_id = self.next_timer_id();
        self.timers.insert(timer_id, TimerPurpose::MigrateJitter);
        actions.push(EngineAction::ArmTimer {
            timer_id,
            after: timing::MIGRATE_BEFORE_TEARDOWN,
        });
        actions
    }

    fn broadcast_message(&self, message: Message) -> Vec<EngineAction> {
        self.registry
            .values()
            .filter(|e| !e.is_me)
            .filter_map(|e| e.channel_id)
            .map(|channel_id| EngineAction::SendMessage {
                channel_id,
                message: message.clone(),
            })
            .collect()
    }

    fn on_timer_fired(&mut self, timer_id: TimerId, now: Instant) -> Vec<EngineAction> {
        let purpose = match self.timers.remove(&timer_id) {
            Some(p) => p,
            None => return Vec::new(),
        };
        match purpose {
            TimerPurpose::JoinTimeout { level, attempt } => self.on_join_failed(level, attempt),
            TimerPurpose::JoinRetry { level, attempt } => self.attempt_join(level, attempt),
            TimerPurpose::Ping => self.on_ping_tick(now),
            TimerPurpose::Monitor => self.on_monitor_tick(),
            TimerPurpose::PeerSlotProbe => self.on_peer_slot_probe_tick(),
            TimerPurpose::PeerSlotTimeout => {
                let level = self.peer_slot_level.take().unwrap_or(self.level).saturating_add(1);
                let mut actions = Vec::new();
                if let Some(req) = self.peer_slot_claim_request.take() {
                    actions.push(EngineAction::ReleaseClaim { request_id: req });
                }
                actions.extend(self.start_election(level));
                actions
            }
            TimerPurpose::PeerSlotRetry { level } => self.attempt_peer_slot(level),
            TimerPurpose::FailoverJitter { target_level } => self.start_election(target_level),
            TimerPurpose::MigrateJitter => {
                let target = self.pending_migrate_target.take().unwrap_or(1);
                let mut actions = self.teardown();
                actions.extend(self.start_election(target));
                actions
            }
        }
    }

    fn on_ping_tick(&mut self, now: Instant) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        let cutoff_age = timing::TTL + timing::TTL_GRACE;
        let mut evicted = false;
        let stale: Vec<(String, Option<ChannelId>)> = self
            .registry
            .values()
            .filter(|e| !e.is_me && now.duration_since(e.last_seen) >= cutoff_age)
            .map(|e| (e.discovery_id.clone(), e.channel_id))
            .collect();
        for (discovery_id, channel_id) in stale {
            self.registry.remove(&discovery_id);
            if let Some(channel_id) = channel_id {
                actions.push(EngineAction::CloseChannel { channel_id });
            }
            evicted = true;
        }

        for entry in self.registry.values().filter(|e| !e.is_me) {
            if let Some(channel_id) = entry.channel_id {
                actions.push(EngineAction::SendMessage {
                    channel_id,
                    message: Message::Ping {},
                });
            }
        }

        if evicted {
            actions.extend(self.broadcast_registry());
        }

        let timer_id = self.next_timer_id();
        self.timers.insert(timer_id, TimerPurpose::Ping);
        actions.push(EngineAction::ArmTimer {
            timer_id,
            after: timing::PING_IV,
        });
        actions
    }

    fn on_monitor_tick(&mut self) -> Vec<EngineAction> {
        let request_id = self.next_request_id();
        self.pending.insert(request_id, Pending::MonitorConnect);
        let endpoint = self.config.router_id(&self.prefix, 1);

        let timer_id = self.next_timer_id();
        self.timers.insert(timer_id, TimerPurpose::Monitor);

        vec![
            EngineAction::ConnectEndpoint { request_id, endpoint },
            EngineAction::ArmTimer {
                timer_id,
                after: timing::MONITOR_IV,
            },
        ]
    }

    fn on_peer_slot_probe_tick(&mut self) -> Vec<EngineAction> {
        let request_id = self.next_request_id();
        self.pending.insert(request_id, Pending::PeerSlotProbeConnect);
        let endpoint = self.config.peer_slot_id(&self.prefix);

        let timer_id = self.next_timer_id();
        self.timers.insert(timer_id, TimerPurpose::PeerSlotProbe);

        vec![
            EngineAction::ConnectEndpoint { request_id, endpoint },
            EngineAction::ArmTimer {
                timer_id,
                after: timing::PEER_SLOT_PROBE_IV,
            },
        ]
    }

    fn on_channel_closed(&mut self, channel_id: ChannelId, now: Instant) -> Vec<EngineAction> {
        match self.channel_roles.remove(&channel_id) {
            Some(ChannelRole::RouterChannel) => {
                if self.router_channel == Some(channel_id) {
                    self.failover(now)
                } else {
                    Vec::new()
                }
            }
            Some(ChannelRole::PeerChannel { discovery_id }) => {
                self.registry.remove(&discovery_id);
                self.broadcast_registry()
            }
            _ => Vec::new(),
        }
    }

    fn failover(&mut self, now: Instant) -> Vec<EngineAction> {
        let mut actions = self.teardown();
        self.insert_self_entry(now);
        let timer_id = self.next_timer_id();
        self.timers
            .insert(timer_id, TimerPurpose::FailoverJitter { target_level: 1 });
        actions.push(EngineAction::ArmTimer {
            timer_id,
            after: random_duration(Duration::ZERO, timing::FAILOVER_JITTER_MAX),
        });
        actions
    }

    fn teardown(&mut self) -> Vec<EngineAction> {
        let mut actions = Vec::new();
        for (timer_id, _) in self.timers.drain() {
            actions.push(EngineAction::CancelTimer { timer_id });
        }
        if let Some(channel_id) = self.router_channel.take() {
            actions.push(EngineAction::CloseChannel { channel_id });
        }
        for (channel_id, _) in self.channel_roles.drain() {
            actions.push(EngineAction::CloseChannel { channel_id });
        }
        if let Some(request_id) = self.router_claim_request.take() {
            actions.push(EngineAction::ReleaseClaim { request_id });
        }
        if let Some(request_id) = self.discovery_claim_request.take() {
            actions.push(EngineAction::ReleaseClaim { request_id });
        }
        if let Some(request_id) = self.peer_slot_claim_request.take() {
            actions.push(EngineAction::ReleaseClaim { request_id });
        }
        self.peer_slot_level = None;
        self.registry.clear();
        self.role = Role::None;
        self.join_status = JoinStatus::Idle;
        self.pending.clear();
        actions
    }
}

// -- Async driver --
//
// `NamespaceEngine` never touches a socket or a clock; `NamespaceDriver` is
// the one task per namespace that does. It turns `EngineAction`s into real
// claims/connects/sends/timers against a `SignalingAdapter` and feeds the
// resulting `EngineEvent`s back into the engine, looping until the
// namespace is torn down. This is the "one task per namespace with a
// sans-I/O core" shape the original design notes call for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::signaling::{SignalingAdapter, SignalingChannel};

enum ChannelCmd {
    Send(Message),
    Close,
}

/// Spawns and tracks the per-channel recv/send tasks a driver hands off to
/// Tokio; channel IDs are allocated here since the engine only assigns them
/// semantic roles, not concrete async objects.
struct ChannelHub {
    next_id: AtomicU64,
    senders: std::sync::Mutex<HashMap<ChannelId, mpsc::UnboundedSender<ChannelCmd>>>,
}

impl ChannelHub {
    fn new() -> Self {
        ChannelHub {
            next_id: AtomicU64::new(1),
            senders: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn spawn<C: SignalingChannel + 'static>(
        &self,
        mut channel: C,
        events_tx: mpsc::UnboundedSender<EngineEvent>,
    ) -> ChannelId {
        let channel_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ChannelCmd>();
        self.senders.lock().unwrap().insert(channel_id, cmd_tx);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ChannelCmd::Send(msg)) => {
                            if channel.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Some(ChannelCmd::Close) | None => break,
                    },
                    incoming = channel.recv() => match incoming {
                        Some(message) => {
                            let _ = events_tx.send(EngineEvent::ChannelData { channel_id, message });
                        }
                        None => break,
                    },
                }
            }
            channel.close();
            let _ = events_tx.send(EngineEvent::ChannelClosed { channel_id });
        });

        channel_id
    }

    fn send(&self, channel_id: ChannelId, message: Message) {
        if let Some(tx) = self.senders.lock().unwrap().get(&channel_id) {
            let _ = tx.send(ChannelCmd::Send(message));
        }
    }

    fn close(&self, channel_id: ChannelId) {
        if let Some(tx) = self.senders.lock().unwrap().remove(&channel_id) {
            let _ = tx.send(ChannelCmd::Close);
        }
    }
}

/// Drives one `NamespaceEngine` against a live `SignalingAdapter`, turning
/// engine actions into real I/O and real timers and feeding the results
/// back in as events. Owns the one Tokio task per namespace that the
/// original design calls for.
pub struct NamespaceDriver<A: SignalingAdapter + Clone> {
    engine: NamespaceEngine,
    adapter: A,
    channels: Arc<ChannelHub>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    releases: HashMap<RequestId, oneshot::Sender<()>>,
    timers: HashMap<TimerId, tokio::task::JoinHandle<()>>,
    status_tx: mpsc::UnboundedSender<NamespaceStatus>,
}

impl<A: SignalingAdapter + Clone> NamespaceDriver<A> {
    /// Build a driver for `engine`. Returns the driver and a receiver of
    /// every `NamespaceStatus` the engine emits, for a host application (or
    /// the rendezvous scheduler) to observe without polling.
    pub fn new(engine: NamespaceEngine, adapter: A) -> (Self, mpsc::UnboundedReceiver<NamespaceStatus>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let driver = NamespaceDriver {
            engine,
            adapter,
            channels: Arc::new(ChannelHub::new()),
            events_tx,
            events_rx,
            releases: HashMap::new(),
            timers: HashMap::new(),
            status_tx,
        };
        (driver, status_rx)
    }

    pub fn engine(&self) -> &NamespaceEngine {
        &self.engine
    }

    /// Start the election/join process. Equivalent to a user "join" command.
    pub fn join(&self) {
        let _ = self.events_tx.send(EngineEvent::Join);
    }

    pub fn leave(&self) {
        let _ = self.events_tx.send(EngineEvent::Leave);
    }

    /// Run the driver's event loop until the namespace goes offline (user
    /// left, or level exhaustion) and there is nothing left in flight.
    pub async fn run(mut self) {
        while let Some(event) = self.events_rx.recv().await {
            let went_offline = matches!(
                event,
                EngineEvent::Leave
            );
            let now = Instant::now();
            let actions = self.engine.handle(event, now);
            let mut stop = false;
            for action in actions {
                if let EngineAction::EmitStatus(status @ (NamespaceStatus::Offline | NamespaceStatus::DiscoveryOffline)) = &action {
                    stop = true;
                    let _ = self.status_tx.send(*status);
                } else {
                    self.perform(action).await;
                }
            }
            if stop || (went_offline && self.engine.role() == Role::None) {
                break;
            }
        }
    }

    async fn perform(&mut self, action: EngineAction) {
        match action {
            EngineAction::ClaimEndpoint { request_id, endpoint } => self.spawn_claim(request_id, endpoint),
            EngineAction::ConnectEndpoint { request_id, endpoint } => self.spawn_connect(request_id, endpoint),
            EngineAction::ReleaseClaim { request_id } => {
                if let Some(tx) = self.releases.remove(&request_id) {
                    let _ = tx.send(());
                }
            }
            EngineAction::SendMessage { channel_id, message } => self.channels.send(channel_id, message),
            EngineAction::CloseChannel { channel_id } => self.channels.close(channel_id),
            EngineAction::ArmTimer { timer_id, after } => self.spawn_timer(timer_id, after),
            EngineAction::CancelTimer { timer_id } => {
                if let Some(handle) = self.timers.remove(&timer_id) {
                    handle.abort();
                }
            }
            EngineAction::EmitStatus(status) => {
                let _ = self.status_tx.send(status);
            }
        }
    }

    fn spawn_claim(&mut self, request_id: RequestId, endpoint: String) {
        let adapter = self.adapter.clone();
        let events_tx = self.events_tx.clone();
        let channels = self.channels.clone();
        let (release_tx, mut release_rx) = oneshot::channel();
        self.releases.insert(request_id, release_tx);

        tokio::spawn(async move {
            match adapter.claim(&endpoint).await {
                Ok(mut claim) => {
                    let _ = events_tx.send(EngineEvent::ClaimGranted { request_id });
                    loop {
                        tokio::select! {
                            _ = &mut release_rx => break,
                            inbound = claim.next_inbound() => match inbound {
                                Some(channel) => {
                                    let channel_id = channels.spawn(channel, events_tx.clone());
                                    let _ = events_tx.send(EngineEvent::InboundConnection { request_id, channel_id });
                                }
                                None => break,
                            },
                        }
                    }
                }
                Err(crate::error::SignalingError::AlreadyTaken(_)) => {
                    let _ = events_tx.send(EngineEvent::ClaimAlreadyTaken { request_id });
                }
                Err(_) => {
                    let _ = events_tx.send(EngineEvent::ClaimFailed { request_id });
                }
            }
        });
    }

    fn spawn_connect(&mut self, request_id: RequestId, endpoint: String) {
        let adapter = self.adapter.clone();
        let events_tx = self.events_tx.clone();
        let channels = self.channels.clone();

        tokio::spawn(async move {
            match adapter.connect(&endpoint).await {
                Ok(channel) => {
                    let channel_id = channels.spawn(channel, events_tx.clone());
                    let _ = events_tx.send(EngineEvent::ConnectOpened { request_id, channel_id });
                }
                Err(_) => {
                    let _ = events_tx.send(EngineEvent::ConnectUnreachable { request_id });
                }
            }
        });
    }

    fn spawn_timer(&mut self, timer_id: TimerId, after: Duration) {
        let events_tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events_tx.send(EngineEvent::TimerFired(timer_id));
        });
        self.timers.insert(timer_id, handle);
    }
}

/// Resolve a namespace's current peer registry against a contact store:
/// reset every contact's on-network flag, then mark matches on-network and
/// cache their current discovery ID, per the registry-merge invariant
/// (§4.4.7). Call after a driver observes `NamespaceStatus::PeerListUpdated`.
///
/// Each entry resolves to a local contact by public key first, falling back
/// to discovery UUID (matching the discovery ID the contact's own UUID would
/// produce in this namespace) for contacts whose public key isn't known yet.
/// A peer public key the store has not seen before for an otherwise-known
/// contact is stored here; the session manager re-derives the shared key
/// lazily the next time it opens a session with that contact (see
/// `SessionManager::ensure_shared_key`), since the key material itself lives
/// in the session, not the contact store.
pub fn resolve_registry_against_contacts(
    engine: &NamespaceEngine,
    contacts: &crate::contact_store::ContactStore,
) {
    for mut record in contacts.all() {
        if record.on_network {
            record.on_network = false;
            record.network_discovery_id = None;
            let _ = contacts.put(record);
        }
    }

    for entry in engine.peers() {
        let by_public_key = entry
            .public_key
            .as_deref()
            .and_then(|pk| contacts.find_by_public_key(pk, None));

        let matched = by_public_key.or_else(|| {
            contacts
                .all()
                .into_iter()
                .find(|c| engine.discovery_id_for_uuid(&c.discovery_uuid) == entry.discovery_id)
        });

        let Some(mut record) = matched else { continue };
        record.on_network = true;
        record.network_discovery_id = Some(entry.discovery_id.clone());
        if record.public_key.is_none() {
            if let Some(pk) = &entry.public_key {
                record.public_key = Some(pk.clone());
            }
        }
        let _ = contacts.put(record);
    }
}
