// src/lib.rs
// peerns - serverless peer-to-peer namespace overlay.
//
// This crate is the control-plane library: identity/crypto, the mesh
// election and routing engine, signaling transport traits, contact
// storage, persistent sessions, and rendezvous recovery. It has no
// application shell of its own; a host binary wires these pieces to a
// real signaling transport and UI.

pub mod config;
pub mod contact_store;
pub mod crypto;
pub mod error;
pub mod namespace;
pub mod rendezvous;
pub mod session;
pub mod signaling;
pub mod sqlite_persistence;
pub mod wire;

pub use config::AppConfig;
pub use crypto::{EncryptedEnvelope, Identity, SharedKey};
pub use error::{PeerNsError, Result};
pub use namespace::{
    EngineAction, EngineEvent, NamespaceConfig, NamespaceDriver, NamespaceEngine, NamespaceStatus,
};
pub use rendezvous::{RendezvousAction, RendezvousEvent, RendezvousScheduler};
pub use session::{DeliveryStatus, SessionEvent, SessionManager};
pub use signaling::{SignalingAdapter, SignalingChannel};
pub use wire::Message;

/// Initialize the crate's logging backend (`env_logger`) if the host
/// process hasn't already installed a logger. Safe to call more than
/// once; subsequent calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::try_init();
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::namespace::{NamespaceConfig, NamespaceEngine};

    /// Sanity check that the crate's public surface composes: an engine can
    /// be constructed for each namespace kind and produces distinct
    /// endpoint ids, without any of the three colliding.
    #[test]
    fn public_namespace_kinds_produce_distinct_endpoints() {
        let prefix = "peerns";
        let public = NamespaceConfig::Public { ip: "203.0.113.5".to_string() };
        let custom = NamespaceConfig::Custom { slug: "team-rocket".to_string(), advanced: false };
        let rendezvous = NamespaceConfig::Rendezvous { slug: "ab12cd34".to_string() };

        let ids = [
            public.router_id(prefix, 1),
            custom.router_id(prefix, 1),
            rendezvous.router_id(prefix, 1),
        ];
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
        assert_ne!(ids[0], ids[2]);

        let _engine = NamespaceEngine::new(prefix, public, "uuid-1", "alice", "pk-1");
    }
}
