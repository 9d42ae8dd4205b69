// tests/scenarios.rs
// End-to-end scenarios driving the namespace engine, session manager, and
// rendezvous scheduler against each other the way a real multi-peer mesh
// would exercise them. Scenarios 1-3 and 5 wire two or three `NamespaceEngine`
// instances together by hand, feeding one engine's `SendMessage` actions into
// the other's `ChannelData` events -- the same sans-I/O cross-wiring the
// engine's own unit tests use, just at a whole-conversation scale. Scenarios
// 4 and 6 drive a real `SessionManager` over the `InProcessAdapter` reference
// transport, since they exercise the async per-contact session loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use peerns::contact_store::{ContactRecord, ContactStore};
use peerns::crypto::Identity;
use peerns::namespace::{EngineAction, EngineEvent, NamespaceConfig, NamespaceEngine, Role};
use peerns::rendezvous::{build_exchange, verify_exchange, RendezvousEvent, RendezvousScheduler};
use peerns::session::{SessionEvent, SessionManager};
use peerns::signaling::{InProcessNetwork, SignalingAdapter};
use peerns::wire::Message;

fn claim_request_id(actions: &[EngineAction]) -> u64 {
    actions
        .iter()
        .find_map(|a| match a {
            EngineAction::ClaimEndpoint { request_id, .. } => Some(*request_id),
            _ => None,
        })
        .expect("expected a ClaimEndpoint action")
}

fn connect_request_id(actions: &[EngineAction]) -> u64 {
    actions
        .iter()
        .find_map(|a| match a {
            EngineAction::ConnectEndpoint { request_id, .. } => Some(*request_id),
            _ => None,
        })
        .expect("expected a ConnectEndpoint action")
}

fn timer_id(actions: &[EngineAction]) -> u64 {
    actions
        .iter()
        .find_map(|a| match a {
            EngineAction::ArmTimer { timer_id, .. } => Some(*timer_id),
            _ => None,
        })
        .expect("expected an ArmTimer action")
}

fn sent_message(actions: &[EngineAction]) -> Message {
    actions
        .iter()
        .find_map(|a| match a {
            EngineAction::SendMessage { message, .. } => Some(message.clone()),
            _ => None,
        })
        .expect("expected a SendMessage action")
}

/// Scenario 1: two-peer election on a shared public IP. A opens first and
/// claims the level-1 router endpoint; B opens 2s later, is told the
/// endpoint is already taken, and joins A as a peer instead. Both ends of
/// the conversation should settle on "peers here = 2" (themselves + the
/// other side).
#[test]
fn two_peer_election_on_shared_ip() {
    let ip = "203.0.113.7".to_string();
    let mut a = NamespaceEngine::new("pfx", NamespaceConfig::Public { ip: ip.clone() }, "uuid-a", "alice", "pk-a");
    let mut b = NamespaceEngine::new("pfx", NamespaceConfig::Public { ip }, "uuid-b", "bob", "pk-b");
    let t0 = Instant::now();

    let actions = a.handle(EngineEvent::Join, t0);
    let req_a = claim_request_id(&actions);
    a.handle(EngineEvent::ClaimGranted { request_id: req_a }, t0);
    assert_eq!(a.role(), Role::Router);

    let t1 = t0 + Duration::from_secs(2);
    let actions = b.handle(EngineEvent::Join, t1);
    let elect_req_b = claim_request_id(&actions);
    let actions = b.handle(EngineEvent::ClaimAlreadyTaken { request_id: elect_req_b }, t1);
    let connect_req_b = connect_request_id(&actions);

    // A's claimed endpoint receives B's inbound connection attempt.
    let channel_on_a = 100;
    a.handle(EngineEvent::InboundConnection { request_id: req_a, channel_id: channel_on_a }, t1);

    // B's connect resolves; B becomes a peer and checks in.
    let channel_on_b = 200;
    let actions = b.handle(EngineEvent::ConnectOpened { request_id: connect_req_b, channel_id: channel_on_b }, t1);
    assert_eq!(b.role(), Role::Peer);
    let checkin = sent_message(&actions);

    let actions = a.handle(EngineEvent::ChannelData { channel_id: channel_on_a, message: checkin }, t1);
    let registry = sent_message(&actions);
    assert_eq!(a.peers().count(), 1);

    b.handle(EngineEvent::ChannelData { channel_id: channel_on_b, message: registry }, t1);
    assert_eq!(b.peers().count(), 1);
}

/// Scenario 2: router death. A (router) disconnects; B (peer) observes the
/// channel close, waits out a jitter window, and successfully claims the
/// now-vacant level-1 endpoint for itself -- becoming router with only its
/// own entry until the next check-in round.
#[test]
fn router_death_triggers_peer_failover_and_reelection() {
    let ip = "203.0.113.7".to_string();
    let mut b = NamespaceEngine::new("pfx", NamespaceConfig::Public { ip: ip.clone() }, "uuid-b", "bob", "pk-b");
    let t0 = Instant::now();

    // Fast-forward B straight to "peer of a router", skipping A's side since
    // only B's failover transition is under test here.
    let actions = b.handle(EngineEvent::Join, t0);
    let elect_req = claim_request_id(&actions);
    let actions = b.handle(EngineEvent::ClaimAlreadyTaken { request_id: elect_req }, t0);
    let connect_req = connect_request_id(&actions);
    let router_channel = 42;
    b.handle(EngineEvent::ConnectOpened { request_id: connect_req, channel_id: router_channel }, t0);
    assert_eq!(b.role(), Role::Peer);

    let actions = b.handle(EngineEvent::ChannelClosed { channel_id: router_channel }, t0);
    let jitter_timer = timer_id(&actions);

    let actions = b.handle(EngineEvent::TimerFired(jitter_timer), t0);
    let reclaim_req = actions
        .iter()
        .find_map(|a| match a {
            EngineAction::ClaimEndpoint { request_id, endpoint } if *endpoint == format!("pfx-{}-1", ip.replace('.', "-")) => {
                Some(*request_id)
            }
            _ => None,
        })
        .expect("expected B to re-claim the level-1 endpoint after jitter");

    b.handle(EngineEvent::ClaimGranted { request_id: reclaim_req }, t0);
    assert_eq!(b.role(), Role::Router);
    assert_eq!(b.level(), 1);
    assert_eq!(b.peers().count(), 0);
}

/// Scenario 3: cascade under an unresponsive squatter. An unrelated client
/// holds the level-1 endpoint but never answers; the joining peer times out
/// three join attempts (8s x 3 = 24s), falls back to the reverse-connect
/// peer slot, and -- since the squatter never probes it -- escalates to
/// level 2 after the peer-slot timeout and elects there instead.
#[test]
fn cascade_under_unresponsive_squatter_escalates_to_level_two() {
    use peerns::namespace::timing;

    let ip = "203.0.113.7".to_string();
    let mut c = NamespaceEngine::new("pfx", NamespaceConfig::Public { ip: ip.clone() }, "uuid-c", "carol", "pk-c");
    let t0 = Instant::now();

    let actions = c.handle(EngineEvent::Join, t0);
    let elect_req = claim_request_id(&actions);
    let actions = c.handle(EngineEvent::ClaimAlreadyTaken { request_id: elect_req }, t0);
    let mut connect_req = connect_request_id(&actions);

    for _ in 0..timing::MAX_JOIN_ATTEMPTS - 1 {
        let actions = c.handle(EngineEvent::ConnectUnreachable { request_id: connect_req }, t0);
        let retry_timer = timer_id(&actions);
        let actions = c.handle(EngineEvent::TimerFired(retry_timer), t0);
        connect_req = connect_request_id(&actions);
    }

    let actions = c.handle(EngineEvent::ConnectUnreachable { request_id: connect_req }, t0);
    let peer_slot_req = claim_request_id(&actions);
    assert!(actions
        .iter()
        .any(|a| matches!(a, EngineAction::ClaimEndpoint { endpoint, .. } if endpoint == &format!("pfx-{}-p1", ip.replace('.', "-")))));

    let actions = c.handle(EngineEvent::ClaimGranted { request_id: peer_slot_req }, t0);
    let peer_slot_timer = timer_id(&actions);

    // The squatter never probes the peer slot; the timeout fires and carol
    // escalates to level 2 rather than waiting forever.
    let t1 = t0 + timing::PEER_SLOT_TIMEOUT;
    let actions = c.handle(EngineEvent::TimerFired(peer_slot_timer), t1);
    assert!(actions
        .iter()
        .any(|a| matches!(a, EngineAction::ClaimEndpoint { endpoint, .. } if endpoint == &format!("pfx-{}-2", ip.replace('.', "-")))));
}

/// Scenario 4: a contact regenerates its persistent ID (reinstall, new
/// device) but keeps the same long-lived keypair. When it reconnects and
/// sends `hello`, the session manager recognizes the public key against the
/// old contact record and migrates history onto the new persistent ID.
#[tokio::test]
async fn public_key_dedup_migrates_contact_on_reconnect() {
    let network = InProcessNetwork::new();
    let bob_identity = Identity::generate().unwrap();
    let carol_identity = Identity::generate().unwrap();
    let carol_pub = carol_identity.public_key_base64().unwrap();

    let contacts = Arc::new(ContactStore::with_null_persistence());
    let mut old_record = ContactRecord::new("p1-old", "uuid-old");
    old_record.public_key = Some(carol_pub.clone());
    old_record.history.push(peerns::contact_store::MessageMeta { id: "m0".to_string(), ts: 1 });
    contacts.put(old_record).unwrap();

    let endpoint = "pfx-direct-carol-reconnect";
    let mut new_record = ContactRecord::new("p2-new", "uuid-new");
    new_record.network_discovery_id = Some(endpoint.to_string());
    contacts.put(new_record).unwrap();

    let bob = SessionManager::new(bob_identity, "bob", contacts.clone(), network.adapter());
    let mut claim = network.adapter().claim(endpoint).await.unwrap();

    let (tx, _rx) = mpsc::unbounded_channel();
    let _bob_task = tokio::spawn(async move { bob.run_session("p2-new".to_string(), tx).await });

    let mut carol_chan = claim.next_inbound().await.unwrap();
    let _bob_hello = carol_chan.recv().await.unwrap();
    carol_chan
        .send(Message::Hello {
            friendly_name: "carol".to_string(),
            public_key: carol_pub.clone(),
            ts: 0,
            signature: carol_identity.sign(b"p2-new").unwrap_or_default(),
        })
        .await
        .unwrap();

    // Give the background session task a moment to process the hello.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(contacts.get("p1-old").is_none());
    let migrated = contacts.get("p2-new").unwrap();
    assert_eq!(migrated.public_key.as_deref(), Some(carol_pub.as_str()));
    assert_eq!(migrated.history.len(), 1);
    assert_eq!(migrated.history[0].id, "m0");
}

/// Scenario 5: rendezvous recovery across an IP change. Both sides of a
/// contact pair independently compute the same time-windowed slug from
/// their shared key, meet in that private namespace, and exchange signed
/// `rvz-exchange` envelopes; the side holding a stale contact migrates it to
/// the freshly announced persistent ID.
#[test]
fn rendezvous_recovery_exchanges_and_migrates_contact() {
    let identity_a = Identity::generate().unwrap();
    let identity_b = Identity::generate().unwrap();
    let pub_a = identity_a.public_key_base64().unwrap();
    let pub_b = identity_b.public_key_base64().unwrap();

    let shared_a = identity_a.derive_shared_key(&pub_b).unwrap();
    let shared_b = identity_b.derive_shared_key(&pub_a).unwrap();

    // Both sides sweep into the scheduler and arrive at the same slug
    // without ever exchanging the window index.
    let mut scheduler_a = RendezvousScheduler::new();
    let sweep_timer = match scheduler_a.start().remove(0) {
        peerns::rendezvous::RendezvousAction::ArmTimer { timer_id, .. } => timer_id,
        _ => unreachable!(),
    };
    scheduler_a.enqueue("stale-b", shared_a.clone());
    let actions = scheduler_a.tick(RendezvousEvent::TimerFired(sweep_timer), 1_000_000);
    let slug_from_scheduler = actions
        .iter()
        .find_map(|a| match a {
            peerns::rendezvous::RendezvousAction::JoinRendezvousNamespace { slug, .. } => Some(slug.clone()),
            _ => None,
        })
        .unwrap();
    let slug_b = shared_b.rendezvous_slug(1_000_000 / peerns::rendezvous::timing::WINDOW_SECS);
    assert_eq!(slug_from_scheduler, slug_b);

    let config = NamespaceConfig::Rendezvous { slug: slug_from_scheduler };
    let mut a = NamespaceEngine::new("pfx", config.clone(), "uuid-a", "alice", pub_a.clone());
    let mut b = NamespaceEngine::new("pfx", config, "uuid-b", "bob", pub_b.clone());
    let t0 = Instant::now();

    let actions = a.handle(EngineEvent::Join, t0);
    let req_a = claim_request_id(&actions);
    a.handle(EngineEvent::ClaimGranted { request_id: req_a }, t0);

    let actions = b.handle(EngineEvent::Join, t0);
    let elect_req_b = claim_request_id(&actions);
    let actions = b.handle(EngineEvent::ClaimAlreadyTaken { request_id: elect_req_b }, t0);
    let connect_req_b = connect_request_id(&actions);

    let channel_on_a = 1;
    a.handle(EngineEvent::InboundConnection { request_id: req_a, channel_id: channel_on_a }, t0);
    let channel_on_b = 2;
    b.handle(EngineEvent::ConnectOpened { request_id: connect_req_b, channel_id: channel_on_b }, t0);

    // A holds a stale contact for B under its old, now-unreachable persistent
    // ID. Once B's signed exchange arrives, A migrates it to B's current one.
    let contacts_a = ContactStore::with_null_persistence();
    contacts_a
        .put({
            let mut r = ContactRecord::new("stale-b", "uuid-stale");
            r.public_key = Some(pub_b.clone());
            r
        })
        .unwrap();

    let exchange_from_b = build_exchange(&identity_b, "fresh-b", "bob", 1_700_000_000).unwrap();
    let (claimed_pid, claimed_pk) = verify_exchange(&exchange_from_b).unwrap();
    assert_eq!(claimed_pid, "fresh-b");

    if let Some(stale) = contacts_a.find_by_public_key(&claimed_pk, None) {
        contacts_a.migrate(&stale.persistent_id, &claimed_pid).unwrap();
    }

    assert!(contacts_a.get("stale-b").is_none());
    assert_eq!(
        contacts_a.find_by_public_key(&pub_b, None).unwrap().persistent_id,
        "fresh-b"
    );

    // Both engines did settle into router/peer roles in the private
    // namespace, satisfying "one becomes router, the other joins".
    assert_ne!(a.role(), Role::None);
    assert_ne!(b.role(), Role::None);
}

/// Scenario 6: E2E tamper. A man-in-the-middle flips one ciphertext byte in
/// transit. The recipient's signature check fails, the message is stored
/// with sentinel content via a logged `TamperedMessage` event rather than
/// silently vanishing, the channel is NOT dropped, and a subsequent
/// legitimate message still decrypts correctly.
#[tokio::test]
async fn e2e_tamper_is_sentineled_without_dropping_the_channel() {
    let network = InProcessNetwork::new();
    let bob_identity = Identity::generate().unwrap();
    let alice_identity = Identity::generate().unwrap();
    let bob_pub = bob_identity.public_key_base64().unwrap();
    let alice_pub = alice_identity.public_key_base64().unwrap();

    let contacts = Arc::new(ContactStore::with_null_persistence());
    let endpoint = "pfx-direct-alice-bob";
    let mut contact = ContactRecord::new("p-alice", "uuid-alice");
    contact.public_key = Some(alice_pub.clone());
    contact.network_discovery_id = Some(endpoint.to_string());
    contacts.put(contact).unwrap();

    let bob = SessionManager::new(bob_identity, "bob", contacts.clone(), network.adapter());
    let mut claim = network.adapter().claim(endpoint).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _bob_task = tokio::spawn(async move { bob.run_session("p-alice".to_string(), tx).await });

    let mut alice_chan = claim.next_inbound().await.unwrap();
    let _bob_hello = alice_chan.recv().await.unwrap();
    alice_chan
        .send(Message::Hello {
            friendly_name: "alice".to_string(),
            public_key: alice_pub.clone(),
            ts: 0,
            signature: alice_identity.sign(b"p-alice").unwrap_or_default(),
        })
        .await
        .unwrap();

    let shared = alice_identity.derive_shared_key(&bob_pub).unwrap();

    // Tampered message: flip a ciphertext byte after signing, as a MITM
    // would, so the signature no longer matches.
    let mut tampered = shared.encrypt(b"hi bob", &alice_identity).unwrap();
    {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        let mut raw = BASE64.decode(&tampered.ct).unwrap();
        raw[0] ^= 0xFF;
        tampered.ct = BASE64.encode(&raw);
    }
    alice_chan
        .send(Message::Text {
            id: "m1".to_string(),
            ts: 1,
            e2e: Some(true),
            iv: Some(tampered.iv),
            ct: Some(tampered.ct),
            sig: Some(tampered.sig),
            content: None,
        })
        .await
        .unwrap();

    // Bob still acks the tampered message -- the channel stays open.
    let ack = alice_chan.recv().await.unwrap();
    assert_eq!(ack.kind(), "message-ack");

    let legit = shared.encrypt(b"legit followup", &alice_identity).unwrap();
    alice_chan
        .send(Message::Text {
            id: "m2".to_string(),
            ts: 2,
            e2e: Some(true),
            iv: Some(legit.iv),
            ct: Some(legit.ct),
            sig: Some(legit.sig),
            content: None,
        })
        .await
        .unwrap();
    let ack2 = alice_chan.recv().await.unwrap();
    assert_eq!(ack2.kind(), "message-ack");

    let mut saw_tampered = false;
    let mut saw_legit = false;
    for _ in 0..6 {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(SessionEvent::TamperedMessage { id, .. })) => {
                assert_eq!(id, "m1");
                saw_tampered = true;
            }
            Ok(Some(SessionEvent::MessageReceived { plaintext, .. })) => {
                assert_eq!(plaintext, b"legit followup");
                saw_legit = true;
            }
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
        if saw_tampered && saw_legit {
            break;
        }
    }
    assert!(saw_tampered, "expected a TamperedMessage event for the flipped ciphertext");
    assert!(saw_legit, "expected the legitimate follow-up message to still decrypt");
}
