// src/signaling.rs
// Signaling Adapter: abstracts the third-party named-endpoint rendezvous
// this crate is built against, plus one in-process reference implementation
// used by the crate's own tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};

use crate::error::SignalingError;
use crate::wire::Message;

/// Reachability state of a claimed endpoint or an open channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Open,
    Reconnecting,
    Closed,
    IdTaken,
}

/// An ordered, reliable, message-oriented channel to a single remote peer.
///
/// Modeled with return-position `impl Future` rather than `#[async_trait]`
/// so implementors avoid a boxed future on every call.
pub trait SignalingChannel: Send {
    fn send(&self, msg: Message) -> impl Future<Output = Result<(), SignalingError>> + Send;
    fn recv(&mut self) -> impl Future<Output = Option<Message>> + Send;
    fn close(&mut self);
    fn status(&self) -> watch::Receiver<ChannelStatus>;
}

/// A held claim on an endpoint string: yields inbound channels as other
/// peers connect to it, and releases the claim when dropped.
pub struct ClaimHandle<C> {
    pub endpoint: String,
    inbound: mpsc::UnboundedReceiver<C>,
    _release: ReleaseGuard,
}

struct ReleaseGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl<C> ClaimHandle<C> {
    pub fn new(
        endpoint: String,
        inbound: mpsc::UnboundedReceiver<C>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        ClaimHandle {
            endpoint,
            inbound,
            _release: ReleaseGuard(Some(Box::new(release))),
        }
    }

    /// Wait for the next inbound connection to this endpoint.
    pub async fn next_inbound(&mut self) -> Option<C> {
        self.inbound.recv().await
    }
}

/// Abstracts the named-endpoint rendezvous service: claim a globally unique
/// string, connect to someone else's claim, and react to reachability
/// changes. The Namespace Engine and Session Manager are generic over this
/// trait rather than depending on any one transport.
pub trait SignalingAdapter: Send + Sync + 'static {
    type Channel: SignalingChannel + 'static;

    fn claim(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<ClaimHandle<Self::Channel>, SignalingError>> + Send;

    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<Self::Channel, SignalingError>> + Send;
}

/// Exponential backoff (1s, 2s, 4s, ... capped at 30s) with +-1s jitter, for
/// anything that reconnects: signaling channels, persistent sessions.
pub mod backoff {
    use super::*;

    /// The un-jittered base delay for the given zero-indexed attempt.
    pub fn base_delay(attempt: u32) -> Duration {
        let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX).min(30);
        Duration::from_secs(secs)
    }

    /// Base delay plus up to +-1s of jitter, floored at zero.
    pub fn next_delay(attempt: u32) -> Duration {
        let base = base_delay(attempt);
        let jitter_ms: i64 = rand::thread_rng().gen_range(-1000..=1000);
        let total_ms = (base.as_millis() as i64 + jitter_ms).max(0) as u64;
        Duration::from_millis(total_ms)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn base_delay_doubles_then_caps_at_30s() {
            assert_eq!(base_delay(0), Duration::from_secs(1));
            assert_eq!(base_delay(1), Duration::from_secs(2));
            assert_eq!(base_delay(2), Duration::from_secs(4));
            assert_eq!(base_delay(5), Duration::from_secs(30));
            assert_eq!(base_delay(20), Duration::from_secs(30));
        }

        #[test]
        fn next_delay_stays_within_one_second_of_base() {
            for attempt in 0..6 {
                let base = base_delay(attempt).as_millis() as i64;
                for _ in 0..20 {
                    let got = next_delay(attempt).as_millis() as i64;
                    assert!((got - base).abs() <= 1000);
                }
            }
        }
    }
}

/// An in-process signaling network: a shared map of claimed endpoints,
/// usable by multiple `InProcessAdapter` handles the way many devices share
/// one real signaling service. This is the reference adapter the crate's
/// own scenario tests run against.
#[derive(Clone)]
pub struct InProcessNetwork {
    claims: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<InProcessChannel>>>>,
}

impl InProcessNetwork {
    pub fn new() -> Self {
        InProcessNetwork {
            claims: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn adapter(&self) -> InProcessAdapter {
        InProcessAdapter {
            claims: self.claims.clone(),
        }
    }
}

impl Default for InProcessNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle onto an `InProcessNetwork`, playing the role of one device's
/// view of the signaling service.
#[derive(Clone)]
pub struct InProcessAdapter {
    claims: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<InProcessChannel>>>>,
}

impl SignalingAdapter for InProcessAdapter {
    type Channel = InProcessChannel;

    fn claim(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<ClaimHandle<InProcessChannel>, SignalingError>> + Send {
        let claims = self.claims.clone();
        let endpoint = endpoint.to_string();
        async move {
            let mut guard = claims.lock().unwrap();
            if guard.contains_key(&endpoint) {
                return Err(SignalingError::AlreadyTaken(endpoint));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            guard.insert(endpoint.clone(), tx);
            drop(guard);

            let release_claims = claims.clone();
            let release_endpoint = endpoint.clone();
            Ok(ClaimHandle::new(endpoint, rx, move || {
                release_claims.lock().unwrap().remove(&release_endpoint);
            }))
        }
    }

    fn connect(
        &self,
        endpoint: &str,
    ) -> impl Future<Output = Result<InProcessChannel, SignalingError>> + Send {
        let claims = self.claims.clone();
        let endpoint = endpoint.to_string();
        async move {
            let host_tx = {
                let guard = claims.lock().unwrap();
                guard
                    .get(&endpoint)
                    .cloned()
                    .ok_or_else(|| SignalingError::Unreachable(endpoint.clone()))?
            };

            let (a_tx, a_rx) = mpsc::unbounded_channel();
            let (b_tx, b_rx) = mpsc::unbounded_channel();
            let host_side = InProcessChannel::new(b_tx, a_rx);
            host_tx
                .send(host_side)
                .map_err(|_| SignalingError::Unreachable(endpoint.clone()))?;

            Ok(InProcessChannel::new(a_tx, b_rx))
        }
    }
}

/// One end of an in-process duplex channel carrying `wire::Message`s.
pub struct InProcessChannel {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    status_tx: watch::Sender<ChannelStatus>,
    status_rx: watch::Receiver<ChannelStatus>,
}

impl InProcessChannel {
    fn new(tx: mpsc::UnboundedSender<Message>, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        let (status_tx, status_rx) = watch::channel(ChannelStatus::Open);
        InProcessChannel {
            tx,
            rx,
            status_tx,
            status_rx,
        }
    }
}

impl SignalingChannel for InProcessChannel {
    fn send(&self, msg: Message) -> impl Future<Output = Result<(), SignalingError>> + Send {
        let tx = self.tx.clone();
        async move { tx.send(msg).map_err(|_| SignalingError::Closed) }
    }

    fn recv(&mut self) -> impl Future<Output = Option<Message>> + Send {
        async move { self.rx.recv().await }
    }

    fn close(&mut self) {
        let _ = self.status_tx.send(ChannelStatus::Closed);
    }

    fn status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_rx.clone()
    }
}
