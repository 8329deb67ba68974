//! In-process transport: peers in the same process talk over unbounded channels.
//!
//! Each registered endpoint is keyed by `(local, remote)` and owns an inbox
//! drained by a pump task, so data arrives asynchronously the way it does on
//! a real data channel. The offer/answer exchange is simulated with opaque
//! SDP strings and must be relayed between managers by the caller, see
//! [`relay_signals`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::connection::events::{EventKind, PeerEvent, SubscriptionId};
use crate::connection::manager::{PeerConnectionManager, PeerOptions, TransportEvent, TransportEvents};
use crate::core::domain::{PeerId, Role};
use crate::core::error::TransportError;
use crate::core::traits::{PeerTransport, SignalData, TransportFactory};

type EndpointKey = (PeerId, PeerId);

struct Endpoint {
    id: u64,
    events: TransportEvents,
    inbox: mpsc::UnboundedSender<Vec<u8>>,
    open: Arc<AtomicBool>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: Mutex<HashMap<EndpointKey, Endpoint>>,
    next_id: AtomicU64,
}

impl NetworkInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<EndpointKey, Endpoint>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared medium connecting loopback transports
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport factory for the node named `local`
    pub fn factory(&self, local: impl Into<PeerId>) -> Arc<LoopbackFactory> {
        Arc::new(LoopbackFactory {
            network: Arc::downgrade(&self.inner),
            local: local.into(),
        })
    }

    /// Whether `local`'s side of the link to `remote` has an open channel
    pub fn is_open(&self, local: &PeerId, remote: &PeerId) -> bool {
        self.inner
            .lock()
            .get(&(local.clone(), remote.clone()))
            .is_some_and(|endpoint| endpoint.open.load(Ordering::SeqCst))
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drop the link between `a` and `b` as if the network vanished; both ends see a close
    pub fn sever(&self, a: &PeerId, b: &PeerId) {
        let removed: Vec<TransportEvents> = {
            let mut endpoints = self.inner.lock();
            [(a.clone(), b.clone()), (b.clone(), a.clone())]
                .iter()
                .filter_map(|key| endpoints.remove(key))
                .map(|endpoint| {
                    endpoint.open.store(false, Ordering::SeqCst);
                    endpoint.events
                })
                .collect()
        };
        debug!(%a, %b, "Loopback link severed");
        for events in removed {
            spawn_emit(events, TransportEvent::Close);
        }
    }

    /// Report a transport error on `local`'s side of the link to `remote`
    pub fn fail(&self, local: &PeerId, remote: &PeerId, message: impl Into<String>) {
        let events = self
            .inner
            .lock()
            .get(&(local.clone(), remote.clone()))
            .map(|endpoint| endpoint.events.clone());
        if let Some(events) = events {
            spawn_emit(events, TransportEvent::Error(message.into()));
        }
    }
}

/// Forward signals raised by `from` (the node named `from_id`) into `to`.
///
/// The receiving side gets a `Receiver` peer on first contact. The handler
/// holds `to` until `from` is destroyed.
pub fn relay_signals(from: &PeerConnectionManager, from_id: &PeerId, to: &PeerConnectionManager) -> SubscriptionId {
    let from_id = from_id.clone();
    let to = to.clone();
    from.on(
        EventKind::Signal,
        Arc::new(move |event: &PeerEvent| {
            let PeerEvent::Signal { data, .. } = event else {
                return Ok(());
            };
            if !to.has_peer(&from_id) {
                to.create_peer(&from_id, Role::Receiver, PeerOptions::default())?;
            }
            to.connect(&from_id, data.clone())?;
            Ok(())
        }),
    )
}

pub struct LoopbackFactory {
    network: Weak<NetworkInner>,
    local: PeerId,
}

impl TransportFactory for LoopbackFactory {
    fn create(
        &self,
        peer_id: &PeerId,
        role: Role,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| TransportError::Create("loopback network is gone".to_string()))?;
        let runtime = Handle::try_current().map_err(|e| TransportError::Create(e.to_string()))?;

        let (inbox, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pump_events = events.clone();
        runtime.spawn(async move {
            while let Some(data) = rx.recv().await {
                pump_events.emit(TransportEvent::Data(data));
            }
        });

        let id = network.next_id.fetch_add(1, Ordering::Relaxed);
        let open = Arc::new(AtomicBool::new(false));
        let key = (self.local.clone(), peer_id.clone());
        let previous = network.lock().insert(
            key,
            Endpoint {
                id,
                events: events.clone(),
                inbox,
                open: open.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.open.store(false, Ordering::SeqCst);
        }

        if role == Role::Initiator {
            let offer = SignalData::Offer {
                sdp: format!("loopback-offer {} -> {}", self.local, peer_id),
            };
            spawn_emit(events, TransportEvent::Signal(offer));
        }
        trace!(local = %self.local, remote = %peer_id, id, ?role, "Loopback endpoint registered");

        Ok(Arc::new(LoopbackTransport {
            network: self.network.clone(),
            local: self.local.clone(),
            remote: peer_id.clone(),
            id,
            open,
            destroyed: AtomicBool::new(false),
        }))
    }
}

pub struct LoopbackTransport {
    network: Weak<NetworkInner>,
    local: PeerId,
    remote: PeerId,
    id: u64,
    open: Arc<AtomicBool>,
    destroyed: AtomicBool,
}

impl LoopbackTransport {
    fn network(&self) -> Result<Arc<NetworkInner>, TransportError> {
        self.network.upgrade().ok_or(TransportError::ChannelClosed)
    }

    fn own_events(&self, network: &NetworkInner) -> Option<TransportEvents> {
        network
            .lock()
            .get(&(self.local.clone(), self.remote.clone()))
            .filter(|endpoint| endpoint.id == self.id)
            .map(|endpoint| endpoint.events.clone())
    }
}

impl PeerTransport for LoopbackTransport {
    fn signal(&self, data: &SignalData) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Signal("transport destroyed".to_string()));
        }
        let network = self.network().map_err(|e| TransportError::Signal(e.to_string()))?;
        match data {
            SignalData::Offer { .. } => {
                let events = self
                    .own_events(&network)
                    .ok_or_else(|| TransportError::Signal("endpoint not registered".to_string()))?;
                let answer = SignalData::Answer {
                    sdp: format!("loopback-answer {} -> {}", self.local, self.remote),
                };
                spawn_emit(events, TransportEvent::Signal(answer));
                Ok(())
            }
            SignalData::Answer { .. } => {
                let (local, remote) = {
                    let endpoints = network.lock();
                    let local = endpoints
                        .get(&(self.local.clone(), self.remote.clone()))
                        .filter(|endpoint| endpoint.id == self.id);
                    let remote = endpoints.get(&(self.remote.clone(), self.local.clone()));
                    match (local, remote) {
                        (Some(local), Some(remote)) => {
                            local.open.store(true, Ordering::SeqCst);
                            remote.open.store(true, Ordering::SeqCst);
                            (local.events.clone(), remote.events.clone())
                        }
                        _ => return Err(TransportError::Signal("remote endpoint not registered".to_string())),
                    }
                };
                debug!(local = %self.local, remote = %self.remote, "Loopback channel open");
                spawn_emit(local, TransportEvent::Connect);
                spawn_emit(remote, TransportEvent::Connect);
                Ok(())
            }
            SignalData::Candidate { .. } => Ok(()),
        }
    }

    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        let network = self.network()?;
        let endpoints = network.lock();
        let remote = endpoints
            .get(&(self.remote.clone(), self.local.clone()))
            .ok_or(TransportError::ChannelClosed)?;
        remote
            .inbox
            .send(payload.to_vec())
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        let Ok(network) = self.network() else { return };
        let counterpart = {
            let mut endpoints = network.lock();
            let key = (self.local.clone(), self.remote.clone());
            if endpoints.get(&key).is_some_and(|endpoint| endpoint.id == self.id) {
                endpoints.remove(&key);
            }
            endpoints
                .get(&(self.remote.clone(), self.local.clone()))
                .filter(|endpoint| endpoint.open.swap(false, Ordering::SeqCst))
                .map(|endpoint| endpoint.events.clone())
        };
        if let Some(events) = counterpart {
            spawn_emit(events, TransportEvent::Close);
        }
        trace!(local = %self.local, remote = %self.remote, "Loopback endpoint destroyed");
    }
}

/// Deliver `event` from a fresh task so the caller never re-enters the manager
fn spawn_emit(events: TransportEvents, event: TransportEvent) {
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move { events.emit(event) });
        }
        Err(_) => debug!(peer_id = %events.peer_id(), "No runtime, dropping loopback event"),
    }
}
