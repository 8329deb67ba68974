use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::state::ConnectionState;
use crate::core::domain::PeerId;
use crate::core::traits::{HandlerResult, SignalData};

/// Closed set of connection event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Signal,
    Connect,
    Data,
    Close,
    Error,
    IceStateChange,
    StateChange,
    Reconnecting,
    ReconnectFailed,
    ReconnectSuccess,
}

/// Why automatic reconnection gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectFailure {
    MaxRetriesExceeded,
    ConnectionError,
}

impl ReconnectFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconnectFailure::MaxRetriesExceeded => "max-retries-exceeded",
            ReconnectFailure::ConnectionError => "connection-error",
        }
    }
}

/// Events emitted by the peer connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Signal { peer_id: PeerId, data: SignalData },
    Connect { peer_id: PeerId },
    Data { peer_id: PeerId, data: Vec<u8> },
    Close { peer_id: PeerId },
    Error { peer_id: PeerId, message: String },
    IceStateChange { peer_id: PeerId, state: String },
    StateChange { peer_id: PeerId, from: ConnectionState, to: ConnectionState },
    Reconnecting { peer_id: PeerId, attempt: u32, delay: Duration },
    ReconnectFailed { peer_id: PeerId, reason: ReconnectFailure, attempts: u32 },
    ReconnectSuccess { peer_id: PeerId, attempts: u32 },
}

impl PeerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PeerEvent::Signal { .. } => EventKind::Signal,
            PeerEvent::Connect { .. } => EventKind::Connect,
            PeerEvent::Data { .. } => EventKind::Data,
            PeerEvent::Close { .. } => EventKind::Close,
            PeerEvent::Error { .. } => EventKind::Error,
            PeerEvent::IceStateChange { .. } => EventKind::IceStateChange,
            PeerEvent::StateChange { .. } => EventKind::StateChange,
            PeerEvent::Reconnecting { .. } => EventKind::Reconnecting,
            PeerEvent::ReconnectFailed { .. } => EventKind::ReconnectFailed,
            PeerEvent::ReconnectSuccess { .. } => EventKind::ReconnectSuccess,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        match self {
            PeerEvent::Signal { peer_id, .. }
            | PeerEvent::Connect { peer_id }
            | PeerEvent::Data { peer_id, .. }
            | PeerEvent::Close { peer_id }
            | PeerEvent::Error { peer_id, .. }
            | PeerEvent::IceStateChange { peer_id, .. }
            | PeerEvent::StateChange { peer_id, .. }
            | PeerEvent::Reconnecting { peer_id, .. }
            | PeerEvent::ReconnectFailed { peer_id, .. }
            | PeerEvent::ReconnectSuccess { peer_id, .. } => peer_id,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(&PeerEvent) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Subscribe/unsubscribe/emit seam for connection events
pub trait EventBus: Send + Sync {
    fn subscribe(&self, kind: EventKind, handler: EventCallback) -> SubscriptionId;
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
    /// Deliver `event`; returns the number of handlers that completed without error
    fn emit(&self, event: &PeerEvent) -> usize;
}

type HandlerList = Vec<(SubscriptionId, EventCallback)>;

/// Global handlers keyed by event kind, with a per-peer registry layered on top
#[derive(Default)]
pub struct EventRegistry {
    global: Mutex<HashMap<EventKind, HandlerList>>,
    per_peer: Mutex<HashMap<PeerId, HashMap<EventKind, HandlerList>>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn global(&self) -> MutexGuard<'_, HashMap<EventKind, HandlerList>> {
        self.global.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn per_peer(&self) -> MutexGuard<'_, HashMap<PeerId, HashMap<EventKind, HandlerList>>> {
        self.per_peer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a handler that only sees events for `peer_id`
    pub fn subscribe_peer(&self, peer_id: &PeerId, kind: EventKind, handler: EventCallback) -> SubscriptionId {
        let id = self.next_id();
        self.per_peer()
            .entry(peer_id.clone())
            .or_default()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Drop every per-peer handler registered for `peer_id`
    pub fn clear_peer(&self, peer_id: &PeerId) {
        self.per_peer().remove(peer_id);
    }

    pub fn clear(&self) {
        self.global().clear();
        self.per_peer().clear();
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.global().get(&kind).map_or(0, Vec::len)
    }
}

impl EventBus for EventRegistry {
    fn subscribe(&self, kind: EventKind, handler: EventCallback) -> SubscriptionId {
        let id = self.next_id();
        self.global().entry(kind).or_default().push((id, handler));
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        for handlers in self.global().values_mut() {
            let before = handlers.len();
            handlers.retain(|(sub, _)| *sub != id);
            removed |= handlers.len() != before;
        }
        for kinds in self.per_peer().values_mut() {
            for handlers in kinds.values_mut() {
                let before = handlers.len();
                handlers.retain(|(sub, _)| *sub != id);
                removed |= handlers.len() != before;
            }
        }
        removed
    }

    fn emit(&self, event: &PeerEvent) -> usize {
        let kind = event.kind();
        // Snapshot so handlers may subscribe or emit without deadlocking.
        let mut snapshot: Vec<EventCallback> = self
            .global()
            .get(&kind)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        if let Some(handlers) = self.per_peer().get(event.peer_id()).and_then(|k| k.get(&kind)) {
            snapshot.extend(handlers.iter().map(|(_, h)| h.clone()));
        }

        snapshot
            .iter()
            .filter(|handler| invoke_guarded("connection", &***handler, event))
            .count()
    }
}

/// Run one handler, logging errors and panics instead of propagating them
pub(crate) fn invoke_guarded<E: std::fmt::Debug>(
    scope: &str,
    handler: &(dyn Fn(&E) -> HandlerResult + Send + Sync),
    event: &E,
) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler(event))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(scope, ?event, "Error in event handler: {}", e);
            false
        }
        Err(_) => {
            error!(scope, ?event, "Event handler panicked");
            false
        }
    }
}

/// Handler that logs every connection event
pub fn logging_handler() -> EventCallback {
    Arc::new(|event: &PeerEvent| {
        match event {
            PeerEvent::Signal { peer_id, .. } => debug!(%peer_id, "Signal generated"),
            PeerEvent::Connect { peer_id } => info!(%peer_id, "Peer connected"),
            PeerEvent::Data { peer_id, data } => debug!(%peer_id, bytes = data.len(), "Data received"),
            PeerEvent::Close { peer_id } => info!(%peer_id, "Peer disconnected"),
            PeerEvent::Error { peer_id, message } => warn!(%peer_id, "Peer error: {}", message),
            PeerEvent::IceStateChange { peer_id, state } => debug!(%peer_id, %state, "ICE state changed"),
            PeerEvent::StateChange { peer_id, from, to } => debug!(%peer_id, %from, %to, "Connection state changed"),
            PeerEvent::Reconnecting { peer_id, attempt, delay } => {
                info!(%peer_id, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting")
            }
            PeerEvent::ReconnectFailed { peer_id, reason, attempts } => {
                error!(%peer_id, attempts, reason = reason.as_str(), "Reconnect failed")
            }
            PeerEvent::ReconnectSuccess { peer_id, attempts } => {
                info!(%peer_id, attempts, "Reconnect succeeded")
            }
        }
        Ok(())
    })
}

/// Every kind, for handlers that want the full stream
pub const ALL_EVENT_KINDS: [EventKind; 10] = [
    EventKind::Signal,
    EventKind::Connect,
    EventKind::Data,
    EventKind::Close,
    EventKind::Error,
    EventKind::IceStateChange,
    EventKind::StateChange,
    EventKind::Reconnecting,
    EventKind::ReconnectFailed,
    EventKind::ReconnectSuccess,
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(count: &Arc<AtomicUsize>) -> EventCallback {
        let count = count.clone();
        Arc::new(move |_: &PeerEvent| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_failing_handlers_do_not_block_others() {
        let registry = EventRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        registry.subscribe(EventKind::Connect, Arc::new(|_: &PeerEvent| -> HandlerResult { Err("boom".into()) }));
        registry.subscribe(EventKind::Connect, Arc::new(|_: &PeerEvent| -> HandlerResult { panic!("handler panic") }));
        registry.subscribe(EventKind::Connect, counter(&count));

        let delivered = registry.emit(&PeerEvent::Connect { peer_id: PeerId::new("a") });
        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_per_peer_overlay() {
        let registry = EventRegistry::new();
        let global = Arc::new(AtomicUsize::new(0));
        let scoped = Arc::new(AtomicUsize::new(0));
        registry.subscribe(EventKind::Close, counter(&global));
        registry.subscribe_peer(&PeerId::new("a"), EventKind::Close, counter(&scoped));

        registry.emit(&PeerEvent::Close { peer_id: PeerId::new("a") });
        registry.emit(&PeerEvent::Close { peer_id: PeerId::new("b") });
        assert_eq!(global.load(Ordering::SeqCst), 2);
        assert_eq!(scoped.load(Ordering::SeqCst), 1);

        registry.clear_peer(&PeerId::new("a"));
        registry.emit(&PeerEvent::Close { peer_id: PeerId::new("a") });
        assert_eq!(scoped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let registry = EventRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = registry.subscribe(EventKind::Data, counter(&count));
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&PeerEvent::Data { peer_id: PeerId::new("a"), data: vec![1] });
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(registry.handler_count(EventKind::Data), 0);
    }
}
