//! Owns every peer connection: creation, teardown, retry/backoff and heartbeat.
//!
//! The peer map lives behind a mutex that is never held while calling into
//! a transport or an event handler, so handlers may call back into the
//! manager. Every timer re-validates its peer (present, same transport
//! generation, expected state) before acting.

use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{
    EventBus, EventCallback, EventKind, EventRegistry, PeerEvent, ReconnectFailure, SubscriptionId,
};
use super::retry::RetryPolicy;
use super::state::{ConnectionState, ConnectionStateMachine};
use crate::core::domain::{PeerId, Role};
use crate::core::error::{ConnectionError, TransportError};
use crate::core::traits::{Payload, PeerMessenger, PeerTransport, SignalData, TransportFactory};
use crate::infrastructure::config::ConnectionConfig;
use crate::utils;

/// Something a transport peer object reports back to the manager
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Signal(SignalData),
    Connect,
    Data(Vec<u8>),
    Close,
    Error(String),
    IceStateChange(String),
}

/// Handle through which one transport object reports its events.
///
/// Bound to the transport generation it was created for: once the peer is
/// replaced, rebuilt or removed, events sent through an old handle are ignored.
#[derive(Clone)]
pub struct TransportEvents {
    peer_id: PeerId,
    generation: u64,
    manager: Weak<ManagerInner>,
}

impl TransportEvents {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(inner) = self.manager.upgrade() {
            PeerConnectionManager { inner }.handle_transport_event(&self.peer_id, self.generation, event);
        }
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("peer_id", &self.peer_id)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Per-peer creation options
#[derive(Debug, Clone, Default)]
pub struct PeerOptions {
    /// Overrides the configured connection timeout; `Some(Duration::ZERO)` disables it
    pub connection_timeout: Option<Duration>,
}

/// Copy of one peer's bookkeeping, safe to hand out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub role: Role,
    pub state: ConnectionState,
    pub retry_count: u32,
}

#[derive(Default)]
struct PeerTimers {
    heartbeat: Option<JoinHandle<()>>,
    connect_timeout: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

impl PeerTimers {
    fn cancel(slot: &mut Option<JoinHandle<()>>) {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    fn clear(&mut self) {
        Self::cancel(&mut self.heartbeat);
        Self::cancel(&mut self.connect_timeout);
        Self::cancel(&mut self.retry);
    }
}

impl Drop for PeerTimers {
    fn drop(&mut self) {
        self.clear();
    }
}

struct PeerEntry {
    role: Role,
    options: PeerOptions,
    machine: ConnectionStateMachine,
    generation: u64,
    transport: Option<Arc<dyn PeerTransport>>,
    retry_count: u32,
    /// Set while a retry attempt is in flight; the next connect reports success
    recovering: bool,
    timers: PeerTimers,
}

impl PeerEntry {
    fn new(role: Role, options: PeerOptions, generation: u64) -> Self {
        Self {
            role,
            options,
            machine: ConnectionStateMachine::new(),
            generation,
            transport: None,
            retry_count: 0,
            recovering: false,
            timers: PeerTimers::default(),
        }
    }

    fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    fn snapshot(&self, peer_id: &PeerId) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: peer_id.clone(),
            role: self.role,
            state: self.state(),
            retry_count: self.retry_count,
        }
    }
}

#[derive(Default)]
struct ManagerState {
    peers: HashMap<PeerId, PeerEntry>,
    destroyed: bool,
    last_generation: u64,
}

impl ManagerState {
    fn bump_generation(&mut self) -> u64 {
        self.last_generation += 1;
        self.last_generation
    }

    fn current(&mut self, peer_id: &PeerId, generation: u64) -> Option<&mut PeerEntry> {
        if self.destroyed {
            return None;
        }
        self.peers
            .get_mut(peer_id)
            .filter(|entry| entry.generation == generation)
    }
}

pub struct ManagerInner {
    config: ConnectionConfig,
    retry: RetryPolicy,
    factory: Arc<dyn TransportFactory>,
    events: EventRegistry,
    state: Mutex<ManagerState>,
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, entry) in state.peers.drain() {
            if let Some(transport) = entry.transport {
                transport.destroy();
            }
        }
    }
}

/// Manages one transport peer object per remote peer id
#[derive(Clone)]
pub struct PeerConnectionManager {
    inner: Arc<ManagerInner>,
}

impl PeerConnectionManager {
    pub fn new(config: ConnectionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                retry: RetryPolicy::from_config(&config),
                config,
                factory,
                events: EventRegistry::new(),
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Create a transport peer for `peer_id`, replacing (and tearing down) any existing one
    pub fn create_peer(&self, peer_id: &PeerId, role: Role, options: PeerOptions) -> Result<(), ConnectionError> {
        let (previous, generation) = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ConnectionError::ManagerDestroyed);
            }
            let previous = state.peers.remove(peer_id);
            let generation = state.bump_generation();
            state
                .peers
                .insert(peer_id.clone(), PeerEntry::new(role, options, generation));
            (previous, generation)
        };

        if let Some(mut old) = previous {
            debug!(%peer_id, "Replacing existing peer");
            old.timers.clear();
            if let Some(transport) = old.transport.take() {
                transport.destroy();
            }
        }

        if let Err(e) = self.install_transport(peer_id, role, generation) {
            let mut state = self.inner.lock();
            if state.current(peer_id, generation).is_some() {
                state.peers.remove(peer_id);
            }
            return Err(e);
        }
        info!(%peer_id, ?role, "Peer created");
        Ok(())
    }

    /// Feed remote signaling data into the named peer's transport
    pub fn connect(&self, peer_id: &PeerId, signal: SignalData) -> Result<(), ConnectionError> {
        let transport = {
            let state = self.inner.lock();
            let entry = state
                .peers
                .get(peer_id)
                .ok_or_else(|| ConnectionError::PeerNotFound(peer_id.clone()))?;
            entry.transport.clone().ok_or_else(|| ConnectionError::InvalidState {
                peer_id: peer_id.clone(),
                state: entry.state(),
            })?
        };
        transport.signal(&signal)?;
        Ok(())
    }

    /// Send to one peer; `false` when the peer is unknown or not connected
    pub fn send(&self, peer_id: &PeerId, payload: impl Into<Payload>) -> bool {
        let transport = {
            let state = self.inner.lock();
            match state.peers.get(peer_id) {
                Some(entry) if entry.state() == ConnectionState::Connected => entry.transport.clone(),
                _ => None,
            }
        };
        let Some(transport) = transport else {
            debug!(%peer_id, "Send skipped, peer not connected");
            return false;
        };
        match transport.send(&payload.into().into_bytes()) {
            Ok(()) => true,
            Err(e) => {
                debug!(%peer_id, "Send failed: {}", e);
                false
            }
        }
    }

    /// Send to every connected peer except `exclude`; returns the delivery count
    pub fn broadcast(&self, payload: impl Into<Payload>, exclude: Option<&PeerId>) -> usize {
        let targets: Vec<(PeerId, Arc<dyn PeerTransport>)> = {
            let state = self.inner.lock();
            state
                .peers
                .iter()
                .filter(|(id, entry)| Some(*id) != exclude && entry.state() == ConnectionState::Connected)
                .filter_map(|(id, entry)| entry.transport.clone().map(|t| (id.clone(), t)))
                .collect()
        };
        let bytes = payload.into().into_bytes();
        targets
            .iter()
            .filter(|(peer_id, transport)| match transport.send(&bytes) {
                Ok(()) => true,
                Err(e) => {
                    debug!(%peer_id, "Broadcast send failed: {}", e);
                    false
                }
            })
            .count()
    }

    /// Close the peer's transport but keep it registered so it can be reconnected
    pub fn disconnect(&self, peer_id: &PeerId) -> Result<(), ConnectionError> {
        let (transport, events) = {
            let mut state = self.inner.lock();
            let entry = state
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| ConnectionError::PeerNotFound(peer_id.clone()))?;
            entry.timers.clear();
            entry.recovering = false;
            let mut events = Vec::new();
            let from = entry.state();
            if entry.machine.transition(ConnectionState::Disconnected).is_ok() {
                events.push(PeerEvent::StateChange {
                    peer_id: peer_id.clone(),
                    from,
                    to: ConnectionState::Disconnected,
                });
                events.push(PeerEvent::Close { peer_id: peer_id.clone() });
            }
            (entry.transport.take(), events)
        };
        if let Some(transport) = transport {
            transport.destroy();
        }
        self.emit_all(events);
        Ok(())
    }

    pub fn disconnect_all(&self) {
        for peer_id in self.peer_ids() {
            // Peers removed concurrently are simply skipped.
            let _ = self.disconnect(&peer_id);
        }
    }

    /// Tear the peer down completely and forget it
    pub fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let entry = self.inner.lock().peers.remove(peer_id);
        let Some(mut entry) = entry else {
            return false;
        };
        entry.timers.clear();
        if let Some(transport) = entry.transport.take() {
            transport.destroy();
        }
        self.inner.events.clear_peer(peer_id);
        info!(%peer_id, "Peer removed");
        true
    }

    pub fn remove_all_peers(&self) {
        for peer_id in self.peer_ids() {
            self.remove_peer(&peer_id);
        }
    }

    /// Manually re-arm a `disconnected` or `failed` peer with a fresh retry budget
    pub fn reconnect(&self, peer_id: &PeerId) -> Result<(), ConnectionError> {
        let (stale, events) = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(ConnectionError::ManagerDestroyed);
            }
            let entry = state
                .peers
                .get_mut(peer_id)
                .ok_or_else(|| ConnectionError::PeerNotFound(peer_id.clone()))?;
            match entry.state() {
                ConnectionState::Disconnected | ConnectionState::Failed => {}
                other => {
                    return Err(ConnectionError::InvalidState {
                        peer_id: peer_id.clone(),
                        state: other,
                    });
                }
            }
            entry.retry_count = 0;
            let events = self.schedule_retry(peer_id, entry);
            (entry.transport.take(), events)
        };
        if let Some(transport) = stale {
            transport.destroy();
        }
        info!(%peer_id, "Manual reconnect requested");
        self.emit_all(events);
        Ok(())
    }

    /// Idempotent full teardown
    pub fn destroy(&self) {
        let entries: Vec<PeerEntry> = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.peers.drain().map(|(_, entry)| entry).collect()
        };
        for mut entry in entries {
            entry.timers.clear();
            if let Some(transport) = entry.transport.take() {
                transport.destroy();
            }
        }
        self.inner.events.clear();
        info!("Connection manager destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Subscribe to an event kind for all peers
    pub fn on(&self, kind: EventKind, handler: EventCallback) -> SubscriptionId {
        self.inner.events.subscribe(kind, handler)
    }

    /// Subscribe to an event kind for one peer only
    pub fn on_peer(&self, peer_id: &PeerId, kind: EventKind, handler: EventCallback) -> SubscriptionId {
        self.inner.events.subscribe_peer(peer_id, kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    pub fn peer_state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.inner.lock().peers.get(peer_id).map(PeerEntry::state)
    }

    pub fn retry_count(&self, peer_id: &PeerId) -> Option<u32> {
        self.inner.lock().peers.get(peer_id).map(|entry| entry.retry_count)
    }

    pub fn has_peer(&self, peer_id: &PeerId) -> bool {
        self.inner.lock().peers.contains_key(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let state = self.inner.lock();
        let mut peers: Vec<_> = state.peers.iter().map(|(id, entry)| entry.snapshot(id)).collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let state = self.inner.lock();
        let mut peers: Vec<_> = state
            .peers
            .iter()
            .filter(|(_, entry)| entry.state() == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    fn peer_ids(&self) -> Vec<PeerId> {
        self.inner.lock().peers.keys().cloned().collect()
    }

    fn emit_all(&self, events: Vec<PeerEvent>) {
        for event in &events {
            self.inner.events.emit(event);
        }
    }

    fn install_transport(&self, peer_id: &PeerId, role: Role, generation: u64) -> Result<(), ConnectionError> {
        let events = TransportEvents {
            peer_id: peer_id.clone(),
            generation,
            manager: Arc::downgrade(&self.inner),
        };
        let transport = self.inner.factory.create(peer_id, role, events)?;

        let mut pending = Some(transport);
        {
            let mut state = self.inner.lock();
            if let Some(entry) = state.current(peer_id, generation) {
                entry.transport = pending.take();
                if entry.state().is_establishing() {
                    self.arm_connection_timeout(peer_id, entry);
                }
            }
        }
        if let Some(superseded) = pending {
            debug!(%peer_id, generation, "Peer replaced while its transport was being created");
            superseded.destroy();
        }
        Ok(())
    }

    fn arm_connection_timeout(&self, peer_id: &PeerId, entry: &mut PeerEntry) {
        let timeout = entry
            .options
            .connection_timeout
            .unwrap_or_else(|| Duration::from_millis(self.inner.config.connection_timeout_ms));
        if timeout.is_zero() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let peer_id = peer_id.clone();
        let generation = entry.generation;
        PeerTimers::cancel(&mut entry.timers.connect_timeout);
        entry.timers.connect_timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                PeerConnectionManager { inner }.on_connection_timeout(&peer_id, generation);
            }
        }));
    }

    fn arm_heartbeat(&self, peer_id: &PeerId, entry: &mut PeerEntry) {
        if self.inner.config.heartbeat_interval_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(self.inner.config.heartbeat_interval_ms);
        let weak = Arc::downgrade(&self.inner);
        let peer_id = peer_id.clone();
        let generation = entry.generation;
        PeerTimers::cancel(&mut entry.timers.heartbeat);
        entry.timers.heartbeat = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                if !(PeerConnectionManager { inner }).heartbeat_tick(&peer_id, generation) {
                    break;
                }
            }
        }));
    }

    /// One heartbeat; returns whether the heartbeat should keep running
    fn heartbeat_tick(&self, peer_id: &PeerId, generation: u64) -> bool {
        {
            let mut state = self.inner.lock();
            match state.current(peer_id, generation) {
                Some(entry) if entry.state() == ConnectionState::Connected => {}
                _ => return false,
            }
        }
        let ping = json!({ "type": "ping", "data": { "timestamp": utils::now_millis() } });
        if self.send(peer_id, ping) {
            return true;
        }
        debug!(%peer_id, "Heartbeat send failed, stopping heartbeat");
        let mut state = self.inner.lock();
        if let Some(entry) = state.current(peer_id, generation) {
            entry.timers.heartbeat = None;
        }
        false
    }

    fn handle_transport_event(&self, peer_id: &PeerId, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Connect => self.on_connect(peer_id, generation),
            TransportEvent::Close => self.on_close(peer_id, generation),
            TransportEvent::Error(message) => self.on_failure(peer_id, generation, message),
            TransportEvent::Signal(data) => self.emit_if_current(
                peer_id,
                generation,
                PeerEvent::Signal { peer_id: peer_id.clone(), data },
            ),
            TransportEvent::Data(data) => self.emit_if_current(
                peer_id,
                generation,
                PeerEvent::Data { peer_id: peer_id.clone(), data },
            ),
            TransportEvent::IceStateChange(state) => self.emit_if_current(
                peer_id,
                generation,
                PeerEvent::IceStateChange { peer_id: peer_id.clone(), state },
            ),
        }
    }

    fn emit_if_current(&self, peer_id: &PeerId, generation: u64, event: PeerEvent) {
        let current = self.inner.lock().current(peer_id, generation).is_some();
        if current {
            self.inner.events.emit(&event);
        } else {
            debug!(%peer_id, generation, kind = ?event.kind(), "Ignoring event from stale transport");
        }
    }

    fn on_connect(&self, peer_id: &PeerId, generation: u64) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.lock();
            let Some(entry) = state.current(peer_id, generation) else {
                return;
            };
            let from = entry.state();
            if let Err(e) = entry.machine.transition(ConnectionState::Connected) {
                warn!(%peer_id, "Ignoring connect: {}", e);
                return;
            }
            PeerTimers::cancel(&mut entry.timers.connect_timeout);
            PeerTimers::cancel(&mut entry.timers.retry);
            events.push(PeerEvent::StateChange {
                peer_id: peer_id.clone(),
                from,
                to: ConnectionState::Connected,
            });
            events.push(PeerEvent::Connect { peer_id: peer_id.clone() });
            if entry.recovering {
                events.push(PeerEvent::ReconnectSuccess {
                    peer_id: peer_id.clone(),
                    attempts: entry.retry_count,
                });
                entry.recovering = false;
            }
            entry.retry_count = 0;
            self.arm_heartbeat(peer_id, entry);
        }
        info!(%peer_id, "Peer connected");
        self.emit_all(events);
    }

    fn on_close(&self, peer_id: &PeerId, generation: u64) {
        let mut events = Vec::new();
        {
            let mut state = self.inner.lock();
            let Some(entry) = state.current(peer_id, generation) else {
                return;
            };
            let from = entry.state();
            if entry.machine.transition(ConnectionState::Disconnected).is_err() {
                return;
            }
            entry.timers.clear();
            entry.recovering = false;
            events.push(PeerEvent::StateChange {
                peer_id: peer_id.clone(),
                from,
                to: ConnectionState::Disconnected,
            });
            events.push(PeerEvent::Close { peer_id: peer_id.clone() });
        }
        info!(%peer_id, "Peer closed");
        self.emit_all(events);
    }

    fn on_connection_timeout(&self, peer_id: &PeerId, generation: u64) {
        let establishing = {
            let mut state = self.inner.lock();
            match state.current(peer_id, generation) {
                Some(entry) => {
                    entry.timers.connect_timeout = None;
                    entry.state().is_establishing()
                }
                None => false,
            }
        };
        if establishing {
            warn!(%peer_id, "Connection timed out");
            self.on_failure(peer_id, generation, "connection timeout".to_string());
        }
    }

    /// Transport error or timeout: fail, then retry with backoff or give up
    fn on_failure(&self, peer_id: &PeerId, generation: u64, message: String) {
        let mut events = Vec::new();
        let mut stale = None;
        {
            let mut state = self.inner.lock();
            let Some(entry) = state.current(peer_id, generation) else {
                return;
            };
            let from = entry.state();
            events.push(PeerEvent::Error {
                peer_id: peer_id.clone(),
                message: message.clone(),
            });
            if entry.machine.transition(ConnectionState::Failed).is_ok() {
                PeerTimers::cancel(&mut entry.timers.connect_timeout);
                PeerTimers::cancel(&mut entry.timers.heartbeat);
                events.insert(
                    0,
                    PeerEvent::StateChange {
                        peer_id: peer_id.clone(),
                        from,
                        to: ConnectionState::Failed,
                    },
                );
                if self.inner.retry.exhausted(entry.retry_count) {
                    entry.recovering = false;
                    stale = entry.transport.take();
                    events.push(PeerEvent::ReconnectFailed {
                        peer_id: peer_id.clone(),
                        reason: ReconnectFailure::MaxRetriesExceeded,
                        attempts: entry.retry_count,
                    });
                } else {
                    events.extend(self.schedule_retry(peer_id, entry));
                }
            }
        }
        warn!(%peer_id, "Peer failure: {}", message);
        if let Some(transport) = stale {
            transport.destroy();
        }
        self.emit_all(events);
    }

    /// Move to `reconnecting` and schedule a rebuild after the backoff delay
    fn schedule_retry(&self, peer_id: &PeerId, entry: &mut PeerEntry) -> Vec<PeerEvent> {
        let from = entry.state();
        if entry.machine.transition(ConnectionState::Reconnecting).is_err() {
            return Vec::new();
        }
        let delay = self.inner.retry.delay_for(entry.retry_count);
        entry.retry_count += 1;
        entry.recovering = true;

        let weak = Arc::downgrade(&self.inner);
        let target = peer_id.clone();
        let generation = entry.generation;
        PeerTimers::cancel(&mut entry.timers.retry);
        entry.timers.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                PeerConnectionManager { inner }.on_retry_timer(&target, generation);
            }
        }));

        debug!(%peer_id, attempt = entry.retry_count, delay_ms = delay.as_millis() as u64, "Retry scheduled");
        vec![
            PeerEvent::StateChange {
                peer_id: peer_id.clone(),
                from,
                to: ConnectionState::Reconnecting,
            },
            PeerEvent::Reconnecting {
                peer_id: peer_id.clone(),
                attempt: entry.retry_count,
                delay,
            },
        ]
    }

    /// Rebuild the transport for a scheduled retry, unless the peer moved on meanwhile
    fn on_retry_timer(&self, peer_id: &PeerId, generation: u64) {
        let (role, stale, new_generation, event) = {
            let mut state = self.inner.lock();
            match state.current(peer_id, generation) {
                Some(entry) if entry.state() == ConnectionState::Reconnecting => {}
                _ => {
                    debug!(%peer_id, "Retry skipped, peer removed or state changed");
                    return;
                }
            }
            let new_generation = state.bump_generation();
            let Some(entry) = state.peers.get_mut(peer_id) else {
                return;
            };
            // Detach rather than abort: this task is the one running.
            entry.timers.retry = None;
            entry.generation = new_generation;
            let from = entry.state();
            if entry.machine.transition(ConnectionState::Connecting).is_err() {
                return;
            }
            let event = PeerEvent::StateChange {
                peer_id: peer_id.clone(),
                from,
                to: ConnectionState::Connecting,
            };
            (entry.role, entry.transport.take(), new_generation, event)
        };

        if let Some(transport) = stale {
            transport.destroy();
        }
        self.inner.events.emit(&event);
        info!(%peer_id, "Rebuilding peer connection");

        if let Err(e) = self.install_transport(peer_id, role, new_generation) {
            self.on_rebuild_failed(peer_id, new_generation, e);
        }
    }

    fn on_rebuild_failed(&self, peer_id: &PeerId, generation: u64, error: ConnectionError) {
        let mut events = vec![PeerEvent::Error {
            peer_id: peer_id.clone(),
            message: error.to_string(),
        }];
        {
            let mut state = self.inner.lock();
            let Some(entry) = state.current(peer_id, generation) else {
                return;
            };
            let from = entry.state();
            if entry.machine.transition(ConnectionState::Failed).is_ok() {
                entry.timers.clear();
                entry.recovering = false;
                events.insert(
                    0,
                    PeerEvent::StateChange {
                        peer_id: peer_id.clone(),
                        from,
                        to: ConnectionState::Failed,
                    },
                );
                events.push(PeerEvent::ReconnectFailed {
                    peer_id: peer_id.clone(),
                    reason: ReconnectFailure::ConnectionError,
                    attempts: entry.retry_count,
                });
            }
        }
        warn!(%peer_id, "Rebuild failed: {}", error);
        self.emit_all(events);
    }
}

impl PeerMessenger for PeerConnectionManager {
    fn send_to_peer(&self, peer_id: &PeerId, payload: Payload) -> bool {
        self.send(peer_id, payload)
    }

    fn broadcast(&self, payload: Payload, exclude: Option<&PeerId>) -> usize {
        PeerConnectionManager::broadcast(self, payload, exclude)
    }
}

impl From<TransportError> for TransportEvent {
    fn from(error: TransportError) -> Self {
        TransportEvent::Error(error.to_string())
    }
}
