//! Scriptable transport that records every call, for driving the connection
//! manager by hand.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::manager::{TransportEvent, TransportEvents};
use crate::core::domain::{PeerId, Role};
use crate::core::error::TransportError;
use crate::core::traits::{PeerTransport, SignalData, TransportFactory};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A transport that never connects on its own; tests fire its events
pub struct RecordedTransport {
    pub role: Role,
    events: TransportEvents,
    sent: Mutex<Vec<Vec<u8>>>,
    signals: Mutex<Vec<SignalData>>,
    destroyed: AtomicBool,
    fail_sends: AtomicBool,
}

impl RecordedTransport {
    /// Raise an event as if the underlying connection produced it
    pub fn emit(&self, event: TransportEvent) {
        self.events.emit(event);
    }

    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        locked(&self.sent).clone()
    }

    pub fn send_count(&self) -> usize {
        locked(&self.sent).len()
    }

    pub fn signals(&self) -> Vec<SignalData> {
        locked(&self.signals).clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }
}

impl PeerTransport for RecordedTransport {
    fn signal(&self, data: &SignalData) -> Result<(), TransportError> {
        locked(&self.signals).push(data.clone());
        Ok(())
    }

    fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) || self.is_destroyed() {
            return Err(TransportError::ChannelClosed);
        }
        locked(&self.sent).push(payload.to_vec());
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Factory handing out [`RecordedTransport`]s and remembering each one
#[derive(Default)]
pub struct RecordingTransportFactory {
    created: Mutex<HashMap<PeerId, Vec<Arc<RecordedTransport>>>>,
    fail_create: AtomicBool,
}

impl RecordingTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Most recently created transport for `peer_id`
    pub fn latest(&self, peer_id: &PeerId) -> Option<Arc<RecordedTransport>> {
        locked(&self.created).get(peer_id).and_then(|all| all.last().cloned())
    }

    pub fn all(&self, peer_id: &PeerId) -> Vec<Arc<RecordedTransport>> {
        locked(&self.created).get(peer_id).cloned().unwrap_or_default()
    }

    pub fn created_count(&self, peer_id: &PeerId) -> usize {
        locked(&self.created).get(peer_id).map_or(0, Vec::len)
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

impl TransportFactory for RecordingTransportFactory {
    fn create(
        &self,
        peer_id: &PeerId,
        role: Role,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Create("creation disabled".to_string()));
        }
        let transport = Arc::new(RecordedTransport {
            role,
            events,
            sent: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            fail_sends: AtomicBool::new(false),
        });
        locked(&self.created)
            .entry(peer_id.clone())
            .or_default()
            .push(transport.clone());
        Ok(transport)
    }
}
