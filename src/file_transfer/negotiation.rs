//! Request/accept/reject/cancel handshake that precedes any file data.
//!
//! Outgoing requests resolve exactly once: the peer's response, the local
//! expiry timer and a cancellation race, and whichever removes the entry
//! from the pending map first wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{TransferCancel, TransferMessage, TransferRequest, TransferResponse};
use crate::core::domain::{FileMetadata, PeerId, TransferId, TransferMethod};
use crate::core::error::NegotiationError;
use crate::core::traits::PeerMessenger;
use crate::infrastructure::config::NegotiationConfig;
use crate::utils;

/// How an outgoing negotiation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationOutcome {
    Accepted,
    Rejected { reason: Option<String> },
    Expired,
    Cancelled,
}

/// What happened to an incoming request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDisposition {
    /// Stored and awaiting a local decision
    Surfaced,
    /// Already past its expiry; rejected without surfacing
    Expired,
    /// Same transfer id already pending or answered; ignored
    Duplicate,
}

/// A request received from a peer, awaiting accept or reject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub from: PeerId,
    pub request: TransferRequest,
}

/// Handle on an outgoing request
#[derive(Debug)]
pub struct PendingNegotiation {
    pub request: TransferRequest,
    outcome: oneshot::Receiver<NegotiationOutcome>,
}

impl PendingNegotiation {
    pub fn transfer_id(&self) -> &TransferId {
        &self.request.transfer_id
    }

    /// Wait for the negotiation to resolve; a torn-down negotiator counts as cancelled
    pub async fn outcome(self) -> NegotiationOutcome {
        self.outcome.await.unwrap_or(NegotiationOutcome::Cancelled)
    }
}

struct Outgoing {
    peer_id: PeerId,
    responder: oneshot::Sender<NegotiationOutcome>,
    expiry: Option<JoinHandle<()>>,
}

impl Outgoing {
    fn resolve(mut self, outcome: NegotiationOutcome) {
        if let Some(timer) = self.expiry.take() {
            timer.abort();
        }
        // The waiter may have gone away; nothing to do then.
        let _ = self.responder.send(outcome);
    }
}

#[derive(Default)]
struct NegotiationState {
    outgoing: HashMap<TransferId, Outgoing>,
    incoming: HashMap<TransferId, IncomingRequest>,
    /// Answered incoming requests, kept until their expiry
    answered: HashMap<TransferId, u64>,
}

impl NegotiationState {
    fn answer(&mut self, transfer_id: &TransferId) -> Option<IncomingRequest> {
        let incoming = self.incoming.remove(transfer_id)?;
        self.answered.insert(transfer_id.clone(), incoming.request.expires_at);
        Some(incoming)
    }
}

struct NegotiatorInner {
    local_id: PeerId,
    config: NegotiationConfig,
    messenger: Arc<dyn PeerMessenger>,
    state: Mutex<NegotiationState>,
}

impl NegotiatorInner {
    fn lock(&self) -> MutexGuard<'_, NegotiationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct TransferNegotiator {
    inner: Arc<NegotiatorInner>,
}

impl TransferNegotiator {
    pub fn new(local_id: PeerId, config: NegotiationConfig, messenger: Arc<dyn PeerMessenger>) -> Self {
        Self {
            inner: Arc::new(NegotiatorInner {
                local_id,
                config,
                messenger,
                state: Mutex::new(NegotiationState::default()),
            }),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    /// Offer a file to `peer_id`; refused once the pending limit is reached
    pub fn request_transfer(
        &self,
        peer_id: &PeerId,
        transfer_id: TransferId,
        metadata: FileMetadata,
        method: TransferMethod,
    ) -> Result<PendingNegotiation, NegotiationError> {
        let timeout = self.inner.config.request_timeout();
        let now = utils::now_millis();
        let request = TransferRequest {
            transfer_id: transfer_id.clone(),
            metadata,
            sender_id: self.inner.local_id.clone(),
            timestamp: now,
            expires_at: now + timeout.as_millis() as u64,
            transfer_method: method,
        };

        let (responder, outcome) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            let max = self.inner.config.max_concurrent_transfers;
            if state.outgoing.len() >= max {
                warn!(%peer_id, max, "Refusing transfer request, too many pending negotiations");
                return Err(NegotiationError::LimitExceeded { max });
            }
            state.outgoing.insert(
                transfer_id.clone(),
                Outgoing {
                    peer_id: peer_id.clone(),
                    responder,
                    expiry: None,
                },
            );
        }

        let message = TransferMessage::Request(request.clone());
        if !self.inner.messenger.send_to_peer(peer_id, message.to_payload()) {
            self.inner.lock().outgoing.remove(&transfer_id);
            return Err(NegotiationError::SendFailed {
                kind: "request",
                peer_id: peer_id.clone(),
            });
        }

        let timer = self.spawn_expiry(transfer_id.clone(), timeout);
        match self.inner.lock().outgoing.get_mut(&transfer_id) {
            Some(entry) => entry.expiry = Some(timer),
            None => timer.abort(),
        }

        info!(%peer_id, %transfer_id, %method, "Transfer requested");
        Ok(PendingNegotiation { request, outcome })
    }

    fn spawn_expiry(&self, transfer_id: TransferId, timeout: Duration) -> JoinHandle<()> {
        let weak: Weak<NegotiatorInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            let entry = inner.lock().outgoing.remove(&transfer_id);
            if let Some(mut entry) = entry {
                info!(%transfer_id, "Transfer request expired");
                // Running inside this timer; detach instead of aborting it.
                entry.expiry = None;
                entry.resolve(NegotiationOutcome::Expired);
            }
        })
    }

    /// Apply a peer's accept/reject; returns the outcome if it resolved a pending request
    pub fn handle_response(&self, from: &PeerId, response: &TransferResponse) -> Option<NegotiationOutcome> {
        let entry = {
            let mut state = self.inner.lock();
            let owner = state.outgoing.get(&response.transfer_id).map(|entry| entry.peer_id == *from);
            match owner {
                Some(true) => state.outgoing.remove(&response.transfer_id),
                Some(false) => {
                    warn!(%from, transfer_id = %response.transfer_id, "Ignoring response from unexpected peer");
                    None
                }
                None => {
                    debug!(transfer_id = %response.transfer_id, "Response for unknown or finished negotiation");
                    None
                }
            }
        }?;

        let outcome = if response.accepted {
            NegotiationOutcome::Accepted
        } else {
            NegotiationOutcome::Rejected {
                reason: response.reason.clone(),
            }
        };
        info!(%from, transfer_id = %response.transfer_id, ?outcome, "Transfer response received");
        entry.resolve(outcome.clone());
        Some(outcome)
    }

    /// Receiver side: store a request, or reject it outright if already expired
    pub fn handle_request(&self, from: &PeerId, request: TransferRequest) -> RequestDisposition {
        let transfer_id = request.transfer_id.clone();
        let now = utils::now_millis();
        if request.is_expired(now) {
            info!(%from, %transfer_id, "Auto-rejecting expired transfer request");
            self.send_response(from, &transfer_id, false, Some("expired".to_string()));
            return RequestDisposition::Expired;
        }

        let mut state = self.inner.lock();
        state.answered.retain(|_, expires_at| *expires_at > now);
        if state.incoming.contains_key(&transfer_id) || state.answered.contains_key(&transfer_id) {
            debug!(%from, %transfer_id, "Duplicate transfer request ignored");
            return RequestDisposition::Duplicate;
        }
        state.incoming.insert(
            transfer_id.clone(),
            IncomingRequest {
                from: from.clone(),
                request,
            },
        );
        info!(%from, %transfer_id, "Incoming transfer request");
        RequestDisposition::Surfaced
    }

    /// Look at a pending incoming request without resolving it
    pub fn incoming_request(&self, transfer_id: &TransferId) -> Option<IncomingRequest> {
        self.inner.lock().incoming.get(transfer_id).cloned()
    }

    /// Accept an incoming request and tell the sender
    pub fn accept(&self, transfer_id: &TransferId) -> Result<IncomingRequest, NegotiationError> {
        let incoming = self.take_incoming(transfer_id)?;
        if incoming.request.is_expired(utils::now_millis()) {
            self.send_response(&incoming.from, transfer_id, false, Some("expired".to_string()));
            return Err(NegotiationError::Expired(transfer_id.clone()));
        }
        if !self.send_response(&incoming.from, transfer_id, true, None) {
            return Err(NegotiationError::SendFailed {
                kind: "response",
                peer_id: incoming.from,
            });
        }
        Ok(incoming)
    }

    /// Reject an incoming request and tell the sender
    pub fn reject(&self, transfer_id: &TransferId, reason: Option<String>) -> Result<IncomingRequest, NegotiationError> {
        let incoming = self.take_incoming(transfer_id)?;
        if !self.send_response(&incoming.from, transfer_id, false, reason) {
            return Err(NegotiationError::SendFailed {
                kind: "response",
                peer_id: incoming.from,
            });
        }
        Ok(incoming)
    }

    /// Cancel a pending negotiation in either direction and notify the far side
    pub fn cancel(&self, transfer_id: &TransferId, reason: Option<String>) -> bool {
        let (outgoing, incoming) = {
            let mut state = self.inner.lock();
            (state.outgoing.remove(transfer_id), state.answer(transfer_id))
        };
        let peer_id = match (outgoing, incoming) {
            (Some(entry), _) => {
                let peer_id = entry.peer_id.clone();
                entry.resolve(NegotiationOutcome::Cancelled);
                peer_id
            }
            (None, Some(incoming)) => incoming.from,
            (None, None) => return false,
        };
        self.send_cancel(&peer_id, transfer_id, reason);
        info!(%transfer_id, "Negotiation cancelled");
        true
    }

    /// The far side cancelled; drop whatever is pending for that transfer
    pub fn handle_cancel(&self, from: &PeerId, cancel: &TransferCancel) -> bool {
        let (outgoing, incoming) = {
            let mut state = self.inner.lock();
            let id = &cancel.transfer_id;
            let outgoing = if state.outgoing.get(id).is_some_and(|entry| entry.peer_id == *from) {
                state.outgoing.remove(id)
            } else {
                None
            };
            let incoming = if state.incoming.get(id).is_some_and(|entry| entry.from == *from) {
                state.answer(id)
            } else {
                None
            };
            (outgoing, incoming)
        };
        let handled = outgoing.is_some() || incoming.is_some();
        if let Some(entry) = outgoing {
            entry.resolve(NegotiationOutcome::Cancelled);
        }
        if handled {
            info!(%from, transfer_id = %cancel.transfer_id, "Peer cancelled negotiation");
        }
        handled
    }

    /// Pending incoming requests, minus any that have expired meanwhile
    pub fn incoming_requests(&self) -> Vec<IncomingRequest> {
        let now = utils::now_millis();
        let mut state = self.inner.lock();
        state.incoming.retain(|_, pending| !pending.request.is_expired(now));
        let mut requests: Vec<_> = state.incoming.values().cloned().collect();
        requests.sort_by_key(|pending| pending.request.timestamp);
        requests
    }

    /// Number of outgoing negotiations still awaiting a response
    pub fn pending_count(&self) -> usize {
        self.inner.lock().outgoing.len()
    }

    pub fn is_pending(&self, transfer_id: &TransferId) -> bool {
        self.inner.lock().outgoing.contains_key(transfer_id)
    }

    /// Drop every negotiation; waiters resolve as cancelled
    pub fn destroy(&self) {
        let outgoing: Vec<Outgoing> = {
            let mut state = self.inner.lock();
            state.incoming.clear();
            state.answered.clear();
            state.outgoing.drain().map(|(_, entry)| entry).collect()
        };
        for entry in outgoing {
            entry.resolve(NegotiationOutcome::Cancelled);
        }
    }

    fn take_incoming(&self, transfer_id: &TransferId) -> Result<IncomingRequest, NegotiationError> {
        self.inner
            .lock()
            .answer(transfer_id)
            .ok_or_else(|| NegotiationError::UnknownTransfer(transfer_id.clone()))
    }

    fn send_response(&self, to: &PeerId, transfer_id: &TransferId, accepted: bool, reason: Option<String>) -> bool {
        let message = TransferMessage::Response(TransferResponse {
            transfer_id: transfer_id.clone(),
            accepted,
            receiver_id: self.inner.local_id.clone(),
            reason,
            timestamp: utils::now_millis(),
        });
        self.inner.messenger.send_to_peer(to, message.to_payload())
    }

    fn send_cancel(&self, to: &PeerId, transfer_id: &TransferId, reason: Option<String>) -> bool {
        let message = TransferMessage::Cancel(TransferCancel {
            transfer_id: transfer_id.clone(),
            reason,
        });
        self.inner.messenger.send_to_peer(to, message.to_payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::traits::Payload;

    #[derive(Default)]
    struct CapturingMessenger {
        sent: Mutex<Vec<(PeerId, TransferMessage)>>,
    }

    impl CapturingMessenger {
        fn sent(&self) -> Vec<(PeerId, TransferMessage)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl PeerMessenger for CapturingMessenger {
        fn send_to_peer(&self, peer_id: &PeerId, payload: Payload) -> bool {
            let message = TransferMessage::decode(&payload.into_bytes()).unwrap();
            self.sent.lock().unwrap().push((peer_id.clone(), message));
            true
        }

        fn broadcast(&self, _payload: Payload, _exclude: Option<&PeerId>) -> usize {
            0
        }
    }

    fn metadata() -> FileMetadata {
        FileMetadata {
            id: "f".into(),
            name: "a.txt".into(),
            size: 1,
            mime_type: "text/plain".into(),
            last_modified: 0,
            chunk_count: 1,
            chunk_size: 1024,
            checksum: None,
        }
    }

    fn negotiator(messenger: &Arc<CapturingMessenger>, max: usize) -> TransferNegotiator {
        let config = NegotiationConfig {
            request_timeout_ms: 1000,
            max_concurrent_transfers: max,
        };
        TransferNegotiator::new(PeerId::new("me"), config, messenger.clone())
    }

    fn response(id: &TransferId, accepted: bool) -> TransferResponse {
        TransferResponse {
            transfer_id: id.clone(),
            accepted,
            receiver_id: PeerId::new("bob"),
            reason: (!accepted).then(|| "no thanks".to_string()),
            timestamp: 0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_resolves_pending() {
        let messenger = Arc::new(CapturingMessenger::default());
        let negotiator = negotiator(&messenger, 5);
        let bob = PeerId::new("bob");
        let id = TransferId::new();
        let pending = negotiator
            .request_transfer(&bob, id.clone(), metadata(), TransferMethod::Direct)
            .unwrap();
        assert_eq!(negotiator.pending_count(), 1);
        assert!(matches!(messenger.sent()[0].1, TransferMessage::Request(_)));

        assert_eq!(
            negotiator.handle_response(&bob, &response(&id, true)),
            Some(NegotiationOutcome::Accepted)
        );
        assert_eq!(pending.outcome().await, NegotiationOutcome::Accepted);
        assert_eq!(negotiator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_then_late_response_is_noop() {
        let messenger = Arc::new(CapturingMessenger::default());
        let negotiator = negotiator(&messenger, 5);
        let bob = PeerId::new("bob");
        let id = TransferId::new();
        let pending = negotiator
            .request_transfer(&bob, id.clone(), metadata(), TransferMethod::Direct)
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(pending.outcome().await, NegotiationOutcome::Expired);
        assert_eq!(negotiator.handle_response(&bob, &response(&id, true)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_exceeded() {
        let messenger = Arc::new(CapturingMessenger::default());
        let negotiator = negotiator(&messenger, 2);
        let bob = PeerId::new("bob");
        let _a = negotiator.request_transfer(&bob, TransferId::new(), metadata(), TransferMethod::Direct).unwrap();
        let _b = negotiator.request_transfer(&bob, TransferId::new(), metadata(), TransferMethod::Direct).unwrap();
        let err = negotiator
            .request_transfer(&bob, TransferId::new(), metadata(), TransferMethod::Direct)
            .unwrap_err();
        assert_eq!(err, NegotiationError::LimitExceeded { max: 2 });
    }

    #[tokio::test]
    async fn test_expired_incoming_request_is_auto_rejected() {
        let messenger = Arc::new(CapturingMessenger::default());
        let negotiator = negotiator(&messenger, 5);
        let request = TransferRequest {
            transfer_id: TransferId::new(),
            metadata: metadata(),
            sender_id: PeerId::new("alice"),
            timestamp: 1,
            expires_at: 2,
            transfer_method: TransferMethod::Direct,
        };
        let disposition = negotiator.handle_request(&PeerId::new("alice"), request);
        assert_eq!(disposition, RequestDisposition::Expired);
        assert!(negotiator.incoming_requests().is_empty());

        let sent = messenger.sent();
        let TransferMessage::Response(response) = &sent[0].1 else {
            panic!("expected a response");
        };
        assert!(!response.accepted);
        assert_eq!(response.reason.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_accept_duplicate_and_cancel() {
        let messenger = Arc::new(CapturingMessenger::default());
        let negotiator = negotiator(&messenger, 5);
        let alice = PeerId::new("alice");
        let request = TransferRequest {
            transfer_id: TransferId::new(),
            metadata: metadata(),
            sender_id: alice.clone(),
            timestamp: utils::now_millis(),
            expires_at: utils::now_millis() + 60_000,
            transfer_method: TransferMethod::Direct,
        };
        let id = request.transfer_id.clone();
        assert_eq!(negotiator.handle_request(&alice, request.clone()), RequestDisposition::Surfaced);
        assert_eq!(negotiator.handle_request(&alice, request.clone()), RequestDisposition::Duplicate);
        assert_eq!(negotiator.incoming_requests().len(), 1);

        let accepted = negotiator.accept(&id).unwrap();
        assert_eq!(accepted.from, alice);
        assert_eq!(negotiator.accept(&id), Err(NegotiationError::UnknownTransfer(id.clone())));

        negotiator.handle_request(&alice, TransferRequest { transfer_id: TransferId::new(), ..request });
        let pending_id = negotiator.incoming_requests()[0].request.transfer_id.clone();
        assert!(negotiator.cancel(&pending_id, None));
        assert!(matches!(messenger.sent().last().unwrap().1, TransferMessage::Cancel(_)));
        assert!(negotiator.incoming_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_cancel_resolves_waiter() {
        let messenger = Arc::new(CapturingMessenger::default());
        let negotiator = negotiator(&messenger, 5);
        let bob = PeerId::new("bob");
        let id = TransferId::new();
        let pending = negotiator
            .request_transfer(&bob, id.clone(), metadata(), TransferMethod::Swarm)
            .unwrap();
        let cancel = TransferCancel { transfer_id: id, reason: None };
        negotiator.handle_cancel(&PeerId::new("mallory"), &cancel);
        assert_eq!(negotiator.pending_count(), 1);
        negotiator.handle_cancel(&bob, &cancel);
        assert_eq!(pending.outcome().await, NegotiationOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_answered_request_is_not_surfaced_again() {
        let messenger = Arc::new(CapturingMessenger::default());
        let negotiator = negotiator(&messenger, 5);
        let alice = PeerId::new("alice");
        let now = utils::now_millis();
        let request = TransferRequest {
            transfer_id: TransferId::new(),
            metadata: metadata(),
            sender_id: alice.clone(),
            timestamp: now,
            expires_at: now + 60_000,
            transfer_method: TransferMethod::Direct,
        };
        let rejected = TransferRequest {
            transfer_id: TransferId::new(),
            ..request.clone()
        };

        negotiator.handle_request(&alice, request.clone());
        negotiator.accept(&request.transfer_id).unwrap();
        assert_eq!(negotiator.handle_request(&alice, request), RequestDisposition::Duplicate);

        negotiator.handle_request(&alice, rejected.clone());
        negotiator.reject(&rejected.transfer_id, None).unwrap();
        assert_eq!(negotiator.handle_request(&alice, rejected), RequestDisposition::Duplicate);
        assert!(negotiator.incoming_requests().is_empty());
        assert_eq!(messenger.sent().len(), 2);
    }
}
