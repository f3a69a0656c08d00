//! Call-document store kept in process memory.
//!
//! Mirrors a hosted document database: one record per call holding the offer,
//! the answer and a candidate list per side. Listeners get what is already
//! recorded first and then every later addition.
//!
//! Disposing a call drops its record. Only the id is remembered, in a bounded
//! history, so [`MemorySignaling::is_disposed`] keeps answering for recent
//! calls without the store growing with every call ever made.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ferry_bus::CallId;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{
    CandidateDescriptor, CandidateOrigin, IncomingCall, SessionDescription, SignalingError,
    SignalingPort, Subscription,
};

struct CallRecord {
    caller: String,
    callee: String,
    offer: SessionDescription,
    answer: Option<SessionDescription>,
    offer_candidates: Vec<Value>,
    answer_candidates: Vec<Value>,
    answer_listeners: HashMap<u64, mpsc::UnboundedSender<SessionDescription>>,
    candidate_listeners: HashMap<u64, (CandidateOrigin, mpsc::UnboundedSender<CandidateDescriptor>)>,
}

impl CallRecord {
    fn candidates(&self, origin: CandidateOrigin) -> &[Value] {
        match origin {
            CandidateOrigin::Offerer => &self.offer_candidates,
            CandidateOrigin::Answerer => &self.answer_candidates,
        }
    }
}

#[derive(Default)]
struct State {
    calls: HashMap<CallId, CallRecord>,
    // Creation order, for deterministic replay.
    order: Vec<CallId>,
    incoming_listeners: HashMap<u64, (String, mpsc::UnboundedSender<IncomingCall>)>,
    disposed: VecDeque<CallId>,
}

/// Disposed call ids remembered for [`MemorySignaling::is_disposed`].
pub const DISPOSED_HISTORY: usize = 256;

impl State {
    fn remember_disposed(&mut self, call_id: CallId) {
        if self.disposed.len() == DISPOSED_HISTORY {
            self.disposed.pop_front();
        }
        self.disposed.push_back(call_id);
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_listener: AtomicU64,
    offline: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemorySignaling {
    inner: Arc<Inner>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every request fails with [`SignalingError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    /// `Some(false)` for a live call, `Some(true)` for one disposed recently
    /// enough to still be in the history, `None` otherwise.
    pub fn is_disposed(&self, call_id: &CallId) -> Option<bool> {
        let state = self.inner.state.lock();
        if state.calls.contains_key(call_id) {
            Some(false)
        } else if state.disposed.contains(call_id) {
            Some(true)
        } else {
            None
        }
    }

    /// Calls still holding a record.
    pub fn live_calls(&self) -> usize {
        self.inner.state.lock().calls.len()
    }

    pub fn call_ids(&self) -> Vec<CallId> {
        self.inner.state.lock().order.clone()
    }

    pub fn candidates(&self, call_id: &CallId, origin: CandidateOrigin) -> Vec<Value> {
        self.inner
            .state
            .lock()
            .calls
            .get(call_id)
            .map(|record| record.candidates(origin).to_vec())
            .unwrap_or_default()
    }

    /// Live answer and candidate listeners attached to a call.
    pub fn listener_count(&self, call_id: &CallId) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .get(call_id)
            .map(|record| record.answer_listeners.len() + record.candidate_listeners.len())
            .unwrap_or(0)
    }

    fn ensure_online(&self) -> Result<(), SignalingError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(SignalingError::Unavailable("signaling service offline".into()));
        }
        Ok(())
    }

    fn next_listener_id(&self) -> u64 {
        self.inner.next_listener.fetch_add(1, Ordering::Relaxed)
    }

    fn detach_call_listener(inner: &Weak<Inner>, call_id: &CallId, listener: u64) {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        if let Some(record) = state.calls.get_mut(call_id) {
            record.answer_listeners.remove(&listener);
            record.candidate_listeners.remove(&listener);
        }
    }
}

#[async_trait]
impl SignalingPort for MemorySignaling {
    async fn create_call(
        &self,
        caller_name: &str,
        callee_name: &str,
        offer: SessionDescription,
    ) -> Result<CallId, SignalingError> {
        self.ensure_online()?;
        let call_id = CallId::new(Uuid::new_v4().simple().to_string());
        let mut state = self.inner.state.lock();
        let announcement = IncomingCall {
            call_id: call_id.clone(),
            caller_name: caller_name.to_string(),
            offer: offer.clone(),
        };
        state.incoming_listeners.retain(|_, (name, tx)| {
            name.as_str() != callee_name || tx.send(announcement.clone()).is_ok()
        });
        state.calls.insert(
            call_id.clone(),
            CallRecord {
                caller: caller_name.to_string(),
                callee: callee_name.to_string(),
                offer,
                answer: None,
                offer_candidates: Vec::new(),
                answer_candidates: Vec::new(),
                answer_listeners: HashMap::new(),
                candidate_listeners: HashMap::new(),
            },
        );
        state.order.push(call_id.clone());
        debug!(
            target = "ferry::signaling::memory",
            %call_id,
            caller = caller_name,
            callee = callee_name,
            "call created"
        );
        Ok(call_id)
    }

    async fn answer_call(
        &self,
        call_id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.ensure_online()?;
        let mut state = self.inner.state.lock();
        let record = state
            .calls
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::UnknownCall(call_id.clone()))?;
        record
            .answer_listeners
            .retain(|_, tx| tx.send(answer.clone()).is_ok());
        record.answer = Some(answer);
        debug!(target = "ferry::signaling::memory", %call_id, "call answered");
        Ok(())
    }

    async fn push_candidate(
        &self,
        call_id: &CallId,
        candidate: CandidateDescriptor,
    ) -> Result<(), SignalingError> {
        self.ensure_online()?;
        let mut state = self.inner.state.lock();
        let record = state
            .calls
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::UnknownCall(call_id.clone()))?;
        let origin = candidate.origin();
        record
            .candidate_listeners
            .retain(|_, (wanted, tx)| *wanted != origin || tx.send(candidate.clone()).is_ok());
        match origin {
            CandidateOrigin::Offerer => record.offer_candidates.push(candidate.candidate),
            CandidateOrigin::Answerer => record.answer_candidates.push(candidate.candidate),
        }
        trace!(target = "ferry::signaling::memory", %call_id, ?origin, "candidate stored");
        Ok(())
    }

    async fn subscribe_incoming_calls(
        &self,
        my_name: &str,
    ) -> Result<Subscription<IncomingCall>, SignalingError> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.next_listener_id();
        {
            let mut state = self.inner.state.lock();
            for call_id in &state.order {
                let Some(record) = state.calls.get(call_id) else {
                    continue;
                };
                if record.callee == my_name && record.answer.is_none() {
                    let _ = tx.send(IncomingCall {
                        call_id: call_id.clone(),
                        caller_name: record.caller.clone(),
                        offer: record.offer.clone(),
                    });
                }
            }
            state
                .incoming_listeners
                .insert(listener, (my_name.to_string(), tx));
        }
        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                inner.state.lock().incoming_listeners.remove(&listener);
            }
        }))
    }

    async fn subscribe_answer(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<SessionDescription>, SignalingError> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.next_listener_id();
        {
            let mut state = self.inner.state.lock();
            let record = state
                .calls
                .get_mut(call_id)
                .ok_or_else(|| SignalingError::UnknownCall(call_id.clone()))?;
            if let Some(answer) = &record.answer {
                let _ = tx.send(answer.clone());
            }
            record.answer_listeners.insert(listener, tx);
        }
        let inner = Arc::downgrade(&self.inner);
        let call_id = call_id.clone();
        Ok(Subscription::new(rx, move || {
            Self::detach_call_listener(&inner, &call_id, listener)
        }))
    }

    async fn subscribe_candidates(
        &self,
        call_id: &CallId,
        origin: CandidateOrigin,
    ) -> Result<Subscription<CandidateDescriptor>, SignalingError> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = self.next_listener_id();
        {
            let mut state = self.inner.state.lock();
            let record = state
                .calls
                .get_mut(call_id)
                .ok_or_else(|| SignalingError::UnknownCall(call_id.clone()))?;
            for candidate in record.candidates(origin) {
                let _ = tx.send(CandidateDescriptor::new(candidate.clone(), origin));
            }
            record.candidate_listeners.insert(listener, (origin, tx));
        }
        let inner = Arc::downgrade(&self.inner);
        let call_id = call_id.clone();
        Ok(Subscription::new(rx, move || {
            Self::detach_call_listener(&inner, &call_id, listener)
        }))
    }

    async fn dispose(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.ensure_online()?;
        let mut state = self.inner.state.lock();
        if state.calls.remove(call_id).is_none() {
            if state.disposed.contains(call_id) {
                return Ok(());
            }
            return Err(SignalingError::UnknownCall(call_id.clone()));
        }
        // Dropping the record drops its listener senders, ending those streams.
        state.order.retain(|id| id != call_id);
        state.remember_disposed(call_id.clone());
        debug!(target = "ferry::signaling::memory", %call_id, "call disposed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer() -> SessionDescription {
        SessionDescription::offer("memory:peer-0")
    }

    #[tokio::test]
    async fn incoming_calls_replay_unanswered_offers() {
        let signaling = MemorySignaling::new();
        let early = signaling
            .create_call("alice", "bob", offer())
            .await
            .expect("create");
        let answered = signaling
            .create_call("carol", "bob", offer())
            .await
            .expect("create");
        signaling
            .answer_call(&answered, SessionDescription::answer("memory:peer-1"))
            .await
            .expect("answer");

        let mut incoming = signaling
            .subscribe_incoming_calls("bob")
            .await
            .expect("subscribe");
        let first = incoming.recv().await.expect("replayed call");
        assert_eq!(first.call_id, early);
        assert_eq!(first.caller_name, "alice");

        let late = signaling
            .create_call("dave", "bob", offer())
            .await
            .expect("create");
        signaling
            .create_call("dave", "erin", offer())
            .await
            .expect("create");
        assert_eq!(incoming.recv().await.expect("live call").call_id, late);
        assert!(incoming.try_recv().is_none());
    }

    #[tokio::test]
    async fn answer_subscription_sees_existing_answer() {
        let signaling = MemorySignaling::new();
        let call_id = signaling
            .create_call("alice", "bob", offer())
            .await
            .expect("create");
        signaling
            .answer_call(&call_id, SessionDescription::answer("memory:peer-1"))
            .await
            .expect("answer");
        let mut answers = signaling.subscribe_answer(&call_id).await.expect("subscribe");
        assert_eq!(
            answers.recv().await,
            Some(SessionDescription::answer("memory:peer-1"))
        );
    }

    #[tokio::test]
    async fn candidates_are_split_by_origin_and_replayed_in_order() {
        let signaling = MemorySignaling::new();
        let call_id = signaling
            .create_call("alice", "bob", offer())
            .await
            .expect("create");
        for n in 0..3 {
            signaling
                .push_candidate(
                    &call_id,
                    CandidateDescriptor::new(json!({ "n": n }), CandidateOrigin::Offerer),
                )
                .await
                .expect("push");
        }
        signaling
            .push_candidate(
                &call_id,
                CandidateDescriptor::new(json!({ "n": 99 }), CandidateOrigin::Answerer),
            )
            .await
            .expect("push");

        let mut offer_side = signaling
            .subscribe_candidates(&call_id, CandidateOrigin::Offerer)
            .await
            .expect("subscribe");
        for n in 0..3 {
            let candidate = offer_side.recv().await.expect("candidate");
            assert_eq!(candidate.candidate, json!({ "n": n }));
            assert!(candidate.from_offerer);
        }
        assert!(offer_side.try_recv().is_none());
        assert_eq!(
            signaling.candidates(&call_id, CandidateOrigin::Answerer),
            vec![json!({ "n": 99 })]
        );
    }

    #[tokio::test]
    async fn dispose_marks_call_and_drops_listeners() {
        let signaling = MemorySignaling::new();
        let call_id = signaling
            .create_call("alice", "bob", offer())
            .await
            .expect("create");
        let mut answers = signaling.subscribe_answer(&call_id).await.expect("subscribe");
        let _candidates = signaling
            .subscribe_candidates(&call_id, CandidateOrigin::Answerer)
            .await
            .expect("subscribe");
        assert_eq!(signaling.listener_count(&call_id), 2);

        signaling.dispose(&call_id).await.expect("dispose");
        assert_eq!(signaling.is_disposed(&call_id), Some(true));
        assert_eq!(signaling.listener_count(&call_id), 0);
        assert_eq!(answers.recv().await, None);
        assert_eq!(signaling.live_calls(), 0);
        assert!(signaling.call_ids().is_empty());
        // The peer disposes the same call on its own teardown.
        signaling.dispose(&call_id).await.expect("second dispose");

        let mut incoming = signaling
            .subscribe_incoming_calls("bob")
            .await
            .expect("subscribe");
        assert!(incoming.try_recv().is_none());
    }

    #[tokio::test]
    async fn disposed_history_is_bounded() {
        let signaling = MemorySignaling::new();
        let first = signaling
            .create_call("alice", "bob", offer())
            .await
            .expect("create");
        signaling.dispose(&first).await.expect("dispose");

        for _ in 0..DISPOSED_HISTORY {
            let call_id = signaling
                .create_call("alice", "bob", offer())
                .await
                .expect("create");
            signaling.dispose(&call_id).await.expect("dispose");
        }

        assert_eq!(signaling.live_calls(), 0);
        assert!(signaling.call_ids().is_empty());
        assert_eq!(signaling.is_disposed(&first), None);
        assert_eq!(
            signaling.dispose(&first).await,
            Err(SignalingError::UnknownCall(first.clone()))
        );
    }

    #[tokio::test]
    async fn dropping_a_subscription_detaches_it() {
        let signaling = MemorySignaling::new();
        let call_id = signaling
            .create_call("alice", "bob", offer())
            .await
            .expect("create");
        let answers = signaling.subscribe_answer(&call_id).await.expect("subscribe");
        assert_eq!(signaling.listener_count(&call_id), 1);
        drop(answers);
        assert_eq!(signaling.listener_count(&call_id), 0);
    }

    #[tokio::test]
    async fn offline_mode_fails_every_request() {
        let signaling = MemorySignaling::new();
        signaling.set_offline(true);
        let err = signaling
            .create_call("alice", "bob", offer())
            .await
            .unwrap_err();
        assert!(matches!(err, SignalingError::Unavailable(_)));
        assert!(signaling.subscribe_incoming_calls("bob").await.is_err());

        signaling.set_offline(false);
        assert!(signaling.create_call("alice", "bob", offer()).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_calls_are_reported() {
        let signaling = MemorySignaling::new();
        let missing = CallId::from("missing");
        assert_eq!(
            signaling.dispose(&missing).await,
            Err(SignalingError::UnknownCall(missing.clone()))
        );
    }
}
