//! Signaling seam: how offers, answers and candidates travel between peers
//! before a direct channel exists.

use std::fmt;

use async_trait::async_trait;
use ferry_bus::CallId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

pub use crate::transport::{SdpKind, SessionDescription};

pub mod memory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("{0}")]
    Unavailable(String),
    #[error("unknown call {0}")]
    UnknownCall(CallId),
}

/// Which side of a call produced a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateOrigin {
    Offerer,
    Answerer,
}

impl CandidateOrigin {
    pub fn is_offerer(self) -> bool {
        matches!(self, CandidateOrigin::Offerer)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    /// Transport-specific candidate blob, relayed verbatim.
    pub candidate: Value,
    #[serde(rename = "isFromOfferer")]
    pub from_offerer: bool,
}

impl CandidateDescriptor {
    pub fn new(candidate: Value, origin: CandidateOrigin) -> Self {
        Self {
            candidate,
            from_offerer: origin.is_offerer(),
        }
    }

    pub fn origin(&self) -> CandidateOrigin {
        if self.from_offerer {
            CandidateOrigin::Offerer
        } else {
            CandidateOrigin::Answerer
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller_name: String,
    pub offer: SessionDescription,
}

/// A live listener on the signaling service. Dropping it detaches the
/// listener; [`Subscription::unsubscribe`] does the same explicitly.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Subscription<T> {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<T>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// `None` once the service stops feeding this listener.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.cancel.is_some())
            .finish()
    }
}

/// Relay for call setup. Every method may fail with
/// [`SignalingError::Unavailable`]; that failure concerns one call only.
#[async_trait]
pub trait SignalingPort: Send + Sync {
    async fn create_call(
        &self,
        caller_name: &str,
        callee_name: &str,
        offer: SessionDescription,
    ) -> Result<CallId, SignalingError>;

    async fn answer_call(
        &self,
        call_id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn push_candidate(
        &self,
        call_id: &CallId,
        candidate: CandidateDescriptor,
    ) -> Result<(), SignalingError>;

    /// Unanswered calls addressed to `my_name`, including ones created before
    /// the subscription.
    async fn subscribe_incoming_calls(
        &self,
        my_name: &str,
    ) -> Result<Subscription<IncomingCall>, SignalingError>;

    /// Yields the answer once, immediately if it is already there.
    async fn subscribe_answer(
        &self,
        call_id: &CallId,
    ) -> Result<Subscription<SessionDescription>, SignalingError>;

    /// Candidates pushed by `origin`, existing ones first.
    async fn subscribe_candidates(
        &self,
        call_id: &CallId,
        origin: CandidateOrigin,
    ) -> Result<Subscription<CandidateDescriptor>, SignalingError>;

    async fn dispose(&self, call_id: &CallId) -> Result<(), SignalingError>;
}
