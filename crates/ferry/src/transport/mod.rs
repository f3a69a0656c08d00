//! Peer transport seam.
//!
//! The core never touches ICE, DTLS or SCTP directly. It drives a
//! [`PeerTransport`] through offer/answer/candidate calls and moves payloads
//! over the [`DataChannel`]s it hands out. [`memory`] wires two transports
//! together in process; the `transport-webrtc` crate provides the real thing.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ferry_bus::Payload;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

use crate::config::IceConfig;

pub mod memory;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("channel '{0}' closed")]
    ChannelClosed(String),
    #[error("send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Offer or answer produced by a transport. The sdp text is opaque to the core
/// and relayed through signaling untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Payload),
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States after which the session on top of the transport is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransportState::Disconnected | TransportState::Failed | TransportState::Closed
        )
    }
}

pub enum TransportEvent {
    /// A locally gathered candidate, ready to be relayed to the remote side.
    LocalCandidate(Value),
    /// A channel opened by the remote side.
    RemoteChannel(Arc<dyn DataChannel>),
    StateChanged(TransportState),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            TransportEvent::RemoteChannel(channel) => {
                f.debug_tuple("RemoteChannel").field(&channel.label()).finish()
            }
            TransportEvent::StateChanged(state) => {
                f.debug_tuple("StateChanged").field(state).finish()
            }
        }
    }
}

/// An ordered, reliable message channel with an outbound buffer counter.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    async fn send(&self, payload: &Payload) -> Result<(), TransportError>;

    /// Bytes queued locally and not yet handed to the network.
    async fn buffered_amount(&self) -> usize;

    /// A notifier fired whenever the buffered amount drops to `threshold` or
    /// below. Channels without such a signal return `None` and callers poll.
    async fn buffered_amount_low(&self, _threshold: usize) -> Option<Arc<Notify>> {
        None
    }

    /// Channel events in delivery order. Handed out once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Creates an answer to the applied remote offer and installs it locally.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    /// Fails when no remote description has been applied yet.
    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError>;

    /// Transport events in emission order. Handed out once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, ice: &IceConfig) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
