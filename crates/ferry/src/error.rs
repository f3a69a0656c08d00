use std::io;

use ferry_bus::CallId;
use thiserror::Error;

use crate::identity::ValidationError;
use crate::protocol::FrameError;
use crate::signaling::SignalingError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum FerryError {
    #[error("no session for call {0}")]
    NoSuchSession(CallId),
    #[error("a session for call {0} already exists")]
    SessionExists(CallId),
    #[error("channel '{0}' is not open")]
    ChannelNotOpen(String),
    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(#[from] SignalingError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed frame: {0}")]
    Frame(#[from] FrameError),
    #[error("invalid display name: {0}")]
    Validation(#[from] ValidationError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(String),
}
