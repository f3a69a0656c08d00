use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Identifier the signaling service assigned to one negotiated call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Offering,
    Answering,
    Connected,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

/// Message body carried on a data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn text(value: impl Into<String>) -> Self {
        Payload::Text(value.into())
    }

    pub fn binary(value: impl Into<Bytes>) -> Self {
        Payload::Binary(value.into())
    }

    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendProgress {
    pub transfer_id: u32,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub sent_chunks: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveProgress {
    pub transfer_id: u32,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub received_chunks: u32,
}

/// A fully reassembled inbound file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedFile {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
    pub content: Bytes,
}

/// Topic a subscriber can filter on. One topic per [`FerryEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    ConnectionStateChanged,
    MessageReceived,
    FileSendProgress,
    FileReceiveProgress,
    FileReceived,
    IncomingCall,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::ConnectionStateChanged,
        Topic::MessageReceived,
        Topic::FileSendProgress,
        Topic::FileReceiveProgress,
        Topic::FileReceived,
        Topic::IncomingCall,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::ConnectionStateChanged => "connection-state-changed",
            Topic::MessageReceived => "message-received",
            Topic::FileSendProgress => "file-send-progress",
            Topic::FileReceiveProgress => "file-receive-progress",
            Topic::FileReceived => "file-received",
            Topic::IncomingCall => "incoming-call",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum FerryEvent {
    ConnectionStateChanged {
        call_id: CallId,
        state: ConnectionState,
    },
    MessageReceived {
        call_id: CallId,
        channel_label: String,
        payload: Payload,
    },
    FileSendProgress(SendProgress),
    FileReceiveProgress(ReceiveProgress),
    FileReceived(ReceivedFile),
    /// Only raised while auto-reply is disabled.
    IncomingCall {
        call_id: CallId,
        remote_peer_id: String,
    },
}

impl FerryEvent {
    pub fn topic(&self) -> Topic {
        match self {
            FerryEvent::ConnectionStateChanged { .. } => Topic::ConnectionStateChanged,
            FerryEvent::MessageReceived { .. } => Topic::MessageReceived,
            FerryEvent::FileSendProgress(_) => Topic::FileSendProgress,
            FerryEvent::FileReceiveProgress(_) => Topic::FileReceiveProgress,
            FerryEvent::FileReceived(_) => Topic::FileReceived,
            FerryEvent::IncomingCall { .. } => Topic::IncomingCall,
        }
    }
}
