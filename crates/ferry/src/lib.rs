//! beach-ferry core: peer-to-peer messaging and file transfer between named
//! devices.
//!
//! A [`Ferry`] negotiates calls through a [`signaling::SignalingPort`], opens
//! peer transports through a [`transport::TransportFactory`] and reports
//! everything that happens on a [`ferry_bus::EventBus`]. Each call carries one
//! control channel for messages and one short-lived channel per file.

pub mod config;
pub mod error;
pub mod identity;
pub mod label;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod signaling;
pub mod transfer;
pub mod transport;

pub use config::{FerryConfig, IceConfig, IceServer, TransferConfig};
pub use error::FerryError;
pub use ferry_bus::{
    CallId, ConnectionState, EventBus, FerryEvent, LocalBus, Payload, ReceiveProgress,
    ReceivedFile, SendProgress, Topic,
};
pub use identity::{DeviceIdentity, DisplayName, ValidationError};
pub use label::{ChannelKind, ChannelLabel};
pub use manager::{Ferry, FerryBuilder};
pub use transfer::TransferReport;
