//! WebRTC implementation of the ferry transport seam, built on `webrtc-rs`.
//!
//! Every callback the peer connection and its data channels fire is turned into
//! an event on an unbounded channel, so the core sees the same ordered streams
//! it gets from the in-memory transport.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use ferry::config::IceConfig;
use ferry::transport::{
    ChannelEvent, DataChannel, PeerTransport, ReadyState, SdpKind, SessionDescription,
    TransportError, TransportEvent, TransportFactory, TransportState,
};
use ferry_bus::Payload;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

fn setup_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn negotiation_error(err: impl std::fmt::Display) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

pub fn rtc_configuration(ice: &IceConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice
            .servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_candidate_pool_size: ice.candidate_pool_size,
        ..Default::default()
    }
}

pub fn transport_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

pub fn ready_state(state: RTCDataChannelState) -> ReadyState {
    match state {
        RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
            ReadyState::Connecting
        }
        RTCDataChannelState::Open => ReadyState::Open,
        RTCDataChannelState::Closing => ReadyState::Closing,
        RTCDataChannelState::Closed => ReadyState::Closed,
    }
}

fn candidate_json(candidate: &RTCIceCandidate) -> Option<Value> {
    let init = match candidate.to_json() {
        Ok(init) => init,
        Err(err) => {
            warn!(target = "ferry::transport::webrtc", error = %err, "failed to encode local candidate");
            return None;
        }
    };
    match serde_json::to_value(init) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target = "ferry::transport::webrtc", error = %err, "failed to encode local candidate");
            None
        }
    }
}

fn message_payload(msg: DataChannelMessage) -> Payload {
    if msg.is_string {
        Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
    } else {
        Payload::Binary(msg.data)
    }
}

/// A reliable, ordered `RTCDataChannel`.
pub struct WebRtcChannel {
    label: String,
    inner: Arc<RTCDataChannel>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    low_water: Mutex<Option<(usize, Arc<Notify>)>>,
}

impl WebRtcChannel {
    pub fn wrap(inner: Arc<RTCDataChannel>) -> Arc<Self> {
        let label = inner.label().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let tx = events_tx.clone();
            let label = label.clone();
            inner.on_open(Box::new(move || {
                Box::pin(async move {
                    debug!(target = "ferry::transport::webrtc", channel = %label, "data channel open");
                    let _ = tx.send(ChannelEvent::Open);
                })
            }));
        }

        {
            let tx = events_tx.clone();
            let label = label.clone();
            inner.on_close(Box::new(move || {
                let tx = tx.clone();
                let label = label.clone();
                Box::pin(async move {
                    debug!(target = "ferry::transport::webrtc", channel = %label, "data channel closed");
                    let _ = tx.send(ChannelEvent::Closed);
                })
            }));
        }

        {
            let tx = events_tx.clone();
            let label = label.clone();
            inner.on_error(Box::new(move |err| {
                let tx = tx.clone();
                let label = label.clone();
                Box::pin(async move {
                    warn!(
                        target = "ferry::transport::webrtc",
                        channel = %label,
                        error = %err,
                        "data channel error"
                    );
                    let _ = tx.send(ChannelEvent::Error(err.to_string()));
                })
            }));
        }

        {
            let tx = events_tx;
            inner.on_message(Box::new(move |msg: DataChannelMessage| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(ChannelEvent::Message(message_payload(msg)));
                })
            }));
        }

        Arc::new(Self {
            label,
            inner,
            events_rx: Mutex::new(Some(events_rx)),
            low_water: Mutex::new(None),
        })
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        ready_state(self.inner.ready_state())
    }

    async fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
            return Err(TransportError::ChannelClosed(self.label.clone()));
        }
        let sent = match payload {
            Payload::Text(text) => self.inner.send_text(text.clone()).await,
            Payload::Binary(bytes) => self.inner.send(bytes).await,
        };
        sent.map(|written| {
            trace!(target = "ferry::transport::webrtc", channel = %self.label, written, "sent");
        })
        .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.inner.buffered_amount().await
    }

    async fn buffered_amount_low(&self, threshold: usize) -> Option<Arc<Notify>> {
        let notify = {
            let mut low_water = self.low_water.lock();
            match low_water.as_ref() {
                Some((current, notify)) if *current == threshold => return Some(notify.clone()),
                _ => {}
            }
            let notify = Arc::new(Notify::new());
            *low_water = Some((threshold, notify.clone()));
            notify
        };
        self.inner.set_buffered_amount_low_threshold(threshold).await;
        let fired = notify.clone();
        self.inner
            .on_buffered_amount_low(Box::new(move || {
                let fired = fired.clone();
                Box::pin(async move {
                    fired.notify_one();
                })
            }))
            .await;
        Some(notify)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.ready_state() == ReadyState::Closed {
            return Ok(());
        }
        self.inner
            .close()
            .await
            .map_err(|err| TransportError::ChannelClosed(format!("{}: {err}", self.label)))
    }
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    pub async fn new(ice: &IceConfig) -> Result<Arc<Self>, TransportError> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(ice))
                .await
                .map_err(setup_error)?,
        );
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        {
            let tx = events_tx.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();
                Box::pin(async move {
                    // `None` marks the end of gathering.
                    if let Some(value) = candidate.as_ref().and_then(candidate_json) {
                        let _ = tx.send(TransportEvent::LocalCandidate(value));
                    }
                })
            }));
        }

        {
            let tx = events_tx.clone();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let tx = tx.clone();
                Box::pin(async move {
                    debug!(
                        target = "ferry::transport::webrtc",
                        channel = %dc.label(),
                        "remote data channel announced"
                    );
                    let channel: Arc<dyn DataChannel> = WebRtcChannel::wrap(dc);
                    let _ = tx.send(TransportEvent::RemoteChannel(channel));
                })
            }));
        }

        {
            let tx = events_tx;
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let tx = tx.clone();
                Box::pin(async move {
                    debug!(target = "ferry::transport::webrtc", state = ?state, "peer connection state changed");
                    let _ = tx.send(TransportEvent::StateChanged(transport_state(state)));
                })
            }));
        }

        Ok(Arc::new(Self {
            pc,
            events_rx: Mutex::new(Some(events_rx)),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(setup_error)?;
        Ok(WebRtcChannel::wrap(dc))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(negotiation_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(negotiation_error)?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation_error)
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        if self.pc.remote_description().await.is_none() {
            return Err(TransportError::Negotiation(
                "remote description not set".into(),
            ));
        }
        let init: RTCIceCandidateInit =
            serde_json::from_value(candidate).map_err(negotiation_error)?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_error)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc.close().await.map_err(setup_error)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, ice: &IceConfig) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport: Arc<dyn PeerTransport> = WebRtcTransport::new(ice).await?;
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ferry::config::IceServer;
    use serde_json::json;
    use test_timeout::tokio_timeout_test;

    #[test]
    fn ice_config_maps_credentials_and_pool_size() {
        let ice = IceConfig {
            servers: vec![
                IceServer::new(["stun:stun1.l.google.com:19302"]),
                IceServer::new(["turn:relay.example:3478"]).with_credentials("ferry", "secret"),
            ],
            candidate_pool_size: 3,
        };
        let config = rtc_configuration(&ice);
        assert_eq!(config.ice_candidate_pool_size, 3);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec!["stun:stun1.l.google.com:19302"]);
        assert!(config.ice_servers[0].username.is_empty());
        assert_eq!(config.ice_servers[1].username, "ferry");
        assert_eq!(config.ice_servers[1].credential, "secret");
    }

    #[test]
    fn terminal_peer_states_map_to_terminal_transport_states() {
        for state in [
            RTCPeerConnectionState::Disconnected,
            RTCPeerConnectionState::Failed,
            RTCPeerConnectionState::Closed,
        ] {
            assert!(transport_state(state).is_terminal(), "{state:?}");
        }
        assert_eq!(
            transport_state(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            transport_state(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
    }

    #[test]
    fn channel_states_map_one_to_one() {
        assert_eq!(ready_state(RTCDataChannelState::Unspecified), ReadyState::Connecting);
        assert_eq!(ready_state(RTCDataChannelState::Open), ReadyState::Open);
        assert_eq!(ready_state(RTCDataChannelState::Closing), ReadyState::Closing);
        assert_eq!(ready_state(RTCDataChannelState::Closed), ReadyState::Closed);
    }

    #[test]
    fn text_messages_stay_text() {
        let text = message_payload(DataChannelMessage {
            is_string: true,
            data: Bytes::from_static(b"hi"),
        });
        assert_eq!(text, Payload::text("hi"));
        let raw = message_payload(DataChannelMessage {
            is_string: false,
            data: Bytes::from_static(&[0, 1]),
        });
        assert_eq!(raw, Payload::binary(vec![0u8, 1]));
    }

    #[tokio_timeout_test(20)]
    async fn offer_carries_a_data_section() {
        let transport = WebRtcTransport::new(&IceConfig {
            servers: Vec::new(),
            candidate_pool_size: 0,
        })
        .await
        .expect("transport");
        let channel = transport
            .create_channel("alice-<>-bob")
            .await
            .expect("channel");
        assert_eq!(channel.label(), "alice-<>-bob");
        assert_eq!(channel.ready_state(), ReadyState::Connecting);

        let offer = transport.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=application"));

        transport.close().await.expect("close");
        transport.close().await.expect("second close is a no-op");
    }

    #[tokio_timeout_test(20)]
    async fn candidates_need_a_remote_description() {
        let transport = WebRtcTransport::new(&IceConfig {
            servers: Vec::new(),
            candidate_pool_size: 0,
        })
        .await
        .expect("transport");
        let err = transport
            .add_candidate(json!({ "candidate": "candidate:1 1 udp 1 127.0.0.1 9 typ host" }))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Negotiation(_)));
        transport.close().await.expect("close");
    }
}
