//! In-process transport network.
//!
//! Two [`MemoryTransport`]s created from the same [`MemoryNetwork`] link up
//! once each side holds a local description and the other side's description
//! as its remote. Channels created on either side before or after the link get
//! a counterpart on the other side, announced through
//! [`TransportEvent::RemoteChannel`]. Delivery is immediate and ordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use ferry_bus::Payload;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace};

use super::{
    ChannelEvent, DataChannel, PeerTransport, ReadyState, SdpKind, SessionDescription,
    TransportError, TransportEvent, TransportFactory, TransportState,
};
use crate::config::IceConfig;

const SDP_PREFIX: &str = "memory:";

pub struct MemoryChannel {
    label: String,
    state: Mutex<ReadyState>,
    peer: Mutex<Weak<MemoryChannel>>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    buffered: AtomicUsize,
    low_water: Mutex<Option<(usize, Arc<Notify>)>>,
}

impl MemoryChannel {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            state: Mutex::new(ReadyState::Connecting),
            peer: Mutex::new(Weak::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            buffered: AtomicUsize::new(0),
            low_water: Mutex::new(None),
        })
    }

    /// Two linked ends, both still connecting.
    pub fn pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let local = Self::new(label);
        let remote = Self::new(label);
        Self::link(&local, &remote);
        (local, remote)
    }

    /// Two linked ends that have already fired `Open`.
    pub fn open_pair(label: &str) -> (Arc<Self>, Arc<Self>) {
        let (local, remote) = Self::pair(label);
        local.mark_open();
        remote.mark_open();
        (local, remote)
    }

    pub fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *a.peer.lock() = Arc::downgrade(b);
        *b.peer.lock() = Arc::downgrade(a);
    }

    pub fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == ReadyState::Connecting {
            *state = ReadyState::Open;
            let _ = self.events_tx.send(ChannelEvent::Open);
        }
    }

    /// Pretends the outbound buffer holds `amount` bytes. Lowering it to or
    /// below a registered threshold fires the low-water notifier.
    pub fn set_buffered_amount(&self, amount: usize) {
        self.buffered.store(amount, Ordering::SeqCst);
        if let Some((threshold, notify)) = self.low_water.lock().as_ref() {
            if amount <= *threshold {
                notify.notify_one();
            }
        }
    }

    fn deliver(&self, payload: Payload) -> bool {
        if *self.state.lock() != ReadyState::Open {
            return false;
        }
        self.events_tx.send(ChannelEvent::Message(payload)).is_ok()
    }

    fn shut(&self) -> bool {
        let mut state = self.state.lock();
        if *state == ReadyState::Closed {
            return false;
        }
        *state = ReadyState::Closed;
        let _ = self.events_tx.send(ChannelEvent::Closed);
        true
    }

    fn close_now(&self) {
        if !self.shut() {
            return;
        }
        trace!(target = "ferry::transport::memory", label = %self.label, "channel closed");
        if let Some(peer) = self.peer.lock().upgrade() {
            peer.shut();
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock()
    }

    async fn send(&self, payload: &Payload) -> Result<(), TransportError> {
        if self.ready_state() != ReadyState::Open {
            return Err(TransportError::ChannelClosed(self.label.clone()));
        }
        let peer = self.peer.lock().upgrade();
        match peer {
            Some(peer) if peer.deliver(payload.clone()) => Ok(()),
            _ => Err(TransportError::ChannelClosed(self.label.clone())),
        }
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    async fn buffered_amount_low(&self, threshold: usize) -> Option<Arc<Notify>> {
        let mut low_water = self.low_water.lock();
        let notify = low_water
            .as_ref()
            .map(|(_, notify)| notify.clone())
            .unwrap_or_else(|| Arc::new(Notify::new()));
        *low_water = Some((threshold, notify.clone()));
        Some(notify)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_now();
        Ok(())
    }
}

#[derive(Default)]
struct NetworkInner {
    transports: Mutex<HashMap<String, Weak<MemoryTransport>>>,
    link_lock: Mutex<()>,
    next_id: AtomicU64,
}

/// Rendezvous point for memory transports.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<MemoryTransport> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = format!("peer-{id}");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Arc::new_cyclic(|me| MemoryTransport {
            token: token.clone(),
            me: me.clone(),
            network: self.inner.clone(),
            inner: Mutex::new(TransportInner::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        });
        self.inner
            .transports
            .lock()
            .insert(token, Arc::downgrade(&transport));
        transport
    }

    pub fn factory(&self) -> MemoryTransportFactory {
        MemoryTransportFactory {
            network: self.clone(),
            created: Mutex::new(Vec::new()),
            ice_configs: Mutex::new(Vec::new()),
        }
    }
}

#[derive(Default)]
struct TransportInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    channels: Vec<Arc<MemoryChannel>>,
    peer: Option<Weak<MemoryTransport>>,
    applied_candidates: Vec<Value>,
    closed: bool,
}

pub struct MemoryTransport {
    token: String,
    me: Weak<MemoryTransport>,
    network: Arc<NetworkInner>,
    inner: Mutex<TransportInner>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MemoryTransport {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<Value> {
        self.inner.lock().applied_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_linked(&self) -> bool {
        self.inner.lock().peer.is_some()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    fn local_candidate(&self) -> Value {
        json!({
            "candidate": format!("candidate:1 1 udp 2130706431 {} 9 typ host", self.token),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        })
    }

    fn install_local(&self, description: SessionDescription) -> Result<(), TransportError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Negotiation("transport closed".into()));
            }
            inner.local = Some(description);
        }
        self.emit(TransportEvent::LocalCandidate(self.local_candidate()));
        self.try_link();
        Ok(())
    }

    fn try_link(&self) {
        let _guard = self.network.link_lock.lock();
        let remote_token = {
            let inner = self.inner.lock();
            if inner.closed || inner.peer.is_some() || inner.local.is_none() {
                return;
            }
            match inner.remote.as_ref().and_then(|desc| parse_token(&desc.sdp)) {
                Some(token) => token.to_string(),
                None => return,
            }
        };
        let peer = self
            .network
            .transports
            .lock()
            .get(&remote_token)
            .and_then(Weak::upgrade);
        let Some(peer) = peer else {
            return;
        };
        {
            let peer_inner = peer.inner.lock();
            let points_back = peer_inner
                .remote
                .as_ref()
                .and_then(|desc| parse_token(&desc.sdp))
                == Some(self.token.as_str());
            if !points_back
                || peer_inner.local.is_none()
                || peer_inner.peer.is_some()
                || peer_inner.closed
            {
                return;
            }
        }

        let local_channels = {
            let mut inner = self.inner.lock();
            inner.peer = Some(Arc::downgrade(&peer));
            inner.channels.clone()
        };
        let remote_channels = {
            let mut inner = peer.inner.lock();
            inner.peer = Some(self.me.clone());
            inner.channels.clone()
        };
        debug!(
            target = "ferry::transport::memory",
            local = %self.token,
            remote = %peer.token,
            "memory transports linked"
        );
        self.emit(TransportEvent::StateChanged(TransportState::Connected));
        peer.emit(TransportEvent::StateChanged(TransportState::Connected));
        for channel in &local_channels {
            peer.accept_remote_channel(channel);
        }
        for channel in &remote_channels {
            self.accept_remote_channel(channel);
        }
    }

    fn accept_remote_channel(&self, origin: &Arc<MemoryChannel>) {
        let counterpart = MemoryChannel::new(origin.label.clone());
        MemoryChannel::link(origin, &counterpart);
        self.inner.lock().channels.push(counterpart.clone());
        self.emit(TransportEvent::RemoteChannel(counterpart.clone()));
        origin.mark_open();
        counterpart.mark_open();
    }
}

fn parse_token(sdp: &str) -> Option<&str> {
    sdp.strip_prefix(SDP_PREFIX)
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn create_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, TransportError> {
        let channel = MemoryChannel::new(label);
        let peer = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Setup("transport closed".into()));
            }
            inner.channels.push(channel.clone());
            inner.peer.as_ref().and_then(Weak::upgrade)
        };
        if let Some(peer) = peer {
            peer.accept_remote_channel(&channel);
        }
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = SessionDescription::offer(format!("{SDP_PREFIX}{}", self.token));
        self.install_local(offer.clone())?;
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let has_offer = matches!(
            self.inner.lock().remote.as_ref().map(|desc| desc.kind),
            Some(SdpKind::Offer)
        );
        if !has_offer {
            return Err(TransportError::Negotiation(
                "cannot answer without a remote offer".into(),
            ));
        }
        let answer = SessionDescription::answer(format!("{SDP_PREFIX}{}", self.token));
        self.install_local(answer.clone())?;
        Ok(answer)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        if parse_token(&description.sdp).is_none() {
            return Err(TransportError::Negotiation(format!(
                "unrecognised session description: {}",
                description.sdp
            )));
        }
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(TransportError::Negotiation("transport closed".into()));
            }
            inner.remote = Some(description);
        }
        self.try_link();
        Ok(())
    }

    async fn add_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TransportError::Negotiation("transport closed".into()));
        }
        if inner.remote.is_none() {
            return Err(TransportError::Negotiation(
                "remote description not set".into(),
            ));
        }
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TransportError> {
        let (channels, peer) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            (
                std::mem::take(&mut inner.channels),
                inner.peer.as_ref().and_then(Weak::upgrade),
            )
        };
        for channel in channels {
            channel.close_now();
        }
        self.network.transports.lock().remove(&self.token);
        self.emit(TransportEvent::StateChanged(TransportState::Closed));
        if let Some(peer) = peer {
            peer.emit(TransportEvent::StateChanged(TransportState::Disconnected));
        }
        debug!(target = "ferry::transport::memory", token = %self.token, "memory transport closed");
        Ok(())
    }
}

/// Hands out memory transports and remembers what it created, so tests can
/// look inside them afterwards.
pub struct MemoryTransportFactory {
    network: MemoryNetwork,
    created: Mutex<Vec<Arc<MemoryTransport>>>,
    ice_configs: Mutex<Vec<IceConfig>>,
}

impl MemoryTransportFactory {
    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.created.lock().clone()
    }

    /// The ICE configuration passed to each `create` call, oldest first.
    pub fn ice_configs(&self) -> Vec<IceConfig> {
        self.ice_configs.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(&self, ice: &IceConfig) -> Result<Arc<dyn PeerTransport>, TransportError> {
        self.ice_configs.lock().push(ice.clone());
        let transport = self.network.transport();
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn negotiate(
        caller: &MemoryTransport,
        callee: &MemoryTransport,
    ) -> Result<(), TransportError> {
        let offer = caller.create_offer().await?;
        callee.set_remote_description(offer).await?;
        let answer = callee.create_answer().await?;
        caller.set_remote_description(answer).await
    }

    async fn next_remote_channel(
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Arc<dyn DataChannel> {
        loop {
            match events.recv().await.expect("transport event") {
                TransportEvent::RemoteChannel(channel) => return channel,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn channels_created_before_negotiation_reach_the_peer() {
        let network = MemoryNetwork::new();
        let caller = network.transport();
        let callee = network.transport();
        let mut callee_events = callee.take_events().expect("events");

        let control = caller.create_channel("alice-<>-bob").await.expect("channel");
        let mut control_events = control.take_events().expect("channel events");
        assert_eq!(control.ready_state(), ReadyState::Connecting);

        negotiate(&caller, &callee).await.expect("negotiate");
        assert!(caller.is_linked() && callee.is_linked());

        let remote = next_remote_channel(&mut callee_events).await;
        assert_eq!(remote.label(), "alice-<>-bob");
        assert_eq!(remote.ready_state(), ReadyState::Open);
        assert_eq!(control_events.recv().await, Some(ChannelEvent::Open));

        control.send(&Payload::text("hi")).await.expect("send");
        let mut remote_events = remote.take_events().expect("remote events");
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(
            remote_events.recv().await,
            Some(ChannelEvent::Message(Payload::text("hi")))
        );
    }

    #[tokio::test]
    async fn channels_created_after_link_are_announced() {
        let network = MemoryNetwork::new();
        let caller = network.transport();
        let callee = network.transport();
        let mut callee_events = callee.take_events().expect("events");
        negotiate(&caller, &callee).await.expect("negotiate");

        let file = caller
            .create_channel("alice-<>-bob-file-a.bin")
            .await
            .expect("channel");
        assert_eq!(file.ready_state(), ReadyState::Open);
        let remote = next_remote_channel(&mut callee_events).await;
        assert_eq!(remote.label(), "alice-<>-bob-file-a.bin");
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let err = transport
            .add_candidate(json!({"candidate": "x"}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Negotiation(_)));

        transport
            .set_remote_description(SessionDescription::offer("memory:peer-99"))
            .await
            .expect("remote");
        transport
            .add_candidate(json!({"candidate": "x"}))
            .await
            .expect("candidate");
        assert_eq!(transport.applied_candidates().len(), 1);
    }

    #[tokio::test]
    async fn closing_a_transport_closes_the_far_end() {
        let network = MemoryNetwork::new();
        let caller = network.transport();
        let callee = network.transport();
        let mut callee_events = callee.take_events().expect("events");
        let _control = caller.create_channel("a-<>-b").await.expect("channel");
        negotiate(&caller, &callee).await.expect("negotiate");
        let remote = next_remote_channel(&mut callee_events).await;

        caller.close().await.expect("close");
        caller.close().await.expect("second close is a no-op");
        assert_eq!(remote.ready_state(), ReadyState::Closed);

        let mut saw_disconnect = false;
        while let Ok(event) = callee_events.try_recv() {
            if let TransportEvent::StateChanged(TransportState::Disconnected) = event {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn lowering_the_buffer_fires_the_notifier() {
        let (local, _remote) = MemoryChannel::open_pair("x-<>-y");
        local.set_buffered_amount(100_000);
        let notify = local.buffered_amount_low(65_536).await.expect("notifier");
        local.set_buffered_amount(10);
        // notify_one stores a permit, so this resolves immediately.
        notify.notified().await;
        assert_eq!(local.buffered_amount().await, 10);
    }

    #[tokio::test]
    async fn send_on_closed_channel_fails() {
        let (local, remote) = MemoryChannel::open_pair("x-<>-y");
        remote.close().await.expect("close");
        assert_eq!(local.ready_state(), ReadyState::Closed);
        let err = local.send(&Payload::text("late")).await.unwrap_err();
        assert_eq!(err, TransportError::ChannelClosed("x-<>-y".into()));
    }
}
