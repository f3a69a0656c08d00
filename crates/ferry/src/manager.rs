//! The peer manager: owns every call this device takes part in.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use ferry_bus::{CallId, ConnectionState, EventBus, FerryEvent, LocalBus, Payload, Topic};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncRead;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{FerryConfig, IceConfig, IceServer};
use crate::error::FerryError;
use crate::identity::{DeviceIdentity, DisplayName};
use crate::label::{ChannelKind, ChannelLabel};
use crate::session::{PeerSession, Role, SessionRegistry};
use crate::signaling::{
    CandidateDescriptor, CandidateOrigin, IncomingCall, SessionDescription, SignalingError,
    SignalingPort, Subscription,
};
use crate::transfer::{
    BackpressureGate, FileReceiver, FileSender, TransferAssembler, TransferReport,
};
use crate::transport::{
    ChannelEvent, DataChannel, ReadyState, TransportEvent, TransportFactory,
};

/// Which pump a watched channel feeds.
#[derive(Debug, Clone, Copy)]
enum Watch {
    Control,
    /// Carries the channel's tracking key in its session.
    File(u64),
}

pub struct FerryBuilder {
    signaling: Arc<dyn SignalingPort>,
    transports: Arc<dyn TransportFactory>,
    identity: Option<DeviceIdentity>,
    config: FerryConfig,
    bus: Option<Arc<dyn EventBus>>,
}

impl FerryBuilder {
    pub fn identity(mut self, identity: DeviceIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn config(mut self, config: FerryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Ferry {
        let bus = self.bus.unwrap_or_else(|| Arc::new(LocalBus::new()));
        let receiver = FileReceiver::new(Arc::new(TransferAssembler::new()), bus.clone());
        let auto_reply = self.config.auto_reply;
        Ferry {
            shared: Arc::new(Shared {
                identity: RwLock::new(self.identity.unwrap_or_else(DeviceIdentity::generate)),
                config: RwLock::new(self.config),
                registry: SessionRegistry::new(),
                signaling: self.signaling,
                transports: self.transports,
                bus,
                receiver,
                parked: Mutex::new(HashMap::new()),
                auto_reply: AtomicBool::new(auto_reply),
                calls_started: AtomicBool::new(false),
                incoming: Mutex::new(None),
            }),
        }
    }
}

/// Entry point for the collaborator: start calls, answer them, message and
/// send files over them, and watch what happens on the event bus.
#[derive(Clone)]
pub struct Ferry {
    shared: Arc<Shared>,
}

impl Ferry {
    pub fn builder(
        signaling: Arc<dyn SignalingPort>,
        transports: Arc<dyn TransportFactory>,
    ) -> FerryBuilder {
        FerryBuilder {
            signaling,
            transports,
            identity: None,
            config: FerryConfig::default(),
            bus: None,
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.shared.identity.read().clone()
    }

    pub fn display_name(&self) -> DisplayName {
        self.shared.display_name()
    }

    pub fn bus(&self) -> Arc<dyn EventBus> {
        self.shared.bus.clone()
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<FerryEvent> {
        self.shared.bus.subscribe(topic)
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<FerryEvent> {
        self.shared.bus.subscribe_all()
    }

    /// Starts listening for calls addressed to this device's display name.
    /// Calling it again replaces the listener.
    pub async fn start(&self) -> Result<(), FerryError> {
        let me = self.shared.display_name();
        let calls = self
            .shared
            .signaling
            .subscribe_incoming_calls(me.as_str())
            .await?;
        let handle = tokio::spawn(run_incoming_listener(Arc::downgrade(&self.shared), calls));
        if let Some(previous) = self.shared.incoming.lock().replace(handle) {
            previous.abort();
        }
        info!(target = "ferry::manager", name = %me, "listening for incoming calls");
        Ok(())
    }

    /// Changes the display name. A running incoming-call listener moves to
    /// the new name; calls already in progress keep their labels.
    pub async fn rename(&self, display_name: &str) -> Result<(), FerryError> {
        let display_name = DisplayName::parse(display_name)?;
        self.shared.identity.write().rename(display_name);
        let listening = self.shared.incoming.lock().is_some();
        if listening {
            self.start().await?;
        }
        Ok(())
    }

    /// Calls `callee` and returns once the offer is published. The session
    /// reaches `Connected` later, when the control channel opens.
    pub async fn initiate(&self, callee: &str) -> Result<CallId, FerryError> {
        let callee = DisplayName::parse(callee)?;
        self.shared.initiate(callee).await
    }

    /// Answers an offer parked while auto-reply was off.
    pub async fn reply(&self, call_id: &CallId) -> Result<(), FerryError> {
        let call = self
            .shared
            .parked
            .lock()
            .remove(call_id)
            .ok_or_else(|| FerryError::NoSuchSession(call_id.clone()))?;
        self.shared.answer_incoming(call).await
    }

    /// Discards a parked offer without answering it.
    pub async fn decline(&self, call_id: &CallId) -> Result<(), FerryError> {
        self.shared
            .parked
            .lock()
            .remove(call_id)
            .ok_or_else(|| FerryError::NoSuchSession(call_id.clone()))?;
        if let Err(err) = self.shared.signaling.dispose(call_id).await {
            warn!(
                target = "ferry::manager",
                %call_id,
                error = %err,
                "failed to dispose declined call"
            );
        }
        info!(target = "ferry::manager", %call_id, "declined incoming call");
        Ok(())
    }

    pub fn parked_calls(&self) -> Vec<CallId> {
        let mut ids: Vec<CallId> = self.shared.parked.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn set_auto_reply(&self, enabled: bool) {
        self.shared.auto_reply.store(enabled, Ordering::SeqCst);
    }

    pub fn auto_reply(&self) -> bool {
        self.shared.auto_reply.load(Ordering::SeqCst)
    }

    /// Replaces the ICE servers used for new transports. Rejected once the
    /// first call has been started or answered.
    pub fn set_ice_servers(
        &self,
        servers: Vec<IceServer>,
        candidate_pool_size: Option<u8>,
    ) -> Result<(), FerryError> {
        if self.shared.calls_started.load(Ordering::SeqCst) {
            return Err(FerryError::Config(
                "ICE servers can only be changed before the first call".into(),
            ));
        }
        let mut config = self.shared.config.write();
        config.ice.servers = servers;
        if let Some(pool) = candidate_pool_size {
            config.ice.candidate_pool_size = pool;
        }
        Ok(())
    }

    pub fn ice_config(&self) -> IceConfig {
        self.shared.ice_config()
    }

    pub async fn send(&self, call_id: &CallId, payload: Payload) -> Result<(), FerryError> {
        let session = self.shared.session(call_id)?;
        session.send_control(&payload).await
    }

    pub async fn send_text(&self, call_id: &CallId, text: &str) -> Result<(), FerryError> {
        self.send(call_id, Payload::text(text)).await
    }

    /// Sends `payload` to every call whose control channel is open and returns
    /// how many got it. Calls that are not ready are skipped.
    pub async fn broadcast(&self, payload: Payload) -> usize {
        let mut delivered = 0;
        for session in self.shared.registry.snapshot() {
            if !session.is_control_open().await {
                continue;
            }
            match session.send_control(&payload).await {
                Ok(()) => delivered += 1,
                Err(err) => debug!(
                    target = "ferry::manager",
                    call_id = %session.call_id(),
                    error = %err,
                    "skipping call in broadcast"
                ),
            }
        }
        delivered
    }

    /// Calls whose control channel is currently open.
    pub async fn active_connections(&self) -> Vec<CallId> {
        let mut active = Vec::new();
        for session in self.shared.registry.snapshot() {
            if session.is_control_open().await {
                active.push(session.call_id().clone());
            }
        }
        active.sort();
        active
    }

    pub fn call_ids(&self) -> Vec<CallId> {
        self.shared.registry.call_ids()
    }

    /// Inbound files that have started arriving but are not complete yet.
    pub fn incoming_transfers(&self) -> usize {
        self.shared.receiver.assembler().in_flight()
    }

    pub async fn connection_state(&self, call_id: &CallId) -> Option<ConnectionState> {
        let session = self.shared.registry.get(call_id)?;
        Some(session.state().await)
    }

    pub async fn send_file<R>(
        &self,
        call_id: &CallId,
        file_name: &str,
        file_size: u64,
        reader: R,
    ) -> Result<TransferReport, FerryError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.send_file_with_cancel(call_id, file_name, file_size, reader, CancellationToken::new())
            .await
    }

    /// Streams `file_size` bytes from `reader` over a new file channel of the
    /// call. Resolves after the last chunk has left the channel buffer.
    pub async fn send_file_with_cancel<R>(
        &self,
        call_id: &CallId,
        file_name: &str,
        file_size: u64,
        reader: R,
        cancel: CancellationToken,
    ) -> Result<TransferReport, FerryError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let session = self.shared.session(call_id)?;
        if session.state().await != ConnectionState::Connected {
            return Err(FerryError::ChannelNotOpen(session.control_label().to_string()));
        }
        let label = session.control_label().file(file_name).to_string();
        let channel = session.transport().create_channel(&label).await?;
        let tracked = session.track_file_channel(channel.clone()).await;
        let events = channel.take_events();

        let gate = BackpressureGate::from_config(&self.shared.config.read().transfer);
        let sender = FileSender::new(self.shared.bus.clone(), gate);
        let result = sender
            .send(channel.as_ref(), events, file_name, file_size, reader, &cancel)
            .await;
        session.untrack_file_channel(tracked).await;
        result
    }

    pub async fn send_bytes(
        &self,
        call_id: &CallId,
        file_name: &str,
        content: Bytes,
    ) -> Result<TransferReport, FerryError> {
        self.send_file(call_id, file_name, content.len() as u64, content.as_ref())
            .await
    }

    pub async fn send_path(
        &self,
        call_id: &CallId,
        path: impl AsRef<Path>,
    ) -> Result<TransferReport, FerryError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no file name", path.display()),
                )
            })?;
        let file = tokio::fs::File::open(path).await?;
        let file_size = file.metadata().await?.len();
        self.send_file(call_id, &file_name, file_size, file).await
    }

    /// Tears the call down. Returns false when there was nothing to close.
    pub async fn dispose(&self, call_id: &CallId) -> bool {
        if self.shared.parked.lock().remove(call_id).is_some() {
            debug!(target = "ferry::manager", %call_id, "dropped parked offer");
        }
        self.shared.close_session(call_id, "disposed").await
    }

    /// Closes every call and stops listening for new ones.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.shared.incoming.lock().take() {
            listener.abort();
        }
        self.shared.parked.lock().clear();
        for call_id in self.shared.registry.call_ids() {
            self.shared.close_session(&call_id, "shutdown").await;
        }
    }
}

struct Shared {
    identity: RwLock<DeviceIdentity>,
    config: RwLock<FerryConfig>,
    registry: SessionRegistry,
    signaling: Arc<dyn SignalingPort>,
    transports: Arc<dyn TransportFactory>,
    bus: Arc<dyn EventBus>,
    receiver: FileReceiver,
    parked: Mutex<HashMap<CallId, IncomingCall>>,
    auto_reply: AtomicBool,
    calls_started: AtomicBool,
    incoming: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn display_name(&self) -> DisplayName {
        self.identity.read().display_name.clone()
    }

    fn ice_config(&self) -> IceConfig {
        self.config.read().ice.clone()
    }

    fn session(&self, call_id: &CallId) -> Result<Arc<PeerSession>, FerryError> {
        self.registry
            .get(call_id)
            .ok_or_else(|| FerryError::NoSuchSession(call_id.clone()))
    }

    async fn initiate(self: &Arc<Self>, callee: DisplayName) -> Result<CallId, FerryError> {
        let me = self.display_name();
        self.calls_started.store(true, Ordering::SeqCst);
        let transport = self.transports.create(&self.ice_config()).await?;
        let transport_events = transport.take_events();
        let label = ChannelLabel::control(me.as_str(), callee.as_str());

        let negotiated = async {
            let control = transport.create_channel(&label.to_string()).await?;
            let offer = transport.create_offer().await?;
            let call_id = self
                .signaling
                .create_call(me.as_str(), callee.as_str(), offer)
                .await?;
            Ok::<_, FerryError>((control, call_id))
        }
        .await;
        let (control, call_id) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(err) => {
                warn!(
                    target = "ferry::manager",
                    callee = %callee,
                    error = %err,
                    "failed to start call"
                );
                if let Err(close_err) = transport.close().await {
                    debug!(target = "ferry::manager", error = %close_err, "transport close failed");
                }
                return Err(err);
            }
        };

        let session = PeerSession::new(
            call_id.clone(),
            Role::Caller,
            me.as_str(),
            callee.as_str(),
            transport,
            self.bus.clone(),
        );
        session.set_control_channel(control.clone()).await;
        if let Err(err) = self.registry.insert(session.clone()) {
            session.shutdown().await;
            return Err(err);
        }
        session.transition(ConnectionState::Offering).await;
        info!(target = "ferry::manager", %call_id, callee = %callee, "call offered");

        let subscriptions = async {
            let answers = self.signaling.subscribe_answer(&call_id).await?;
            let candidates = self
                .signaling
                .subscribe_candidates(&call_id, CandidateOrigin::Answerer)
                .await?;
            Ok::<_, SignalingError>((answers, candidates))
        }
        .await;
        let (answers, candidates) = match subscriptions {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!(
                    target = "ferry::manager",
                    %call_id,
                    error = %err,
                    "failed to follow call"
                );
                self.close_session(&call_id, "signaling failure").await;
                return Err(err.into());
            }
        };

        self.start_transport_pump(&session, transport_events);
        self.watch_channel(&session, control, Watch::Control);
        session.spawn(run_answer_pump(
            Arc::downgrade(self),
            session.clone(),
            answers,
        ));
        session.spawn(run_candidate_pump(session.clone(), candidates));
        Ok(call_id)
    }

    async fn answer_incoming(self: &Arc<Self>, call: IncomingCall) -> Result<(), FerryError> {
        let IncomingCall {
            call_id,
            caller_name,
            offer,
        } = call;
        let me = self.display_name();
        self.calls_started.store(true, Ordering::SeqCst);
        let transport = self.transports.create(&self.ice_config()).await?;
        let transport_events = transport.take_events();
        let session = PeerSession::new(
            call_id.clone(),
            Role::Callee,
            me.as_str(),
            caller_name,
            transport.clone(),
            self.bus.clone(),
        );
        if let Err(err) = self.registry.insert(session.clone()) {
            session.shutdown().await;
            return Err(err);
        }

        let negotiated = async {
            session.apply_remote_description(offer).await?;
            let answer = transport.create_answer().await?;
            self.signaling.answer_call(&call_id, answer).await?;
            session.transition(ConnectionState::Answering).await;
            let candidates = self
                .signaling
                .subscribe_candidates(&call_id, CandidateOrigin::Offerer)
                .await?;
            Ok::<_, FerryError>(candidates)
        }
        .await;
        let candidates = match negotiated {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(
                    target = "ferry::manager",
                    %call_id,
                    error = %err,
                    "failed to answer call"
                );
                self.close_session(&call_id, "answer failed").await;
                return Err(err);
            }
        };
        info!(
            target = "ferry::manager",
            %call_id,
            caller = session.remote_name(),
            "call answered"
        );

        self.start_transport_pump(&session, transport_events);
        session.spawn(run_candidate_pump(session.clone(), candidates));
        Ok(())
    }

    fn on_incoming_call(self: &Arc<Self>, call: IncomingCall) {
        if self.registry.contains(&call.call_id) || self.parked.lock().contains_key(&call.call_id) {
            return;
        }
        info!(
            target = "ferry::manager",
            call_id = %call.call_id,
            caller = %call.caller_name,
            "incoming call"
        );
        if self.auto_reply.load(Ordering::SeqCst) {
            let shared = self.clone();
            tokio::spawn(async move {
                let call_id = call.call_id.clone();
                if let Err(err) = shared.answer_incoming(call).await {
                    warn!(
                        target = "ferry::manager",
                        %call_id,
                        error = %err,
                        "auto-reply failed"
                    );
                }
            });
            return;
        }
        let call_id = call.call_id.clone();
        let remote_peer_id = call.caller_name.clone();
        self.parked.lock().insert(call_id.clone(), call);
        self.bus.publish(FerryEvent::IncomingCall {
            call_id,
            remote_peer_id,
        });
    }

    fn start_transport_pump(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    ) {
        match events {
            Some(events) => session.spawn(run_transport_pump(
                Arc::downgrade(self),
                session.clone(),
                events,
            )),
            None => warn!(
                target = "ferry::manager",
                call_id = %session.call_id(),
                "transport events already taken; session will not see remote channels"
            ),
        }
    }

    fn watch_channel(
        self: &Arc<Self>,
        session: &Arc<PeerSession>,
        channel: Arc<dyn DataChannel>,
        watch: Watch,
    ) {
        let Some(events) = channel.take_events() else {
            warn!(
                target = "ferry::manager",
                call_id = %session.call_id(),
                label = channel.label(),
                "channel events already taken"
            );
            return;
        };
        let shared = Arc::downgrade(self);
        match watch {
            Watch::Control => {
                session.spawn(run_control_pump(shared, session.clone(), channel, events))
            }
            Watch::File(tracked) => {
                session.spawn(run_file_pump(shared, session.clone(), channel, tracked, events))
            }
        }
    }

    async fn adopt_channel(self: &Arc<Self>, session: &Arc<PeerSession>, channel: Arc<dyn DataChannel>) {
        let resolved = match session.control_label().resolve(channel.label()) {
            Some(label) => Ok(label),
            None => ChannelLabel::parse(channel.label()),
        };
        let label = match resolved {
            Ok(label) => label,
            Err(err) => {
                warn!(
                    target = "ferry::manager",
                    call_id = %session.call_id(),
                    error = %err,
                    "closing channel with unparseable label"
                );
                if let Err(close_err) = channel.close().await {
                    debug!(target = "ferry::manager", error = %close_err, "channel close failed");
                }
                return;
            }
        };
        if label.remote_name(session.local_name()) != Some(session.remote_name()) {
            warn!(
                target = "ferry::manager",
                call_id = %session.call_id(),
                label = %label,
                "channel label does not name this call's peers"
            );
        }
        debug!(
            target = "ferry::manager",
            call_id = %session.call_id(),
            label = %label,
            kind = ?label.kind(),
            "remote channel announced"
        );
        let watch = match label.kind() {
            ChannelKind::Control => {
                session.set_control_channel(channel.clone()).await;
                Watch::Control
            }
            ChannelKind::File => Watch::File(session.track_file_channel(channel.clone()).await),
        };
        self.watch_channel(session, channel, watch);
    }

    /// Closes a call from inside one of its own tasks, which `shutdown` would abort.
    fn schedule_close(&self, call_id: CallId, reason: &'static str, shared: Weak<Shared>) {
        trace!(target = "ferry::manager", %call_id, reason, "scheduling close");
        tokio::spawn(async move {
            if let Some(shared) = shared.upgrade() {
                shared.close_session(&call_id, reason).await;
            }
        });
    }

    async fn close_session(&self, call_id: &CallId, reason: &str) -> bool {
        let Some(session) = self.registry.remove(call_id) else {
            return false;
        };
        debug!(target = "ferry::manager", %call_id, reason, "closing session");
        session.shutdown().await;
        self.receiver.on_call_closed(session.control_label());
        if let Err(err) = self.signaling.dispose(call_id).await {
            warn!(
                target = "ferry::manager",
                %call_id,
                error = %err,
                "failed to dispose call with signaling"
            );
        }
        self.bus.publish(FerryEvent::ConnectionStateChanged {
            call_id: call_id.clone(),
            state: ConnectionState::Closed,
        });
        info!(target = "ferry::manager", %call_id, reason, "session closed");
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(listener) = self.incoming.get_mut().take() {
            listener.abort();
        }
    }
}

async fn run_incoming_listener(shared: Weak<Shared>, mut calls: Subscription<IncomingCall>) {
    while let Some(call) = calls.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.on_incoming_call(call);
    }
    debug!(target = "ferry::manager", "incoming call listener stopped");
}

async fn run_transport_pump(
    shared: Weak<Shared>,
    session: Arc<PeerSession>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let origin = session.role().candidate_origin();
    while let Some(event) = events.recv().await {
        let Some(strong) = shared.upgrade() else {
            break;
        };
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let descriptor = CandidateDescriptor::new(candidate, origin);
                if let Err(err) = strong
                    .signaling
                    .push_candidate(session.call_id(), descriptor)
                    .await
                {
                    warn!(
                        target = "ferry::manager",
                        call_id = %session.call_id(),
                        error = %err,
                        "failed to publish local candidate"
                    );
                }
            }
            TransportEvent::RemoteChannel(channel) => strong.adopt_channel(&session, channel).await,
            TransportEvent::StateChanged(state) if state.is_terminal() => {
                debug!(
                    target = "ferry::manager",
                    call_id = %session.call_id(),
                    ?state,
                    "transport went away"
                );
                strong.schedule_close(session.call_id().clone(), "transport closed", shared.clone());
                break;
            }
            TransportEvent::StateChanged(state) => trace!(
                target = "ferry::manager",
                call_id = %session.call_id(),
                ?state,
                "transport state"
            ),
        }
    }
}

async fn run_control_pump(
    shared: Weak<Shared>,
    session: Arc<PeerSession>,
    channel: Arc<dyn DataChannel>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    let label = channel.label().to_string();
    if channel.ready_state() == ReadyState::Open {
        session.transition(ConnectionState::Connected).await;
    }
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Open => {
                session.transition(ConnectionState::Connected).await;
            }
            ChannelEvent::Message(payload) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                shared.bus.publish(FerryEvent::MessageReceived {
                    call_id: session.call_id().clone(),
                    channel_label: label.clone(),
                    payload,
                });
            }
            ChannelEvent::Error(reason) => warn!(
                target = "ferry::manager",
                call_id = %session.call_id(),
                label = %label,
                reason = %reason,
                "control channel error"
            ),
            ChannelEvent::Closed => break,
        }
    }
    if let Some(strong) = shared.upgrade() {
        strong.schedule_close(session.call_id().clone(), "control channel closed", shared);
    }
}

async fn run_file_pump(
    shared: Weak<Shared>,
    session: Arc<PeerSession>,
    channel: Arc<dyn DataChannel>,
    tracked: u64,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    let label = channel.label().to_string();
    // Transfers this channel carried; a same-named channel may carry others.
    let mut fed = HashSet::new();
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::Message(payload) => {
                fed.extend(shared.receiver.on_payload(&label, payload));
            }
            ChannelEvent::Open => trace!(target = "ferry::manager", label = %label, "file channel open"),
            ChannelEvent::Error(reason) => warn!(
                target = "ferry::manager",
                label = %label,
                reason = %reason,
                "file channel error"
            ),
            ChannelEvent::Closed => break,
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.receiver.on_channel_closed(&fed);
    }
    session.untrack_file_channel(tracked).await;
}

async fn run_answer_pump(
    shared: Weak<Shared>,
    session: Arc<PeerSession>,
    mut answers: Subscription<SessionDescription>,
) {
    let Some(answer) = answers.recv().await else {
        return;
    };
    answers.unsubscribe();
    match session.apply_remote_description(answer).await {
        Ok(flushed) => debug!(
            target = "ferry::manager",
            call_id = %session.call_id(),
            flushed,
            "answer applied"
        ),
        Err(err) => {
            warn!(
                target = "ferry::manager",
                call_id = %session.call_id(),
                error = %err,
                "failed to apply answer"
            );
            if let Some(strong) = shared.upgrade() {
                strong.schedule_close(session.call_id().clone(), "answer rejected", shared);
            }
        }
    }
}

async fn run_candidate_pump(
    session: Arc<PeerSession>,
    mut candidates: Subscription<CandidateDescriptor>,
) {
    while let Some(candidate) = candidates.recv().await {
        session.add_remote_candidate(candidate).await;
    }
}
