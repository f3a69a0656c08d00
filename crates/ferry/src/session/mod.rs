//! One negotiated call and the state it owns.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ferry_bus::{CallId, ConnectionState, EventBus, FerryEvent, Payload};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::FerryError;
use crate::label::ChannelLabel;
use crate::signaling::{CandidateDescriptor, CandidateOrigin, SessionDescription};
use crate::transport::{DataChannel, PeerTransport, ReadyState, TransportError};

mod registry;

pub use registry::SessionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Caller,
    Callee,
}

impl Role {
    /// Which side this role's local candidates are tagged with.
    pub fn candidate_origin(self) -> CandidateOrigin {
        match self {
            Role::Caller => CandidateOrigin::Offerer,
            Role::Callee => CandidateOrigin::Answerer,
        }
    }

    fn negotiating_state(self) -> ConnectionState {
        match self {
            Role::Caller => ConnectionState::Offering,
            Role::Callee => ConnectionState::Answering,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Caller => f.write_str("caller"),
            Role::Callee => f.write_str("callee"),
        }
    }
}

struct SessionInner {
    state: ConnectionState,
    control: Option<Arc<dyn DataChannel>>,
    // Keyed by a per-session counter; two sends of one file share a label.
    file_channels: HashMap<u64, Arc<dyn DataChannel>>,
    next_file_channel: u64,
    pending_candidates: VecDeque<CandidateDescriptor>,
    remote_description_applied: bool,
}

/// A call between this device and one remote peer.
///
/// Every mutation goes through the session's async mutex, so work for one
/// call id is serialised even when it comes from several pumps at once.
/// Background tasks spawned for the session are aborted by [`shutdown`].
///
/// [`shutdown`]: PeerSession::shutdown
pub struct PeerSession {
    call_id: CallId,
    role: Role,
    local_name: String,
    remote_name: String,
    control_label: ChannelLabel,
    transport: Arc<dyn PeerTransport>,
    bus: Arc<dyn EventBus>,
    inner: AsyncMutex<SessionInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerSession {
    pub fn new(
        call_id: CallId,
        role: Role,
        local_name: impl Into<String>,
        remote_name: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        bus: Arc<dyn EventBus>,
    ) -> Arc<Self> {
        let local_name = local_name.into();
        let remote_name = remote_name.into();
        let control_label = match role {
            Role::Caller => ChannelLabel::control(local_name.clone(), remote_name.clone()),
            Role::Callee => ChannelLabel::control(remote_name.clone(), local_name.clone()),
        };
        Arc::new(Self {
            call_id,
            role,
            local_name,
            remote_name,
            control_label,
            transport,
            bus,
            inner: AsyncMutex::new(SessionInner {
                state: ConnectionState::Idle,
                control: None,
                file_channels: HashMap::new(),
                next_file_channel: 0,
                pending_candidates: VecDeque::new(),
                remote_description_applied: false,
            }),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn control_label(&self) -> &ChannelLabel {
        &self.control_label
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Moves the session forward and publishes the change. Returns whether the
    /// state changed; repeated and backwards moves are ignored.
    pub async fn transition(&self, next: ConnectionState) -> bool {
        let mut inner = self.inner.lock().await;
        let current = inner.state;
        let allowed = match (current, next) {
            (current, _) if current.is_terminal() => false,
            (_, ConnectionState::Closed) => true,
            (ConnectionState::Idle, state) => state == self.role.negotiating_state(),
            (ConnectionState::Offering | ConnectionState::Answering, ConnectionState::Connected) => {
                true
            }
            _ => false,
        };
        if !allowed {
            if current != next {
                trace!(
                    target = "ferry::session",
                    call_id = %self.call_id,
                    from = ?current,
                    to = ?next,
                    "ignoring state transition"
                );
            }
            return false;
        }
        inner.state = next;
        drop(inner);
        debug!(
            target = "ferry::session",
            call_id = %self.call_id,
            role = %self.role,
            from = ?current,
            to = ?next,
            "connection state changed"
        );
        if next != ConnectionState::Closed {
            self.bus.publish(FerryEvent::ConnectionStateChanged {
                call_id: self.call_id.clone(),
                state: next,
            });
        }
        true
    }

    pub async fn set_control_channel(&self, channel: Arc<dyn DataChannel>) {
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.control.replace(channel) {
            warn!(
                target = "ferry::session",
                call_id = %self.call_id,
                label = previous.label(),
                "replacing control channel"
            );
        }
    }

    pub async fn control_channel(&self) -> Option<Arc<dyn DataChannel>> {
        self.inner.lock().await.control.clone()
    }

    pub async fn is_control_open(&self) -> bool {
        self.control_channel()
            .await
            .is_some_and(|channel| channel.ready_state() == ReadyState::Open)
    }

    /// Keeps a file channel open until [`untrack_file_channel`] or shutdown.
    /// The returned key identifies this channel even when another one carries
    /// the same label.
    ///
    /// [`untrack_file_channel`]: PeerSession::untrack_file_channel
    pub async fn track_file_channel(&self, channel: Arc<dyn DataChannel>) -> u64 {
        let mut inner = self.inner.lock().await;
        let key = inner.next_file_channel;
        inner.next_file_channel += 1;
        inner.file_channels.insert(key, channel);
        key
    }

    pub async fn untrack_file_channel(&self, key: u64) {
        self.inner.lock().await.file_channels.remove(&key);
    }

    /// Applies the remote offer or answer, then every candidate that arrived
    /// before it, in arrival order.
    pub async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<usize, TransportError> {
        let mut inner = self.inner.lock().await;
        self.transport.set_remote_description(description).await?;
        inner.remote_description_applied = true;
        let mut flushed = 0;
        while let Some(candidate) = inner.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
            flushed += 1;
        }
        if flushed > 0 {
            debug!(
                target = "ferry::session",
                call_id = %self.call_id,
                flushed,
                "flushed buffered candidates"
            );
        }
        Ok(flushed)
    }

    /// Applies a remote candidate, or parks it until the remote description is in.
    pub async fn add_remote_candidate(&self, candidate: CandidateDescriptor) {
        let mut inner = self.inner.lock().await;
        if inner.state == ConnectionState::Closed {
            return;
        }
        if !inner.remote_description_applied {
            inner.pending_candidates.push_back(candidate);
            trace!(
                target = "ferry::session",
                call_id = %self.call_id,
                pending = inner.pending_candidates.len(),
                "buffering candidate until remote description is set"
            );
            return;
        }
        self.apply_candidate(candidate).await;
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.inner.lock().await.pending_candidates.len()
    }

    async fn apply_candidate(&self, candidate: CandidateDescriptor) {
        if let Err(err) = self.transport.add_candidate(candidate.candidate).await {
            warn!(
                target = "ferry::session",
                call_id = %self.call_id,
                error = %err,
                "failed to apply remote candidate"
            );
        }
    }

    pub async fn send_control(&self, payload: &Payload) -> Result<(), FerryError> {
        let channel = self.control_channel().await;
        let channel = match channel {
            Some(channel) if channel.ready_state() == ReadyState::Open => channel,
            _ => return Err(FerryError::ChannelNotOpen(self.control_label.to_string())),
        };
        channel.send(payload).await?;
        trace!(
            target = "ferry::session",
            call_id = %self.call_id,
            bytes = payload.len(),
            "control message sent"
        );
        Ok(())
    }

    /// Runs `task` for as long as the session lives.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.tasks.lock();
        if self.is_closed() {
            handle.abort();
            return;
        }
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Marks the session closed, closes its channels and transport and aborts
    /// its tasks. Only the first call does anything.
    ///
    /// Must not be awaited from one of the session's own tasks: the abort at
    /// the end would cut it short.
    pub async fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.transition(ConnectionState::Closed).await;
        let (control, file_channels) = {
            let mut inner = self.inner.lock().await;
            inner.pending_candidates.clear();
            (
                inner.control.take(),
                std::mem::take(&mut inner.file_channels),
            )
        };
        for channel in control.into_iter().chain(file_channels.into_values()) {
            if let Err(err) = channel.close().await {
                debug!(
                    target = "ferry::session",
                    call_id = %self.call_id,
                    label = channel.label(),
                    error = %err,
                    "channel close failed"
                );
            }
        }
        if let Err(err) = self.transport.close().await {
            warn!(
                target = "ferry::session",
                call_id = %self.call_id,
                error = %err,
                "transport close failed"
            );
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        debug!(target = "ferry::session", call_id = %self.call_id, "session shut down");
        true
    }
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("call_id", &self.call_id)
            .field("role", &self.role)
            .field("remote_name", &self.remote_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryChannel, MemoryNetwork, MemoryTransport};
    use ferry_bus::{LocalBus, Topic};
    use serde_json::json;

    fn caller_session(transport: Arc<MemoryTransport>, bus: Arc<LocalBus>) -> Arc<PeerSession> {
        PeerSession::new(
            CallId::from("call-1"),
            Role::Caller,
            "alice",
            "bob",
            transport,
            bus,
        )
    }

    fn candidate(n: u32) -> CandidateDescriptor {
        CandidateDescriptor::new(json!({ "candidate": format!("c{n}") }), CandidateOrigin::Answerer)
    }

    #[tokio::test]
    async fn candidates_before_the_answer_are_applied_in_arrival_order() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let session = caller_session(transport.clone(), Arc::new(LocalBus::new()));

        for n in 0..4 {
            session.add_remote_candidate(candidate(n)).await;
        }
        assert_eq!(session.pending_candidate_count().await, 4);
        assert!(transport.applied_candidates().is_empty());

        let flushed = session
            .apply_remote_description(SessionDescription::answer("memory:peer-42"))
            .await
            .expect("apply");
        assert_eq!(flushed, 4);
        session.add_remote_candidate(candidate(4)).await;

        let applied: Vec<String> = transport
            .applied_candidates()
            .into_iter()
            .map(|value| value["candidate"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(applied, vec!["c0", "c1", "c2", "c3", "c4"]);
        assert_eq!(session.pending_candidate_count().await, 0);
    }

    #[tokio::test]
    async fn transitions_follow_the_role() {
        let bus = Arc::new(LocalBus::new());
        let mut states = bus.subscribe(Topic::ConnectionStateChanged);
        let session = caller_session(MemoryNetwork::new().transport(), bus.clone());

        assert!(!session.transition(ConnectionState::Answering).await);
        assert!(!session.transition(ConnectionState::Connected).await);
        assert!(session.transition(ConnectionState::Offering).await);
        assert!(!session.transition(ConnectionState::Offering).await);
        assert!(session.transition(ConnectionState::Connected).await);
        assert!(!session.transition(ConnectionState::Offering).await);

        let seen: Vec<ConnectionState> = std::iter::from_fn(|| states.try_recv().ok())
            .filter_map(|event| match event {
                FerryEvent::ConnectionStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            seen,
            vec![ConnectionState::Offering, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn send_requires_an_open_control_channel() {
        let session = caller_session(MemoryNetwork::new().transport(), Arc::new(LocalBus::new()));
        let err = session.send_control(&Payload::text("hi")).await.unwrap_err();
        assert!(matches!(err, FerryError::ChannelNotOpen(label) if label == "alice-<>-bob"));

        let (connecting, _far) = MemoryChannel::pair("alice-<>-bob");
        session.set_control_channel(connecting.clone()).await;
        assert!(matches!(
            session.send_control(&Payload::text("hi")).await,
            Err(FerryError::ChannelNotOpen(_))
        ));

        let (open, far) = MemoryChannel::open_pair("alice-<>-bob");
        let mut far_events = far.take_events().expect("events");
        session.set_control_channel(open).await;
        session
            .send_control(&Payload::text("hi"))
            .await
            .expect("send");
        assert_eq!(
            far_events.recv().await,
            Some(crate::transport::ChannelEvent::Open)
        );
        assert_eq!(
            far_events.recv().await,
            Some(crate::transport::ChannelEvent::Message(Payload::text("hi")))
        );
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_closes_everything() {
        let network = MemoryNetwork::new();
        let transport = network.transport();
        let session = caller_session(transport.clone(), Arc::new(LocalBus::new()));
        let (control, _far) = MemoryChannel::open_pair("alice-<>-bob");
        session.set_control_channel(control.clone()).await;
        session.spawn(std::future::pending());

        assert!(session.shutdown().await);
        assert!(!session.shutdown().await);
        assert!(session.is_closed());
        assert!(transport.is_closed());
        assert_eq!(control.ready_state(), ReadyState::Closed);
        assert_eq!(session.state().await, ConnectionState::Closed);
        assert!(!session.transition(ConnectionState::Connected).await);
        assert!(session.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn file_channels_sharing_a_label_are_tracked_separately() {
        let session = caller_session(MemoryNetwork::new().transport(), Arc::new(LocalBus::new()));
        let (first, _far_first) = MemoryChannel::open_pair("alice-<>-bob-file-a.txt");
        let (second, _far_second) = MemoryChannel::open_pair("alice-<>-bob-file-a.txt");
        let first_key = session.track_file_channel(first.clone()).await;
        let second_key = session.track_file_channel(second.clone()).await;
        assert_ne!(first_key, second_key);

        session.untrack_file_channel(first_key).await;
        session.shutdown().await;
        assert_eq!(first.ready_state(), ReadyState::Open);
        assert_eq!(second.ready_state(), ReadyState::Closed);
    }
}
