//! The endpoint task.
//!
//! One [`Node`] owns the signaling link, every peer session, the presence
//! view and the transfer manager, and handles [`NodeEvent`]s strictly one at
//! a time. Sockets, transports, timers and send tasks reach it only through
//! the event queue. Transport events carry the epoch of the transport that
//! produced them and are dropped once the session has moved past it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::core::config::{CHUNK_SIZE, DEFAULT_ICE_SERVER, DEFAULT_SIGNALING_URL, PRESENCE_INTERVAL};
use crate::core::connection::{FrameLane, TransportEvent, TransportFactory, TransportSink, WebRtcFactory};
use crate::core::error::CallError;
use crate::core::identity::PeerId;
use crate::core::peer_registry::{FriendRecord, FriendRegistry, KnownPeers};
use crate::core::persistence::PostArchive;
use crate::core::presence::{Presence, PresenceChange};
use crate::core::session::{
    CloseReason, ConnectionState, PeerSession, ReconnectContext, Role, Route, SessionAction,
    SessionRegistry, SessionTimer,
};
use crate::core::signaling::envelope::{CandidatePayload, DescriptionPayload};
use crate::core::signaling::link::LinkState;
use crate::core::signaling::{
    Connector, IceCandidate, LinkAction, SessionDescription, SignalKind, SignalingEnvelope,
    SignalingLink, SocketEvent, SocketHandle, WsConnector,
};
use crate::core::timers::{TimerFired, TimerKey, Timers};
use crate::core::transfer::delivery;
use crate::core::transfer::frames::{ChatMessage, ControlFrame, Post};
use crate::core::transfer::receiver::ReceiveOutcome;
use crate::core::transfer::sender::OutboundTransfer;
use crate::core::transfer::store::{ByteStore, FsChunkStore, MemoryChunkStore};
use crate::core::transfer::{TransferEvent, TransferManager};
use crate::utils::data_dir::DataDir;
use crate::utils::sos::SignalOfStop;

/// Everything the node needs to know about its environment.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub server_url: String,
    pub data_dir: DataDir,
    pub chunk_size: u32,
    pub ice_servers: Vec<String>,
}

impl NodeSettings {
    pub fn new(data_dir: DataDir) -> Self {
        Self {
            server_url: DEFAULT_SIGNALING_URL.to_string(),
            data_dir,
            chunk_size: CHUNK_SIZE as u32,
            ice_servers: vec![DEFAULT_ICE_SERVER.to_string()],
        }
    }
}

/// The node's outward seams.
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub factory: Arc<dyn TransportFactory>,
    pub store: Arc<dyn ByteStore>,
}

impl Collaborators {
    /// Relay over WebSocket, peers over WebRTC, chunks on disk.
    pub fn production(settings: &NodeSettings) -> Self {
        Self {
            connector: Arc::new(WsConnector::new(settings.server_url.clone())),
            factory: Arc::new(WebRtcFactory::new(settings.ice_servers.clone())),
            store: open_store(&settings.data_dir),
        }
    }
}

/// Disk chunk store, or an in-memory one if the disk is unusable. Transfers
/// then no longer survive a restart, but they still work.
pub fn open_store(data_dir: &DataDir) -> Arc<dyn ByteStore> {
    match FsChunkStore::open(&data_dir.chunks()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(
                event = "chunk_store_unavailable",
                error = %e,
                "Falling back to in-memory chunk store"
            );
            Arc::new(MemoryChunkStore::new())
        }
    }
}

/// Local requests, normally typed at the console.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Call(PeerId),
    Hangup(PeerId),
    SendFile { peer_id: PeerId, path: PathBuf },
    /// `None` sends to every connected peer.
    Chat { peer_id: Option<PeerId>, content: String },
    Post(String),
    Unpost(String),
    AddFriend { peer_id: PeerId, name: Option<String> },
    RemoveFriend(PeerId),
    Accept(PeerId),
    Reject(PeerId),
    Renegotiate(PeerId),
    ListPeers,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// What the node reports to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    LinkReady,
    LinkFailed(CallError),
    PeersOnline(Vec<PeerId>),
    PeerOffline(PeerId),
    PeerConnected(PeerId),
    PeerClosed {
        peer_id: PeerId,
        reason: CloseReason,
    },
    IncomingCall(PeerId),
    CallRejected(PeerId),
    CallBusy(PeerId),
    Message {
        peer_id: PeerId,
        message: ChatMessage,
    },
    PostPublished(Post),
    PostReceived {
        peer_id: PeerId,
        post: Post,
    },
    PostDeleted {
        peer_id: PeerId,
        post_id: String,
    },
    IncomingFile {
        peer_id: PeerId,
        file_id: String,
        name: String,
        size: u64,
    },
    TransferProgress {
        peer_id: PeerId,
        file_id: String,
        direction: Direction,
        percent: u8,
    },
    FileSent {
        peer_id: PeerId,
        file_id: String,
    },
    FileReceived {
        peer_id: PeerId,
        file_id: String,
        name: String,
        mime: String,
        path: PathBuf,
        size: u64,
    },
    TransferFailed {
        peer_id: PeerId,
        file_id: String,
        error: CallError,
    },
    /// Interrupted by a disconnect, or left over from a previous run (`peer_id` unknown).
    TransferAbandoned {
        peer_id: Option<PeerId>,
        file_id: String,
    },
    Error(CallError),
    PeerList {
        online: Vec<PeerId>,
        connected: Vec<PeerId>,
        friends: Vec<FriendRecord>,
    },
}

#[derive(Debug)]
pub enum NodeEvent {
    Socket {
        generation: u64,
        event: SocketEvent,
    },
    Transport {
        peer_id: PeerId,
        epoch: u64,
        event: TransportEvent,
    },
    Timer(TimerFired),
    Transfer(TransferEvent),
    Intent(Intent),
}

impl From<TimerFired> for NodeEvent {
    fn from(fired: TimerFired) -> Self {
        NodeEvent::Timer(fired)
    }
}

impl From<TransferEvent> for NodeEvent {
    fn from(event: TransferEvent) -> Self {
        NodeEvent::Transfer(event)
    }
}

/// Cloneable way to hand intents to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeHandle {
    /// Returns `false` once the node has stopped.
    pub fn send(&self, intent: Intent) -> bool {
        self.events.send(NodeEvent::Intent(intent)).is_ok()
    }
}

fn timer_key(peer_id: &PeerId, timer: SessionTimer) -> TimerKey {
    match timer {
        SessionTimer::Negotiation => TimerKey::Negotiation(peer_id.clone()),
        SessionTimer::Reconnect => TimerKey::PeerReconnect(peer_id.clone()),
    }
}

pub struct Node {
    local: PeerId,
    downloads: PathBuf,
    link: SignalingLink,
    socket: Option<SocketHandle>,
    sessions: SessionRegistry,
    presence: Presence,
    transfers: TransferManager,
    friends: FriendRegistry,
    posts: PostArchive,
    timers: Timers<NodeEvent>,
    connector: Arc<dyn Connector>,
    factory: Arc<dyn TransportFactory>,
    /// Peers that sent `call-request` and wait for accept/reject.
    incoming_calls: HashSet<PeerId>,
    /// Peers we sent `call-request` to.
    outgoing_calls: HashSet<PeerId>,
    events: mpsc::UnboundedSender<NodeEvent>,
    app: mpsc::UnboundedSender<AppEvent>,
}

impl Node {
    pub fn new(
        local: PeerId,
        settings: &NodeSettings,
        collaborators: Collaborators,
        app: mpsc::UnboundedSender<AppEvent>,
    ) -> (Self, mpsc::UnboundedReceiver<NodeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let data_dir = &settings.data_dir;
        let posts = PostArchive::load(&data_dir.posts()).unwrap_or_else(|e| {
            warn!(event = "posts_load_failure", error = %e, "Starting with an empty posts archive");
            PostArchive::empty(&data_dir.posts())
        });
        let node = Self {
            link: SignalingLink::new(local.clone()),
            local,
            downloads: data_dir.downloads(),
            socket: None,
            sessions: SessionRegistry::new(),
            presence: Presence::new(),
            transfers: TransferManager::new(collaborators.store, settings.chunk_size),
            friends: FriendRegistry::load(&data_dir.friends()),
            posts,
            timers: Timers::new(events.clone()),
            connector: collaborators.connector,
            factory: collaborators.factory,
            incoming_calls: HashSet::new(),
            outgoing_calls: HashSet::new(),
            events,
            app,
        };
        (node, rx)
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            events: self.events.clone(),
        }
    }

    /// Sweep chunks left by a previous run and open the signaling link.
    pub async fn start(&mut self) {
        match self.transfers.sweep_stale().await {
            Ok(ids) => {
                for file_id in ids {
                    self.emit(AppEvent::TransferAbandoned {
                        peer_id: None,
                        file_id,
                    });
                }
            }
            Err(e) => {
                warn!(event = "stale_sweep_failure", error = %e, "Could not sweep stale chunks");
                self.emit(AppEvent::Error(e));
            }
        }
        let actions = self.link.connect();
        self.apply_link(actions).await;
    }

    /// Process events until `Quit`, cancellation or the queue closing.
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<NodeEvent>, sos: SignalOfStop) {
        self.start().await;
        let mut presence = tokio::time::interval(PRESENCE_INTERVAL);
        presence.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = sos.wait() => break,
                _ = presence.tick() => self.reconcile_presence().await,
                event = events.recv() => match event {
                    Some(NodeEvent::Intent(Intent::Quit)) | None => break,
                    Some(event) => self.handle_event(event).await,
                },
            }
        }
        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        let actions = self.link.disconnect();
        self.apply_link(actions).await;
        self.timers.cancel_all();
        info!(event = "node_stopped", peer_id = %self.local, "Node stopped");
    }

    pub async fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Socket { generation, event } => self.on_socket(generation, event).await,
            NodeEvent::Transport {
                peer_id,
                epoch,
                event,
            } => self.on_transport(peer_id, epoch, event).await,
            NodeEvent::Timer(fired) => self.on_timer(fired).await,
            NodeEvent::Transfer(event) => self.on_transfer(event),
            NodeEvent::Intent(intent) => self.on_intent(intent).await,
        }
    }

    fn emit(&self, event: AppEvent) {
        let _ = self.app.send(event);
    }

    fn signal(&self, envelope: SignalingEnvelope) {
        let Some(socket) = self.socket.as_ref().filter(|_| self.link.is_open()) else {
            debug!(event = "signal_dropped", kind = %envelope.kind.as_str(), "Signaling link not open");
            return;
        };
        if let Err(e) = socket.send(&envelope) {
            warn!(event = "signal_send_failure", kind = %envelope.kind.as_str(), error = %e, "Failed to queue envelope");
        }
    }

    fn sink(&self, peer_id: &PeerId, epoch: u64) -> TransportSink {
        let events = self.events.clone();
        let peer_id = peer_id.clone();
        TransportSink::new(move |event| {
            let _ = events.send(NodeEvent::Transport {
                peer_id: peer_id.clone(),
                epoch,
                event,
            });
        })
    }

    fn reconnect_ctx(&self, peer_id: &PeerId) -> ReconnectContext {
        ReconnectContext {
            peer_known: self.friends.is_known_peer(peer_id),
            link_ready: self.link.is_ready(),
        }
    }

    /// The session for `peer_id`, if it is still on transport `epoch`.
    fn live_session(&mut self, peer_id: &PeerId, epoch: u64) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(peer_id)
            .filter(|s| s.epoch() == epoch && s.state() != ConnectionState::Closed)
    }

    fn connected_lane(&self, peer_id: &PeerId) -> Result<FrameLane, CallError> {
        self.sessions
            .get(peer_id)
            .filter(|s| s.state() == ConnectionState::Connected || s.is_renegotiating())
            .and_then(|s| s.lane().cloned())
            .ok_or_else(|| CallError::NotConnected {
                peer_id: peer_id.clone(),
            })
    }

    /// No transport could be built. A session that never got past Idle is
    /// dropped; a reconnecting one spends the attempt.
    async fn setup_failed(&mut self, peer_id: &PeerId, reason: &str) {
        if self.sessions.state(peer_id) == Some(ConnectionState::Idle) {
            self.sessions.remove(peer_id);
            return;
        }
        let ctx = self.reconnect_ctx(peer_id);
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        let actions = session.on_setup_failed(reason, ctx);
        self.apply_session(peer_id, actions).await;
    }

    // ── Link ─────────────────────────────────────────────────────────────────

    async fn apply_link(&mut self, actions: Vec<LinkAction>) {
        for action in actions {
            match action {
                LinkAction::OpenSocket { generation } => {
                    let events = self.events.clone();
                    let report = Box::new(move |event: SocketEvent| {
                        let _ = events.send(NodeEvent::Socket { generation, event });
                    });
                    let socket = self.connector.open(generation, report);
                    if let Some(old) = self.socket.replace(socket) {
                        old.close();
                    }
                }
                LinkAction::CloseSocket => {
                    if let Some(socket) = self.socket.take() {
                        socket.close();
                    }
                }
                LinkAction::Send(envelope) => self.signal(envelope),
                LinkAction::ArmReconnect(delay) => self.timers.arm(TimerKey::LinkReconnect, delay),
                LinkAction::CancelReconnect => self.timers.cancel(&TimerKey::LinkReconnect),
                LinkAction::TearDownSessions => self.tear_down_sessions().await,
                LinkAction::Ready(queued) => {
                    self.emit(AppEvent::LinkReady);
                    for peer_id in queued {
                        self.place_call(&peer_id).await;
                    }
                    self.reconcile_presence().await;
                }
                LinkAction::Fatal(err) => {
                    self.socket = None;
                    self.emit(AppEvent::LinkFailed(err));
                }
            }
        }
    }

    async fn tear_down_sessions(&mut self) {
        for (peer_id, actions) in self.sessions.close_all() {
            self.apply_session(&peer_id, actions).await;
        }
        self.presence.reset();
        self.incoming_calls.clear();
        self.outgoing_calls.clear();
    }

    async fn on_socket(&mut self, generation: u64, event: SocketEvent) {
        match event {
            SocketEvent::Opened => {
                let actions = self.link.on_open(generation);
                self.apply_link(actions).await;
            }
            SocketEvent::Envelope(envelope) => {
                if generation == self.link.generation() {
                    self.on_envelope(envelope).await;
                }
            }
            SocketEvent::Closed { code } => {
                if generation == self.link.generation() {
                    self.socket = None;
                }
                let actions = self.link.on_close(generation, code);
                self.apply_link(actions).await;
            }
        }
    }

    async fn on_envelope(&mut self, envelope: SignalingEnvelope) {
        match self.sessions.route(&envelope) {
            Route::Link => {
                let actions = self.link.on_registered();
                self.apply_link(actions).await;
            }
            Route::Presence => self.on_presence(&envelope).await,
            Route::NewInbound(peer_id) | Route::Session(peer_id) => match envelope.kind {
                SignalKind::Offer => self.on_offer(&peer_id, &envelope).await,
                SignalKind::Answer => self.on_answer(&peer_id, &envelope).await,
                SignalKind::IceCandidate => self.on_remote_candidate(&peer_id, &envelope).await,
                _ => debug!(event = "envelope_ignored", kind = %envelope.kind.as_str(), "Nothing to do"),
            },
            Route::CallPolicy(peer_id) => self.on_call_signal(&peer_id, &envelope).await,
            Route::Drop => {}
        }
    }

    // ── Presence ─────────────────────────────────────────────────────────────

    async fn on_presence(&mut self, envelope: &SignalingEnvelope) {
        match self.presence.apply(envelope, &self.local) {
            PresenceChange::Online(peers) => {
                self.emit(AppEvent::PeersOnline(peers));
                self.reconcile_presence().await;
            }
            PresenceChange::Offline(peer_id) => self.emit(AppEvent::PeerOffline(peer_id)),
            PresenceChange::None => {}
        }
    }

    async fn reconcile_presence(&mut self) {
        if !self.link.is_ready() {
            return;
        }
        for peer_id in self.presence.reconcile(&self.friends, &self.sessions) {
            self.start_outbound(&peer_id).await;
        }
    }

    // ── Negotiation ──────────────────────────────────────────────────────────

    async fn start_outbound(&mut self, peer_id: &PeerId) {
        let epoch = match self.sessions.create_outbound(peer_id) {
            Ok(session) => session.next_epoch(),
            Err(e) => {
                warn!(event = "call_rejected_locally", peer_id = %peer_id, error = %e, "Session already active");
                self.emit(AppEvent::Error(e));
                return;
            }
        };
        let sink = self.sink(peer_id, epoch);
        let transport = match self.factory.create(peer_id, Role::Initiator, epoch, sink).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(event = "transport_create_failure", peer_id = %peer_id, error = %e, "Could not create transport");
                self.setup_failed(peer_id, &e.to_string()).await;
                return;
            }
        };
        let lane = FrameLane::new(transport);
        let Some(session) = self.sessions.get_mut(peer_id) else {
            lane.transport().close().await;
            return;
        };
        let actions = session.begin_offer(lane.clone());
        self.apply_session(peer_id, actions).await;

        match lane.transport().create_offer().await {
            Ok(offer) => self.signal(SignalingEnvelope::offer(&self.local, peer_id, &offer)),
            Err(e) => self.transport_failed(peer_id, epoch, &format!("offer failed: {e}")).await,
        }
    }

    async fn on_offer(&mut self, peer_id: &PeerId, envelope: &SignalingEnvelope) {
        let sdp = match envelope.payload_as::<DescriptionPayload>() {
            Ok(payload) => payload.sdp,
            Err(e) => {
                warn!(event = "offer_malformed", peer_id = %peer_id, error = %e, "Ignoring offer");
                return;
            }
        };
        let Some(session) = self.sessions.get(peer_id) else {
            self.accept_inbound(peer_id, sdp, false).await;
            return;
        };

        if session.state() == ConnectionState::Connected {
            self.answer_renegotiation(peer_id, sdp).await;
        } else if session.is_renegotiating() {
            if self.local.as_str() < peer_id.as_str() {
                info!(event = "renegotiation_glare_yield", peer_id = %peer_id, "Both sides renegotiated, answering theirs");
                if let Some(session) = self.sessions.get_mut(peer_id) {
                    let actions = session.yield_renegotiation();
                    self.apply_session(peer_id, actions).await;
                }
                self.answer_renegotiation(peer_id, sdp).await;
            } else {
                warn!(event = "renegotiation_glare_ignored", peer_id = %peer_id, "Both sides renegotiated, keeping ours");
            }
        } else if session.is_unanswered_offer() {
            if self.local.as_str() < peer_id.as_str() {
                info!(event = "glare_yield", peer_id = %peer_id, "Both sides offered, accepting theirs");
                self.accept_inbound(peer_id, sdp, true).await;
            } else {
                warn!(event = "glare_ignored", peer_id = %peer_id, "Both sides offered, keeping ours");
            }
        } else if session.state().is_active() {
            warn!(
                event = "offer_rejected",
                peer_id = %peer_id,
                state = ?session.state(),
                "Offer for a session that is already negotiating"
            );
        } else {
            self.accept_inbound(peer_id, sdp, false).await;
        }
    }

    /// Answer a remote offer on a fresh transport. With `supersede`, our own
    /// unanswered offer is replaced instead of rejecting the inbound one.
    async fn accept_inbound(&mut self, peer_id: &PeerId, sdp: SessionDescription, supersede: bool) {
        let session = if supersede {
            self.sessions.get_mut(peer_id).ok_or_else(|| CallError::NotConnected {
                peer_id: peer_id.clone(),
            })
        } else {
            self.sessions.create_inbound(peer_id)
        };
        let epoch = match session {
            Ok(session) => session.next_epoch(),
            Err(e) => {
                warn!(event = "offer_rejected", peer_id = %peer_id, error = %e, "Cannot accept offer");
                return;
            }
        };
        let sink = self.sink(peer_id, epoch);
        let transport = match self.factory.create(peer_id, Role::Responder, epoch, sink).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!(event = "transport_create_failure", peer_id = %peer_id, error = %e, "Could not create transport");
                self.setup_failed(peer_id, &e.to_string()).await;
                return;
            }
        };
        let lane = FrameLane::new(transport);
        let Some(session) = self.sessions.get_mut(peer_id) else {
            lane.transport().close().await;
            return;
        };
        let actions = session.accept_offer(lane.clone());
        self.apply_session(peer_id, actions).await;
        self.presence.clear_abandoned(peer_id);

        if let Err(e) = lane.transport().set_remote_description(sdp).await {
            self.transport_failed(peer_id, epoch, &format!("remote offer rejected: {e}")).await;
            return;
        }
        let Some(session) = self.live_session(peer_id, epoch) else {
            return;
        };
        let queued = session.on_remote_description_set();
        self.apply_candidates(peer_id, &lane, queued).await;

        match lane.transport().create_answer().await {
            Ok(answer) => self.signal(SignalingEnvelope::answer(&self.local, peer_id, &answer)),
            Err(e) => self.transport_failed(peer_id, epoch, &format!("answer failed: {e}")).await,
        }
    }

    /// The remote side renegotiates a connected session: answer in place.
    async fn answer_renegotiation(&mut self, peer_id: &PeerId, sdp: SessionDescription) {
        let Some(session) = self.sessions.get(peer_id) else {
            return;
        };
        let epoch = session.epoch();
        let Some(lane) = session.lane().cloned() else {
            return;
        };
        debug!(event = "renegotiation_answer", peer_id = %peer_id, "Answering renegotiation");
        if let Err(e) = lane.transport().set_remote_description(sdp).await {
            self.transport_failed(peer_id, epoch, &format!("renegotiation offer rejected: {e}")).await;
            return;
        }
        let Some(session) = self.live_session(peer_id, epoch) else {
            return;
        };
        let queued = session.on_remote_description_set();
        self.apply_candidates(peer_id, &lane, queued).await;
        match lane.transport().create_answer().await {
            Ok(answer) => self.signal(SignalingEnvelope::answer(&self.local, peer_id, &answer)),
            Err(e) => self.transport_failed(peer_id, epoch, &format!("answer failed: {e}")).await,
        }
    }

    async fn on_answer(&mut self, peer_id: &PeerId, envelope: &SignalingEnvelope) {
        let Some(session) = self.sessions.get(peer_id) else {
            return;
        };
        if session.state() != ConnectionState::Negotiating
            || session.role != Role::Initiator
            || session.remote_description_set()
        {
            warn!(
                event = "answer_unexpected",
                peer_id = %peer_id,
                state = ?session.state(),
                "Ignoring answer without a pending offer"
            );
            return;
        }
        let epoch = session.epoch();
        let Some(lane) = session.lane().cloned() else {
            return;
        };
        let sdp = match envelope.payload_as::<DescriptionPayload>() {
            Ok(payload) => payload.sdp,
            Err(e) => {
                warn!(event = "answer_malformed", peer_id = %peer_id, error = %e, "Ignoring answer");
                return;
            }
        };

        if let Err(e) = lane.transport().set_remote_description(sdp).await {
            self.transport_failed(peer_id, epoch, &format!("remote answer rejected: {e}")).await;
            return;
        }
        let Some(session) = self.live_session(peer_id, epoch) else {
            return;
        };
        let queued = session.on_remote_description_set();
        let renegotiated = session.is_renegotiating();
        self.apply_candidates(peer_id, &lane, queued).await;

        // The data channel is already open, so no Established event follows.
        if renegotiated {
            if let Some(session) = self.live_session(peer_id, epoch) {
                let actions = session.on_established();
                self.apply_session(peer_id, actions).await;
            }
        }
    }

    async fn on_remote_candidate(&mut self, peer_id: &PeerId, envelope: &SignalingEnvelope) {
        let candidate = match envelope.payload_as::<CandidatePayload>() {
            Ok(payload) => payload.candidate,
            Err(e) => {
                warn!(event = "candidate_malformed", peer_id = %peer_id, error = %e, "Ignoring candidate");
                return;
            }
        };
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        if !session.state().is_active() {
            debug!(event = "candidate_ignored", peer_id = %peer_id, state = ?session.state(), "No negotiation running");
            return;
        }
        let Some(lane) = session.lane().cloned() else {
            return;
        };
        match session.add_candidate(candidate) {
            Some(candidate) => self.apply_candidates(peer_id, &lane, vec![candidate]).await,
            None => debug!(
                event = "candidate_queued",
                peer_id = %peer_id,
                queued = session.queued_candidates(),
                "Remote description not set yet"
            ),
        }
    }

    /// Apply candidates in order. A rejected one is reported and skipped.
    async fn apply_candidates(&self, peer_id: &PeerId, lane: &FrameLane, candidates: Vec<IceCandidate>) {
        for candidate in candidates {
            if let Err(e) = lane.transport().add_ice_candidate(candidate).await {
                warn!(event = "candidate_apply_failure", peer_id = %peer_id, error = %e, "Skipping candidate");
                self.emit(AppEvent::Error(CallError::CandidateApplyFailure {
                    peer_id: peer_id.clone(),
                    reason: e.to_string(),
                }));
            }
        }
    }

    async fn transport_failed(&mut self, peer_id: &PeerId, epoch: u64, reason: &str) {
        let ctx = self.reconnect_ctx(peer_id);
        let Some(session) = self.live_session(peer_id, epoch) else {
            return;
        };
        let actions = session.on_transport_failed(reason, ctx);
        self.apply_session(peer_id, actions).await;
    }

    async fn apply_session(&mut self, peer_id: &PeerId, actions: Vec<SessionAction>) {
        for action in actions {
            match action {
                SessionAction::ArmTimer { timer, delay } => self.timers.arm(timer_key(peer_id, timer), delay),
                SessionAction::CancelTimer(timer) => self.timers.cancel(&timer_key(peer_id, timer)),
                SessionAction::CloseTransport(lane) => {
                    lane.transport().close().await;
                    for file_id in self.transfers.abort_peer(peer_id).await {
                        warn!(event = "transfer_interrupted", peer_id = %peer_id, file_id = %file_id, "Transport closed mid-transfer");
                        self.emit(AppEvent::TransferAbandoned {
                            peer_id: Some(peer_id.clone()),
                            file_id,
                        });
                    }
                }
                SessionAction::Remove { reason } => {
                    self.sessions.remove(peer_id);
                    self.timers.cancel_peer(peer_id);
                    if let CloseReason::Abandoned { .. } = reason {
                        self.presence.mark_abandoned(peer_id);
                    }
                    info!(event = "session_removed", peer_id = %peer_id, reason = ?reason, "Peer session closed");
                    self.emit(AppEvent::PeerClosed {
                        peer_id: peer_id.clone(),
                        reason,
                    });
                }
            }
        }
    }

    // ── Transport events ─────────────────────────────────────────────────────

    async fn on_transport(&mut self, peer_id: PeerId, epoch: u64, event: TransportEvent) {
        if self.live_session(&peer_id, epoch).is_none() {
            debug!(event = "stale_transport_event", peer_id = %peer_id, epoch, "Dropping event from a superseded transport");
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.signal(SignalingEnvelope::candidate(&self.local, &peer_id, &candidate))
            }
            TransportEvent::Established => {
                let Some(session) = self.live_session(&peer_id, epoch) else {
                    return;
                };
                let actions = session.on_established();
                if !actions.is_empty() {
                    self.emit(AppEvent::PeerConnected(peer_id.clone()));
                }
                self.apply_session(&peer_id, actions).await;
            }
            TransportEvent::Dropped { reason } => self.transport_failed(&peer_id, epoch, &reason).await,
            TransportEvent::Text(text) => self.on_frame(&peer_id, &text).await,
            TransportEvent::Binary(data) => self.on_binary(&peer_id, data).await,
        }
    }

    async fn on_frame(&mut self, peer_id: &PeerId, text: &str) {
        let frame = match ControlFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(event = "frame_parse_failure", peer_id = %peer_id, error = %e, "Ignoring control frame");
                return;
            }
        };
        match frame {
            ControlFrame::DirectMessage(message) => self.emit(AppEvent::Message {
                peer_id: peer_id.clone(),
                message,
            }),
            ControlFrame::Post(post) => match self.posts.insert(post.clone()) {
                Ok(true) => self.emit(AppEvent::PostReceived {
                    peer_id: peer_id.clone(),
                    post,
                }),
                Ok(false) => debug!(event = "post_duplicate", post_id = %post.id, "Post already archived"),
                Err(e) => warn!(event = "post_store_failure", post_id = %post.id, error = %e, "Could not archive post"),
            },
            ControlFrame::DeletePost { post_id } => {
                let owned = self
                    .posts
                    .posts
                    .get(&post_id)
                    .is_some_and(|p| &p.sender == peer_id);
                if !owned {
                    debug!(event = "delete_post_ignored", peer_id = %peer_id, post_id = %post_id, "Not a post by this peer");
                    return;
                }
                match self.posts.remove(&post_id) {
                    Ok(_) => self.emit(AppEvent::PostDeleted {
                        peer_id: peer_id.clone(),
                        post_id,
                    }),
                    Err(e) => warn!(event = "post_store_failure", post_id = %post_id, error = %e, "Could not delete post"),
                }
            }
            ControlFrame::FileMetadata(meta) => {
                let outcome = self.transfers.on_metadata(peer_id, meta).await;
                self.on_receive_outcome(peer_id, outcome).await;
            }
            ControlFrame::FileChunk(header) => self.transfers.on_chunk_header(peer_id, header),
        }
    }

    async fn on_binary(&mut self, peer_id: &PeerId, data: Bytes) {
        let outcome = self.transfers.on_binary(peer_id, data).await;
        self.on_receive_outcome(peer_id, outcome).await;
    }

    async fn on_receive_outcome(&mut self, peer_id: &PeerId, outcome: ReceiveOutcome) {
        match outcome {
            ReceiveOutcome::Opened { file_id, name, size } => self.emit(AppEvent::IncomingFile {
                peer_id: peer_id.clone(),
                file_id,
                name,
                size,
            }),
            ReceiveOutcome::Progress { file_id, percent, .. } => self.emit(AppEvent::TransferProgress {
                peer_id: peer_id.clone(),
                file_id,
                direction: Direction::Inbound,
                percent,
            }),
            ReceiveOutcome::Assembled(artifact) => match delivery::deliver(&self.downloads, &artifact).await {
                Ok(path) => self.emit(AppEvent::FileReceived {
                    peer_id: peer_id.clone(),
                    size: artifact.data.len() as u64,
                    file_id: artifact.file_id,
                    name: artifact.name,
                    mime: artifact.mime,
                    path,
                }),
                Err(e) => {
                    error!(event = "file_delivery_failure", file_id = %artifact.file_id, error = %e, "Could not save file");
                    self.emit(AppEvent::TransferFailed {
                        peer_id: peer_id.clone(),
                        file_id: artifact.file_id,
                        error: CallError::StorageUnavailable(format!("{e:#}")),
                    });
                }
            },
            ReceiveOutcome::Failed { file_id, error } => {
                warn!(event = "transfer_failed", peer_id = %peer_id, file_id = %file_id, error = %error, "Inbound transfer failed");
                self.emit(AppEvent::TransferFailed {
                    peer_id: peer_id.clone(),
                    file_id,
                    error,
                });
            }
            ReceiveOutcome::Ignored => {}
        }
    }

    fn on_transfer(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Progress {
                peer_id,
                file_id,
                percent,
            } => self.emit(AppEvent::TransferProgress {
                peer_id,
                file_id,
                direction: Direction::Outbound,
                percent,
            }),
            TransferEvent::Sent { peer_id, file_id } => {
                self.transfers.on_send_finished(&peer_id, &file_id);
                self.emit(AppEvent::FileSent { peer_id, file_id });
            }
            TransferEvent::Failed {
                peer_id,
                file_id,
                error,
            } => {
                self.transfers.on_send_finished(&peer_id, &file_id);
                self.emit(AppEvent::TransferFailed {
                    peer_id,
                    file_id,
                    error,
                });
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    async fn on_timer(&mut self, fired: TimerFired) {
        if !self.timers.fired(&fired) {
            debug!(event = "stale_timer", key = ?fired.key, "Ignoring cancelled timer");
            return;
        }
        match fired.key {
            TimerKey::LinkReconnect => {
                let actions = self.link.on_reconnect_timer();
                self.apply_link(actions).await;
            }
            TimerKey::Negotiation(peer_id) => {
                let ctx = self.reconnect_ctx(&peer_id);
                let Some(session) = self.sessions.get_mut(&peer_id) else {
                    return;
                };
                let actions = session.on_negotiation_timeout(ctx);
                if !actions.is_empty() {
                    self.emit(AppEvent::Error(CallError::NegotiationTimeout {
                        peer_id: peer_id.clone(),
                    }));
                }
                self.apply_session(&peer_id, actions).await;
            }
            TimerKey::PeerReconnect(peer_id) => {
                let due = self
                    .sessions
                    .get_mut(&peer_id)
                    .is_some_and(|s| s.on_reconnect_timer());
                if due && self.link.is_ready() {
                    self.start_outbound(&peer_id).await;
                }
            }
        }
    }

    // ── Intents ──────────────────────────────────────────────────────────────

    async fn on_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Call(peer_id) => {
                if self.link.state() == LinkState::Failed {
                    info!(event = "link_restart", "Restarting signaling link for a call");
                    let actions = self.link.connect();
                    self.apply_link(actions).await;
                }
                self.place_call(&peer_id).await;
            }
            Intent::Hangup(peer_id) => {
                self.outgoing_calls.remove(&peer_id);
                let actions = self.sessions.close(&peer_id);
                if actions.is_empty() {
                    self.emit(AppEvent::Error(CallError::NotConnected { peer_id }));
                    return;
                }
                self.apply_session(&peer_id, actions).await;
            }
            Intent::SendFile { peer_id, path } => self.send_file(&peer_id, path).await,
            Intent::Chat { peer_id, content } => self.send_chat(peer_id, content).await,
            Intent::Post(content) => self.publish_post(content).await,
            Intent::Unpost(post_id) => self.retract_post(post_id).await,
            Intent::AddFriend { peer_id, name } => match self.friends.add(&peer_id, name) {
                Ok(added) => {
                    if added {
                        info!(event = "friend_added", peer_id = %peer_id, "Friend added");
                    }
                    self.reconcile_presence().await;
                }
                Err(e) => self.emit(AppEvent::Error(CallError::StorageUnavailable(format!("{e:#}")))),
            },
            Intent::RemoveFriend(peer_id) => {
                if let Err(e) = self.friends.remove(&peer_id) {
                    self.emit(AppEvent::Error(CallError::StorageUnavailable(format!("{e:#}"))));
                }
            }
            Intent::Accept(peer_id) => self.answer_call(&peer_id, SignalKind::CallAccepted),
            Intent::Reject(peer_id) => self.answer_call(&peer_id, SignalKind::CallRejected),
            Intent::Renegotiate(peer_id) => self.renegotiate(&peer_id).await,
            Intent::ListPeers => self.emit(AppEvent::PeerList {
                online: self.presence.online(),
                connected: self.sessions.connected_peers(),
                friends: self.friends.all().into_iter().cloned().collect(),
            }),
            Intent::Quit => {}
        }
    }

    /// Friends are dialled directly; anyone else is asked with `call-request`
    /// first. Held until the link is ready.
    async fn place_call(&mut self, peer_id: &PeerId) {
        if *peer_id == self.local {
            self.emit(AppEvent::Error(CallError::Protocol("cannot call yourself".into())));
            return;
        }
        self.presence.clear_abandoned(peer_id);
        if !self.link.is_ready() {
            if self.link.queue_intent(peer_id) {
                info!(event = "call_queued", peer_id = %peer_id, "Signaling not ready, call queued");
            }
            return;
        }
        if self.friends.is_known_peer(peer_id) {
            self.start_outbound(peer_id).await;
        } else {
            self.outgoing_calls.insert(peer_id.clone());
            self.signal(SignalingEnvelope::call(SignalKind::CallRequest, &self.local, peer_id));
        }
    }

    fn answer_call(&mut self, peer_id: &PeerId, kind: SignalKind) {
        if !self.incoming_calls.remove(peer_id) {
            self.emit(AppEvent::Error(CallError::Protocol(format!("no pending call from {peer_id}"))));
            return;
        }
        self.signal(SignalingEnvelope::call(kind, &self.local, peer_id));
    }

    async fn on_call_signal(&mut self, peer_id: &PeerId, envelope: &SignalingEnvelope) {
        match envelope.kind {
            SignalKind::CallRequest => {
                if self.sessions.state(peer_id) == Some(ConnectionState::Connected) {
                    info!(event = "call_busy", peer_id = %peer_id, "Already connected, answering busy");
                    self.signal(SignalingEnvelope::call(SignalKind::CallBusy, &self.local, peer_id));
                } else {
                    self.incoming_calls.insert(peer_id.clone());
                    self.emit(AppEvent::IncomingCall(peer_id.clone()));
                }
            }
            SignalKind::CallAccepted => {
                if self.outgoing_calls.remove(peer_id) {
                    self.start_outbound(peer_id).await;
                } else {
                    warn!(event = "call_accept_unexpected", peer_id = %peer_id, "No call pending to this peer");
                }
            }
            SignalKind::CallRejected => {
                self.outgoing_calls.remove(peer_id);
                self.emit(AppEvent::CallRejected(peer_id.clone()));
            }
            SignalKind::CallBusy => {
                self.outgoing_calls.remove(peer_id);
                self.emit(AppEvent::CallBusy(peer_id.clone()));
            }
            _ => {}
        }
    }

    async fn renegotiate(&mut self, peer_id: &PeerId) {
        let not_connected = || {
            AppEvent::Error(CallError::NotConnected {
                peer_id: peer_id.clone(),
            })
        };
        let Some(session) = self.sessions.get_mut(peer_id) else {
            self.emit(not_connected());
            return;
        };
        let Some(actions) = session.renegotiate() else {
            self.emit(not_connected());
            return;
        };
        let epoch = session.epoch();
        let lane = session.lane().cloned();
        self.apply_session(peer_id, actions).await;
        let Some(lane) = lane else {
            return;
        };
        match lane.transport().create_offer().await {
            Ok(offer) => self.signal(SignalingEnvelope::offer(&self.local, peer_id, &offer)),
            Err(e) => self.transport_failed(peer_id, epoch, &format!("offer failed: {e}")).await,
        }
    }

    async fn send_file(&mut self, peer_id: &PeerId, path: PathBuf) {
        let lane = match self.connected_lane(peer_id) {
            Ok(lane) => lane,
            Err(e) => {
                self.emit(AppEvent::Error(e));
                return;
            }
        };
        match OutboundTransfer::from_path(peer_id, path, self.transfers.chunk_size()).await {
            Ok(transfer) => {
                self.transfers.start_send(transfer, lane, self.events.clone());
            }
            Err(e) => {
                warn!(event = "send_file_failure", peer_id = %peer_id, error = %e, "Cannot read file");
                self.emit(AppEvent::Error(CallError::StorageUnavailable(format!("{e:#}"))));
            }
        }
    }

    async fn send_frame(&self, peer_id: &PeerId, frame: &ControlFrame) {
        let lane = match self.connected_lane(peer_id) {
            Ok(lane) => lane,
            Err(e) => {
                self.emit(AppEvent::Error(e));
                return;
            }
        };
        if let Err(e) = lane.send_frame(frame).await {
            warn!(event = "frame_send_failure", peer_id = %peer_id, error = %e, "Could not send control frame");
        }
    }

    async fn broadcast(&self, frame: &ControlFrame) {
        let peers = self.sessions.connected_peers();
        if peers.is_empty() {
            debug!(event = "broadcast_no_peers", "No connected peers");
        }
        for peer_id in &peers {
            self.send_frame(peer_id, frame).await;
        }
    }

    async fn send_chat(&mut self, peer_id: Option<PeerId>, content: String) {
        let frame = ControlFrame::direct_message(&self.local, content);
        match peer_id {
            Some(peer_id) => self.send_frame(&peer_id, &frame).await,
            None => self.broadcast(&frame).await,
        }
    }

    async fn publish_post(&mut self, content: String) {
        let post = Post::new(&self.local, content);
        if let Err(e) = self.posts.insert(post.clone()) {
            warn!(event = "post_store_failure", post_id = %post.id, error = %e, "Could not archive own post");
        }
        self.broadcast(&ControlFrame::Post(post.clone())).await;
        self.emit(AppEvent::PostPublished(post));
    }

    async fn retract_post(&mut self, post_id: String) {
        match self.posts.remove(&post_id) {
            Ok(true) => {}
            Ok(false) => {
                self.emit(AppEvent::Error(CallError::Protocol(format!("unknown post {post_id}"))));
                return;
            }
            Err(e) => warn!(event = "post_store_failure", post_id = %post_id, error = %e, "Could not delete post"),
        }
        self.broadcast(&ControlFrame::DeletePost { post_id }).await;
    }
}
