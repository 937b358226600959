//! Call negotiation engine.
//!
//! One state machine per session, driven by a single actor task: every
//! command and every incoming signaling event funnels through one queue, so
//! transitions happen strictly in arrival order. The machine itself is the
//! pure [`transition`] function; the actor adds the side effects (media
//! acquisition, signaling sends, timers) around it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deskcall_common::{Error, Presence, Result, Role, WireEvent};

use crate::media::{MediaConstraints, MediaController, MediaResource};
use crate::peer::{IceState, PeerFactory, PeerSession};
use crate::transport::{Transport, TransportEvent};

const ENGINE_CMD_CAPACITY: usize = 64;
const ENGINE_EVENT_CAPACITY: usize = 64;

/// Why a call ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailure {
    MediaUnavailable,
    NegotiationTimeout,
    ConnectivityTimeout,
    TransportLost,
    PeerOffline,
    RemoteRejected,
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MediaUnavailable => "media unavailable",
            Self::NegotiationTimeout => "negotiation timeout",
            Self::ConnectivityTimeout => "connectivity timeout",
            Self::TransportLost => "transport lost",
            Self::PeerOffline => "peer offline",
            Self::RemoteRejected => "remote rejected",
        };
        f.write_str(s)
    }
}

/// Call state. Exactly one per session; transitions only through
/// [`transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Requesting,
    Negotiating,
    Connected,
    Ended,
    Failed(CallFailure),
}

impl CallState {
    /// A call is in flight (signaling for it is meaningful).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Requesting | Self::Negotiating | Self::Connected)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    StartCall,
    AcceptCall,
    MediaFailed,
    OfferCreated,
    AnswerCreated,
    RemoteAnswer,
    RemoteEnd,
    LocalEnd,
    IceFailed,
    NegotiationTimedOut,
    ConnectivityTimedOut,
    TransportLost,
    PeerOffline,
    Reset,
}

/// The pure transition function: `(state, event) -> state`. Unknown
/// combinations leave the state unchanged; the driver logs them as stale.
pub fn transition(state: CallState, event: CallEvent) -> CallState {
    use CallEvent as E;
    use CallState as S;
    match (state, event) {
        (S::Idle, E::StartCall | E::AcceptCall) => S::Requesting,
        (S::Idle | S::Requesting, E::MediaFailed) => S::Failed(CallFailure::MediaUnavailable),
        (S::Requesting, E::OfferCreated) => S::Negotiating,
        (S::Requesting | S::Negotiating, E::AnswerCreated) => S::Connected,
        (S::Negotiating, E::RemoteAnswer) => S::Connected,
        (S::Requesting | S::Negotiating, E::NegotiationTimedOut) => {
            S::Failed(CallFailure::NegotiationTimeout)
        }
        (S::Connected, E::ConnectivityTimedOut) => S::Failed(CallFailure::ConnectivityTimeout),
        (S::Requesting | S::Negotiating | S::Connected, E::IceFailed) => {
            S::Failed(CallFailure::ConnectivityTimeout)
        }
        // An end before the call is established is a rejection; after, a
        // normal hang-up.
        (S::Requesting | S::Negotiating, E::RemoteEnd) => S::Failed(CallFailure::RemoteRejected),
        (S::Connected, E::RemoteEnd) => S::Ended,
        (S::Requesting | S::Negotiating | S::Connected, E::LocalEnd) => S::Ended,
        (S::Requesting | S::Negotiating | S::Connected, E::TransportLost) => {
            S::Failed(CallFailure::TransportLost)
        }
        (S::Requesting | S::Negotiating, E::PeerOffline) => S::Failed(CallFailure::PeerOffline),
        (S::Ended | S::Failed(_), E::Reset) => S::Idle,
        (state, _) => state,
    }
}

/// Routing identity for one session's signaling.
#[derive(Debug, Clone)]
pub struct CallIdentity {
    pub session_id: Uuid,
    pub local_id: String,
    pub remote_id: String,
    pub role: Role,
}

impl CallIdentity {
    /// `(userId, agentId)` as they appear on the wire, regardless of which
    /// side we are.
    fn wire_ids(&self) -> (String, String) {
        match self.role {
            Role::Customer => (self.local_id.clone(), self.remote_id.clone()),
            Role::Agent => (self.remote_id.clone(), self.local_id.clone()),
        }
    }
}

/// Engine tunables. ICE servers are injected, never hard-coded.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ice_servers: Vec<String>,
    pub constraints: MediaConstraints,
    pub negotiation_timeout: Duration,
    pub connectivity_timeout: Duration,
    /// How long a `Connected` call survives a transport outage before it
    /// fails with `TransportLost`.
    pub resume_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            constraints: MediaConstraints::audio_video(),
            negotiation_timeout: Duration::from_secs(30),
            connectivity_timeout: Duration::from_secs(10),
            resume_window: Duration::from_secs(15),
        }
    }
}

/// Notifications surfaced to the UI.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The counterpart is calling; nothing is auto-answered.
    IncomingCall { from: String },
    /// The caller hung up before we accepted.
    IncomingCallCancelled,
    StateChanged(CallState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Negotiation,
    Connectivity,
    Resume,
}

enum Cmd {
    Start(oneshot::Sender<Result<()>>),
    Accept(oneshot::Sender<Result<()>>),
    End(oneshot::Sender<Result<()>>),
    Reset(oneshot::Sender<Result<()>>),
    ToggleAudio(bool, oneshot::Sender<Result<()>>),
    ToggleVideo(bool, oneshot::Sender<Result<()>>),
    Timer(TimerKind, u64),
}

/// Handle to a spawned per-session engine actor.
pub struct CallEngine {
    cmd_tx: mpsc::Sender<Cmd>,
    state_rx: watch::Receiver<CallState>,
    events: broadcast::Sender<EngineEvent>,
}

impl CallEngine {
    /// Spawn the engine actor for one session. It subscribes to the
    /// transport before returning, so no signaling is missed.
    pub fn spawn(
        config: EngineConfig,
        identity: CallIdentity,
        transport: Arc<dyn Transport>,
        media: Arc<MediaController>,
        peers: Arc<dyn PeerFactory>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(ENGINE_CMD_CAPACITY);
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        let transport_rx = transport.subscribe();

        let actor = Actor {
            cfg: config,
            identity,
            transport,
            media,
            peers,
            state: CallState::Idle,
            state_tx,
            events: events.clone(),
            cmd_tx: cmd_tx.clone(),
            peer: None,
            resource: None,
            pending_offer: None,
            pending_candidates: VecDeque::new(),
            timers: Timers::default(),
        };
        tokio::spawn(actor.run(cmd_rx, transport_rx));

        Self {
            cmd_tx,
            state_rx,
            events,
        }
    }

    pub fn state(&self) -> CallState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Start an outgoing call: acquire media, create the offer, send it.
    pub async fn start_call(&self) -> Result<()> {
        self.request(Cmd::Start).await
    }

    /// Answer a previously surfaced incoming call.
    pub async fn accept_call(&self) -> Result<()> {
        self.request(Cmd::Accept).await
    }

    /// Hang up. Media is released before this returns.
    pub async fn end_call(&self) -> Result<()> {
        self.request(Cmd::End).await
    }

    /// Return a terminal machine to `Idle`; cancels an in-flight call.
    pub async fn reset(&self) -> Result<()> {
        self.request(Cmd::Reset).await
    }

    pub async fn toggle_audio(&self, enabled: bool) -> Result<()> {
        self.request(|tx| Cmd::ToggleAudio(enabled, tx)).await
    }

    pub async fn toggle_video(&self, enabled: bool) -> Result<()> {
        self.request(|tx| Cmd::ToggleVideo(enabled, tx)).await
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<()>>) -> Cmd,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| Error::internal("call engine stopped"))?;
        rx.await.map_err(|_| Error::internal("call engine stopped"))?
    }
}

#[derive(Default)]
struct TimerSlot {
    gen: u64,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Timers {
    negotiation: TimerSlot,
    connectivity: TimerSlot,
    resume: TimerSlot,
}

impl Timers {
    fn slot(&mut self, kind: TimerKind) -> &mut TimerSlot {
        match kind {
            TimerKind::Negotiation => &mut self.negotiation,
            TimerKind::Connectivity => &mut self.connectivity,
            TimerKind::Resume => &mut self.resume,
        }
    }
}

struct Actor {
    cfg: EngineConfig,
    identity: CallIdentity,
    transport: Arc<dyn Transport>,
    media: Arc<MediaController>,
    peers: Arc<dyn PeerFactory>,
    state: CallState,
    state_tx: watch::Sender<CallState>,
    events: broadcast::Sender<EngineEvent>,
    cmd_tx: mpsc::Sender<Cmd>,
    peer: Option<Box<dyn PeerSession>>,
    resource: Option<Arc<MediaResource>>,
    /// Remote offer awaiting a local accept.
    pending_offer: Option<String>,
    /// Candidates received before the remote description; applied in
    /// arrival order the moment it lands.
    pending_candidates: VecDeque<String>,
    timers: Timers,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Cmd>,
        mut transport_rx: broadcast::Receiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    self.handle_cmd(cmd);
                }
                ev = transport_rx.recv() => {
                    match ev {
                        Ok(ev) => self.handle_transport(ev),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("engine lagged {n} transport events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        // Owning-component teardown still releases media.
        self.teardown();
    }

    fn handle_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Cmd::Accept(reply) => {
                let _ = reply.send(self.accept());
            }
            Cmd::End(reply) => {
                let _ = reply.send(self.end_local());
            }
            Cmd::Reset(reply) => {
                let _ = reply.send(self.reset());
            }
            Cmd::ToggleAudio(enabled, reply) => {
                let _ = reply.send(self.toggle_audio(enabled));
            }
            Cmd::ToggleVideo(enabled, reply) => {
                let _ = reply.send(self.toggle_video(enabled));
            }
            Cmd::Timer(kind, gen) => self.timer_fired(kind, gen),
        }
    }

    fn start(&mut self) -> Result<()> {
        match self.state {
            CallState::Idle => {}
            s if s.is_active() => return Err(Error::CallAlreadyActive),
            _ => return Err(Error::internal("call not idle; reset first")),
        }

        // Both sides dialed: the counterpart's offer is already ringing, so
        // join it rather than racing a competing one.
        if let Some(offer) = self.pending_offer.take() {
            info!(session = %self.identity.session_id, "joining the counterpart's ringing call");
            self.apply(CallEvent::AcceptCall);
            let resource = match self.media.acquire(&self.cfg.constraints) {
                Ok(resource) => resource,
                Err(err) => {
                    self.apply(CallEvent::MediaFailed);
                    return Err(err);
                }
            };
            self.resource = Some(resource);
            return self.answer_offer(&offer);
        }

        self.apply(CallEvent::StartCall);

        let resource = match self.media.acquire(&self.cfg.constraints) {
            Ok(resource) => resource,
            Err(err) => {
                // No signaling message goes out on a media failure.
                self.apply(CallEvent::MediaFailed);
                return Err(err);
            }
        };
        self.resource = Some(resource);

        let mut peer = match self.peers.connect(&self.cfg.ice_servers) {
            Ok(peer) => peer,
            Err(err) => {
                self.apply(CallEvent::IceFailed);
                return Err(err);
            }
        };
        let offer = match peer.create_offer() {
            Ok(offer) => offer,
            Err(err) => {
                self.apply(CallEvent::IceFailed);
                return Err(err);
            }
        };
        self.peer = Some(peer);
        self.apply(CallEvent::OfferCreated);

        let (user_id, agent_id) = self.identity.wire_ids();
        self.send(WireEvent::VideoOffer {
            session_id: self.identity.session_id,
            offer,
            user_id,
            agent_id,
        })?;
        self.flush_local_candidates()?;
        self.arm_timer(TimerKind::Negotiation, self.cfg.negotiation_timeout);
        info!(session = %self.identity.session_id, "offer sent, negotiating");
        Ok(())
    }

    fn accept(&mut self) -> Result<()> {
        if self.state != CallState::Idle {
            return Err(Error::stale("no incoming call to accept"));
        }
        let Some(offer) = self.pending_offer.take() else {
            return Err(Error::stale("no incoming call to accept"));
        };
        self.apply(CallEvent::AcceptCall);

        let resource = match self.media.acquire(&self.cfg.constraints) {
            Ok(resource) => resource,
            Err(err) => {
                self.apply(CallEvent::MediaFailed);
                return Err(err);
            }
        };
        self.resource = Some(resource);
        self.answer_offer(&offer)
    }

    /// Apply a remote offer, answer it, and move to `Connected`. Shared by
    /// the accept path and the glare-yield path; media must already be
    /// acquired.
    fn answer_offer(&mut self, offer: &str) -> Result<()> {
        let mut peer = match self.peers.connect(&self.cfg.ice_servers) {
            Ok(peer) => peer,
            Err(err) => {
                self.apply(CallEvent::IceFailed);
                return Err(err);
            }
        };
        if let Err(err) = peer.set_remote_description(offer) {
            self.apply(CallEvent::IceFailed);
            return Err(err);
        }
        let answer = match peer.create_answer() {
            Ok(answer) => answer,
            Err(err) => {
                self.apply(CallEvent::IceFailed);
                return Err(err);
            }
        };
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(err) = peer.add_ice_candidate(&candidate) {
                debug!("dropping unusable buffered candidate: {err}");
            }
        }
        self.peer = Some(peer);

        let (user_id, agent_id) = self.identity.wire_ids();
        self.send(WireEvent::VideoAnswer {
            session_id: self.identity.session_id,
            answer,
            user_id,
            agent_id,
        })?;
        self.flush_local_candidates()?;
        self.apply(CallEvent::AnswerCreated);
        self.arm_timer(TimerKind::Connectivity, self.cfg.connectivity_timeout);
        self.check_ice_connected();
        info!(session = %self.identity.session_id, "answer sent, call connected");
        Ok(())
    }

    fn end_local(&mut self) -> Result<()> {
        match self.state {
            CallState::Idle => {
                // Declining a surfaced incoming call.
                if self.pending_offer.take().is_some() {
                    self.pending_candidates.clear();
                    let (user_id, agent_id) = self.identity.wire_ids();
                    self.send(WireEvent::EndVideoCall {
                        session_id: self.identity.session_id,
                        user_id,
                        agent_id,
                    })?;
                }
                Ok(())
            }
            s if s.is_active() => {
                let (user_id, agent_id) = self.identity.wire_ids();
                let _ = self.send(WireEvent::EndVideoCall {
                    session_id: self.identity.session_id,
                    user_id,
                    agent_id,
                });
                // Teardown runs inside apply: media is released before the
                // caller's await returns.
                self.apply(CallEvent::LocalEnd);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn reset(&mut self) -> Result<()> {
        if self.state.is_active() {
            self.end_local()?;
        }
        self.pending_offer = None;
        self.pending_candidates.clear();
        self.apply(CallEvent::Reset);
        Ok(())
    }

    fn toggle_audio(&mut self, enabled: bool) -> Result<()> {
        match &self.resource {
            Some(resource) => resource.toggle_audio(enabled),
            None => Err(Error::internal("no active media")),
        }
    }

    fn toggle_video(&mut self, enabled: bool) -> Result<()> {
        match &self.resource {
            Some(resource) => resource.toggle_video(enabled),
            None => Err(Error::internal("no active media")),
        }
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Event(ev) => self.handle_wire(ev),
            TransportEvent::Down => match self.state {
                CallState::Requesting | CallState::Negotiating => {
                    warn!("transport lost during negotiation");
                    self.apply(CallEvent::TransportLost);
                }
                CallState::Connected => {
                    info!(
                        "transport lost mid-call, resume window {:?}",
                        self.cfg.resume_window
                    );
                    self.arm_timer(TimerKind::Resume, self.cfg.resume_window);
                }
                _ => {}
            },
            TransportEvent::Up => {
                // Reconnected within the resume window: the call stands.
                // No offer/answer is re-exchanged; anything the counterpart
                // queued (possibly an end) arrives right after this.
                self.clear_timer(TimerKind::Resume);
            }
        }
    }

    fn handle_wire(&mut self, event: WireEvent) {
        if let Some(session_id) = event.session_id() {
            if event.is_signaling() && session_id != self.identity.session_id {
                self.log_stale(event.kind(), "unknown session");
                return;
            }
        }
        match event {
            WireEvent::VideoOffer { offer, .. } => self.on_remote_offer(offer),
            WireEvent::VideoAnswer { answer, .. } => self.on_remote_answer(answer),
            WireEvent::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate),
            WireEvent::EndVideoCall { .. } => self.on_remote_end(),
            WireEvent::PresenceUpdate { user_id, state } => {
                if user_id == self.identity.remote_id && state == Presence::Offline {
                    self.on_peer_offline();
                }
            }
            // Chat traffic is none of the engine's business.
            _ => {}
        }
    }

    fn on_remote_offer(&mut self, offer: String) {
        match self.state {
            CallState::Idle => {
                self.pending_offer = Some(offer);
                let _ = self.events.send(EngineEvent::IncomingCall {
                    from: self.identity.remote_id.clone(),
                });
            }
            CallState::Requesting | CallState::Negotiating => {
                // Simultaneous offers: the lexicographically smaller user id
                // yields and answers the incoming offer instead.
                if self.identity.local_id < self.identity.remote_id {
                    info!(
                        "offer glare: yielding to {}",
                        self.identity.remote_id
                    );
                    self.clear_timer(TimerKind::Negotiation);
                    if let Some(mut old) = self.peer.take() {
                        old.close();
                    }
                    if let Err(err) = self.answer_offer(&offer) {
                        warn!("failed to answer after yielding: {err}");
                    }
                } else {
                    debug!("offer glare: keeping local offer");
                }
            }
            _ => self.log_stale("video_offer", "call not open for an offer"),
        }
    }

    fn on_remote_answer(&mut self, answer: String) {
        if self.state != CallState::Negotiating {
            self.log_stale("video_answer", "not negotiating");
            return;
        }
        self.clear_timer(TimerKind::Negotiation);
        let Some(peer) = self.peer.as_mut() else {
            self.log_stale("video_answer", "no peer session");
            return;
        };
        if let Err(err) = peer.set_remote_description(&answer) {
            warn!("remote answer rejected: {err}");
            self.apply(CallEvent::IceFailed);
            return;
        }
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(err) = peer.add_ice_candidate(&candidate) {
                debug!("dropping unusable buffered candidate: {err}");
            }
        }
        self.apply(CallEvent::RemoteAnswer);
        self.arm_timer(TimerKind::Connectivity, self.cfg.connectivity_timeout);
        self.check_ice_connected();
    }

    fn on_remote_candidate(&mut self, candidate: String) {
        let ringing = self.state == CallState::Idle && self.pending_offer.is_some();
        if !self.state.is_active() && !ringing {
            self.log_stale("ice_candidate", "no call in progress");
            return;
        }
        match self.peer.as_mut() {
            Some(peer) if peer.has_remote_description() => {
                if let Err(err) = peer.add_ice_candidate(&candidate) {
                    debug!("dropping unusable candidate: {err}");
                }
                self.check_ice_connected();
            }
            // Buffered, never dropped; flushed in this order once the
            // remote description is applied.
            _ => self.pending_candidates.push_back(candidate),
        }
    }

    fn on_remote_end(&mut self) {
        match self.state {
            CallState::Idle => {
                if self.pending_offer.take().is_some() {
                    self.pending_candidates.clear();
                    let _ = self.events.send(EngineEvent::IncomingCallCancelled);
                } else {
                    self.log_stale("end_video_call", "no call in progress");
                }
            }
            s if s.is_active() => {
                info!(session = %self.identity.session_id, "remote ended call");
                self.apply(CallEvent::RemoteEnd);
            }
            _ => self.log_stale("end_video_call", "call already over"),
        }
    }

    fn on_peer_offline(&mut self) {
        if matches!(self.state, CallState::Requesting | CallState::Negotiating) {
            warn!("counterpart went offline, aborting pending call");
            self.apply(CallEvent::PeerOffline);
        }
    }

    fn timer_fired(&mut self, kind: TimerKind, gen: u64) {
        if self.timers.slot(kind).gen != gen {
            return; // cleared or re-armed since
        }
        match kind {
            TimerKind::Negotiation => {
                if matches!(self.state, CallState::Requesting | CallState::Negotiating) {
                    warn!("no answer within {:?}", self.cfg.negotiation_timeout);
                    self.apply(CallEvent::NegotiationTimedOut);
                }
            }
            TimerKind::Connectivity => {
                let connected = self
                    .peer
                    .as_ref()
                    .map(|p| p.ice_state() == IceState::Connected)
                    .unwrap_or(false);
                if self.state == CallState::Connected && !connected {
                    warn!("ICE never connected within {:?}", self.cfg.connectivity_timeout);
                    self.apply(CallEvent::ConnectivityTimedOut);
                }
            }
            TimerKind::Resume => {
                if self.state == CallState::Connected {
                    warn!("transport did not recover within {:?}", self.cfg.resume_window);
                    self.apply(CallEvent::TransportLost);
                }
            }
        }
    }

    /// Run the pure machine and perform the entry actions of the new state.
    fn apply(&mut self, event: CallEvent) {
        let next = transition(self.state, event);
        if next == self.state {
            debug!(state = ?self.state, event = ?event, "no-op transition");
            return;
        }
        debug!(from = ?self.state, to = ?next, event = ?event, "call transition");
        self.state = next;
        if matches!(next, CallState::Ended | CallState::Failed(_)) {
            self.teardown();
        }
        self.state_tx.send_replace(next);
        let _ = self.events.send(EngineEvent::StateChanged(next));
    }

    /// Release everything a call holds. Runs on every terminal transition
    /// and on actor shutdown; leaves the machine clean for `reset`.
    fn teardown(&mut self) {
        self.clear_timer(TimerKind::Negotiation);
        self.clear_timer(TimerKind::Connectivity);
        self.clear_timer(TimerKind::Resume);
        self.pending_offer = None;
        self.pending_candidates.clear();
        if let Some(mut peer) = self.peer.take() {
            peer.close();
        }
        if let Some(resource) = self.resource.take() {
            resource.release();
        }
    }

    fn send(&mut self, event: WireEvent) -> Result<()> {
        if let Err(err) = self.transport.send(event) {
            self.apply(CallEvent::TransportLost);
            return Err(err);
        }
        Ok(())
    }

    fn flush_local_candidates(&mut self) -> Result<()> {
        let candidates = match self.peer.as_mut() {
            Some(peer) => peer.take_local_candidates(),
            None => return Ok(()),
        };
        let (user_id, agent_id) = self.identity.wire_ids();
        for candidate in candidates {
            self.send(WireEvent::IceCandidate {
                session_id: self.identity.session_id,
                candidate,
                user_id: user_id.clone(),
                agent_id: agent_id.clone(),
            })?;
        }
        Ok(())
    }

    fn check_ice_connected(&mut self) {
        let connected = self
            .peer
            .as_ref()
            .map(|p| p.ice_state() == IceState::Connected)
            .unwrap_or(false);
        if connected {
            self.clear_timer(TimerKind::Connectivity);
        }
    }

    fn arm_timer(&mut self, kind: TimerKind, duration: Duration) {
        let slot = self.timers.slot(kind);
        slot.gen += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
        let gen = slot.gen;
        let tx = self.cmd_tx.clone();
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(Cmd::Timer(kind, gen)).await;
        }));
    }

    fn clear_timer(&mut self, kind: TimerKind) {
        let slot = self.timers.slot(kind);
        slot.gen += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }

    fn log_stale(&self, kind: &str, why: &str) {
        // Recovered locally; never surfaced to the user, never re-dispatched.
        warn!(state = ?self.state, "discarding stale {kind}: {why}");
    }
}
