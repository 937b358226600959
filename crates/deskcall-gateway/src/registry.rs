//! Session registry: who is joined, with which connections, paired with
//! which counterpart.
//!
//! All state lives in this injected instance; there are no module-level
//! statics. Joins are idempotent per user, extra connections for the same
//! user fan out (multi-tab), and a disconnected user keeps their session
//! for a grace window so a reconnect resumes it. Events addressed to a
//! user inside that window queue and flush on rejoin, which is what gives
//! the transport its at-least-once guarantee.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use deskcall_common::{Error, Presence, Result, Role, Session, WireEvent};

/// Per-connection outbox; the WebSocket writer task drains it.
pub type Outbox = mpsc::Sender<WireEvent>;

/// Events queued for an offline-in-grace user beyond this are dropped
/// oldest-first.
const PENDING_EVENT_LIMIT: usize = 256;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long session metadata survives after the last connection drops.
    pub grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(30),
        }
    }
}

struct Connection {
    id: u64,
    tx: Outbox,
}

struct UserEntry {
    role: Role,
    presence: Presence,
    connections: Vec<Connection>,
    pending: VecDeque<WireEvent>,
    /// Bumped on every join/disconnect; a grace timer only destroys the
    /// entry if its generation still matches.
    grace_gen: u64,
}

struct Pair {
    session_id: Uuid,
    customer_id: String,
    agent_id: Option<String>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<String, UserEntry>,
    sessions: HashMap<Uuid, Pair>,
    conn_seq: u64,
}

/// The authoritative session/presence state of the gateway.
pub struct SessionRegistry {
    cfg: RegistryConfig,
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register a connection for a user. Idempotent per user: an existing
    /// session is resumed with presence refreshed to online. Returns the
    /// connection id to hand back on close.
    pub fn join(
        &self,
        user_id: &str,
        user_name: &str,
        role: Role,
        outbox: Outbox,
    ) -> u64 {
        let mut deliveries: Vec<(String, WireEvent)> = Vec::new();
        let conn_id;
        {
            let mut inner = self.inner.lock().expect("registry lock");
            inner.conn_seq += 1;
            conn_id = inner.conn_seq;

            let entry = inner
                .users
                .entry(user_id.to_string())
                .or_insert_with(|| UserEntry {
                    role,
                    presence: Presence::Offline,
                    connections: Vec::new(),
                    pending: VecDeque::new(),
                    grace_gen: 0,
                });
            let was_offline = entry.presence == Presence::Offline;
            entry.presence = Presence::Online;
            entry.grace_gen += 1; // cancels any running grace timer

            // Flush everything queued while the user was away, then attach.
            let pending: Vec<_> = entry.pending.drain(..).collect();
            for event in pending {
                if outbox.try_send(event).is_err() {
                    warn!("outbox full while flushing queue for {user_id}");
                    break;
                }
            }
            entry.connections.push(Connection {
                id: conn_id,
                tx: outbox,
            });

            match role {
                Role::Customer => self.ensure_customer_session(&mut inner, user_id),
                Role::Agent => self.pair_waiting_sessions(&mut inner, user_id),
            }

            // Session views for everyone involved, presence for counterparts.
            for pair in inner.sessions.values().filter(|p| p.involves(user_id)) {
                deliveries.push((
                    pair.customer_id.clone(),
                    session_joined(&inner, pair, &pair.customer_id),
                ));
                if let Some(agent) = &pair.agent_id {
                    deliveries.push((agent.clone(), session_joined(&inner, pair, agent)));
                }
                if was_offline {
                    if let Some(other) = pair.counterpart_of(user_id) {
                        deliveries.push((
                            other.to_string(),
                            WireEvent::PresenceUpdate {
                                user_id: user_id.to_string(),
                                state: Presence::Online,
                            },
                        ));
                    }
                }
            }
            for (target, event) in &deliveries {
                deliver(&mut inner, target, event.clone());
            }
        }
        info!(user = user_id, name = user_name, conn = conn_id, ?role, "joined support chat");
        conn_id
    }

    /// Re-send the user's session views (idempotent join on an already
    /// bound connection).
    pub fn resend_sessions(&self, user_id: &str) {
        let mut inner = self.inner.lock().expect("registry lock");
        let views: Vec<WireEvent> = inner
            .sessions
            .values()
            .filter(|p| p.involves(user_id))
            .map(|p| session_joined(&inner, p, user_id))
            .collect();
        for view in views {
            deliver(&mut inner, user_id, view);
        }
    }

    /// A connection dropped. When it was the user's last one, presence
    /// goes offline and the grace timer starts.
    pub fn connection_closed(self: &Arc<Self>, user_id: &str, conn_id: u64) {
        let gen = {
            let mut inner = self.inner.lock().expect("registry lock");
            let Some(entry) = inner.users.get_mut(user_id) else {
                return;
            };
            entry.connections.retain(|c| c.id != conn_id);
            if !entry.connections.is_empty() {
                debug!(user = user_id, "connection closed, others remain");
                return;
            }
            entry.presence = Presence::Offline;
            entry.grace_gen += 1;
            let gen = entry.grace_gen;
            self.notify_presence(&mut inner, user_id, Presence::Offline);
            info!(user = user_id, grace = ?self.cfg.grace, "last connection closed");
            gen
        };
        self.spawn_grace_timer(user_id.to_string(), gen);
    }

    /// Relay a session-scoped event from `sender` to the counterpart's
    /// connections, stamping identities so a client cannot spoof them.
    pub fn relay(&self, sender_id: &str, event: WireEvent) -> Result<()> {
        let session_id = event
            .session_id()
            .ok_or_else(|| Error::stale("event carries no session id"))?;
        let mut inner = self.inner.lock().expect("registry lock");
        let pair = inner
            .sessions
            .get(&session_id)
            .ok_or_else(|| Error::stale(format!("unknown session {session_id}")))?;
        if !pair.involves(sender_id) {
            return Err(Error::stale(format!(
                "{sender_id} is not a participant of {session_id}"
            )));
        }
        let target = pair
            .counterpart_of(sender_id)
            .ok_or_else(|| Error::stale("session has no counterpart yet"))?
            .to_string();
        let stamped = stamp(event, pair, sender_id);
        deliver(&mut inner, &target, stamped);
        Ok(())
    }

    /// Number of live sessions (for diagnostics and tests).
    pub fn session_count(&self) -> usize {
        self.inner.lock().expect("registry lock").sessions.len()
    }

    /// A user's current session view, if any.
    pub fn session_of(&self, user_id: &str) -> Option<Session> {
        let inner = self.inner.lock().expect("registry lock");
        inner
            .sessions
            .values()
            .find(|p| p.involves(user_id))
            .map(|p| session_view(&inner, p, user_id))
    }

    fn ensure_customer_session(&self, inner: &mut Inner, customer_id: &str) {
        if inner
            .sessions
            .values()
            .any(|p| p.customer_id == customer_id)
        {
            return;
        }
        let agent_id = pick_agent(inner);
        let pair = Pair {
            session_id: Uuid::new_v4(),
            customer_id: customer_id.to_string(),
            agent_id: agent_id.clone(),
        };
        info!(
            session = %pair.session_id,
            customer = customer_id,
            agent = ?agent_id,
            "session created"
        );
        inner.sessions.insert(pair.session_id, pair);
    }

    fn pair_waiting_sessions(&self, inner: &mut Inner, agent_id: &str) {
        for pair in inner.sessions.values_mut().filter(|p| p.agent_id.is_none()) {
            pair.agent_id = Some(agent_id.to_string());
            info!(session = %pair.session_id, agent = agent_id, "agent paired");
        }
    }

    fn notify_presence(&self, inner: &mut Inner, user_id: &str, state: Presence) {
        let targets: Vec<String> = inner
            .sessions
            .values()
            .filter(|p| p.involves(user_id))
            .filter_map(|p| p.counterpart_of(user_id).map(str::to_string))
            .collect();
        for target in targets {
            deliver(
                inner,
                &target,
                WireEvent::PresenceUpdate {
                    user_id: user_id.to_string(),
                    state,
                },
            );
        }
    }

    fn spawn_grace_timer(self: &Arc<Self>, user_id: String, gen: u64) {
        let registry = Arc::clone(self);
        // Anchor the deadline now, not at the task's first poll, so the
        // window measures from the moment the connection closed.
        let sleep = tokio::time::sleep(self.cfg.grace);
        tokio::spawn(async move {
            sleep.await;
            registry.expire(&user_id, gen);
        });
    }

    /// Destroy a user whose grace window elapsed without a rejoin.
    fn expire(&self, user_id: &str, gen: u64) {
        let mut inner = self.inner.lock().expect("registry lock");
        let matches = inner
            .users
            .get(user_id)
            .map(|e| e.grace_gen == gen && e.connections.is_empty())
            .unwrap_or(false);
        if !matches {
            return; // rejoined or superseded in the meantime
        }
        inner.users.remove(user_id);
        info!(user = user_id, "grace elapsed, destroying session state");

        // Customer sessions die with the customer; an agent's sessions go
        // back to waiting and re-pair if another agent is online.
        let dead: Vec<Uuid> = inner
            .sessions
            .values()
            .filter(|p| p.customer_id == user_id)
            .map(|p| p.session_id)
            .collect();
        for id in dead {
            inner.sessions.remove(&id);
        }
        let orphaned: Vec<Uuid> = inner
            .sessions
            .values()
            .filter(|p| p.agent_id.as_deref() == Some(user_id))
            .map(|p| p.session_id)
            .collect();
        for id in orphaned {
            let replacement = pick_agent(&inner);
            if let Some(pair) = inner.sessions.get_mut(&id) {
                pair.agent_id = replacement.clone();
            }
            if replacement.is_some() {
                let views: Vec<(String, WireEvent)> = {
                    let pair = &inner.sessions[&id];
                    let mut v = vec![(
                        pair.customer_id.clone(),
                        session_joined(&inner, pair, &pair.customer_id),
                    )];
                    if let Some(agent) = &pair.agent_id {
                        v.push((agent.clone(), session_joined(&inner, pair, agent)));
                    }
                    v
                };
                for (target, view) in views {
                    deliver(&mut inner, &target, view);
                }
            }
        }
    }
}

impl Pair {
    fn involves(&self, user_id: &str) -> bool {
        self.customer_id == user_id || self.agent_id.as_deref() == Some(user_id)
    }

    fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        if self.customer_id == user_id {
            self.agent_id.as_deref()
        } else if self.agent_id.as_deref() == Some(user_id) {
            Some(self.customer_id.as_str())
        } else {
            None
        }
    }
}

/// Lowest-id online agent wins, for deterministic pairing.
fn pick_agent(inner: &Inner) -> Option<String> {
    inner
        .users
        .iter()
        .filter(|(_, e)| e.role == Role::Agent && e.presence == Presence::Online)
        .map(|(id, _)| id.clone())
        .min()
}

fn session_view(inner: &Inner, pair: &Pair, for_user: &str) -> Session {
    let presence = inner
        .users
        .get(for_user)
        .map(|e| e.presence)
        .unwrap_or(Presence::Offline);
    Session {
        session_id: pair.session_id,
        user_id: for_user.to_string(),
        counterpart_id: pair.counterpart_of(for_user).map(str::to_string),
        presence,
    }
}

fn session_joined(inner: &Inner, pair: &Pair, for_user: &str) -> WireEvent {
    WireEvent::SessionJoined {
        session: session_view(inner, pair, for_user),
    }
}

/// Rewrite the identities an event carries to what the registry knows,
/// and convert client chat sends to the server-side delivery event.
fn stamp(event: WireEvent, pair: &Pair, sender_id: &str) -> WireEvent {
    let customer = pair.customer_id.clone();
    let agent = pair.agent_id.clone().unwrap_or_default();
    match event {
        WireEvent::SupportMessage { mut message }
        | WireEvent::SupportMessageReceived { mut message } => {
            message.sender_id = sender_id.to_string();
            WireEvent::SupportMessageReceived { message }
        }
        WireEvent::VideoOffer {
            session_id, offer, ..
        } => WireEvent::VideoOffer {
            session_id,
            offer,
            user_id: customer,
            agent_id: agent,
        },
        WireEvent::VideoAnswer {
            session_id, answer, ..
        } => WireEvent::VideoAnswer {
            session_id,
            answer,
            user_id: customer,
            agent_id: agent,
        },
        WireEvent::IceCandidate {
            session_id,
            candidate,
            ..
        } => WireEvent::IceCandidate {
            session_id,
            candidate,
            user_id: customer,
            agent_id: agent,
        },
        WireEvent::EndVideoCall { session_id, .. } => WireEvent::EndVideoCall {
            session_id,
            user_id: customer,
            agent_id: agent,
        },
        other => other,
    }
}

/// Fan an event out to every connection of a user, or queue it while the
/// user is inside the grace window.
fn deliver(inner: &mut Inner, user_id: &str, event: WireEvent) {
    let Some(entry) = inner.users.get_mut(user_id) else {
        warn!(user = user_id, kind = event.kind(), "dropping event for unknown user");
        return;
    };
    if entry.connections.is_empty() {
        if entry.pending.len() >= PENDING_EVENT_LIMIT {
            warn!(user = user_id, "pending queue full, dropping oldest event");
            entry.pending.pop_front();
        }
        entry.pending.push_back(event);
        return;
    }
    for conn in &entry.connections {
        if conn.tx.try_send(event.clone()).is_err() {
            warn!(user = user_id, conn = conn.id, "outbox full, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskcall_common::ChatMessage;
    use tokio::sync::mpsc::Receiver;

    fn registry(grace: Duration) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(RegistryConfig { grace }))
    }

    fn connect(
        registry: &Arc<SessionRegistry>,
        user: &str,
        role: Role,
    ) -> (u64, Receiver<WireEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let conn = registry.join(user, user, role, tx);
        (conn, rx)
    }

    fn drain(rx: &mut Receiver<WireEvent>) -> Vec<WireEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn joined_session(events: &[WireEvent], user: &str) -> Option<Session> {
        events.iter().rev().find_map(|ev| match ev {
            WireEvent::SessionJoined { session } if session.user_id == user => {
                Some(session.clone())
            }
            _ => None,
        })
    }

    #[tokio::test]
    async fn test_customer_and_agent_are_paired() {
        let reg = registry(Duration::from_secs(30));
        let (_c, mut customer_rx) = connect(&reg, "customer-1", Role::Customer);
        let (_a, mut agent_rx) = connect(&reg, "agent-1", Role::Agent);

        let customer_view =
            joined_session(&drain(&mut customer_rx), "customer-1").expect("customer view");
        assert_eq!(customer_view.counterpart_id.as_deref(), Some("agent-1"));

        let agent_view = joined_session(&drain(&mut agent_rx), "agent-1").expect("agent view");
        assert_eq!(agent_view.counterpart_id.as_deref(), Some("customer-1"));
        assert_eq!(agent_view.session_id, customer_view.session_id);
    }

    #[tokio::test]
    async fn test_join_is_idempotent_per_user() {
        let reg = registry(Duration::from_secs(30));
        let (_a, _arx) = connect(&reg, "agent-1", Role::Agent);
        let (_c1, mut rx1) = connect(&reg, "customer-1", Role::Customer);
        let first = joined_session(&drain(&mut rx1), "customer-1").expect("view");

        // Second tab: same session, fan-out to both connections.
        let (_c2, mut rx2) = connect(&reg, "customer-1", Role::Customer);
        let second = joined_session(&drain(&mut rx2), "customer-1").expect("view");
        assert_eq!(first.session_id, second.session_id);
        assert_eq!(reg.session_count(), 1);
    }

    #[tokio::test]
    async fn test_relay_stamps_sender_and_converts_chat() {
        let reg = registry(Duration::from_secs(30));
        let (_a, mut agent_rx) = connect(&reg, "agent-1", Role::Agent);
        let (_c, mut customer_rx) = connect(&reg, "customer-1", Role::Customer);
        let session = joined_session(&drain(&mut customer_rx), "customer-1").expect("view");
        drain(&mut agent_rx);

        let mut message = ChatMessage::outgoing(session.session_id, "spoofed", "hi", None);
        message.sender_id = "spoofed".into();
        reg.relay("customer-1", WireEvent::SupportMessage { message })
            .expect("relay");

        let received = drain(&mut agent_rx);
        match received.last() {
            Some(WireEvent::SupportMessageReceived { message }) => {
                assert_eq!(message.sender_id, "customer-1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relay_rejects_non_participants_and_unknown_sessions() {
        let reg = registry(Duration::from_secs(30));
        let (_a, mut agent_rx) = connect(&reg, "agent-1", Role::Agent);
        let (_c, mut customer_rx) = connect(&reg, "customer-1", Role::Customer);
        let session = joined_session(&drain(&mut customer_rx), "customer-1").expect("view");
        drain(&mut agent_rx);

        let event = WireEvent::EndVideoCall {
            session_id: session.session_id,
            user_id: "x".into(),
            agent_id: "y".into(),
        };
        assert!(matches!(
            reg.relay("intruder", event.clone()),
            Err(Error::StaleMessage(_))
        ));

        let unknown = WireEvent::EndVideoCall {
            session_id: Uuid::new_v4(),
            user_id: "x".into(),
            agent_id: "y".into(),
        };
        assert!(matches!(
            reg.relay("customer-1", unknown),
            Err(Error::StaleMessage(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_queues_and_flushes_on_rejoin() {
        let reg = registry(Duration::from_secs(30));
        let (_a, mut agent_rx) = connect(&reg, "agent-1", Role::Agent);
        let (conn, mut customer_rx) = connect(&reg, "customer-1", Role::Customer);
        let session = joined_session(&drain(&mut customer_rx), "customer-1").expect("view");
        drain(&mut agent_rx);

        reg.connection_closed("customer-1", conn);
        // Counterpart hangs up while the customer is away: queued, not lost.
        reg.relay(
            "agent-1",
            WireEvent::EndVideoCall {
                session_id: session.session_id,
                user_id: String::new(),
                agent_id: String::new(),
            },
        )
        .expect("relay");

        tokio::time::advance(Duration::from_secs(10)).await;
        let (_c2, mut rx2) = connect(&reg, "customer-1", Role::Customer);
        let flushed = drain(&mut rx2);
        assert!(
            flushed
                .iter()
                .any(|e| matches!(e, WireEvent::EndVideoCall { .. })),
            "queued end event must flush on rejoin: {flushed:?}"
        );
        assert_eq!(reg.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_destroys_the_session() {
        let reg = registry(Duration::from_secs(30));
        let (_a, _agent_rx) = connect(&reg, "agent-1", Role::Agent);
        let (conn, mut customer_rx) = connect(&reg, "customer-1", Role::Customer);
        drain(&mut customer_rx);
        assert_eq!(reg.session_count(), 1);

        reg.connection_closed("customer-1", conn);
        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(reg.session_count(), 0);
        assert!(reg.session_of("customer-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_cancels_grace_destruction() {
        let reg = registry(Duration::from_secs(30));
        let (_a, _agent_rx) = connect(&reg, "agent-1", Role::Agent);
        let (conn, _rx) = connect(&reg, "customer-1", Role::Customer);

        reg.connection_closed("customer-1", conn);
        tokio::time::advance(Duration::from_secs(10)).await;
        let (_c2, _rx2) = connect(&reg, "customer-1", Role::Customer);
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(reg.session_count(), 1);
    }

    #[tokio::test]
    async fn test_presence_offline_reaches_the_counterpart() {
        let reg = registry(Duration::from_secs(30));
        let (_a, mut agent_rx) = connect(&reg, "agent-1", Role::Agent);
        let (conn, _customer_rx) = connect(&reg, "customer-1", Role::Customer);
        drain(&mut agent_rx);

        reg.connection_closed("customer-1", conn);
        let events = drain(&mut agent_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            WireEvent::PresenceUpdate {
                user_id,
                state: Presence::Offline
            } if user_id == "customer-1"
        )));
    }

    #[tokio::test]
    async fn test_waiting_customer_is_paired_when_agent_joins() {
        let reg = registry(Duration::from_secs(30));
        let (_c, mut customer_rx) = connect(&reg, "customer-1", Role::Customer);
        let unpaired = joined_session(&drain(&mut customer_rx), "customer-1").expect("view");
        assert!(unpaired.counterpart_id.is_none());

        let (_a, _agent_rx) = connect(&reg, "agent-1", Role::Agent);
        let paired = joined_session(&drain(&mut customer_rx), "customer-1").expect("view");
        assert_eq!(paired.counterpart_id.as_deref(), Some("agent-1"));
        assert_eq!(paired.session_id, unpaired.session_id);
    }
}
