//! Client-side session handle.
//!
//! Joins the support channel, tracks the counterpart's presence, and
//! re-joins automatically whenever the transport comes back up, so a
//! reconnect inside the gateway's grace window lands in the same session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use deskcall_common::{Error, Presence, Result, Role, Session, WireEvent};

use crate::transport::{Transport, TransportEvent};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A joined support session.
pub struct SessionHandle {
    user_id: String,
    session_rx: watch::Receiver<Option<Session>>,
    presence_rx: watch::Receiver<Presence>,
}

impl SessionHandle {
    /// Send `join_support_chat` and wait for the gateway's `session_joined`.
    /// Joining twice for the same user is accepted by the registry and
    /// resolves to the same session.
    pub async fn join(
        transport: Arc<dyn Transport>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
        role: Role,
    ) -> Result<Self> {
        let user_id = user_id.into();
        let user_name = user_name.into();

        let (session_tx, session_rx) = watch::channel(None);
        let (presence_tx, presence_rx) = watch::channel(Presence::Offline);

        let transport_rx = transport.subscribe();
        let join_event = WireEvent::JoinSupportChat {
            user_id: user_id.clone(),
            user_name: user_name.clone(),
            role,
        };
        transport.send(join_event.clone())?;

        tokio::spawn(track_session(
            transport,
            transport_rx,
            join_event,
            user_id.clone(),
            session_tx,
            presence_tx,
        ));

        let mut handle = Self {
            user_id,
            session_rx,
            presence_rx,
        };
        tokio::time::timeout(JOIN_TIMEOUT, handle.wait_joined())
            .await
            .map_err(|_| Error::transport("timed out waiting for session_joined"))??;
        Ok(handle)
    }

    async fn wait_joined(&mut self) -> Result<()> {
        while self.session_rx.borrow().is_none() {
            self.session_rx
                .changed()
                .await
                .map_err(|_| Error::transport("session tracker stopped"))?;
        }
        Ok(())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Current session view, if joined.
    pub fn session(&self) -> Option<Session> {
        self.session_rx.borrow().clone()
    }

    /// Wait until the registry has paired us with a counterpart.
    pub async fn wait_counterpart(&mut self) -> Result<Session> {
        loop {
            if let Some(session) = self.session_rx.borrow().clone() {
                if session.counterpart_id.is_some() {
                    return Ok(session);
                }
            }
            self.session_rx
                .changed()
                .await
                .map_err(|_| Error::transport("session tracker stopped"))?;
        }
    }

    /// Counterpart presence as reported by the registry.
    pub fn counterpart_presence(&self) -> watch::Receiver<Presence> {
        self.presence_rx.clone()
    }
}

async fn track_session(
    transport: Arc<dyn Transport>,
    mut transport_rx: broadcast::Receiver<TransportEvent>,
    join_event: WireEvent,
    user_id: String,
    session_tx: watch::Sender<Option<Session>>,
    presence_tx: watch::Sender<Presence>,
) {
    loop {
        let event = match transport_rx.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("session tracker lagged {n} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            TransportEvent::Up => {
                // Rejoin so a reconnect inside the grace window resumes the
                // same session and flushes anything queued for us.
                debug!("transport up, re-joining session");
                if transport.send(join_event.clone()).is_err() {
                    return;
                }
            }
            TransportEvent::Down => {}
            TransportEvent::Event(WireEvent::SessionJoined { session })
                if session.user_id == user_id =>
            {
                info!(
                    session = %session.session_id,
                    counterpart = ?session.counterpart_id,
                    "session joined"
                );
                session_tx.send_replace(Some(session));
            }
            TransportEvent::Event(WireEvent::PresenceUpdate { user_id: who, state }) => {
                let counterpart = session_tx
                    .borrow()
                    .as_ref()
                    .and_then(|s| s.counterpart_id.clone());
                if counterpart.as_deref() == Some(who.as_str()) {
                    presence_tx.send_replace(state);
                }
            }
            TransportEvent::Event(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use tokio::time::timeout;
    use uuid::Uuid;

    /// Answers every `join_support_chat` with a session view, like the
    /// gateway would.
    fn spawn_join_responder(gateway: Arc<ChannelTransport>) {
        let mut rx = gateway.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let TransportEvent::Event(WireEvent::JoinSupportChat { user_id, .. }) = event {
                    let _ = gateway.send(WireEvent::SessionJoined {
                        session: Session {
                            session_id: Uuid::nil(),
                            user_id,
                            counterpart_id: Some("agent-1".into()),
                            presence: Presence::Online,
                        },
                    });
                }
            }
        });
    }

    #[tokio::test]
    async fn test_join_resolves_on_session_joined() {
        let (a, b) = ChannelTransport::pair();
        spawn_join_responder(Arc::new(b));

        let handle = SessionHandle::join(Arc::new(a), "customer-1", "Ada", Role::Customer)
            .await
            .expect("join");
        let session = handle.session().expect("session view");
        assert_eq!(session.user_id, "customer-1");
        assert_eq!(session.counterpart_id.as_deref(), Some("agent-1"));
    }

    #[tokio::test]
    async fn test_rejoin_is_sent_when_the_transport_recovers() {
        let (a, b) = ChannelTransport::pair();
        let gateway = Arc::new(b);
        spawn_join_responder(Arc::clone(&gateway));
        let mut wire = gateway.subscribe();

        let a = Arc::new(a);
        let handle = SessionHandle::join(
            Arc::clone(&a) as Arc<dyn Transport>,
            "customer-1",
            "Ada",
            Role::Customer,
        )
        .await
        .expect("join");

        a.link().sever();
        a.link().restore();

        // The tracker re-sends the join on `Up`, so the gateway sees two.
        let mut joins = 0;
        let _ = timeout(Duration::from_secs(2), async {
            while joins < 2 {
                if let Ok(TransportEvent::Event(WireEvent::JoinSupportChat { .. })) =
                    wire.recv().await
                {
                    joins += 1;
                }
            }
        })
        .await;
        assert_eq!(joins, 2, "reconnect must re-send join_support_chat");
        assert!(handle.session().is_some(), "session view must survive");
    }
}
