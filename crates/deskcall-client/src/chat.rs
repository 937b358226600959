//! Live text chat over the signaling transport.
//!
//! Chat and calls are independent concerns: the relay shares only the
//! transport and the session identity with the engine, and never waits on
//! negotiation activity. Incoming messages are appended in arrival order;
//! `display_order` re-sorts by the sender-assigned timestamp when delivery
//! was reordered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use deskcall_common::{ChatMessage, Result, WireEvent};

use crate::transport::{Transport, TransportEvent};

const CHAT_EVENT_CAPACITY: usize = 128;
/// Typing indicators clear themselves after this much silence; a dropped
/// "stopped typing" never leaves the indicator stuck.
pub const TYPING_CLEAR_WINDOW: Duration = Duration::from_secs(5);
/// Re-assert an unchanged typing flag at most this often.
const TYPING_RESEND_INTERVAL: Duration = Duration::from_secs(2);

/// Chat notification delivered to subscribers.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A message from the counterpart arrived.
    Message(ChatMessage),
    /// One of our messages was acknowledged.
    Delivered(Uuid),
}

/// Messages of one session, arrival order preserved.
#[derive(Debug, Default)]
pub struct ChatLog {
    entries: Vec<ChatMessage>,
}

impl ChatLog {
    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push(message);
    }

    pub fn mark_delivered(&mut self, id: Uuid) -> bool {
        match self.entries.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.delivered = true;
                true
            }
            None => false,
        }
    }

    /// Messages as they arrived.
    pub fn arrival_order(&self) -> Vec<ChatMessage> {
        self.entries.clone()
    }

    /// Messages re-sorted by sender timestamp for display.
    pub fn display_order(&self) -> Vec<ChatMessage> {
        let mut sorted = self.entries.clone();
        sorted.sort_by_key(|m| m.sent_at);
        sorted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Delivers chat messages and typing indicators between the participants
/// of one session.
pub struct ChatRelay {
    transport: Arc<dyn Transport>,
    session_id: Uuid,
    local_id: String,
    events: broadcast::Sender<ChatEvent>,
    log: Arc<Mutex<ChatLog>>,
    typing_rx: watch::Receiver<bool>,
    typing_sent: Mutex<Option<(bool, Instant)>>,
}

impl ChatRelay {
    /// Start relaying for one session. `persist_url`, when set, is the REST
    /// collaborator that stores messages beyond the live session; failures
    /// there are logged and never block delivery.
    pub fn new(
        transport: Arc<dyn Transport>,
        session_id: Uuid,
        local_id: impl Into<String>,
        persist_url: Option<String>,
    ) -> Self {
        let local_id = local_id.into();
        let (events, _) = broadcast::channel(CHAT_EVENT_CAPACITY);
        let (typing_tx, typing_rx) = watch::channel(false);
        let log = Arc::new(Mutex::new(ChatLog::default()));

        tokio::spawn(relay_loop(
            Arc::clone(&transport),
            transport.subscribe(),
            session_id,
            local_id.clone(),
            events.clone(),
            Arc::clone(&log),
            typing_tx,
            persist_url.map(Persist::new),
        ));

        Self {
            transport,
            session_id,
            local_id,
            events,
            log,
            typing_rx,
            typing_sent: Mutex::new(None),
        }
    }

    /// Send a message. It is recorded locally with `delivered = false`
    /// until the counterpart acknowledges it.
    pub fn send_message(
        &self,
        body: impl Into<String>,
        attachment: Option<String>,
    ) -> Result<ChatMessage> {
        let message =
            ChatMessage::outgoing(self.session_id, self.local_id.clone(), body, attachment);
        self.log.lock().expect("chat log lock").push(message.clone());
        self.transport.send(WireEvent::SupportMessage {
            message: message.clone(),
        })?;
        Ok(message)
    }

    /// Broadcast a typing flag. Low priority and non-persisted; unchanged
    /// flags are re-asserted at most every couple of seconds so the
    /// receiver's self-clearing window stays open while typing continues.
    pub fn set_typing(&self, is_typing: bool) -> Result<()> {
        {
            let mut sent = self.typing_sent.lock().expect("typing state lock");
            let now = Instant::now();
            if let Some((last_flag, at)) = *sent {
                if last_flag == is_typing && now.duration_since(at) < TYPING_RESEND_INTERVAL {
                    return Ok(());
                }
            }
            *sent = Some((is_typing, now));
        }
        self.transport.send(WireEvent::AgentTyping {
            session_id: self.session_id,
            is_typing,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Whether the counterpart is typing; clears itself after
    /// [`TYPING_CLEAR_WINDOW`] of silence.
    pub fn counterpart_typing(&self) -> watch::Receiver<bool> {
        self.typing_rx.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.log.lock().expect("chat log lock").arrival_order()
    }

    pub fn messages_for_display(&self) -> Vec<ChatMessage> {
        self.log.lock().expect("chat log lock").display_order()
    }
}

struct Persist {
    client: reqwest::Client,
    url: String,
}

impl Persist {
    fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    fn store(&self, message: &ChatMessage) {
        let request = self.client.post(&self.url).json(message);
        tokio::spawn(async move {
            if let Err(err) = request.send().await {
                warn!("chat persistence failed: {err}");
            }
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn relay_loop(
    transport: Arc<dyn Transport>,
    mut transport_rx: broadcast::Receiver<TransportEvent>,
    session_id: Uuid,
    local_id: String,
    events: broadcast::Sender<ChatEvent>,
    log: Arc<Mutex<ChatLog>>,
    typing_tx: watch::Sender<bool>,
    persist: Option<Persist>,
) {
    let mut typing_clear_at: Option<Instant> = None;

    loop {
        let event = tokio::select! {
            ev = transport_rx.recv() => match ev {
                Ok(ev) => ev,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("chat relay lagged {n} events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = sleep_until_opt(typing_clear_at), if typing_clear_at.is_some() => {
                typing_tx.send_replace(false);
                typing_clear_at = None;
                continue;
            }
        };

        let TransportEvent::Event(event) = event else {
            continue;
        };
        match event {
            // The gateway rewrites `support_message` to
            // `support_message_received` on relay; a direct loopback
            // transport delivers the original. Accept both.
            WireEvent::SupportMessage { mut message }
            | WireEvent::SupportMessageReceived { mut message }
                if message.session_id == session_id && message.sender_id != local_id =>
            {
                message.delivered = true;
                debug!(id = %message.id, "chat message received");
                log.lock().expect("chat log lock").push(message.clone());
                let _ = transport.send(WireEvent::MessageAck {
                    session_id,
                    message_id: message.id,
                });
                if let Some(persist) = &persist {
                    persist.store(&message);
                }
                let _ = events.send(ChatEvent::Message(message));
            }
            WireEvent::MessageAck {
                session_id: sid,
                message_id,
            } if sid == session_id => {
                if log.lock().expect("chat log lock").mark_delivered(message_id) {
                    let _ = events.send(ChatEvent::Delivered(message_id));
                }
            }
            WireEvent::AgentTyping {
                session_id: sid,
                is_typing,
            } if sid == session_id => {
                typing_tx.send_replace(is_typing);
                typing_clear_at = is_typing.then(|| Instant::now() + TYPING_CLEAR_WINDOW);
            }
            _ => {}
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
