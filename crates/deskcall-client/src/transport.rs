//! Signaling transport: one logical bidirectional event channel per client.
//!
//! The transport is an explicit instance injected into the session handle,
//! the call engine and the chat relay. Nothing in this crate touches a
//! global socket. `WsTransport` is the production WebSocket implementation;
//! `ChannelTransport` is an in-process pair used for loopback runs and
//! tests, with a link handle that can sever and restore the connection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};
use url::Url;

use deskcall_common::{Error, Result, WireEvent};

const EVENT_BUS_CAPACITY: usize = 256;
const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(15);

/// Transport-level notification delivered to subscribers.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Connection (re)established.
    Up,
    /// Connection lost; the transport keeps trying to reconnect.
    Down,
    /// An event arrived from the counterpart side.
    Event(WireEvent),
}

/// Bidirectional event channel carrying typed signaling and chat events.
///
/// Outbound events queue while the connection is down and flush on
/// reconnect, giving at-least-once delivery for queued events.
pub trait Transport: Send + Sync {
    fn send(&self, event: WireEvent) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    fn is_up(&self) -> bool;
}

/// WebSocket transport with transparent reconnection.
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<WireEvent>,
    events: broadcast::Sender<TransportEvent>,
    up: Arc<AtomicBool>,
}

impl WsTransport {
    /// Connect to a signaling gateway. The connection task starts
    /// immediately and keeps reconnecting with jittered backoff until the
    /// transport is dropped.
    pub fn connect(url: Url) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let up = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_connection(
            url,
            outbound_rx,
            events.clone(),
            Arc::clone(&up),
        ));

        Self {
            outbound,
            events,
            up,
        }
    }
}

impl Transport for WsTransport {
    fn send(&self, event: WireEvent) -> Result<()> {
        self.outbound
            .send(event)
            .map_err(|_| Error::transport("transport task stopped"))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}

async fn run_connection(
    url: Url,
    mut outbound_rx: mpsc::UnboundedReceiver<WireEvent>,
    events: broadcast::Sender<TransportEvent>,
    up: Arc<AtomicBool>,
) {
    // Events accepted while disconnected wait here until the next flush.
    let mut queue: VecDeque<WireEvent> = VecDeque::new();
    let mut attempt: u32 = 0;

    loop {
        let mut ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let delay = backoff_delay(attempt);
                debug!("gateway connect failed ({err}); retrying in {delay:?}");
                // Keep draining callers so senders never block on a dead link.
                let sleep = tokio::time::sleep(delay);
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        _ = &mut sleep => break,
                        ev = outbound_rx.recv() => match ev {
                            Some(ev) => queue.push_back(ev),
                            None => return,
                        },
                    }
                }
                continue;
            }
        };

        attempt = 0;
        up.store(true, Ordering::Relaxed);
        let _ = events.send(TransportEvent::Up);
        info!("signaling transport up: {url}");

        // Flush everything queued while we were down.
        let mut flush_failed = false;
        while let Some(ev) = queue.pop_front() {
            if let Err(err) = send_event(&mut ws, &ev).await {
                warn!("flush failed, requeueing event: {err}");
                queue.push_front(ev);
                flush_failed = true;
                break;
            }
        }

        if !flush_failed {
            loop {
                tokio::select! {
                    ev = outbound_rx.recv() => {
                        let Some(ev) = ev else { return };
                        if let Err(err) = send_event(&mut ws, &ev).await {
                            warn!("send failed, requeueing event: {err}");
                            queue.push_front(ev);
                            break;
                        }
                    }
                    msg = ws.next() => {
                        match msg {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<WireEvent>(&text) {
                                    Ok(event) => {
                                        let _ = events.send(TransportEvent::Event(event));
                                    }
                                    Err(err) => warn!("invalid event from gateway: {err}"),
                                }
                            }
                            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!("transport read error: {err}");
                                break;
                            }
                        }
                    }
                }
            }
        }

        up.store(false, Ordering::Relaxed);
        let _ = events.send(TransportEvent::Down);
        info!("signaling transport down, reconnecting");
    }
}

async fn send_event(
    ws: &mut (impl Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    event: &WireEvent,
) -> Result<()> {
    let text = serde_json::to_string(event)?;
    ws.send(WsMessage::Text(text))
        .await
        .map_err(Error::transport)
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE_DELAY.saturating_mul(1u32 << attempt.min(5));
    let capped = exp.min(RECONNECT_MAX_DELAY);
    // Jitter spreads reconnect storms after a gateway restart.
    let jitter = rand::thread_rng().gen_range(0..=capped.as_millis() as u64 / 4);
    capped + Duration::from_millis(jitter)
}

/// In-process transport pair connected by a severable link.
pub struct ChannelTransport {
    link: Arc<Link>,
    side: Side,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

/// Shared state of a [`ChannelTransport`] pair. Cloning the handle lets a
/// test (or a supervisor) sever and restore the link.
pub struct Link {
    inner: Mutex<LinkInner>,
    a_events: broadcast::Sender<TransportEvent>,
    b_events: broadcast::Sender<TransportEvent>,
}

struct LinkInner {
    up: bool,
    pending_to_a: VecDeque<WireEvent>,
    pending_to_b: VecDeque<WireEvent>,
}

impl Link {
    /// Drop the link: both sides observe `Down`; sends queue until restore.
    pub fn sever(&self) {
        let mut inner = self.inner.lock().expect("link lock");
        if !inner.up {
            return;
        }
        inner.up = false;
        drop(inner);
        let _ = self.a_events.send(TransportEvent::Down);
        let _ = self.b_events.send(TransportEvent::Down);
    }

    /// Restore the link and flush everything queued while it was down,
    /// preserving order.
    pub fn restore(&self) {
        let mut inner = self.inner.lock().expect("link lock");
        if inner.up {
            return;
        }
        inner.up = true;
        let to_a: Vec<_> = inner.pending_to_a.drain(..).collect();
        let to_b: Vec<_> = inner.pending_to_b.drain(..).collect();
        drop(inner);
        let _ = self.a_events.send(TransportEvent::Up);
        let _ = self.b_events.send(TransportEvent::Up);
        for ev in to_a {
            let _ = self.a_events.send(TransportEvent::Event(ev));
        }
        for ev in to_b {
            let _ = self.b_events.send(TransportEvent::Event(ev));
        }
    }

    pub fn is_up(&self) -> bool {
        self.inner.lock().expect("link lock").up
    }
}

impl ChannelTransport {
    /// Create a connected pair. Everything side A sends is delivered to
    /// side B's subscribers and vice versa.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (a_events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (b_events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let link = Arc::new(Link {
            inner: Mutex::new(LinkInner {
                up: true,
                pending_to_a: VecDeque::new(),
                pending_to_b: VecDeque::new(),
            }),
            a_events,
            b_events,
        });
        (
            ChannelTransport {
                link: Arc::clone(&link),
                side: Side::A,
            },
            ChannelTransport {
                link,
                side: Side::B,
            },
        )
    }

    /// Handle for severing/restoring the link.
    pub fn link(&self) -> Arc<Link> {
        Arc::clone(&self.link)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, event: WireEvent) -> Result<()> {
        let mut inner = self.link.inner.lock().expect("link lock");
        if inner.up {
            drop(inner);
            let peer = match self.side {
                Side::A => &self.link.b_events,
                Side::B => &self.link.a_events,
            };
            let _ = peer.send(TransportEvent::Event(event));
        } else {
            match self.side {
                Side::A => inner.pending_to_b.push_back(event),
                Side::B => inner.pending_to_a.push_back(event),
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        match self.side {
            Side::A => self.link.a_events.subscribe(),
            Side::B => self.link.b_events.subscribe(),
        }
    }

    fn is_up(&self) -> bool {
        self.link.is_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskcall_common::Presence;

    fn probe_event() -> WireEvent {
        WireEvent::PresenceUpdate {
            user_id: "u1".into(),
            state: Presence::Online,
        }
    }

    #[tokio::test]
    async fn test_pair_delivers_to_peer_only() {
        let (a, b) = ChannelTransport::pair();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.send(probe_event()).expect("send");
        assert!(matches!(b_rx.try_recv(), Ok(TransportEvent::Event(_))));
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_severed_link_queues_and_flushes_in_order() {
        let (a, b) = ChannelTransport::pair();
        let mut b_rx = b.subscribe();

        a.link().sever();
        assert!(!a.is_up());
        assert!(matches!(b_rx.try_recv(), Ok(TransportEvent::Down)));

        a.send(WireEvent::PresenceUpdate {
            user_id: "first".into(),
            state: Presence::Online,
        })
        .expect("send");
        a.send(WireEvent::PresenceUpdate {
            user_id: "second".into(),
            state: Presence::Online,
        })
        .expect("send");
        assert!(b_rx.try_recv().is_err());

        a.link().restore();
        assert!(matches!(b_rx.try_recv(), Ok(TransportEvent::Up)));
        for expected in ["first", "second"] {
            match b_rx.try_recv() {
                Ok(TransportEvent::Event(WireEvent::PresenceUpdate { user_id, .. })) => {
                    assert_eq!(user_id, expected)
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
    }
}
