//! End-to-end call flows over an in-process transport pair: two engines,
//! deterministic capture and peer backends, no gateway and no network.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use uuid::Uuid;

use deskcall_client::{
    CallEngine, CallFailure, CallIdentity, CallState, ChannelTransport, ChatEvent, ChatRelay,
    DummyCapture, EngineConfig, EngineEvent, IceState, MediaController, PeerFactory, PeerSession,
    SdpPeerFactory, Transport, TransportEvent,
};
use deskcall_common::{Error, Presence, Result, Role, WireEvent};

const WAIT: Duration = Duration::from_secs(2);

struct Side {
    engine: CallEngine,
    media: Arc<MediaController>,
    transport: Arc<ChannelTransport>,
}

fn make_side(
    transport: ChannelTransport,
    session: Uuid,
    local: &str,
    remote: &str,
    role: Role,
    capture: DummyCapture,
) -> Side {
    let transport = Arc::new(transport);
    let media = Arc::new(MediaController::new(Arc::new(capture)));
    let engine = CallEngine::spawn(
        EngineConfig::default(),
        CallIdentity {
            session_id: session,
            local_id: local.to_string(),
            remote_id: remote.to_string(),
            role,
        },
        Arc::clone(&transport) as Arc<dyn Transport>,
        Arc::clone(&media),
        Arc::new(SdpPeerFactory),
    );
    Side {
        engine,
        media,
        transport,
    }
}

fn call_pair(session: Uuid) -> (Side, Side) {
    let (a, b) = ChannelTransport::pair();
    let customer = make_side(
        a,
        session,
        "customer-7",
        "agent-3",
        Role::Customer,
        DummyCapture::new(),
    );
    let agent = make_side(
        b,
        session,
        "agent-3",
        "customer-7",
        Role::Agent,
        DummyCapture::new(),
    );
    (customer, agent)
}

async fn wait_state(rx: &mut watch::Receiver<CallState>, target: CallState) {
    timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target:?}"))
        .expect("engine stopped");
}

async fn wait_incoming(rx: &mut broadcast::Receiver<EngineEvent>) -> String {
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for incoming call")
            .expect("engine stopped");
        if let EngineEvent::IncomingCall { from } = event {
            return from;
        }
    }
}

/// Customer dials, agent accepts, both land in `Connected`.
async fn establish(customer: &Side, agent: &Side) {
    let mut ringing = agent.engine.subscribe();
    customer.engine.start_call().await.expect("start call");
    let from = wait_incoming(&mut ringing).await;
    assert_eq!(from, "customer-7");
    agent.engine.accept_call().await.expect("accept call");
    wait_state(&mut customer.engine.watch_state(), CallState::Connected).await;
    wait_state(&mut agent.engine.watch_state(), CallState::Connected).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_offer_answer_connects_both_sides() {
    let session = Uuid::new_v4();
    let (customer, agent) = call_pair(session);
    establish(&customer, &agent).await;
    assert_eq!(customer.media.active_track_count(), 2);
    assert_eq!(agent.media.active_track_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_media_denied_fails_without_any_signaling() {
    let session = Uuid::new_v4();
    let (a, b) = ChannelTransport::pair();
    let mut agent_wire = b.subscribe();
    let customer = make_side(
        a,
        session,
        "customer-7",
        "agent-3",
        Role::Customer,
        DummyCapture::failing("permission denied"),
    );

    let err = customer.engine.start_call().await.expect_err("must fail");
    assert!(matches!(err, Error::MediaUnavailable(_)));
    assert_eq!(
        customer.engine.state(),
        CallState::Failed(CallFailure::MediaUnavailable)
    );
    assert_eq!(customer.media.active_track_count(), 0);
    // The counterpart must never learn a call was attempted.
    assert!(agent_wire.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_timeout_then_late_answer_is_discarded() {
    let session = Uuid::new_v4();
    let (a, b) = ChannelTransport::pair();
    let customer = make_side(
        a,
        session,
        "customer-7",
        "agent-3",
        Role::Customer,
        DummyCapture::new(),
    );

    customer.engine.start_call().await.expect("start call");
    let mut state = customer.engine.watch_state();
    // No answer ever arrives; the paused clock runs the timeout down.
    state
        .wait_for(|s| *s == CallState::Failed(CallFailure::NegotiationTimeout))
        .await
        .expect("engine stopped");
    assert_eq!(customer.media.active_track_count(), 0);

    // An answer arriving after the failure changes nothing.
    b.send(WireEvent::VideoAnswer {
        session_id: session,
        answer: "v=0\r\nlate".into(),
        user_id: "customer-7".into(),
        agent_id: "agent-3".into(),
    })
    .expect("send");
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert_eq!(
        customer.engine.state(),
        CallState::Failed(CallFailure::NegotiationTimeout)
    );
}

struct RecordingPeer {
    applied: Arc<Mutex<Vec<String>>>,
    remote: bool,
}

impl PeerSession for RecordingPeer {
    fn create_offer(&mut self) -> Result<String> {
        Ok("v=0\r\nrecording-offer".into())
    }
    fn create_answer(&mut self) -> Result<String> {
        Ok("v=0\r\nrecording-answer".into())
    }
    fn set_remote_description(&mut self, _sdp: &str) -> Result<()> {
        self.remote = true;
        Ok(())
    }
    fn has_remote_description(&self) -> bool {
        self.remote
    }
    fn add_ice_candidate(&mut self, candidate: &str) -> Result<()> {
        self.applied
            .lock()
            .expect("lock")
            .push(candidate.to_string());
        Ok(())
    }
    fn take_local_candidates(&mut self) -> Vec<String> {
        Vec::new()
    }
    fn ice_state(&self) -> IceState {
        IceState::Connected
    }
    fn close(&mut self) {}
}

#[derive(Default)]
struct RecordingFactory {
    applied: Arc<Mutex<Vec<String>>>,
}

impl PeerFactory for RecordingFactory {
    fn connect(&self, _ice_servers: &[String]) -> Result<Box<dyn PeerSession>> {
        Ok(Box::new(RecordingPeer {
            applied: Arc::clone(&self.applied),
            remote: false,
        }))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_candidates_before_the_offer_is_accepted_apply_in_arrival_order() {
    let session = Uuid::new_v4();
    let (a, b) = ChannelTransport::pair();
    let factory = Arc::new(RecordingFactory::default());
    let applied = Arc::clone(&factory.applied);

    let transport = Arc::new(a);
    let media = Arc::new(MediaController::new(Arc::new(DummyCapture::new())));
    let engine = CallEngine::spawn(
        EngineConfig::default(),
        CallIdentity {
            session_id: session,
            local_id: "agent-3".to_string(),
            remote_id: "customer-7".to_string(),
            role: Role::Agent,
        },
        Arc::clone(&transport) as Arc<dyn Transport>,
        media,
        factory,
    );
    let mut ringing = engine.subscribe();
    let mut caller_wire = b.subscribe();

    b.send(WireEvent::VideoOffer {
        session_id: session,
        offer: "v=0\r\ncaller".into(),
        user_id: "customer-7".into(),
        agent_id: "agent-3".into(),
    })
    .expect("send offer");
    for candidate in ["candidate:1", "candidate:2", "candidate:3"] {
        b.send(WireEvent::IceCandidate {
            session_id: session,
            candidate: candidate.into(),
            user_id: "customer-7".into(),
            agent_id: "agent-3".into(),
        })
        .expect("send candidate");
    }

    wait_incoming(&mut ringing).await;
    engine.accept_call().await.expect("accept");
    assert_eq!(
        *applied.lock().expect("lock"),
        vec!["candidate:1", "candidate:2", "candidate:3"]
    );

    let answered = timeout(WAIT, async {
        loop {
            if let TransportEvent::Event(WireEvent::VideoAnswer { .. }) =
                caller_wire.recv().await.expect("wire closed")
            {
                break;
            }
        }
    })
    .await;
    assert!(answered.is_ok(), "caller never saw the answer");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simultaneous_offers_resolve_to_one_call() {
    let session = Uuid::new_v4();
    let (customer, agent) = call_pair(session);
    let mut to_customer = customer.transport.subscribe();
    let mut to_agent = agent.transport.subscribe();

    // Both dial at once. The side with the smaller id yields and answers.
    let (c, a) = tokio::join!(customer.engine.start_call(), agent.engine.start_call());
    c.expect("customer start");
    a.expect("agent start");

    wait_state(&mut customer.engine.watch_state(), CallState::Connected).await;
    wait_state(&mut agent.engine.watch_state(), CallState::Connected).await;

    let mut answers = 0;
    while let Ok(event) = to_customer.try_recv() {
        if matches!(event, TransportEvent::Event(WireEvent::VideoAnswer { .. })) {
            answers += 1;
        }
    }
    while let Ok(event) = to_agent.try_recv() {
        if matches!(event, TransportEvent::Event(WireEvent::VideoAnswer { .. })) {
            answers += 1;
        }
    }
    assert_eq!(answers, 1, "exactly one side may answer");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chat_flows_while_a_call_is_negotiating() {
    let session = Uuid::new_v4();
    let (customer, agent) = call_pair(session);
    let customer_chat = ChatRelay::new(
        Arc::clone(&customer.transport) as Arc<dyn Transport>,
        session,
        "customer-7",
        None,
    );
    let agent_chat = ChatRelay::new(
        Arc::clone(&agent.transport) as Arc<dyn Transport>,
        session,
        "agent-3",
        None,
    );
    let mut agent_events = agent_chat.subscribe();
    let mut customer_events = customer_chat.subscribe();

    // Dial but never accept: the call sits in Negotiating while chat runs.
    customer.engine.start_call().await.expect("start call");
    wait_state(&mut customer.engine.watch_state(), CallState::Negotiating).await;

    let sent = customer_chat
        .send_message("my camera shows a black screen", None)
        .expect("send");
    assert!(!sent.delivered);

    let received = timeout(WAIT, async {
        loop {
            if let ChatEvent::Message(message) = agent_events.recv().await.expect("closed") {
                return message;
            }
        }
    })
    .await
    .expect("agent never received the message");
    assert_eq!(received.id, sent.id);
    assert_eq!(received.sender_id, "customer-7");

    // The automatic ack marks the sender's copy delivered.
    timeout(WAIT, async {
        loop {
            if let ChatEvent::Delivered(id) = customer_events.recv().await.expect("closed") {
                assert_eq!(id, sent.id);
                return;
            }
        }
    })
    .await
    .expect("delivery receipt never arrived");
    assert!(customer_chat.messages()[0].delivered);
    assert_eq!(customer.engine.state(), CallState::Negotiating);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hangup_releases_media_on_both_sides() {
    let session = Uuid::new_v4();
    let (customer, agent) = call_pair(session);
    establish(&customer, &agent).await;

    customer.engine.end_call().await.expect("end call");
    assert_eq!(customer.engine.state(), CallState::Ended);
    // Media is released before end_call returns.
    assert_eq!(customer.media.active_track_count(), 0);

    wait_state(&mut agent.engine.watch_state(), CallState::Ended).await;
    assert_eq!(agent.media.active_track_count(), 0);

    // Both sides can dial again after a reset.
    customer.engine.reset().await.expect("reset");
    assert_eq!(customer.engine.state(), CallState::Idle);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_transport_outage_preserves_a_connected_call() {
    let session = Uuid::new_v4();
    let (customer, agent) = call_pair(session);
    establish(&customer, &agent).await;

    let link = customer.transport.link();
    link.sever();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(customer.engine.state(), CallState::Connected);
    assert_eq!(agent.engine.state(), CallState::Connected);

    link.restore();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(customer.engine.state(), CallState::Connected);
    assert_eq!(agent.engine.state(), CallState::Connected);
    assert_eq!(customer.media.active_track_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_resume_window_expiry_fails_the_call() {
    let session = Uuid::new_v4();
    let (customer, agent) = call_pair(session);
    establish(&customer, &agent).await;

    customer.transport.link().sever();
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
    assert_eq!(customer.engine.state(), CallState::Connected);

    // The transport never recovers; the resume window runs out.
    tokio::time::advance(Duration::from_secs(16)).await;
    let mut state = customer.engine.watch_state();
    state
        .wait_for(|s| *s == CallState::Failed(CallFailure::TransportLost))
        .await
        .expect("engine stopped");
    assert_eq!(customer.media.active_track_count(), 0);

    let mut agent_state = agent.engine.watch_state();
    agent_state
        .wait_for(|s| *s == CallState::Failed(CallFailure::TransportLost))
        .await
        .expect("engine stopped");
    assert_eq!(agent.media.active_track_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_counterpart_going_offline_aborts_a_pending_call() {
    let session = Uuid::new_v4();
    let (a, b) = ChannelTransport::pair();
    let customer = make_side(
        a,
        session,
        "customer-7",
        "agent-3",
        Role::Customer,
        DummyCapture::new(),
    );

    customer.engine.start_call().await.expect("start call");
    assert_eq!(customer.engine.state(), CallState::Negotiating);

    // Somebody else's presence is not our counterpart's.
    b.send(WireEvent::PresenceUpdate {
        user_id: "agent-9".into(),
        state: Presence::Offline,
    })
    .expect("send");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(customer.engine.state(), CallState::Negotiating);

    b.send(WireEvent::PresenceUpdate {
        user_id: "agent-3".into(),
        state: Presence::Offline,
    })
    .expect("send");
    wait_state(
        &mut customer.engine.watch_state(),
        CallState::Failed(CallFailure::PeerOffline),
    )
    .await;
    assert_eq!(customer.media.active_track_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_counterpart_hangup_during_an_outage_lands_after_reconnect() {
    let session = Uuid::new_v4();
    let (customer, agent) = call_pair(session);
    establish(&customer, &agent).await;

    let link = customer.transport.link();
    link.sever();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The agent hangs up while the customer is unreachable; the end event
    // queues on the link and lands right after the restore.
    agent.engine.end_call().await.expect("end call");
    assert_eq!(agent.engine.state(), CallState::Ended);
    assert_eq!(customer.engine.state(), CallState::Connected);

    link.restore();
    wait_state(&mut customer.engine.watch_state(), CallState::Ended).await;
    assert_eq!(customer.media.active_track_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_call_attempt_is_rejected_while_one_is_active() {
    let session = Uuid::new_v4();
    let (customer, agent) = call_pair(session);
    establish(&customer, &agent).await;

    let err = customer.engine.start_call().await.expect_err("must reject");
    assert!(matches!(err, Error::CallAlreadyActive));
    assert_eq!(customer.engine.state(), CallState::Connected);
    let _ = agent;
}
