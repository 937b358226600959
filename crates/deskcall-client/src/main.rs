//! Deskcall terminal client: join the support channel, chat, and place or
//! answer calls.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use url::Url;

use deskcall_client::{
    CallEngine, CallIdentity, ChatEvent, ChatRelay, DummyCapture, EngineConfig, EngineEvent,
    MediaController, SdpPeerFactory, SessionHandle, Transport, WsTransport,
};
use deskcall_common::Role;

#[derive(Parser, Debug)]
#[command(name = "deskcall")]
#[command(about = "Deskcall support-channel client")]
struct Args {
    /// Signaling gateway WebSocket URL
    #[arg(long, env = "DESKCALL_GATEWAY_URL", default_value = "ws://127.0.0.1:8787/ws")]
    gateway: Url,

    /// User id to join as
    #[arg(long, env = "DESKCALL_USER_ID")]
    user: String,

    /// Display name
    #[arg(long, default_value = "Deskcall user")]
    name: String,

    /// Join as a support agent instead of a customer
    #[arg(long)]
    agent: bool,

    /// STUN/TURN server URL; repeat for multiple
    #[arg(long = "ice-server", env = "DESKCALL_ICE_SERVERS", value_delimiter = ',')]
    ice_servers: Vec<String>,

    /// REST endpoint that persists chat messages beyond the live session
    #[arg(long, env = "DESKCALL_PERSIST_URL")]
    persist_url: Option<String>,

    /// Answer incoming calls automatically
    #[arg(long)]
    auto_accept: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    deskcall_common::init_tracing();
    let args = Args::parse();

    let role = if args.agent { Role::Agent } else { Role::Customer };
    let transport: Arc<dyn Transport> = Arc::new(WsTransport::connect(args.gateway.clone()));

    let mut session = SessionHandle::join(
        Arc::clone(&transport),
        args.user.clone(),
        args.name.clone(),
        role,
    )
    .await
    .context("joining support session")?;

    info!("waiting for a counterpart...");
    let joined = session.wait_counterpart().await?;
    let counterpart = joined
        .counterpart_id
        .clone()
        .context("session has no counterpart")?;
    info!("session {} with {}", joined.session_id, counterpart);

    let media = Arc::new(MediaController::new(Arc::new(DummyCapture::new())));
    let engine = Arc::new(CallEngine::spawn(
        EngineConfig {
            ice_servers: args.ice_servers.clone(),
            ..EngineConfig::default()
        },
        CallIdentity {
            session_id: joined.session_id,
            local_id: args.user.clone(),
            remote_id: counterpart.clone(),
            role,
        },
        Arc::clone(&transport),
        Arc::clone(&media),
        Arc::new(SdpPeerFactory),
    ));
    let chat = Arc::new(ChatRelay::new(
        Arc::clone(&transport),
        joined.session_id,
        args.user.clone(),
        args.persist_url.clone(),
    ));

    spawn_event_printer(Arc::clone(&engine), args.auto_accept);
    spawn_chat_printer(Arc::clone(&chat));

    println!("commands: /call, /accept, /hangup, /mute, /unmute, /camera-on, /camera-off, /quit; anything else is chat");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match line {
                    "/call" => report(engine.start_call().await),
                    "/accept" => report(engine.accept_call().await),
                    "/hangup" => report(engine.end_call().await),
                    "/mute" => report(engine.toggle_audio(false).await),
                    "/unmute" => report(engine.toggle_audio(true).await),
                    "/camera-off" => report(engine.toggle_video(false).await),
                    "/camera-on" => report(engine.toggle_video(true).await),
                    "/quit" => break,
                    text => {
                        chat.set_typing(false).ok();
                        report(chat.send_message(text, None).map(|_| ()));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.end_call().await.ok();
    info!("bye");
    Ok(())
}

fn report(result: deskcall_common::Result<()>) {
    if let Err(err) = result {
        warn!("{err}");
    }
}

fn spawn_event_printer(engine: Arc<CallEngine>, auto_accept: bool) {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::IncomingCall { from } => {
                    println!("* incoming call from {from} (/accept to answer)");
                    if auto_accept {
                        if let Err(err) = engine.accept_call().await {
                            warn!("auto-accept failed: {err}");
                        }
                    }
                }
                EngineEvent::IncomingCallCancelled => println!("* caller hung up"),
                EngineEvent::StateChanged(state) => println!("* call state: {state:?}"),
            }
        }
    });
}

fn spawn_chat_printer(chat: Arc<ChatRelay>) {
    let mut events = chat.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ChatEvent::Message(message) => {
                    println!("<{}> {}", message.sender_id, message.body)
                }
                ChatEvent::Delivered(id) => info!("message {id} delivered"),
            }
        }
    });
}
