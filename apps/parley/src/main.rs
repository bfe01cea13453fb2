mod cipher;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::engine::RtcEngine;
use parley_core::telemetry::logging::{self, LogConfig, LogLevel};
use parley_core::{Role, Session, SessionConfig, SessionContext, SessionEvent, SessionHandle};
use tokio::io::{AsyncBufReadExt, BufReader};

use cipher::TokenCipher;

#[derive(Parser, Debug)]
#[command(name = "parley", about = "Encrypted one-to-one chat and video over WebRTC")]
struct Cli {
    /// Signaling server base URL (http, https, ws or wss).
    #[arg(long, env = "PARLEY_SIGNALING_URL")]
    signaling_url: Option<String>,

    #[arg(long, env = "PARLEY_TOKEN")]
    token: String,

    /// Defaults to a random id.
    #[arg(long, env = "PARLEY_PARTICIPANT")]
    participant: Option<String>,

    #[arg(long, env = "PARLEY_ROLE")]
    role: Role,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn, env = "PARLEY_LOG_LEVEL")]
    log_level: LogLevel,

    #[arg(long, env = "PARLEY_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Chat(String),
    Invite,
    Accept,
    Decline,
    End,
    Video(bool),
    Resume,
    Quit,
    Unknown(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Input::Chat(line.to_string()));
    };
    let mut parts = command.split_whitespace();
    Some(match (parts.next(), parts.next()) {
        (Some("invite"), None) => Input::Invite,
        (Some("accept"), None) => Input::Accept,
        (Some("decline"), None) => Input::Decline,
        (Some("end"), None) => Input::End,
        (Some("video"), Some("on")) => Input::Video(true),
        (Some("video"), Some("off")) => Input::Video(false),
        (Some("resume"), None) => Input::Resume,
        (Some("quit"), None) => Input::Quit,
        _ => Input::Unknown(line.to_string()),
    })
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::SignalingStateChanged(state) => format!("* signaling {state:?}"),
        SessionEvent::ParticipantsChanged(participants) => {
            format!("* participants: {}", participants.join(", "))
        }
        SessionEvent::ConnectionStateChanged(status) => format!("* connection {status:?}"),
        SessionEvent::DataChannelOpened => "* chat ready".into(),
        SessionEvent::DataChannelClosed => "* chat closed".into(),
        SessionEvent::VideoInviteReceived => "* video invite received (/accept or /decline)".into(),
        SessionEvent::VideoAccepted => "* video accepted".into(),
        SessionEvent::VideoDeclined => "* video declined".into(),
        SessionEvent::VideoEnded => "* video ended".into(),
        SessionEvent::RemoteMediaChanged(Some(media)) => {
            format!("* remote video {}", media.track_id)
        }
        SessionEvent::RemoteMediaChanged(None) => "* remote video gone".into(),
        SessionEvent::ChatMessageReceived(message) => {
            format!("<{}> {}", message.sender_role, message.text)
        }
        SessionEvent::MessageAcknowledged(id) => format!("* delivered {id}"),
        SessionEvent::NegotiationFailed(reason) => format!("! negotiation failed: {reason}"),
        SessionEvent::DecryptionFailed { message_id, reason } => {
            format!("! could not decrypt {message_id}: {reason}")
        }
        SessionEvent::ServerError(message) => format!("! server: {message}"),
        SessionEvent::SessionEnded(reason) => format!("* session ended: {reason:?}"),
    }
}

async fn dispatch(handle: &SessionHandle, input: Input) -> Result<bool> {
    let result = match input {
        Input::Chat(text) => handle.send_chat(text).await.map(|_| ()),
        Input::Invite => handle.send_invite().await,
        Input::Accept => handle.accept_invite().await,
        Input::Decline => handle.decline_invite().await,
        Input::End => handle.end_call().await,
        Input::Video(true) => handle.start_video().await,
        Input::Video(false) => handle.stop_video().await,
        Input::Resume => handle.request_recovery(),
        Input::Quit => return Ok(false),
        Input::Unknown(line) => {
            eprintln!("unknown command: {line}");
            Ok(())
        }
    };
    if let Err(err) = result {
        eprintln!("! {err}");
    }
    Ok(!handle.is_closed())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialise logging")?;

    let mut config = SessionConfig::from_env();
    if let Some(url) = cli.signaling_url {
        config = config.with_signaling_url(url);
    }
    let participant = cli
        .participant
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let context = SessionContext::new(cli.token, participant, cli.role);
    tracing::info!(
        target: "parley::cli",
        participant = %context.participant_id,
        role = %context.role,
        signaling = %config.signaling_url,
        "starting session"
    );

    let engine = Arc::new(RtcEngine::new(&config).context("failed to set up webrtc engine")?);
    let (handle, mut events) = Session::spawn(config, context, engine, Arc::new(TokenCipher));
    handle.start().await.context("failed to reach signaling server")?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", describe(&event));
            if matches!(event, SessionEvent::SessionEnded(_)) {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let Some(input) = parse_input(&line) else {
            continue;
        };
        if !dispatch(&handle, input).await? {
            break;
        }
    }

    if !handle.is_closed() {
        let _ = handle.end_session().await;
    }
    let _ = printer.await;
    Ok(())
}
