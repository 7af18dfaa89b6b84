//! Coordinator server — WebSocket listener and per-connection tasks.
//!
//! Each connection authenticates during the HTTP upgrade (before any room
//! state exists), then runs a read loop that turns wire events into typed
//! room commands. Handlers are isolated: malformed input gets an `error`
//! event back and the loop continues; a connection task failing never
//! touches another connection or the accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth;
use crate::config::Config;
use crate::error::SessionError;
use crate::pipeline::PipelineSettings;
use crate::protocol::{ClientEvent, Participant, ServerEvent, SignalKind};
use crate::registry::room::{RoomCommand, RoomHandle, RoomSettings};
use crate::registry::RoomRegistry;

/// Identity established at handshake time.
#[derive(Debug, Clone)]
struct Identity {
    user_id: String,
    display_name: String,
}

/// Run the coordinator until Ctrl+C.
pub async fn run(config: Config) -> Result<()> {
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    tracing::info!("listening on {}", config.bind_addr);

    let registry = Arc::new(RoomRegistry::new(RoomSettings {
        max_signal_payload: config.max_signal_payload,
        pipeline: PipelineSettings::from_config(&config),
    }));

    let rooms = Arc::clone(&registry);
    tokio::select! {
        result = serve(listener, registry, Arc::new(config)) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down with {} active rooms", rooms.room_count());
            println!("Shutting down...");
            Ok(())
        }
    }
}

/// Accept loop. Split from [`run`] so tests can drive it on an ephemeral port.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<RoomRegistry>,
    config: Arc<Config>,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {:#}", e);
                continue;
            }
        };

        let registry = Arc::clone(&registry);
        let config = Arc::clone(&config);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr, registry, config).await {
                tracing::debug!("connection {} closed: {:#}", peer_addr, e);
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    config: Arc<Config>,
) -> Result<()> {
    let mut identity: Option<Identity> = None;
    let secret = config.shared_secret.clone();

    let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
        match authenticate(request, &secret) {
            Ok(id) => {
                identity = Some(id);
                Ok(response)
            }
            Err(e) => {
                tracing::warn!("rejected connection from {}: {}", peer_addr, e);
                let mut response = ErrorResponse::new(Some(e.to_string()));
                *response.status_mut() = StatusCode::UNAUTHORIZED;
                Err(response)
            }
        }
    })
    .await
    .context("WebSocket handshake failed")?;

    let identity = identity.context("handshake closure did not run")?;
    let conn_id = Uuid::new_v4();
    tracing::info!("{} connected from {} ({})", identity.user_id, peer_addr, conn_id);

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Outbox: the FIFO queue every room component delivers into. A separate
    // control lane carries protocol frames (pongs) from the read loop.
    let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (ctrl, mut ctrl_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = outbox_rx.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("failed to serialize event: {:#}", e);
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                frame = ctrl_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if ws_tx.send(frame).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let result = read_loop(&mut ws_rx, conn_id, &identity, &registry, &outbox, &ctrl).await;

    // Transport gone, for whatever reason: same cleanup as an explicit leave.
    registry.on_disconnect(conn_id);
    writer.abort();
    tracing::info!("{} disconnected ({})", identity.user_id, conn_id);
    result
}

async fn read_loop(
    ws_rx: &mut (impl futures::Stream<Item = tokio_tungstenite::tungstenite::Result<Message>> + Unpin),
    conn_id: Uuid,
    identity: &Identity,
    registry: &RoomRegistry,
    outbox: &mpsc::UnboundedSender<ServerEvent>,
    ctrl: &mpsc::UnboundedSender<Message>,
) -> Result<()> {
    // The room the connection is currently joined to, if any.
    let mut session: Option<RoomHandle> = None;

    while let Some(frame) = ws_rx.next().await {
        let message = frame.context("WebSocket receive error")?;
        match message {
            Message::Text(text) => {
                let event = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        // One participant's malformed input stays that
                        // participant's problem.
                        tracing::debug!("malformed event from {}: {:#}", identity.user_id, e);
                        let _ = outbox.send(ServerEvent::Error {
                            code: "malformed-event".to_string(),
                            message: "could not parse event".to_string(),
                        });
                        continue;
                    }
                };
                dispatch(event, conn_id, identity, registry, outbox, &mut session).await;
            }
            Message::Ping(data) => {
                let _ = ctrl.send(Message::Pong(data));
            }
            Message::Close(_) => break,
            other => {
                tracing::debug!("ignoring frame: {:?}", other);
            }
        }
    }
    Ok(())
}

async fn dispatch(
    event: ClientEvent,
    conn_id: Uuid,
    identity: &Identity,
    registry: &RoomRegistry,
    outbox: &mpsc::UnboundedSender<ServerEvent>,
    session: &mut Option<RoomHandle>,
) {
    match event {
        ClientEvent::JoinMeeting { room_id } => {
            let participant =
                Participant::new(identity.user_id.clone(), identity.display_name.clone());
            match registry
                .join(&room_id, conn_id, participant, outbox.clone())
                .await
            {
                Ok((handle, snapshot)) => {
                    let _ = outbox.send(ServerEvent::MeetingJoined {
                        room_id: handle.room_id.clone(),
                        participants: snapshot.participants,
                        is_recording: snapshot.is_recording,
                        transcription_enabled: snapshot.transcription_enabled,
                    });
                    *session = Some(handle);
                }
                Err(e) => {
                    tracing::warn!("join of {} to {} failed: {}", identity.user_id, room_id, e);
                    let _ = outbox.send(ServerEvent::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        ClientEvent::LeaveMeeting { room_id } => {
            registry.leave(&room_id, &identity.user_id, Some(conn_id));
            if session.as_ref().is_some_and(|h| h.room_id == room_id) {
                *session = None;
            }
        }
        other => {
            let ended = matches!(other, ClientEvent::EndMeeting { .. });
            let routed = route_to_room(other, identity, session);
            // A stale or forged roomId is a dropped event; the session
            // binding only goes away when the joined room actually ended.
            if ended && routed {
                *session = None;
            }
        }
    }
}

/// Forward a room-scoped event to the connection's joined room. Addressing a
/// room the connection is not in — including a stale or forged `roomId` —
/// is a no-op, logged. Returns whether the event reached the joined room.
fn route_to_room(event: ClientEvent, identity: &Identity, session: &Option<RoomHandle>) -> bool {
    let Some(handle) = session else {
        tracing::debug!(
            "{} sent {:?} before joining a room",
            identity.user_id,
            event.room_id()
        );
        return false;
    };
    if *event.room_id() != handle.room_id {
        tracing::debug!(
            "{} addressed room {} while joined to {}",
            identity.user_id,
            event.room_id(),
            handle.room_id
        );
        return false;
    }

    let from = identity.user_id.clone();
    let command = match event {
        ClientEvent::WebrtcOffer { to, payload, .. } => RoomCommand::Signal {
            from,
            to,
            kind: SignalKind::Offer,
            payload,
        },
        ClientEvent::WebrtcAnswer { to, payload, .. } => RoomCommand::Signal {
            from,
            to,
            kind: SignalKind::Answer,
            payload,
        },
        ClientEvent::WebrtcIceCandidate { to, payload, .. } => RoomCommand::Signal {
            from,
            to,
            kind: SignalKind::IceCandidate,
            payload,
        },
        ClientEvent::ChatMessage {
            message,
            message_type,
            ..
        } => RoomCommand::Chat {
            from,
            message,
            message_type,
        },
        ClientEvent::AudioData {
            audio_data, format, ..
        } => match BASE64.decode(audio_data.as_bytes()) {
            Ok(data) => RoomCommand::Audio { from, data, format },
            Err(_) => {
                tracing::debug!("undecodable audio payload from {}", identity.user_id);
                return false;
            }
        },
        ClientEvent::Reaction { emoji, .. } => RoomCommand::Reaction { from, emoji },
        ClientEvent::PollCreate {
            question, options, ..
        } => RoomCommand::PollCreate {
            from,
            question,
            options,
        },
        ClientEvent::PollVote {
            poll_id, option, ..
        } => RoomCommand::PollVote {
            from,
            poll_id,
            option,
        },
        ClientEvent::WhiteboardDraw { stroke, .. } => RoomCommand::WhiteboardDraw { from, stroke },
        ClientEvent::RecordingStart { .. } => RoomCommand::SetRecording { from, on: true },
        ClientEvent::RecordingStop { .. } => RoomCommand::SetRecording { from, on: false },
        ClientEvent::ScreenShareStart { .. } => RoomCommand::SetScreenShare { from, on: true },
        ClientEvent::ScreenShareStop { .. } => RoomCommand::SetScreenShare { from, on: false },
        ClientEvent::TranscriptionStart { .. } => RoomCommand::SetTranscription { from, on: true },
        ClientEvent::TranscriptionStop { .. } => RoomCommand::SetTranscription { from, on: false },
        ClientEvent::ParticipantStatus {
            muted,
            video_on,
            speaking,
            ..
        } => RoomCommand::Status {
            from,
            muted,
            video_on,
            speaking,
        },
        ClientEvent::EndMeeting { .. } => RoomCommand::End { from },
        ClientEvent::JoinMeeting { .. } | ClientEvent::LeaveMeeting { .. } => {
            unreachable!("handled in dispatch")
        }
    };
    handle.send(command);
    true
}

/// Check the connect credential carried in the upgrade URL's query string.
/// Runs before any room-level state exists.
fn authenticate(request: &Request, secret: &str) -> Result<Identity, SessionError> {
    let query = request.uri().query().unwrap_or("");

    let mut user_id = None;
    let mut display_name = None;
    let mut token = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "user" => user_id = Some(value.into_owned()),
            "name" => display_name = Some(value.into_owned()),
            "token" => token = Some(value.into_owned()),
            _ => {}
        }
    }

    let user_id = user_id.ok_or(SessionError::Unauthenticated)?;
    let token = token.ok_or(SessionError::Unauthenticated)?;
    auth::verify_token(secret, &user_id, &token)?;

    let display_name = display_name.unwrap_or_else(|| user_id.clone());
    Ok(Identity {
        user_id,
        display_name,
    })
}
