//! Reference client session.
//!
//! Connects to a coordinator, joins one room, and drives the peer mesh
//! orchestrator against a pluggable engine while printing room events.
//! Browser clients speak the same protocol; this one exists for development
//! and for exercising a deployment end to end.

pub mod socket;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time;

use crate::auth;
use crate::config::Config;
use crate::mesh::{MeshEvent, MeshOrchestrator, PeerTransport, TrackKind, TransportFactory};
use crate::protocol::{ClientEvent, ServerEvent, UserId};

/// Builds one peer engine per remote, shared across reconnect attempts.
pub type EngineFactory = Arc<dyn Fn(&UserId) -> Box<dyn PeerTransport> + Send + Sync>;

/// Reason the inner session loop exited.
enum DisconnectReason {
    /// Clean shutdown (Ctrl+C or meeting ended). Do not reconnect.
    Shutdown,
    /// Error or server-initiated close. Should reconnect.
    Error(anyhow::Error),
}

/// Run the client session with automatic reconnection.
///
/// On transient errors or server-initiated disconnects, reconnects with
/// exponential backoff (1s, 2s, 4s, ... capped at 64s). On clean shutdown
/// (Ctrl+C, meeting ended), exits immediately.
pub async fn connect_and_run(
    config: &Config,
    room_id: &str,
    user_id: &str,
    display_name: &str,
    engine: EngineFactory,
) -> Result<()> {
    let mut backoff = 1u64;

    loop {
        match run_session(config, room_id, user_id, display_name, &engine).await {
            Ok(DisconnectReason::Shutdown) => {
                return Ok(());
            }
            Ok(DisconnectReason::Error(e)) => {
                // Connection was stable (>60s), reset backoff before reconnecting.
                backoff = 1;
                tracing::warn!(
                    "Disconnected after stable session: {:#}. Reconnecting in 1s...",
                    e,
                );

                tokio::select! {
                    _ = time::sleep(Duration::from_secs(1)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        println!("Shutting down...");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Disconnected: {:#}. Reconnecting in {}s...", e, backoff);

                tokio::select! {
                    _ = time::sleep(Duration::from_secs(backoff)) => {}
                    _ = tokio::signal::ctrl_c() => {
                        println!("Shutting down...");
                        return Ok(());
                    }
                }

                backoff = (backoff * 2).min(64);
            }
        }
    }
}

/// Run one full session: connect, join, event loop.
///
/// Returns `DisconnectReason::Shutdown` on clean exit, or
/// `DisconnectReason::Error` when the connection should be retried.
async fn run_session(
    config: &Config,
    room_id: &str,
    user_id: &str,
    display_name: &str,
    engine: &EngineFactory,
) -> Result<DisconnectReason> {
    let token = auth::mint_token(&config.shared_secret, user_id);
    let mut ws =
        socket::MeetingSocket::connect(&config.server_url, user_id, display_name, &token).await?;

    ws.send_event(&ClientEvent::JoinMeeting {
        room_id: room_id.to_string(),
    })
    .await?;

    // Signaling the mesh produces goes through this queue; the loop below
    // flushes it to the socket.
    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ClientEvent>();
    let per_peer = Arc::clone(engine);
    let factory: TransportFactory = Box::new(move |remote: &UserId| per_peer(remote));
    let mut mesh =
        MeshOrchestrator::new(user_id.to_string(), room_id.to_string(), factory, signal_tx);

    let connected_at = Instant::now();
    let mut keepalive = time::interval(Duration::from_secs(30));
    keepalive.tick().await; // skip first immediate tick

    // Stability threshold: reset backoff after 60s of successful connection.
    // Communicated via the return value — the caller checks timing.
    let stability_threshold = Duration::from_secs(60);

    println!("Connected to {}. (Ctrl-C to leave)", config.server_url);

    let disconnect_reason = loop {
        tokio::select! {
            event = ws.recv_event() => {
                match event {
                    Ok(Some(event)) => {
                        let ended = matches!(event, ServerEvent::MeetingEnded { .. });
                        render(&event);
                        let changes = mesh.handle_event(&event);
                        if !changes.is_empty() {
                            tracing::debug!("{} peer links", mesh.link_count());
                        }
                        for change in changes {
                            render_mesh(&change);
                        }
                        if ended {
                            break DisconnectReason::Shutdown;
                        }
                    }
                    Ok(None) => {
                        break DisconnectReason::Error(anyhow::anyhow!("connection closed by server"));
                    }
                    Err(e) => {
                        break DisconnectReason::Error(e.context("WebSocket recv error"));
                    }
                }
            }
            outbound = signal_rx.recv() => {
                let Some(outbound) = outbound else {
                    break DisconnectReason::Error(anyhow::anyhow!("signaling queue closed"));
                };
                if let Err(e) = ws.send_event(&outbound).await {
                    break DisconnectReason::Error(e.context("signaling send failed"));
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = ws.ping().await {
                    break DisconnectReason::Error(e.context("keepalive send failed"));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Leaving...");
                let _ = ws.send_event(&ClientEvent::LeaveMeeting {
                    room_id: room_id.to_string(),
                }).await;
                break DisconnectReason::Shutdown;
            }
        }
    };

    // If we were connected long enough, signal stability so caller resets backoff.
    if connected_at.elapsed() >= stability_threshold {
        return Ok(disconnect_reason);
    }

    match disconnect_reason {
        DisconnectReason::Shutdown => Ok(DisconnectReason::Shutdown),
        DisconnectReason::Error(e) => Err(e),
    }
}

/// Print a room event, one line each, signaling traffic at debug only.
fn render(event: &ServerEvent) {
    match event {
        ServerEvent::MeetingJoined {
            room_id,
            participants,
            is_recording,
            transcription_enabled,
        } => {
            println!(
                "Joined {} ({} participants, recording={}, transcription={})",
                room_id,
                participants.len(),
                is_recording,
                transcription_enabled
            );
            for p in participants {
                println!("  {} ({:?})", p.display_name, p.role);
            }
        }
        ServerEvent::ParticipantJoined { name, .. } => println!("→ {} joined", name),
        ServerEvent::ParticipantLeft { name, .. } => println!("← {} left", name),
        ServerEvent::ChatMessage { name, message, .. } => println!("[CHAT] {}: {}", name, message),
        ServerEvent::Transcription {
            speaker_name,
            text,
            confidence,
            ..
        } => println!("[TRANSCRIPT] {}: {} ({:.2})", speaker_name, text, confidence),
        ServerEvent::AiInsight {
            insight_type, data, ..
        } => println!("[INSIGHT] {}: {}", insight_type, data),
        ServerEvent::Reaction { from, emoji, .. } => println!("[REACT] {}: {}", from, emoji),
        ServerEvent::PollCreate {
            from,
            question,
            options,
            ..
        } => println!("[POLL] {} asks: {} {:?}", from, question, options),
        ServerEvent::PollVote { from, option, .. } => {
            println!("[POLL] {} voted for option {}", from, option)
        }
        ServerEvent::WhiteboardDraw { from, .. } => println!("[BOARD] stroke from {}", from),
        ServerEvent::RecordingStart { user_id, .. } => {
            println!("● recording started by {}", user_id)
        }
        ServerEvent::RecordingStop { user_id, .. } => {
            println!("○ recording stopped by {}", user_id)
        }
        ServerEvent::ScreenShareStart { user_id, .. } => {
            println!("[SHARE] {} started sharing", user_id)
        }
        ServerEvent::ScreenShareStop { user_id, .. } => {
            println!("[SHARE] {} stopped sharing", user_id)
        }
        ServerEvent::TranscriptionStart { user_id, .. } => {
            println!("[TRANSCRIPT] enabled by {}", user_id)
        }
        ServerEvent::TranscriptionStop { user_id, .. } => {
            println!("[TRANSCRIPT] disabled by {}", user_id)
        }
        ServerEvent::ParticipantStatus {
            user_id,
            muted,
            video_on,
            speaking,
            ..
        } => println!(
            "[STATUS] {}: muted={} video={} speaking={}",
            user_id, muted, video_on, speaking
        ),
        ServerEvent::MeetingEnded { room_id } => println!("Meeting {} ended", room_id),
        ServerEvent::Error { code, message } => println!("[ERROR] {}: {}", code, message),
        ServerEvent::WebrtcOffer { from, .. }
        | ServerEvent::WebrtcAnswer { from, .. }
        | ServerEvent::WebrtcIceCandidate { from, .. } => {
            tracing::debug!("signaling from {}", from);
        }
    }
}

fn render_mesh(change: &MeshEvent) {
    match change {
        MeshEvent::Negotiating(user) => println!("[MESH] negotiating with {}", user),
        MeshEvent::Connected(user) => println!("[MESH] linked to {}", user),
        MeshEvent::Degraded(user) => println!("[MESH] link to {} degraded", user),
        MeshEvent::Closed(user) => println!("[MESH] link to {} closed", user),
    }
}

/// Stand-in peer engine for the headless client.
///
/// Produces minimal SDP-shaped descriptions so two headless clients can walk
/// the whole negotiation path against a live coordinator. No media flows.
pub struct HeadlessEngine {
    remote: UserId,
    seq: u64,
    closed: bool,
}

impl HeadlessEngine {
    pub fn new(remote: &UserId) -> Self {
        Self {
            remote: remote.clone(),
            seq: 0,
            closed: false,
        }
    }
}

impl PeerTransport for HeadlessEngine {
    fn create_offer(&mut self) -> Result<serde_json::Value> {
        anyhow::ensure!(!self.closed, "engine closed");
        self.seq += 1;
        Ok(json!({"sdp": format!("headless-offer-{}", self.seq), "to": self.remote}))
    }

    fn create_answer(&mut self, offer: &serde_json::Value) -> Result<serde_json::Value> {
        Ok(json!({"sdp": "headless-answer", "inReplyTo": offer.get("sdp")}))
    }

    fn apply_answer(&mut self, _answer: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn add_ice_candidate(&mut self, _candidate: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn drain_candidates(&mut self) -> Vec<serde_json::Value> {
        Vec::new()
    }

    fn replace_tracks(&mut self, _tracks: &[TrackKind]) -> Result<()> {
        Ok(())
    }

    fn open_data_channel(&mut self, _label: &str) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
