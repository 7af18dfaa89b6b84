//! Per-room actor.
//!
//! Every mutation of a room's membership and flags happens on this task, in
//! command arrival order, which is what makes relay/broadcast semantics
//! linearizable per room without a lock in sight. Commands never await
//! anything; the only slow work (inference) is handed off by the pipeline to
//! detached tasks that feed results back as ordinary commands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::pipeline::{AudioPipeline, InsightResult, PipelineSettings};
use crate::protocol::{Participant, Role, RoomId, ServerEvent, SignalKind, UserId};

use super::broadcast::broadcast;
use super::relay::relay;
use super::Shared;

/// Outbound queue of one connection. FIFO per connection, so per-source
/// ordering survives the fanout.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

/// A participant as tracked inside the actor.
pub struct Member {
    pub participant: Participant,
    pub conn_id: Uuid,
    pub outbox: Outbox,
}

/// Room state returned to a joiner.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub participants: Vec<Participant>,
    pub is_recording: bool,
    pub transcription_enabled: bool,
}

/// Typed commands processed sequentially by the room task.
pub enum RoomCommand {
    Join {
        conn_id: Uuid,
        participant: Participant,
        outbox: Outbox,
        reply: oneshot::Sender<RoomSnapshot>,
    },
    /// Idempotent. `conn_id` filters out leaves from a connection that was
    /// already replaced by a newer one for the same user.
    Leave {
        user_id: UserId,
        conn_id: Option<Uuid>,
    },
    Signal {
        from: UserId,
        to: UserId,
        kind: SignalKind,
        payload: Value,
    },
    Chat {
        from: UserId,
        message: String,
        message_type: String,
    },
    Audio {
        from: UserId,
        data: Vec<u8>,
        format: String,
    },
    Reaction {
        from: UserId,
        emoji: String,
    },
    PollCreate {
        from: UserId,
        question: String,
        options: Vec<String>,
    },
    PollVote {
        from: UserId,
        poll_id: String,
        option: u32,
    },
    WhiteboardDraw {
        from: UserId,
        stroke: Value,
    },
    SetRecording {
        from: UserId,
        on: bool,
    },
    SetScreenShare {
        from: UserId,
        on: bool,
    },
    SetTranscription {
        from: UserId,
        on: bool,
    },
    Status {
        from: UserId,
        muted: bool,
        video_on: bool,
        speaking: bool,
    },
    /// Fed back by the pipeline's inference task.
    Transcribed {
        speaker_id: UserId,
        speaker_name: String,
        text: String,
        confidence: f64,
        insights: Vec<InsightResult>,
    },
    End {
        from: UserId,
    },
}

/// Cheap cloneable handle to one room's command queue.
#[derive(Clone)]
pub struct RoomHandle {
    pub room_id: RoomId,
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl RoomHandle {
    /// Queue a command. A closed queue means the room died; callers treat
    /// that exactly like an unknown room (no-op, logged).
    pub fn send(&self, command: RoomCommand) -> bool {
        if self.tx.send(command).is_err() {
            tracing::debug!("room {} is gone, command dropped", self.room_id);
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Per-room tuning handed down from the registry.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    pub max_signal_payload: usize,
    pub pipeline: PipelineSettings,
}

pub(crate) fn spawn(
    room_id: RoomId,
    generation: u64,
    shared: Arc<Shared>,
    settings: RoomSettings,
    http: reqwest::Client,
) -> RoomHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = RoomState {
        room_id: room_id.clone(),
        generation,
        created_at: Utc::now(),
        members: HashMap::new(),
        is_recording: false,
        transcription_enabled: false,
        pipeline: AudioPipeline::new(settings.pipeline, http),
        max_signal_payload: settings.max_signal_payload,
        shared,
        self_tx: tx.clone(),
    };
    tokio::spawn(run(state, rx));
    RoomHandle { room_id, tx }
}

struct RoomState {
    room_id: RoomId,
    generation: u64,
    #[allow(dead_code)]
    created_at: DateTime<Utc>,
    members: HashMap<UserId, Member>,
    is_recording: bool,
    transcription_enabled: bool,
    pipeline: AudioPipeline,
    max_signal_payload: usize,
    shared: Arc<Shared>,
    self_tx: mpsc::UnboundedSender<RoomCommand>,
}

async fn run(mut state: RoomState, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
    tracing::debug!("room {} created", state.room_id);

    // Periodic tick drives age-based pipeline flushes.
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(command) => {
                        if !state.apply(command) {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tick.tick() => {
                for segment in state.pipeline.flush_stale() {
                    state.pipeline.dispatch(segment, state.self_tx.clone());
                }
            }
        }
    }

    // Normally the member map is already empty here; a forced shutdown still
    // has to release the registry's connection index.
    for (user_id, member) in state.members.drain() {
        state.shared.unbind(&user_id, member.conn_id, &state.room_id);
    }
    state.shared.remove_room(&state.room_id, state.generation);
    tracing::debug!("room {} destroyed", state.room_id);
}

impl RoomState {
    /// Apply one command. Returns false when the room should shut down
    /// (membership hit zero or the meeting was ended).
    fn apply(&mut self, command: RoomCommand) -> bool {
        match command {
            RoomCommand::Join {
                conn_id,
                participant,
                outbox,
                reply,
            } => self.join(conn_id, participant, outbox, reply),
            RoomCommand::Leave { user_id, conn_id } => {
                return self.leave(&user_id, conn_id);
            }
            RoomCommand::Signal {
                from,
                to,
                kind,
                payload,
            } => self.signal(&from, &to, kind, payload),
            RoomCommand::Chat {
                from,
                message,
                message_type,
            } => {
                let Some(name) = self.member_name(&from) else {
                    return true;
                };
                let event = ServerEvent::ChatMessage {
                    room_id: self.room_id.clone(),
                    from,
                    name,
                    message,
                    message_type,
                    timestamp: Utc::now(),
                };
                broadcast(&self.members, &event, None);
            }
            RoomCommand::Audio { from, data, format } => self.audio(&from, data, &format),
            RoomCommand::Reaction { from, emoji } => {
                if self.members.contains_key(&from) {
                    let event = ServerEvent::Reaction {
                        room_id: self.room_id.clone(),
                        from,
                        emoji,
                        timestamp: Utc::now(),
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::PollCreate {
                from,
                question,
                options,
            } => {
                if self.members.contains_key(&from) {
                    let event = ServerEvent::PollCreate {
                        room_id: self.room_id.clone(),
                        poll_id: Uuid::new_v4().to_string(),
                        from,
                        question,
                        options,
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::PollVote {
                from,
                poll_id,
                option,
            } => {
                if self.members.contains_key(&from) {
                    let event = ServerEvent::PollVote {
                        room_id: self.room_id.clone(),
                        poll_id,
                        from,
                        option,
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::WhiteboardDraw { from, stroke } => {
                if self.members.contains_key(&from) {
                    let event = ServerEvent::WhiteboardDraw {
                        room_id: self.room_id.clone(),
                        from,
                        stroke,
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::SetRecording { from, on } => {
                if self.members.contains_key(&from) {
                    self.is_recording = on;
                    let event = if on {
                        ServerEvent::RecordingStart {
                            room_id: self.room_id.clone(),
                            user_id: from,
                            timestamp: Utc::now(),
                        }
                    } else {
                        ServerEvent::RecordingStop {
                            room_id: self.room_id.clone(),
                            user_id: from,
                            timestamp: Utc::now(),
                        }
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::SetScreenShare { from, on } => {
                if self.members.contains_key(&from) {
                    let event = if on {
                        ServerEvent::ScreenShareStart {
                            room_id: self.room_id.clone(),
                            user_id: from,
                            timestamp: Utc::now(),
                        }
                    } else {
                        ServerEvent::ScreenShareStop {
                            room_id: self.room_id.clone(),
                            user_id: from,
                            timestamp: Utc::now(),
                        }
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::SetTranscription { from, on } => {
                if self.members.contains_key(&from) {
                    self.transcription_enabled = on;
                    if !on {
                        self.pipeline.clear_all();
                    }
                    let event = if on {
                        ServerEvent::TranscriptionStart {
                            room_id: self.room_id.clone(),
                            user_id: from,
                        }
                    } else {
                        ServerEvent::TranscriptionStop {
                            room_id: self.room_id.clone(),
                            user_id: from,
                        }
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::Status {
                from,
                muted,
                video_on,
                speaking,
            } => {
                if let Some(member) = self.members.get_mut(&from) {
                    member.participant.muted = muted;
                    member.participant.video_on = video_on;
                    member.participant.speaking = speaking;
                    let event = ServerEvent::ParticipantStatus {
                        room_id: self.room_id.clone(),
                        user_id: from,
                        muted,
                        video_on,
                        speaking,
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::Transcribed {
                speaker_id,
                speaker_name,
                text,
                confidence,
                insights,
            } => {
                if !text.is_empty() {
                    let event = ServerEvent::Transcription {
                        text,
                        confidence,
                        speaker_id,
                        speaker_name,
                        timestamp: Utc::now(),
                    };
                    broadcast(&self.members, &event, None);
                }
                for insight in insights {
                    let event = ServerEvent::AiInsight {
                        insight_type: insight.insight_type,
                        data: insight.data,
                        timestamp: Utc::now(),
                    };
                    broadcast(&self.members, &event, None);
                }
            }
            RoomCommand::End { from } => {
                if !self.members.contains_key(&from) {
                    return true;
                }
                let event = ServerEvent::MeetingEnded {
                    room_id: self.room_id.clone(),
                };
                broadcast(&self.members, &event, None);
                for (user_id, member) in self.members.drain() {
                    self.shared.unbind(&user_id, member.conn_id, &self.room_id);
                }
                tracing::info!("room {} ended by {}", self.room_id, from);
                return false;
            }
        }
        true
    }

    fn join(
        &mut self,
        conn_id: Uuid,
        mut participant: Participant,
        outbox: Outbox,
        reply: oneshot::Sender<RoomSnapshot>,
    ) {
        let user_id = participant.user_id.clone();

        if let Some(existing) = self.members.get_mut(&user_id) {
            // Same user again: replace the connection, keep the entry.
            existing.conn_id = conn_id;
            existing.outbox = outbox;
            self.shared.bind(&user_id, conn_id, &self.room_id);
            tracing::debug!("{} re-joined room {}", user_id, self.room_id);
        } else {
            participant.role = if self.members.is_empty() {
                Role::Host
            } else {
                Role::Participant
            };
            participant.joined_at = Utc::now();

            let announce = ServerEvent::ParticipantJoined {
                user_id: user_id.clone(),
                name: participant.display_name.clone(),
                role: participant.role,
                timestamp: participant.joined_at,
            };

            self.members.insert(
                user_id.clone(),
                Member {
                    participant,
                    conn_id,
                    outbox,
                },
            );
            self.shared.bind(&user_id, conn_id, &self.room_id);
            broadcast(&self.members, &announce, Some(&user_id));
            tracing::info!(
                "{} joined room {} ({} members)",
                user_id,
                self.room_id,
                self.members.len()
            );
        }

        let _ = reply.send(self.snapshot());
    }

    fn leave(&mut self, user_id: &UserId, conn_id: Option<Uuid>) -> bool {
        let Some(member) = self.members.get(user_id) else {
            // Leaving twice, or a room you were never in, is a no-op.
            return true;
        };
        if conn_id.is_some_and(|c| c != member.conn_id) {
            // Stale leave from a connection that was already replaced.
            return true;
        }

        let member = self.members.remove(user_id).expect("member checked above");
        self.shared.unbind(user_id, member.conn_id, &self.room_id);
        self.pipeline.clear(user_id);

        let event = ServerEvent::ParticipantLeft {
            user_id: user_id.clone(),
            name: member.participant.display_name,
            role: member.participant.role,
            timestamp: Utc::now(),
        };
        broadcast(&self.members, &event, None);
        tracing::info!(
            "{} left room {} ({} members)",
            user_id,
            self.room_id,
            self.members.len()
        );

        // A room with zero participants does not persist.
        !self.members.is_empty()
    }

    fn signal(&mut self, from: &UserId, to: &UserId, kind: SignalKind, payload: Value) {
        match relay(
            &self.members,
            &self.room_id,
            from,
            to,
            kind,
            payload,
            self.max_signal_payload,
        ) {
            Ok(()) => {}
            Err(
                e @ (crate::error::SessionError::SelfAddressed
                | crate::error::SessionError::OversizedPayload { .. }),
            ) => {
                // Rejected, but the connection stays open.
                if let Some(sender) = self.members.get(from) {
                    let _ = sender.outbox.send(ServerEvent::Error {
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                }
            }
            Err(e) => {
                // Silent drop; the sender's renegotiation timeout recovers.
                tracing::debug!("relay {} -> {} dropped: {}", from, to, e);
            }
        }
    }

    fn audio(&mut self, from: &UserId, data: Vec<u8>, format: &str) {
        if !self.transcription_enabled {
            tracing::debug!("audio from {} ignored, transcription disabled", from);
            return;
        }
        let Some(name) = self.member_name(from) else {
            return;
        };
        if let Some(segment) = self.pipeline.push(from, &name, &data, format) {
            self.pipeline.dispatch(segment, self.self_tx.clone());
        }
    }

    fn member_name(&self, user_id: &UserId) -> Option<String> {
        self.members
            .get(user_id)
            .map(|m| m.participant.display_name.clone())
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut participants: Vec<Participant> = self
            .members
            .values()
            .map(|m| m.participant.clone())
            .collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        RoomSnapshot {
            participants,
            is_recording: self.is_recording,
            transcription_enabled: self.transcription_enabled,
        }
    }
}
