//! Wire protocol — every event that crosses the WebSocket, plus the shared
//! data model (participants, roles, signal kinds).
//!
//! One JSON text frame per event. Events are internally tagged with a
//! kebab-case `type` field so the browser client can dispatch on it the same
//! way it would on a socket event name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type RoomId = String;
pub type UserId = String;

/// Participant role within a room. The first joiner becomes the host;
/// authorization policy built on top of roles lives outside this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Moderator,
    Participant,
}

/// A room member as seen on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub video_on: bool,
    #[serde(default)]
    pub speaking: bool,
}

impl Participant {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role: Role::Participant,
            joined_at: Utc::now(),
            muted: false,
            video_on: false,
            speaking: false,
        }
    }
}

/// Kind of a point-to-point negotiation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

/// Client → server events.
///
/// Room-scoped events carry `roomId` redundantly with the connection's bound
/// room; the server treats a mismatch as addressing an unknown room (no-op,
/// logged) rather than trusting the field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    JoinMeeting {
        room_id: RoomId,
    },
    LeaveMeeting {
        room_id: RoomId,
    },
    WebrtcOffer {
        room_id: RoomId,
        to: UserId,
        payload: Value,
    },
    WebrtcAnswer {
        room_id: RoomId,
        to: UserId,
        payload: Value,
    },
    WebrtcIceCandidate {
        room_id: RoomId,
        to: UserId,
        payload: Value,
    },
    ChatMessage {
        room_id: RoomId,
        message: String,
        message_type: String,
    },
    /// Base64-encoded audio segment for the insight pipeline.
    AudioData {
        room_id: RoomId,
        audio_data: String,
        format: String,
    },
    Reaction {
        room_id: RoomId,
        emoji: String,
    },
    PollCreate {
        room_id: RoomId,
        question: String,
        options: Vec<String>,
    },
    PollVote {
        room_id: RoomId,
        poll_id: String,
        option: u32,
    },
    WhiteboardDraw {
        room_id: RoomId,
        stroke: Value,
    },
    RecordingStart {
        room_id: RoomId,
    },
    RecordingStop {
        room_id: RoomId,
    },
    ScreenShareStart {
        room_id: RoomId,
    },
    ScreenShareStop {
        room_id: RoomId,
    },
    TranscriptionStart {
        room_id: RoomId,
    },
    TranscriptionStop {
        room_id: RoomId,
    },
    ParticipantStatus {
        room_id: RoomId,
        muted: bool,
        video_on: bool,
        speaking: bool,
    },
    EndMeeting {
        room_id: RoomId,
    },
}

impl ClientEvent {
    /// Room the event is addressed to, for routing and mismatch checks.
    pub fn room_id(&self) -> &RoomId {
        match self {
            ClientEvent::JoinMeeting { room_id }
            | ClientEvent::LeaveMeeting { room_id }
            | ClientEvent::WebrtcOffer { room_id, .. }
            | ClientEvent::WebrtcAnswer { room_id, .. }
            | ClientEvent::WebrtcIceCandidate { room_id, .. }
            | ClientEvent::ChatMessage { room_id, .. }
            | ClientEvent::AudioData { room_id, .. }
            | ClientEvent::Reaction { room_id, .. }
            | ClientEvent::PollCreate { room_id, .. }
            | ClientEvent::PollVote { room_id, .. }
            | ClientEvent::WhiteboardDraw { room_id, .. }
            | ClientEvent::RecordingStart { room_id }
            | ClientEvent::RecordingStop { room_id }
            | ClientEvent::ScreenShareStart { room_id }
            | ClientEvent::ScreenShareStop { room_id }
            | ClientEvent::TranscriptionStart { room_id }
            | ClientEvent::TranscriptionStop { room_id }
            | ClientEvent::ParticipantStatus { room_id, .. }
            | ClientEvent::EndMeeting { room_id } => room_id,
        }
    }
}

/// Server → client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    MeetingJoined {
        room_id: RoomId,
        participants: Vec<Participant>,
        is_recording: bool,
        transcription_enabled: bool,
    },
    ParticipantJoined {
        user_id: UserId,
        name: String,
        role: Role,
        timestamp: DateTime<Utc>,
    },
    ParticipantLeft {
        user_id: UserId,
        name: String,
        role: Role,
        timestamp: DateTime<Utc>,
    },
    WebrtcOffer {
        room_id: RoomId,
        from: UserId,
        payload: Value,
    },
    WebrtcAnswer {
        room_id: RoomId,
        from: UserId,
        payload: Value,
    },
    WebrtcIceCandidate {
        room_id: RoomId,
        from: UserId,
        payload: Value,
    },
    ChatMessage {
        room_id: RoomId,
        from: UserId,
        name: String,
        message: String,
        message_type: String,
        timestamp: DateTime<Utc>,
    },
    Transcription {
        text: String,
        confidence: f64,
        speaker_id: UserId,
        speaker_name: String,
        timestamp: DateTime<Utc>,
    },
    AiInsight {
        insight_type: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },
    Reaction {
        room_id: RoomId,
        from: UserId,
        emoji: String,
        timestamp: DateTime<Utc>,
    },
    PollCreate {
        room_id: RoomId,
        poll_id: String,
        from: UserId,
        question: String,
        options: Vec<String>,
    },
    PollVote {
        room_id: RoomId,
        poll_id: String,
        from: UserId,
        option: u32,
    },
    WhiteboardDraw {
        room_id: RoomId,
        from: UserId,
        stroke: Value,
    },
    RecordingStart {
        room_id: RoomId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    RecordingStop {
        room_id: RoomId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    ScreenShareStart {
        room_id: RoomId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    ScreenShareStop {
        room_id: RoomId,
        user_id: UserId,
        timestamp: DateTime<Utc>,
    },
    TranscriptionStart {
        room_id: RoomId,
        user_id: UserId,
    },
    TranscriptionStop {
        room_id: RoomId,
        user_id: UserId,
    },
    ParticipantStatus {
        room_id: RoomId,
        user_id: UserId,
        muted: bool,
        video_on: bool,
        speaking: bool,
    },
    MeetingEnded {
        room_id: RoomId,
    },
    /// Rejected input that leaves the connection open (e.g. oversized payload).
    Error {
        code: String,
        message: String,
    },
}
