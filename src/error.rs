//! Session error taxonomy.
//!
//! These are the internal vocabulary for rejected or dropped inputs. Per the
//! propagation policy, none of them is fatal: relay/broadcast misses are
//! logged no-ops, rejections go back to the offending connection as an
//! `error` event, and only authentication failures terminate a handshake.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("missing or invalid connect credential")]
    Unauthenticated,

    #[error("room {0} not found")]
    RoomNotFound(String),

    #[error("target {0} is not connected to this room")]
    TargetUnavailable(String),

    #[error("payload of {got} bytes exceeds ceiling of {limit}")]
    OversizedPayload { got: usize, limit: usize },

    #[error("self-addressed signaling message")]
    SelfAddressed,

    #[error("not a member of room {0}")]
    NotAMember(String),

    #[error("external inference service failed: {0}")]
    ExternalService(String),
}

impl SessionError {
    /// Stable machine-readable code carried on `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Unauthenticated => "unauthenticated",
            SessionError::RoomNotFound(_) => "room-not-found",
            SessionError::TargetUnavailable(_) => "target-unavailable",
            SessionError::OversizedPayload { .. } => "oversized-payload",
            SessionError::SelfAddressed => "self-addressed",
            SessionError::NotAMember(_) => "not-a-member",
            SessionError::ExternalService(_) => "external-service",
        }
    }
}
