//! Signaling relay — point-to-point delivery of negotiation messages.
//!
//! A message reaches its target iff the target is a member of the same room
//! right now. A missing target is a silent drop (the sender's renegotiation
//! timeout owns recovery); self-addressed and oversized payloads are
//! rejected back to the sender without closing anything.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::SessionError;
use crate::protocol::{RoomId, ServerEvent, SignalKind, UserId};

use super::room::Member;

/// Relay one negotiation message inside a room.
///
/// Runs inside the room actor, so per-(sender, receiver) ordering follows
/// from sequential command processing plus the FIFO outbox.
pub(crate) fn relay(
    members: &HashMap<UserId, Member>,
    room_id: &RoomId,
    from: &UserId,
    to: &UserId,
    kind: SignalKind,
    payload: Value,
    max_payload: usize,
) -> Result<(), SessionError> {
    if from == to {
        return Err(SessionError::SelfAddressed);
    }

    let size = payload_size(&payload);
    if size > max_payload {
        return Err(SessionError::OversizedPayload {
            got: size,
            limit: max_payload,
        });
    }

    if !members.contains_key(from) {
        return Err(SessionError::NotAMember(room_id.clone()));
    }

    let Some(target) = members.get(to) else {
        return Err(SessionError::TargetUnavailable(to.clone()));
    };

    let event = match kind {
        SignalKind::Offer => ServerEvent::WebrtcOffer {
            room_id: room_id.clone(),
            from: from.clone(),
            payload,
        },
        SignalKind::Answer => ServerEvent::WebrtcAnswer {
            room_id: room_id.clone(),
            from: from.clone(),
            payload,
        },
        SignalKind::IceCandidate => ServerEvent::WebrtcIceCandidate {
            room_id: room_id.clone(),
            from: from.clone(),
            payload,
        },
    };

    // At-most-once: a connection that died between the membership check and
    // here just misses the message.
    let _ = target.outbox.send(event);
    Ok(())
}

/// Serialized size of the opaque payload, for the rejection ceiling.
fn payload_size(payload: &Value) -> usize {
    serde_json::to_string(payload).map(|s| s.len()).unwrap_or(0)
}
