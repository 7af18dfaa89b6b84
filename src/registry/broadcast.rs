//! Broadcast fanout — deliver one event to every current room member.
//!
//! Delivery is at-most-once against the membership snapshot at the instant of
//! the call. There is no backfill for later joiners and no retry for dropped
//! connections; a closed outbox simply misses the event.

use std::collections::HashMap;

use crate::protocol::{ServerEvent, UserId};

use super::room::Member;

/// Fan `event` out to every member except `exclude`.
///
/// Returns the number of outboxes the event was queued on, which is what the
/// "delivered to members at the instant of broadcast" property is asserted
/// against in tests.
pub(crate) fn broadcast(
    members: &HashMap<UserId, Member>,
    event: &ServerEvent,
    exclude: Option<&UserId>,
) -> usize {
    let mut delivered = 0;
    for (user_id, member) in members {
        if exclude.is_some_and(|ex| ex == user_id) {
            continue;
        }
        if member.outbox.send(event.clone()).is_ok() {
            delivered += 1;
        } else {
            // Connection already gone; cleanup happens via on_disconnect.
            tracing::debug!("broadcast to {} dropped (outbox closed)", user_id);
        }
    }
    delivered
}
