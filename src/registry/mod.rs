//! Room registry & connection manager.
//!
//! The registry is the authoritative owner of who is in which room and which
//! connection belongs to whom. It is an explicit injected object (no process
//! globals) so tests and future multi-process deployments can run isolated
//! instances. Membership itself is mutated only inside each room's actor
//! task; the registry keeps the room handles plus two read-mostly indexes
//! (user → room, connection → identity) that the actors maintain through
//! [`Shared`].

mod broadcast;
mod relay;
pub mod room;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::SessionError;
use crate::protocol::{Participant, RoomId, UserId};

use room::{Outbox, RoomCommand, RoomHandle, RoomSettings, RoomSnapshot};

/// Where a live connection currently sits.
#[derive(Debug, Clone)]
pub struct ConnLocation {
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Debug, Clone)]
struct UserLocation {
    room_id: RoomId,
    conn_id: Uuid,
}

struct RoomEntry {
    handle: RoomHandle,
    generation: u64,
}

/// Index state shared between the registry front-end and the room actors.
pub(crate) struct Shared {
    rooms: Mutex<HashMap<RoomId, RoomEntry>>,
    users: Mutex<HashMap<UserId, UserLocation>>,
    connections: Mutex<HashMap<Uuid, ConnLocation>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `user_id` now lives in `room_id` via `conn_id`. Any
    /// previous connection entry for the user is dropped, which is what makes
    /// a disconnect of a replaced socket a no-op later.
    pub(crate) fn bind(&self, user_id: &UserId, conn_id: Uuid, room_id: &RoomId) {
        let old = self.users.lock().unwrap().insert(
            user_id.clone(),
            UserLocation {
                room_id: room_id.clone(),
                conn_id,
            },
        );
        let mut connections = self.connections.lock().unwrap();
        if let Some(old) = old {
            if old.conn_id != conn_id {
                connections.remove(&old.conn_id);
            }
        }
        connections.insert(
            conn_id,
            ConnLocation {
                room_id: room_id.clone(),
                user_id: user_id.clone(),
            },
        );
    }

    /// Forget a user/connection pair leaving `room_id`. Entries already
    /// re-bound elsewhere are left alone: a user can switch rooms on the same
    /// connection, and the old room's leave then lands after the new room's
    /// bind — it must not wipe the new binding.
    pub(crate) fn unbind(&self, user_id: &UserId, conn_id: Uuid, room_id: &RoomId) {
        let mut connections = self.connections.lock().unwrap();
        if connections
            .get(&conn_id)
            .is_some_and(|loc| loc.room_id == *room_id)
        {
            connections.remove(&conn_id);
        }
        drop(connections);
        let mut users = self.users.lock().unwrap();
        if users
            .get(user_id)
            .is_some_and(|loc| loc.conn_id == conn_id && loc.room_id == *room_id)
        {
            users.remove(user_id);
        }
    }

    /// Drop the room entry, but only for the actor generation that is
    /// actually exiting — a newer actor under the same id stays.
    pub(crate) fn remove_room(&self, room_id: &RoomId, generation: u64) {
        let mut rooms = self.rooms.lock().unwrap();
        if rooms.get(room_id).is_some_and(|e| e.generation == generation) {
            rooms.remove(room_id);
        }
    }
}

/// Authoritative in-memory map of rooms and connections.
pub struct RoomRegistry {
    shared: Arc<Shared>,
    settings: RoomSettings,
    http: reqwest::Client,
    next_generation: AtomicU64,
}

impl RoomRegistry {
    pub fn new(settings: RoomSettings) -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            settings,
            http: reqwest::Client::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Admit a participant into a room, creating the room on demand.
    ///
    /// A join to a second room implicitly leaves the first: one user, one
    /// room. A repeat join to the same room replaces the connection and
    /// returns the snapshot again instead of duplicating the entry.
    pub async fn join(
        &self,
        room_id: &RoomId,
        conn_id: Uuid,
        participant: Participant,
        outbox: Outbox,
    ) -> Result<(RoomHandle, RoomSnapshot), SessionError> {
        let user_id = participant.user_id.clone();

        let previous = self.shared.users.lock().unwrap().get(&user_id).cloned();
        if let Some(previous) = previous {
            if previous.room_id != *room_id {
                tracing::debug!(
                    "{} joining {} implicitly leaves {}",
                    user_id,
                    room_id,
                    previous.room_id
                );
                self.leave(&previous.room_id, &user_id, None);
            }
        }

        // The target actor can be mid-shutdown (its last member just left);
        // a closed queue or dropped reply means "spawn a fresh one and retry".
        for _ in 0..3 {
            let handle = self.get_or_spawn(room_id);
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let sent = handle.send(RoomCommand::Join {
                conn_id,
                participant: participant.clone(),
                outbox: outbox.clone(),
                reply: reply_tx,
            });
            if !sent {
                continue;
            }
            match reply_rx.await {
                Ok(snapshot) => return Ok((handle, snapshot)),
                Err(_) => continue,
            }
        }

        Err(SessionError::RoomNotFound(room_id.clone()))
    }

    /// Idempotent leave. Unknown room or non-member is a no-op.
    pub fn leave(&self, room_id: &RoomId, user_id: &UserId, conn_id: Option<Uuid>) {
        if let Some(handle) = self.room(room_id) {
            handle.send(RoomCommand::Leave {
                user_id: user_id.clone(),
                conn_id,
            });
        }
    }

    /// A connection died without a leave-meeting; same cleanup as an explicit
    /// leave, resolved through the connection index.
    pub fn on_disconnect(&self, conn_id: Uuid) {
        let location = self.shared.connections.lock().unwrap().get(&conn_id).cloned();
        if let Some(location) = location {
            tracing::debug!(
                "connection {} of {} dropped, leaving room {}",
                conn_id,
                location.user_id,
                location.room_id
            );
            self.leave(&location.room_id, &location.user_id, Some(conn_id));
        }
    }

    /// Live handle for a room, if it exists.
    pub fn room(&self, room_id: &RoomId) -> Option<RoomHandle> {
        let rooms = self.shared.rooms.lock().unwrap();
        rooms
            .get(room_id)
            .filter(|entry| !entry.handle.is_closed())
            .map(|entry| entry.handle.clone())
    }

    fn get_or_spawn(&self, room_id: &RoomId) -> RoomHandle {
        let mut rooms = self.shared.rooms.lock().unwrap();
        if let Some(entry) = rooms.get(room_id) {
            if !entry.handle.is_closed() {
                return entry.handle.clone();
            }
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = room::spawn(
            room_id.clone(),
            generation,
            Arc::clone(&self.shared),
            self.settings.clone(),
            self.http.clone(),
        );
        rooms.insert(
            room_id.clone(),
            RoomEntry {
                handle: handle.clone(),
                generation,
            },
        );
        handle
    }

    // -- introspection, mainly for tests and a future status endpoint --

    pub fn room_count(&self) -> usize {
        self.shared.rooms.lock().unwrap().len()
    }

    pub fn users_in(&self, room_id: &RoomId) -> usize {
        self.shared
            .users
            .lock()
            .unwrap()
            .values()
            .filter(|loc| loc.room_id == *room_id)
            .count()
    }

    pub fn user_room(&self, user_id: &UserId) -> Option<RoomId> {
        self.shared
            .users
            .lock()
            .unwrap()
            .get(user_id)
            .map(|loc| loc.room_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineSettings;
    use crate::protocol::{Role, ServerEvent, SignalKind};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn registry() -> RoomRegistry {
        RoomRegistry::new(RoomSettings {
            max_signal_payload: 1024,
            pipeline: PipelineSettings {
                inference_url: None,
                timeout: Duration::from_secs(1),
                flush_bytes: 8,
                flush_after: Duration::from_millis(50),
            },
        })
    }

    fn outbox() -> (Outbox, mpsc::UnboundedReceiver<ServerEvent>) {
        mpsc::unbounded_channel()
    }

    /// Poll until `cond` holds; leaves/disconnects are fire-and-forget so
    /// tests observe their effects within a bounded window.
    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within bounded time window");
    }

    async fn recv_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("outbox closed")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[tokio::test]
    async fn test_join_creates_room_with_host_role() {
        let registry = registry();
        let (tx, _rx) = outbox();
        let (_, snapshot) = registry
            .join(
                &"m1".to_string(),
                Uuid::new_v4(),
                Participant::new("alice", "Alice"),
                tx,
            )
            .await
            .unwrap();

        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].role, Role::Host);
        assert!(!snapshot.is_recording);
        assert!(!snapshot.transcription_enabled);
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_member_count_equals_joins_minus_leaves() {
        let registry = registry();
        let room = "m1".to_string();
        let mut conns = Vec::new();
        for user in ["a", "b", "c"] {
            let (tx, rx) = outbox();
            let conn_id = Uuid::new_v4();
            registry
                .join(&room, conn_id, Participant::new(user, user), tx)
                .await
                .unwrap();
            conns.push((user.to_string(), conn_id, rx));
        }
        assert_eq!(registry.users_in(&room), 3);

        registry.leave(&room, &"b".to_string(), None);
        wait_for(|| registry.users_in(&room) == 2).await;

        // Leaving twice, and leaving a room you were never in, are no-ops.
        registry.leave(&room, &"b".to_string(), None);
        registry.leave(&room, &"nobody".to_string(), None);
        registry.leave(&"other-room".to_string(), &"a".to_string(), None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.users_in(&room), 2);
    }

    #[tokio::test]
    async fn test_rapid_double_join_yields_one_entry() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();

        registry
            .join(&room, Uuid::new_v4(), Participant::new("alice", "Alice"), tx1)
            .await
            .unwrap();
        let (_, snapshot) = registry
            .join(&room, Uuid::new_v4(), Participant::new("alice", "Alice"), tx2)
            .await
            .unwrap();

        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(registry.users_in(&room), 1);
    }

    #[tokio::test]
    async fn test_stale_disconnect_does_not_kick_replacement() {
        let registry = registry();
        let room = "m1".to_string();
        let conn1 = Uuid::new_v4();
        let conn2 = Uuid::new_v4();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();

        registry
            .join(&room, conn1, Participant::new("alice", "Alice"), tx1)
            .await
            .unwrap();
        registry
            .join(&room, conn2, Participant::new("alice", "Alice"), tx2)
            .await
            .unwrap();

        // The old socket dies after the user already reconnected.
        registry.on_disconnect(conn1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.users_in(&room), 1);
        assert_eq!(registry.user_room(&"alice".to_string()), Some(room.clone()));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_up_and_notifies_room() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, _rx_b) = outbox();
        let conn_b = Uuid::new_v4();

        registry
            .join(&room, Uuid::new_v4(), Participant::new("alice", "Alice"), tx_a)
            .await
            .unwrap();
        registry
            .join(&room, conn_b, Participant::new("bob", "Bob"), tx_b)
            .await
            .unwrap();

        match recv_event(&mut rx_a).await {
            ServerEvent::ParticipantJoined { user_id, .. } => assert_eq!(user_id, "bob"),
            other => panic!("unexpected event: {:?}", other),
        }

        registry.on_disconnect(conn_b);
        match recv_event(&mut rx_a).await {
            ServerEvent::ParticipantLeft { user_id, .. } => assert_eq!(user_id, "bob"),
            other => panic!("unexpected event: {:?}", other),
        }
        wait_for(|| registry.users_in(&room) == 1).await;
    }

    #[tokio::test]
    async fn test_empty_room_is_deleted_and_id_reuse_starts_fresh() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx, _rx) = outbox();
        let (handle, _) = registry
            .join(&room, Uuid::new_v4(), Participant::new("alice", "Alice"), tx)
            .await
            .unwrap();

        // Flip recording on so stale state would be observable after reuse.
        handle.send(RoomCommand::SetRecording {
            from: "alice".to_string(),
            on: true,
        });

        registry.leave(&room, &"alice".to_string(), None);
        wait_for(|| registry.room_count() == 0).await;

        let (tx2, _rx2) = outbox();
        let (_, snapshot) = registry
            .join(&room, Uuid::new_v4(), Participant::new("bob", "Bob"), tx2)
            .await
            .unwrap();
        assert_eq!(snapshot.participants.len(), 1);
        assert_eq!(snapshot.participants[0].user_id, "bob");
        assert_eq!(snapshot.participants[0].role, Role::Host);
        assert!(!snapshot.is_recording, "reused room id must not inherit state");
    }

    #[tokio::test]
    async fn test_second_room_join_implicitly_leaves_first() {
        let registry = registry();
        let (tx1, _rx1) = outbox();
        let (tx2, _rx2) = outbox();

        registry
            .join(
                &"m1".to_string(),
                Uuid::new_v4(),
                Participant::new("alice", "Alice"),
                tx1,
            )
            .await
            .unwrap();
        registry
            .join(
                &"m2".to_string(),
                Uuid::new_v4(),
                Participant::new("alice", "Alice"),
                tx2,
            )
            .await
            .unwrap();

        wait_for(|| registry.users_in(&"m1".to_string()) == 0).await;
        assert_eq!(registry.users_in(&"m2".to_string()), 1);
        assert_eq!(registry.user_room(&"alice".to_string()), Some("m2".to_string()));
        // m1 emptied out, so it is gone entirely.
        wait_for(|| registry.room_count() == 1).await;
    }

    #[tokio::test]
    async fn test_same_connection_room_switch_keeps_index() {
        let registry = registry();
        let conn = Uuid::new_v4();
        let (tx1, _rx1) = outbox();
        let (handle1, _) = registry
            .join(
                &"m1".to_string(),
                conn,
                Participant::new("alice", "Alice"),
                tx1,
            )
            .await
            .unwrap();

        // Pile cheap no-op commands onto m1 so its implicit leave is
        // processed only after the m2 join has re-bound the connection.
        for _ in 0..5000 {
            handle1.send(RoomCommand::Chat {
                from: "nobody".to_string(),
                message: "x".to_string(),
                message_type: "text".to_string(),
            });
        }

        let (tx2, _rx2) = outbox();
        registry
            .join(
                &"m2".to_string(),
                conn,
                Participant::new("alice", "Alice"),
                tx2,
            )
            .await
            .unwrap();

        // m1 drains, processes the late leave, and empties out; the late
        // leave must not wipe the m2 binding.
        wait_for(|| registry.room_count() == 1).await;
        assert_eq!(registry.user_room(&"alice".to_string()), Some("m2".to_string()));
        assert_eq!(registry.users_in(&"m2".to_string()), 1);

        // The surviving binding still resolves the disconnect, so m2 can
        // empty out and be deleted.
        registry.on_disconnect(conn);
        wait_for(|| registry.room_count() == 0).await;
    }

    #[tokio::test]
    async fn test_offer_relayed_then_suppressed_after_leave() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();

        let (handle, _) = registry
            .join(&room, Uuid::new_v4(), Participant::new("a", "A"), tx_a)
            .await
            .unwrap();
        registry
            .join(&room, Uuid::new_v4(), Participant::new("b", "B"), tx_b)
            .await
            .unwrap();

        handle.send(RoomCommand::Signal {
            from: "a".to_string(),
            to: "b".to_string(),
            kind: SignalKind::Offer,
            payload: json!({"sdp": "v=0"}),
        });

        match recv_event(&mut rx_b).await {
            ServerEvent::WebrtcOffer { from, .. } => assert_eq!(from, "a"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx_b.try_recv().is_err(), "exactly one offer expected");

        registry.leave(&room, &"b".to_string(), None);
        wait_for(|| registry.users_in(&room) == 1).await;

        handle.send(RoomCommand::Signal {
            from: "a".to_string(),
            to: "b".to_string(),
            kind: SignalKind::Offer,
            payload: json!({"sdp": "v=0"}),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Silently suppressed: no error event surfaces to the sender.
        let events = drain(&mut rx_a);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, ServerEvent::Error { .. })),
            "sender must not be notified of a dropped relay"
        );
    }

    #[tokio::test]
    async fn test_broadcast_reaches_members_at_instant_only() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();

        let (handle, _) = registry
            .join(&room, Uuid::new_v4(), Participant::new("a", "A"), tx_a)
            .await
            .unwrap();
        registry
            .join(&room, Uuid::new_v4(), Participant::new("b", "B"), tx_b)
            .await
            .unwrap();

        registry.leave(&room, &"b".to_string(), None);
        wait_for(|| registry.users_in(&room) == 1).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        handle.send(RoomCommand::Chat {
            from: "a".to_string(),
            message: "anyone here?".to_string(),
            message_type: "text".to_string(),
        });

        match recv_event(&mut rx_a).await {
            ServerEvent::ChatMessage { message, .. } => assert_eq!(message, "anyone here?"),
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            !drain(&mut rx_b)
                .iter()
                .any(|e| matches!(e, ServerEvent::ChatMessage { .. })),
            "departed member must not receive the broadcast"
        );
    }

    #[tokio::test]
    async fn test_audio_with_transcription_disabled_emits_nothing() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx, mut rx) = outbox();
        let (handle, snapshot) = registry
            .join(&room, Uuid::new_v4(), Participant::new("a", "A"), tx)
            .await
            .unwrap();
        assert!(!snapshot.transcription_enabled);

        handle.send(RoomCommand::Audio {
            from: "a".to_string(),
            data: vec![0u8; 64],
            format: "pcm16".to_string(),
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ServerEvent::Transcription { .. })),
            "no transcription event may be produced while disabled"
        );
    }

    #[tokio::test]
    async fn test_recording_and_transcription_flags_in_snapshot() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx_a, _rx_a) = outbox();
        let (handle, _) = registry
            .join(&room, Uuid::new_v4(), Participant::new("a", "A"), tx_a)
            .await
            .unwrap();

        handle.send(RoomCommand::SetRecording {
            from: "a".to_string(),
            on: true,
        });
        handle.send(RoomCommand::SetTranscription {
            from: "a".to_string(),
            on: true,
        });

        let (tx_b, _rx_b) = outbox();
        let (_, snapshot) = registry
            .join(&room, Uuid::new_v4(), Participant::new("b", "B"), tx_b)
            .await
            .unwrap();
        assert!(snapshot.is_recording);
        assert!(snapshot.transcription_enabled);
    }

    #[tokio::test]
    async fn test_end_meeting_tears_down_room_and_discards_late_work() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();

        let (handle, _) = registry
            .join(&room, Uuid::new_v4(), Participant::new("a", "A"), tx_a)
            .await
            .unwrap();
        registry
            .join(&room, Uuid::new_v4(), Participant::new("b", "B"), tx_b)
            .await
            .unwrap();

        handle.send(RoomCommand::End {
            from: "a".to_string(),
        });

        wait_for(|| registry.room_count() == 0).await;
        assert_eq!(registry.users_in(&room), 0);
        assert!(drain(&mut rx_a)
            .iter()
            .any(|e| matches!(e, ServerEvent::MeetingEnded { .. })));
        assert!(drain(&mut rx_b)
            .iter()
            .any(|e| matches!(e, ServerEvent::MeetingEnded { .. })));

        // A late command on the dead handle is simply dropped.
        assert!(!handle.send(RoomCommand::Chat {
            from: "a".to_string(),
            message: "too late".to_string(),
            message_type: "text".to_string(),
        }));
    }

    #[tokio::test]
    async fn test_oversized_signal_rejected_without_disconnect() {
        let registry = registry();
        let room = "m1".to_string();
        let (tx_a, mut rx_a) = outbox();
        let (tx_b, mut rx_b) = outbox();

        let (handle, _) = registry
            .join(&room, Uuid::new_v4(), Participant::new("a", "A"), tx_a)
            .await
            .unwrap();
        registry
            .join(&room, Uuid::new_v4(), Participant::new("b", "B"), tx_b)
            .await
            .unwrap();
        drain(&mut rx_a);

        handle.send(RoomCommand::Signal {
            from: "a".to_string(),
            to: "b".to_string(),
            kind: SignalKind::Offer,
            payload: json!({"sdp": "x".repeat(4096)}),
        });

        match recv_event(&mut rx_a).await {
            ServerEvent::Error { code, .. } => assert_eq!(code, "oversized-payload"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!drain(&mut rx_b)
            .iter()
            .any(|e| matches!(e, ServerEvent::WebrtcOffer { .. })));
        // The sender is still a member.
        assert_eq!(registry.users_in(&room), 2);
    }
}
