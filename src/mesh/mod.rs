//! Peer mesh orchestrator (client side).
//!
//! Maintains one peer link per remote participant in a full mesh: when P
//! joins, every already-present member initiates exactly one link to P and P
//! answers the inbound offers; when P leaves, only P's link is torn down.
//! Full mesh is O(N²) in connection count — a scaling ceiling this design
//! accepts deliberately; replacing it with selective forwarding is a
//! different architecture, not a tweak.
//!
//! The orchestrator is synchronous state: it consumes server events and
//! engine reports, mutates links, and queues outgoing signaling on a channel
//! the client session flushes to the socket.

pub mod link;

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::{ClientEvent, RoomId, ServerEvent, SignalKind, UserId};

pub use link::{LinkOutcome, LinkState, LinkUpdate, PeerLink, PeerTransport, TrackKind};

/// Builds one transport per remote peer.
pub type TransportFactory = Box<dyn Fn(&UserId) -> Box<dyn PeerTransport> + Send>;

/// User-visible mesh changes, rendered as per-participant tile states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    Negotiating(UserId),
    Connected(UserId),
    /// The link failed after its one retry; only this participant's tile
    /// degrades, the session carries on.
    Degraded(UserId),
    Closed(UserId),
}

pub struct MeshOrchestrator {
    local_user: UserId,
    room_id: RoomId,
    links: HashMap<UserId, PeerLink>,
    factory: TransportFactory,
    outgoing: mpsc::UnboundedSender<ClientEvent>,
    local_tracks: Vec<TrackKind>,
}

impl MeshOrchestrator {
    pub fn new(
        local_user: UserId,
        room_id: RoomId,
        factory: TransportFactory,
        outgoing: mpsc::UnboundedSender<ClientEvent>,
    ) -> Self {
        Self {
            local_user,
            room_id,
            links: HashMap::new(),
            factory,
            outgoing,
            local_tracks: vec![TrackKind::Audio, TrackKind::Camera],
        }
    }

    /// Digest one server event, updating links and queueing signaling.
    pub fn handle_event(&mut self, event: &ServerEvent) -> Vec<MeshEvent> {
        match event {
            ServerEvent::MeetingJoined { participants, .. } => {
                // We are the newcomer: existing members will each initiate a
                // link toward us, so we only wait for their offers.
                tracing::debug!(
                    "joined with {} existing participants, awaiting offers",
                    participants.len().saturating_sub(1)
                );
                Vec::new()
            }
            ServerEvent::ParticipantJoined { user_id, .. } => self.initiate(user_id),
            ServerEvent::ParticipantLeft { user_id, .. } => self.drop_link(user_id),
            ServerEvent::WebrtcOffer { from, payload, .. } => self.on_offer(from, payload),
            ServerEvent::WebrtcAnswer { from, payload, .. } => self.on_answer(from, payload),
            ServerEvent::WebrtcIceCandidate { from, payload, .. } => {
                self.on_candidate(from, payload)
            }
            ServerEvent::MeetingEnded { .. } => {
                let remotes: Vec<UserId> = self.links.keys().cloned().collect();
                remotes.iter().flat_map(|r| self.drop_link(r)).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Engine connection-state report for one remote.
    pub fn handle_link_update(&mut self, remote: &UserId, update: LinkUpdate) -> Vec<MeshEvent> {
        let Some(link) = self.links.get_mut(remote) else {
            return Vec::new();
        };
        match link.handle_update(update) {
            LinkOutcome::Settled => {
                if link.state == LinkState::Connected {
                    vec![MeshEvent::Connected(remote.clone())]
                } else {
                    Vec::new()
                }
            }
            LinkOutcome::Renegotiate(offer) => {
                self.send_signal(remote, SignalKind::Offer, offer);
                self.trickle(remote);
                vec![MeshEvent::Negotiating(remote.clone())]
            }
            LinkOutcome::Failed => {
                // Kept in the map as Closed so the tile shows degraded until
                // the participant actually leaves.
                vec![MeshEvent::Degraded(remote.clone())]
            }
        }
    }

    /// The local media track set changed (e.g. camera swapped for a screen
    /// share). Live links renegotiate in place via track replacement.
    pub fn set_local_tracks(&mut self, tracks: Vec<TrackKind>) -> Vec<MeshEvent> {
        self.local_tracks = tracks;
        let mut events = Vec::new();
        let local_tracks = self.local_tracks.clone();
        let remotes: Vec<UserId> = self.links.keys().cloned().collect();
        for remote in remotes {
            let Some(link) = self.links.get_mut(&remote) else {
                continue;
            };
            match link.change_tracks(&local_tracks) {
                Ok(Some(offer)) => {
                    self.send_signal(&remote, SignalKind::Offer, offer);
                    self.trickle(&remote);
                    events.push(MeshEvent::Negotiating(remote.clone()));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("track change on link to {} failed: {:#}", remote, e);
                }
            }
        }
        events
    }

    pub fn link_state(&self, remote: &UserId) -> Option<LinkState> {
        self.links.get(remote).map(|l| l.state)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    fn initiate(&mut self, remote: &UserId) -> Vec<MeshEvent> {
        if *remote == self.local_user || self.links.contains_key(remote) {
            return Vec::new();
        }
        let transport = (self.factory)(remote);
        match PeerLink::initiate(remote.clone(), transport) {
            Ok((mut link, offer)) => {
                if let Err(e) = link.change_tracks(&self.local_tracks) {
                    tracing::warn!("attaching tracks for {} failed: {:#}", remote, e);
                }
                self.links.insert(remote.clone(), link);
                self.send_signal(remote, SignalKind::Offer, offer);
                self.trickle(remote);
                vec![MeshEvent::Negotiating(remote.clone())]
            }
            Err(e) => {
                tracing::warn!("could not open link to {}: {:#}", remote, e);
                vec![MeshEvent::Degraded(remote.clone())]
            }
        }
    }

    fn drop_link(&mut self, remote: &UserId) -> Vec<MeshEvent> {
        let Some(mut link) = self.links.remove(remote) else {
            return Vec::new();
        };
        link.close();
        vec![MeshEvent::Closed(remote.clone())]
    }

    fn on_offer(&mut self, from: &UserId, payload: &Value) -> Vec<MeshEvent> {
        if let Some(link) = self.links.get_mut(from) {
            // Renegotiation offer on an established link.
            match link.handle_remote_offer(payload) {
                Ok(Some(answer)) => {
                    self.send_signal(from, SignalKind::Answer, answer);
                    self.trickle(from);
                }
                Ok(None) => {
                    tracing::debug!("offer from {} on a closed link, dropped", from);
                }
                Err(e) => {
                    tracing::warn!("renegotiation answer for {} failed: {:#}", from, e);
                }
            }
            return Vec::new();
        }

        let transport = (self.factory)(from);
        match PeerLink::accept(from.clone(), transport, payload) {
            Ok((mut link, answer)) => {
                if let Err(e) = link.change_tracks(&self.local_tracks) {
                    tracing::warn!("attaching tracks for {} failed: {:#}", from, e);
                }
                self.links.insert(from.clone(), link);
                self.send_signal(from, SignalKind::Answer, answer);
                self.trickle(from);
                vec![MeshEvent::Negotiating(from.clone())]
            }
            Err(e) => {
                tracing::warn!("could not answer offer from {}: {:#}", from, e);
                vec![MeshEvent::Degraded(from.clone())]
            }
        }
    }

    fn on_answer(&mut self, from: &UserId, payload: &Value) -> Vec<MeshEvent> {
        let Some(link) = self.links.get_mut(from) else {
            tracing::debug!("answer from {} without a link, ignored", from);
            return Vec::new();
        };
        if let Err(e) = link.handle_answer(payload) {
            tracing::warn!("applying answer from {} failed: {:#}", from, e);
            return Vec::new();
        }
        let state = link.state;
        self.trickle(from);
        if state == LinkState::Connected {
            vec![MeshEvent::Connected(from.clone())]
        } else {
            Vec::new()
        }
    }

    fn on_candidate(&mut self, from: &UserId, payload: &Value) -> Vec<MeshEvent> {
        let Some(link) = self.links.get_mut(from) else {
            tracing::debug!("candidate from {} without a link, ignored", from);
            return Vec::new();
        };
        if let Err(e) = link.handle_candidate(payload.clone()) {
            tracing::debug!("candidate from {} rejected: {:#}", from, e);
        }
        Vec::new()
    }

    /// Send any locally gathered candidates for `remote` to the relay.
    fn trickle(&mut self, remote: &UserId) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        for candidate in link.local_candidates() {
            self.send_signal(remote, SignalKind::IceCandidate, candidate);
        }
    }

    fn send_signal(&self, to: &UserId, kind: SignalKind, payload: Value) {
        let event = match kind {
            SignalKind::Offer => ClientEvent::WebrtcOffer {
                room_id: self.room_id.clone(),
                to: to.clone(),
                payload,
            },
            SignalKind::Answer => ClientEvent::WebrtcAnswer {
                room_id: self.room_id.clone(),
                to: to.clone(),
                payload,
            },
            SignalKind::IceCandidate => ClientEvent::WebrtcIceCandidate {
                room_id: self.room_id.clone(),
                to: to.clone(),
                payload,
            },
        };
        if self.outgoing.send(event).is_err() {
            tracing::debug!("signaling channel closed, dropping message to {}", to);
        }
    }
}
