//! Peer link state machine.
//!
//! One `PeerLink` per remote participant, wrapping the actual WebRTC engine
//! behind [`PeerTransport`]. The link owns the two ordering rules that make
//! negotiation correct: remote ICE candidates are buffered until the remote
//! description is set, and a track-set change renegotiates on the existing
//! link via track replacement instead of tearing it down.

use anyhow::Result;
use serde_json::Value;

use crate::protocol::UserId;

/// Label of the ancillary data channel opened on every initiated link.
pub const DATA_CHANNEL_LABEL: &str = "huddle-data";

/// Lifecycle of one peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    Renegotiating,
    Closed,
}

/// Kinds of local media tracks attached to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Camera,
    ScreenShare,
}

/// Connection-state reports from the underlying engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkUpdate {
    Connected,
    /// Transient ICE disconnection; one automatic renegotiation is allowed.
    Disconnected,
    /// Unrecoverable engine failure.
    Failed,
}

/// What the orchestrator must do after a connection-state report.
#[derive(Debug)]
pub enum LinkOutcome {
    /// Nothing to send.
    Settled,
    /// Send this renegotiation offer to the remote.
    Renegotiate(Value),
    /// The link is terminally closed; surface a degraded indicator.
    Failed,
}

/// Seam to the WebRTC engine. The coordinator core brokers negotiation only;
/// media, SDP generation and ICE gathering live behind this trait.
pub trait PeerTransport: Send {
    fn create_offer(&mut self) -> Result<Value>;
    /// Applies the remote offer and produces an answer.
    fn create_answer(&mut self, offer: &Value) -> Result<Value>;
    fn apply_answer(&mut self, answer: &Value) -> Result<()>;
    fn add_ice_candidate(&mut self, candidate: &Value) -> Result<()>;
    /// Locally gathered candidates since the last call, ready to trickle out.
    fn drain_candidates(&mut self) -> Vec<Value>;
    /// Swap the local track set on the live link (no ICE restart).
    fn replace_tracks(&mut self, tracks: &[TrackKind]) -> Result<()>;
    fn open_data_channel(&mut self, label: &str) -> Result<()>;
    fn close(&mut self);
}

pub struct PeerLink {
    pub remote: UserId,
    pub state: LinkState,
    transport: Box<dyn PeerTransport>,
    /// Remote candidates that arrived before the remote description.
    pending_remote_candidates: Vec<Value>,
    remote_description_set: bool,
    /// Whether the single automatic renegotiation attempt was spent.
    retried: bool,
    pub data_channel: Option<String>,
}

impl PeerLink {
    /// Initiator side: we saw `remote` join and open the link toward them.
    pub fn initiate(remote: UserId, mut transport: Box<dyn PeerTransport>) -> Result<(Self, Value)> {
        transport.open_data_channel(DATA_CHANNEL_LABEL)?;
        let mut link = Self {
            remote,
            state: LinkState::New,
            transport,
            pending_remote_candidates: Vec::new(),
            remote_description_set: false,
            retried: false,
            data_channel: Some(DATA_CHANNEL_LABEL.to_string()),
        };
        let offer = link.transport.create_offer()?;
        link.state = LinkState::Negotiating;
        Ok((link, offer))
    }

    /// Answerer side: an offer arrived from a peer we have no link to yet.
    /// `create_answer` applies the remote description, so candidate buffering
    /// is never needed on this side for the initial exchange.
    pub fn accept(
        remote: UserId,
        transport: Box<dyn PeerTransport>,
        offer: &Value,
    ) -> Result<(Self, Value)> {
        let mut link = Self {
            remote,
            state: LinkState::New,
            transport,
            pending_remote_candidates: Vec::new(),
            remote_description_set: false,
            retried: false,
            data_channel: None,
        };
        let answer = link.transport.create_answer(offer)?;
        link.remote_description_set = true;
        link.state = LinkState::Negotiating;
        Ok((link, answer))
    }

    /// The remote answered our (re)negotiation offer.
    pub fn handle_answer(&mut self, answer: &Value) -> Result<()> {
        if self.state == LinkState::Closed {
            return Ok(());
        }
        self.transport.apply_answer(answer)?;
        self.remote_description_set = true;
        self.flush_pending_candidates();
        if self.state == LinkState::Renegotiating {
            // Track swap or recovery finished without tearing the link down.
            self.state = LinkState::Connected;
        }
        Ok(())
    }

    /// A renegotiation offer from the remote on an established link.
    /// On a closed link the offer is dropped (`None`): answering would tell
    /// the remote recovery succeeded while this side stays degraded.
    pub fn handle_remote_offer(&mut self, offer: &Value) -> Result<Option<Value>> {
        if self.state == LinkState::Closed {
            return Ok(None);
        }
        let answer = self.transport.create_answer(offer)?;
        self.remote_description_set = true;
        self.flush_pending_candidates();
        Ok(Some(answer))
    }

    /// Buffer or apply a remote ICE candidate, per negotiation ordering.
    pub fn handle_candidate(&mut self, candidate: Value) -> Result<()> {
        if self.state == LinkState::Closed {
            return Ok(());
        }
        if !self.remote_description_set {
            self.pending_remote_candidates.push(candidate);
            return Ok(());
        }
        self.transport.add_ice_candidate(&candidate)
    }

    fn flush_pending_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.pending_remote_candidates) {
            if let Err(e) = self.transport.add_ice_candidate(&candidate) {
                tracing::debug!("buffered candidate for {} rejected: {:#}", self.remote, e);
            }
        }
    }

    /// Locally gathered candidates ready to trickle to the remote.
    pub fn local_candidates(&mut self) -> Vec<Value> {
        self.transport.drain_candidates()
    }

    /// React to an engine connection-state report.
    pub fn handle_update(&mut self, update: LinkUpdate) -> LinkOutcome {
        if self.state == LinkState::Closed {
            return LinkOutcome::Settled;
        }
        match update {
            LinkUpdate::Connected => {
                self.state = LinkState::Connected;
                self.retried = false;
                LinkOutcome::Settled
            }
            LinkUpdate::Disconnected => {
                if self.retried {
                    // Second failure in a row: give up on this peer only.
                    self.close();
                    return LinkOutcome::Failed;
                }
                self.retried = true;
                match self.transport.create_offer() {
                    Ok(offer) => {
                        self.remote_description_set = false;
                        self.state = LinkState::Renegotiating;
                        LinkOutcome::Renegotiate(offer)
                    }
                    Err(e) => {
                        tracing::debug!("renegotiation offer for {} failed: {:#}", self.remote, e);
                        self.close();
                        LinkOutcome::Failed
                    }
                }
            }
            LinkUpdate::Failed => {
                self.close();
                LinkOutcome::Failed
            }
        }
    }

    /// The local track set changed. On a live link this swaps tracks in place
    /// and renegotiates; the other party never sees a reconnect.
    pub fn change_tracks(&mut self, tracks: &[TrackKind]) -> Result<Option<Value>> {
        if self.state == LinkState::Closed {
            return Ok(None);
        }
        self.transport.replace_tracks(tracks)?;
        if self.state == LinkState::Connected {
            let offer = self.transport.create_offer()?;
            self.remote_description_set = false;
            self.state = LinkState::Renegotiating;
            return Ok(Some(offer));
        }
        Ok(None)
    }

    pub fn close(&mut self) {
        if self.state != LinkState::Closed {
            self.transport.close();
            self.state = LinkState::Closed;
            self.pending_remote_candidates.clear();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTransport;
    use super::*;
    use serde_json::json;

    fn initiated() -> (PeerLink, FakeTransport) {
        let fake = FakeTransport::default();
        let (link, _offer) = PeerLink::initiate("bob".into(), Box::new(fake.clone())).unwrap();
        (link, fake)
    }

    #[test]
    fn test_initiate_opens_data_channel_and_negotiates() {
        let (link, fake) = initiated();
        assert_eq!(link.state, LinkState::Negotiating);
        assert_eq!(link.data_channel.as_deref(), Some(DATA_CHANNEL_LABEL));
        assert_eq!(fake.inner().offers, 1);
        assert_eq!(fake.inner().data_channels, vec![DATA_CHANNEL_LABEL]);
    }

    #[test]
    fn test_candidates_buffered_until_remote_description() {
        let (mut link, fake) = initiated();

        link.handle_candidate(json!({"candidate": "c1"})).unwrap();
        link.handle_candidate(json!({"candidate": "c2"})).unwrap();
        assert!(fake.inner().applied_candidates.is_empty());

        link.handle_answer(&json!({"sdp": "answer"})).unwrap();
        let applied = fake.inner().applied_candidates.clone();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0]["candidate"], "c1");
        assert_eq!(applied[1]["candidate"], "c2");

        // After the description is set, candidates go straight through.
        link.handle_candidate(json!({"candidate": "c3"})).unwrap();
        assert_eq!(fake.inner().applied_candidates.len(), 3);
    }

    #[test]
    fn test_answerer_side_applies_immediately() {
        let fake = FakeTransport::default();
        let (mut link, answer) =
            PeerLink::accept("alice".into(), Box::new(fake.clone()), &json!({"sdp": "offer-1"}))
                .unwrap();
        assert_eq!(answer["sdp"], "answer-to-offer-1");
        assert_eq!(link.state, LinkState::Negotiating);

        link.handle_candidate(json!({"candidate": "c1"})).unwrap();
        assert_eq!(fake.inner().applied_candidates.len(), 1);
    }

    #[test]
    fn test_transient_failure_gets_exactly_one_retry() {
        let (mut link, _fake) = initiated();
        link.handle_answer(&json!({"sdp": "a"})).unwrap();
        assert!(matches!(
            link.handle_update(LinkUpdate::Connected),
            LinkOutcome::Settled
        ));
        assert_eq!(link.state, LinkState::Connected);

        // First drop: one automatic renegotiation.
        match link.handle_update(LinkUpdate::Disconnected) {
            LinkOutcome::Renegotiate(offer) => assert_eq!(offer["sdp"], "offer-2"),
            other => panic!("expected renegotiation, got {:?}", other),
        }
        assert_eq!(link.state, LinkState::Renegotiating);

        // Second drop before recovery: terminal.
        assert!(matches!(
            link.handle_update(LinkUpdate::Disconnected),
            LinkOutcome::Failed
        ));
        assert_eq!(link.state, LinkState::Closed);
    }

    #[test]
    fn test_recovery_resets_the_retry_budget() {
        let (mut link, _fake) = initiated();
        link.handle_answer(&json!({"sdp": "a"})).unwrap();
        link.handle_update(LinkUpdate::Connected);

        assert!(matches!(
            link.handle_update(LinkUpdate::Disconnected),
            LinkOutcome::Renegotiate(_)
        ));
        link.handle_update(LinkUpdate::Connected);
        assert_eq!(link.state, LinkState::Connected);

        // A later, separate transient drop gets its own attempt.
        assert!(matches!(
            link.handle_update(LinkUpdate::Disconnected),
            LinkOutcome::Renegotiate(_)
        ));
    }

    #[test]
    fn test_track_change_renegotiates_in_place() {
        let (mut link, fake) = initiated();
        link.handle_answer(&json!({"sdp": "a"})).unwrap();
        link.handle_update(LinkUpdate::Connected);

        let offer = link
            .change_tracks(&[TrackKind::Audio, TrackKind::ScreenShare])
            .unwrap();
        assert!(offer.is_some(), "live link must renegotiate");
        assert_eq!(link.state, LinkState::Renegotiating);
        assert!(!fake.inner().closed, "track swap must not tear the link down");
        assert_eq!(
            fake.inner().replaced_tracks,
            vec![vec![TrackKind::Audio, TrackKind::ScreenShare]]
        );

        link.handle_answer(&json!({"sdp": "a2"})).unwrap();
        assert_eq!(link.state, LinkState::Connected);
    }

    #[test]
    fn test_remote_offer_on_closed_link_is_dropped() {
        let (mut link, fake) = initiated();
        link.handle_update(LinkUpdate::Failed);
        assert_eq!(link.state, LinkState::Closed);

        let answer = link.handle_remote_offer(&json!({"sdp": "offer-x"})).unwrap();
        assert!(answer.is_none(), "a closed link must not answer");
        assert_eq!(fake.inner().answers, 0);
        assert_eq!(link.state, LinkState::Closed);
    }

    #[test]
    fn test_terminal_failure_closes() {
        let (mut link, fake) = initiated();
        assert!(matches!(
            link.handle_update(LinkUpdate::Failed),
            LinkOutcome::Failed
        ));
        assert_eq!(link.state, LinkState::Closed);
        assert!(fake.inner().closed);

        // Everything after close is inert.
        assert!(matches!(
            link.handle_update(LinkUpdate::Disconnected),
            LinkOutcome::Settled
        ));
        link.handle_candidate(json!({"candidate": "late"})).unwrap();
        assert!(fake.inner().applied_candidates.is_empty());
    }
}
