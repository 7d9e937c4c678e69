// Poll sessions: one interactive round in which the channel reacts to a
// proposed venue.
//
// `PollSession` is a plain state machine (Open -> Confirmed | Rejected |
// Expired). `PollRunner` drives it: posts the proposal, merges the reaction
// stream with the timeout in a single `tokio::select!` loop, and persists
// every accepted vote and the final transition.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{LunchError, Result};
use crate::gateway::{ChatError, ChatGateway, PostedMessage};
use crate::model::{ParticipantId, PollStatus, ReactionEvent, SessionId, Venue, VenueId, Vote};

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Result of feeding one reaction into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    /// The session is no longer open; nothing changed.
    Ignored,
    /// The vote was stored; the session is still open.
    Recorded,
    /// The vote was stored and moved the session to a terminal status.
    Resolved(PollStatus),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub positive: usize,
    pub negative: usize,
    pub vetoes: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollSession {
    pub(crate) id: SessionId,
    pub(crate) channel: String,
    pub(crate) venue_id: VenueId,
    pub(crate) message_id: Option<String>,
    /// One vote per participant; a later reaction replaces the earlier one.
    pub(crate) votes: BTreeMap<ParticipantId, Vote>,
    pub(crate) quorum: usize,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) expires_at: DateTime<Utc>,
    pub(crate) status: PollStatus,
    pub(crate) resolved_at: Option<DateTime<Utc>>,
    pub(crate) payer: Option<ParticipantId>,
}

impl PollSession {
    pub fn new(
        channel: &str,
        venue_id: &str,
        quorum: usize,
        created_at: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<Self> {
        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| created_at.checked_add_signed(t))
            .ok_or_else(|| LunchError::InvalidPoll {
                message: format!("timeout of {}s is out of range", timeout.as_secs()),
            })?;
        Ok(Self {
            id: generate_session_id(created_at),
            channel: channel.to_string(),
            venue_id: venue_id.to_string(),
            message_id: None,
            votes: BTreeMap::new(),
            quorum,
            created_at,
            expires_at,
            status: PollStatus::Open,
            resolved_at: None,
            payer: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn venue_id(&self) -> &str {
        &self.venue_id
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn status(&self) -> PollStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == PollStatus::Open
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }

    pub fn payer(&self) -> Option<&str> {
        self.payer.as_deref()
    }

    pub fn votes(&self) -> &BTreeMap<ParticipantId, Vote> {
        &self.votes
    }

    pub fn tally(&self) -> Tally {
        let mut tally = Tally::default();
        for vote in self.votes.values() {
            match vote {
                Vote::Join => tally.positive += 1,
                Vote::Decline => tally.negative += 1,
                Vote::Veto => tally.vetoes += 1,
            }
        }
        tally
    }

    /// Participants who voted to join, in id order.
    pub fn joiners(&self) -> Vec<ParticipantId> {
        self.votes
            .iter()
            .filter(|(_, v)| v.is_positive())
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Record `participant`'s vote. A veto rejects the session at once;
    /// reaching the quorum of join votes confirms it.
    pub fn record_reaction(
        &mut self,
        participant: &str,
        vote: Vote,
        now: DateTime<Utc>,
    ) -> ReactionOutcome {
        if !self.is_open() {
            return ReactionOutcome::Ignored;
        }
        self.votes.insert(participant.to_string(), vote);

        if vote == Vote::Veto {
            self.transition(PollStatus::Rejected, now);
            return ReactionOutcome::Resolved(PollStatus::Rejected);
        }
        if self.tally().positive >= self.quorum {
            self.transition(PollStatus::Confirmed, now);
            return ReactionOutcome::Resolved(PollStatus::Confirmed);
        }
        ReactionOutcome::Recorded
    }

    /// Drop `participant`'s vote while the session is open.
    pub fn withdraw_reaction(&mut self, participant: &str) -> ReactionOutcome {
        if !self.is_open() {
            return ReactionOutcome::Ignored;
        }
        self.votes.remove(participant);
        ReactionOutcome::Recorded
    }

    /// Resolve on timeout: more joins than declines confirms, any other vote
    /// count rejects, no votes at all expires. Returns `None` if the session
    /// was already terminal.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Option<PollStatus> {
        if !self.is_open() {
            return None;
        }
        let tally = self.tally();
        let status = if tally.positive > tally.negative + tally.vetoes {
            PollStatus::Confirmed
        } else if self.votes.is_empty() {
            PollStatus::Expired
        } else {
            PollStatus::Rejected
        };
        self.transition(status, now);
        Some(status)
    }

    fn transition(&mut self, status: PollStatus, now: DateTime<Utc>) {
        debug_assert!(self.is_open());
        self.status = status;
        self.resolved_at = Some(now);
    }
}

/// Unique session id based on the current UTC timestamp plus a random
/// suffix, e.g. `poll_20261019_113000_123_4f2a`.
pub fn generate_session_id(now: DateTime<Utc>) -> SessionId {
    format!(
        "{}_{:04x}",
        now.format("poll_%Y%m%d_%H%M%S_%3f"),
        rand::random::<u16>()
    )
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub quorum: usize,
    pub timeout: Duration,
    /// Reactions pre-attached to the proposal.
    pub prompt_reactions: Vec<String>,
}

pub struct PollRunner<'a> {
    chat: &'a dyn ChatGateway,
    db: &'a Database,
    settings: &'a PollSettings,
}

impl<'a> PollRunner<'a> {
    pub fn new(chat: &'a dyn ChatGateway, db: &'a Database, settings: &'a PollSettings) -> Self {
        Self { chat, db, settings }
    }

    /// Claim the channel, post the proposal and return the Open session.
    ///
    /// Fails with `SessionAlreadyOpen` if the channel already has an open
    /// session. If posting fails the claim is released again.
    pub async fn open(
        &self,
        channel: &str,
        venue: &Venue,
        text: &str,
    ) -> Result<(PollSession, PostedMessage)> {
        let now = Utc::now();
        let mut session =
            PollSession::new(channel, &venue.id, self.settings.quorum, now, self.settings.timeout)?;

        if !self.db.open_session(&session, now)? {
            warn!(channel, "refusing to open a second poll session");
            return Err(LunchError::SessionAlreadyOpen {
                channel: channel.to_string(),
            });
        }

        let message = match self.chat.post_message(channel, text).await {
            Ok(m) => m,
            Err(e) => {
                self.discard(&session);
                return Err(e.into());
            }
        };
        self.db.set_message_id(&session.id, &message.message_id)?;
        session.message_id = Some(message.message_id.clone());

        for name in &self.settings.prompt_reactions {
            if let Err(e) = self.chat.add_reaction(&message, name).await {
                warn!(reaction = %name, "failed to add prompt reaction: {e}");
            }
        }

        info!(session = %session.id, channel, venue = %venue.id, "poll opened");
        Ok((session, message))
    }

    /// Collect reactions until the session resolves, by quorum, veto or
    /// timeout, and persist the terminal status. A confirmed session commits
    /// the venue pick in the same step.
    ///
    /// Chat failures discard the session so the channel is not left with a
    /// dangling open poll.
    pub async fn collect(
        &self,
        session: &mut PollSession,
        message: &PostedMessage,
    ) -> Result<PollStatus> {
        let mut rx = match self.chat.subscribe_reactions(message).await {
            Ok(rx) => rx,
            Err(e) => {
                self.discard(session);
                return Err(e.into());
            }
        };

        let remaining = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);

        // The reaction stream may end early (e.g. the gateway restarts); the
        // session still only resolves at quorum or timeout.
        let mut stream_open = true;

        let status = loop {
            tokio::select! {
                _ = &mut deadline => {
                    match session.expire(Utc::now()) {
                        Some(status) => {
                            debug!(session = %session.id, %status, "poll timed out");
                            break status;
                        }
                        None => break session.status,
                    }
                }

                event = rx.recv(), if stream_open => {
                    match event {
                        Some(ReactionEvent::Cast { participant, vote }) => {
                            let outcome = session.record_reaction(&participant, vote, Utc::now());
                            if outcome != ReactionOutcome::Ignored {
                                if let Err(e) = self.db.record_vote(&session.id, &participant, vote) {
                                    self.discard(session);
                                    return Err(e.into());
                                }
                            }
                            if let ReactionOutcome::Resolved(status) = outcome {
                                debug!(session = %session.id, %status, "poll resolved early");
                                break status;
                            }
                        }
                        Some(ReactionEvent::Withdrawn { participant }) => {
                            if session.withdraw_reaction(&participant) == ReactionOutcome::Recorded {
                                if let Err(e) = self.db.remove_vote(&session.id, &participant) {
                                    self.discard(session);
                                    return Err(e.into());
                                }
                            }
                        }
                        Some(ReactionEvent::Lost { message }) => {
                            warn!(session = %session.id, "reaction stream lost: {message}");
                            self.discard(session);
                            return Err(ChatError::Transport(message).into());
                        }
                        None => {
                            debug!(session = %session.id, "reaction stream ended before timeout");
                            stream_open = false;
                        }
                    }
                }
            }
        };

        // Dropping `rx` ends the gateway's subscription; the timer is dropped
        // with this frame so it can never re-evaluate the session.
        drop(rx);

        let resolved_at = session.resolved_at.unwrap_or_else(Utc::now);
        let status = if self.db.resolve_session(session, resolved_at)? {
            status
        } else {
            self.adopt_stored_status(session, status)?
        };

        let tally = session.tally();
        info!(
            session = %session.id,
            %status,
            joins = tally.positive,
            declines = tally.negative,
            vetoes = tally.vetoes,
            "poll closed"
        );
        Ok(status)
    }

    /// The stored row left Open before this runner resolved it (swept by
    /// another process). The stored status is authoritative.
    fn adopt_stored_status(&self, session: &mut PollSession, local: PollStatus) -> Result<PollStatus> {
        let stored = self
            .db
            .load_session(&session.id)?
            .ok_or_else(|| LunchError::SessionNotFound {
                session_id: session.id.clone(),
            })?;
        warn!(
            session = %session.id,
            local = %local,
            stored = %stored.status,
            "poll was resolved elsewhere, keeping the stored status"
        );
        session.status = stored.status;
        session.resolved_at = stored.resolved_at;
        Ok(stored.status)
    }

    fn discard(&self, session: &PollSession) {
        if let Err(e) = self.db.discard_session(&session.id) {
            warn!(session = %session.id, "failed to discard poll session: {e:#}");
        }
    }
}
