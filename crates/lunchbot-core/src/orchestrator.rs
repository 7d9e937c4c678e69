// One end-to-end run: select a venue, poll the channel, announce the outcome
// and settle the bill. Settlement failures never unwind the poll: by then the
// meal is decided and the venue pick committed.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::Database;
use crate::error::{LunchError, Result};
use crate::gateway::{ChatGateway, LedgerGateway, PostedMessage};
use crate::messages;
use crate::model::{ParticipantId, PollStatus, SettlementRecord, Venue};
use crate::poll::{PollRunner, PollSession, PollSettings};
use crate::selection::SelectionEngine;
use crate::settlement::{SettlementReporter, SettlementRequest};

/// Reminders are only sent for sessions resolved less than this many hours
/// ago.
const REMINDER_MAX_AGE_HOURS: i64 = 24;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for retryable errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. The delay doubles after every failure.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(attempt, max = self.attempts, ?delay, "retrying after error: {e}");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub history_window: usize,
    pub poll: PollSettings,
    pub join_reactions: Vec<String>,
    pub decline_reactions: Vec<String>,
    pub retry: RetryPolicy,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            history_window: config.selection.history_window,
            poll: PollSettings {
                quorum: config.poll.quorum,
                timeout: Duration::from_secs(config.poll.timeout_secs),
                prompt_reactions: config.poll.reactions.prompt_reactions(),
            },
            join_reactions: config.poll.reactions.join.clone(),
            decline_reactions: config.poll.reactions.decline.clone(),
            retry: RetryPolicy {
                attempts: config.settlement.retry_attempts,
                base_delay: Duration::from_millis(config.settlement.retry_base_delay_ms),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Run results
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum SettlementOutcome {
    /// Nothing to settle; the reason is human readable.
    NotApplicable(String),
    Recorded(SettlementRecord),
    /// The meal is decided but the debt is not recorded.
    Failed(LunchError),
}

#[derive(Debug)]
pub struct RunReport {
    pub session: PollSession,
    pub venue: Venue,
    pub status: PollStatus,
    /// Whether the outcome announcement reached the channel.
    pub announced: bool,
    pub settlement: SettlementOutcome,
}

impl RunReport {
    /// Meal decided, debt unrecorded.
    pub fn is_partial(&self) -> bool {
        matches!(self.settlement, SettlementOutcome::Failed(_))
    }
}

/// Price per person times the number of joiners.
fn meal_cost(price_per_person_cents: u64, joiners: usize) -> Result<u64> {
    u64::try_from(joiners)
        .ok()
        .and_then(|n| price_per_person_cents.checked_mul(n))
        .ok_or_else(|| LunchError::InvalidSettlement {
            message: format!(
                "{joiners} x {price_per_person_cents} cents does not fit in a cost"
            ),
        })
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    db: Arc<Database>,
    chat: Arc<dyn ChatGateway>,
    ledger: Arc<dyn LedgerGateway>,
    reporter: SettlementReporter,
    selection: Mutex<SelectionEngine>,
    rng: Mutex<StdRng>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        chat: Arc<dyn ChatGateway>,
        ledger: Arc<dyn LedgerGateway>,
        settings: OrchestratorSettings,
    ) -> Self {
        let selection = SelectionEngine::new(settings.history_window);
        Self::build(db, chat, ledger, settings, selection, StdRng::from_entropy())
    }

    /// Deterministic variant for tests.
    pub fn seeded(
        db: Arc<Database>,
        chat: Arc<dyn ChatGateway>,
        ledger: Arc<dyn LedgerGateway>,
        settings: OrchestratorSettings,
        seed: u64,
    ) -> Self {
        let selection = SelectionEngine::seeded(settings.history_window, seed);
        Self::build(db, chat, ledger, settings, selection, StdRng::seed_from_u64(seed))
    }

    fn build(
        db: Arc<Database>,
        chat: Arc<dyn ChatGateway>,
        ledger: Arc<dyn LedgerGateway>,
        settings: OrchestratorSettings,
        selection: SelectionEngine,
        rng: StdRng,
    ) -> Self {
        let reporter = SettlementReporter::new(db.clone(), ledger.clone());
        Self {
            db,
            chat,
            ledger,
            reporter,
            selection: Mutex::new(selection),
            rng: Mutex::new(rng),
            settings,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Propose a venue in `channel`, wait for the poll to resolve, announce
    /// the result and settle it when confirmed.
    ///
    /// Errors before the poll resolves abort the run. Settlement errors are
    /// reported in the returned `RunReport` instead.
    pub async fn run(&self, channel: &str) -> Result<RunReport> {
        let catalog = self.db.load_catalog()?;
        let venue = {
            let mut engine = self.selection.lock().expect("selection mutex poisoned");
            engine.pick(&catalog)?.clone()
        };
        info!(channel, venue = %venue.id, "starting lunch run");

        let text = messages::proposal(
            &venue,
            &self.settings.join_reactions,
            &self.settings.decline_reactions,
        );
        let runner = PollRunner::new(self.chat.as_ref(), &self.db, &self.settings.poll);
        let (mut session, message) = runner.open(channel, &venue, &text).await?;
        let status = runner.collect(&mut session, &message).await?;

        if status == PollStatus::Confirmed && venue.delivery.has_payer() {
            if let Some(payer) = self.choose_payer(&session.joiners()).await {
                // The poll is already decided; the channel still gets told.
                if let Err(e) = self.db.set_payer(session.id(), &payer) {
                    warn!(session = %session.id(), %payer, "failed to store payer: {e:#}");
                }
                session.payer = Some(payer);
            }
        }

        let announced = match messages::outcome(status, &venue, session.payer()) {
            Some(text) => self.announce(channel, &text).await.is_some(),
            None => false,
        };

        let settlement = if status == PollStatus::Confirmed {
            self.settle_run(&session, &venue).await
        } else {
            SettlementOutcome::NotApplicable(format!("poll {status}"))
        };

        Ok(RunReport {
            session,
            venue,
            status,
            announced,
            settlement,
        })
    }

    async fn settle_run(&self, session: &PollSession, venue: &Venue) -> SettlementOutcome {
        if !venue.delivery.has_payer() {
            return SettlementOutcome::NotApplicable("everyone pays for themselves".into());
        }
        if !self.ledger.is_enabled() {
            return SettlementOutcome::NotApplicable("no ledger configured".into());
        }
        let Some(price) = venue.price_per_person_cents else {
            return SettlementOutcome::NotApplicable(format!(
                "{} has no price; settle manually with the receipt total",
                venue.name
            ));
        };

        let joiners = session.joiners();
        let cost = match meal_cost(price, joiners.len()) {
            Ok(cost) => cost,
            Err(e) => {
                error!(session = %session.id(), "settlement failed, meal stays decided: {e}");
                return SettlementOutcome::Failed(e);
            }
        };
        let request = SettlementRequest::even(
            session.payer().map(str::to_string),
            joiners,
            cost,
            format!("Dinner: {}", venue.name),
        );

        match self
            .settings
            .retry
            .run(|| self.reporter.report(session, &request))
            .await
        {
            Ok(record) => SettlementOutcome::Recorded(record),
            Err(e) => {
                error!(session = %session.id(), "settlement failed, meal stays decided: {e}");
                SettlementOutcome::Failed(e)
            }
        }
    }

    /// Settle a confirmed session after the fact, e.g. once the receipt total
    /// is known. `cost_cents` overrides the venue's price times the joiners.
    pub async fn settle(&self, session_id: &str, cost_cents: Option<u64>) -> Result<SettlementRecord> {
        let mut session =
            self.db
                .load_session(session_id)?
                .ok_or_else(|| LunchError::SessionNotFound {
                    session_id: session_id.to_string(),
                })?;
        if session.status() != PollStatus::Confirmed {
            return Err(LunchError::SessionNotConfirmed {
                session_id: session_id.to_string(),
                status: session.status().to_string(),
            });
        }
        if let Some(existing) = self.db.load_settlement(session_id)? {
            return Ok(existing);
        }

        let venue = self.db.venue(session.venue_id())?.ok_or_else(|| {
            LunchError::Storage(anyhow::anyhow!("venue {} not found", session.venue_id()))
        })?;
        let joiners = session.joiners();
        let cost = match (cost_cents, venue.price_per_person_cents) {
            (Some(cost), _) => cost,
            (None, Some(price)) => meal_cost(price, joiners.len())?,
            (None, None) => {
                return Err(LunchError::InvalidSettlement {
                    message: format!("{} has no price; pass the total cost", venue.name),
                })
            }
        };

        if session.payer().is_none() {
            if let Some(payer) = self.choose_payer(&joiners).await {
                self.db.set_payer(session.id(), &payer)?;
                session.payer = Some(payer);
            }
        }

        let request = SettlementRequest::even(
            session.payer().map(str::to_string),
            joiners,
            cost,
            format!("Dinner: {}", venue.name),
        );
        self.settings
            .retry
            .run(|| self.reporter.report(&session, &request))
            .await
    }

    /// Re-post the announcement of the channel's latest confirmed session if
    /// it is less than a day old. Returns `None` when there is nothing recent
    /// to remind about.
    pub async fn remind(&self, channel: &str) -> Result<Option<PostedMessage>> {
        let Some(session) = self.db.latest_session(channel, PollStatus::Confirmed)? else {
            info!(channel, "no confirmed session to remind about");
            return Ok(None);
        };
        let decided_at = session.resolved_at().unwrap_or(session.created_at());
        if Utc::now() - decided_at > chrono::Duration::hours(REMINDER_MAX_AGE_HOURS) {
            warn!(session = %session.id(), %decided_at, "latest confirmed session is too old to remind");
            return Ok(None);
        }
        let venue = self.db.venue(session.venue_id())?.ok_or_else(|| {
            LunchError::Storage(anyhow::anyhow!("venue {} not found", session.venue_id()))
        })?;

        let text = messages::confirmed(&venue, session.payer(), true);
        let posted = self.chat.post_message(channel, &text).await?;
        Ok(Some(posted))
    }

    /// The joining participant with the lowest ledger balance, ties broken at
    /// random. Falls back to a uniform draw when balances are unavailable or
    /// no joiner is mapped to a ledger member.
    async fn choose_payer(&self, joiners: &[ParticipantId]) -> Option<ParticipantId> {
        if joiners.is_empty() {
            return None;
        }

        let lowest = if self.ledger.is_enabled() {
            match self.lowest_balance_joiners(joiners).await {
                Ok(lowest) => lowest,
                Err(e) => {
                    warn!("could not look up balances, picking payer at random: {e}");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let pool: &[ParticipantId] = if lowest.is_empty() { joiners } else { &lowest };
        let mut rng = self.rng.lock().expect("rng mutex poisoned");
        pool.choose(&mut *rng).cloned()
    }

    async fn lowest_balance_joiners(&self, joiners: &[ParticipantId]) -> Result<Vec<ParticipantId>> {
        let balances = self.ledger.balances().await?;
        let mappings = self.db.member_mappings()?;

        let mut candidates: Vec<(ParticipantId, i64)> = Vec::new();
        for balance in &balances {
            let chat_user = mappings
                .iter()
                .find(|m| m.ledger_member == balance.member_id)
                .map(|m| &m.chat_user);
            match chat_user {
                Some(user) if joiners.contains(user) => {
                    candidates.push((user.clone(), balance.balance_cents));
                }
                Some(_) => {}
                None => warn!(
                    member = %balance.member_id,
                    nickname = %balance.nickname,
                    "ledger member has no chat mapping"
                ),
            }
        }

        let Some(min) = candidates.iter().map(|(_, b)| *b).min() else {
            return Ok(Vec::new());
        };
        Ok(candidates
            .into_iter()
            .filter(|(_, b)| *b == min)
            .map(|(user, _)| user)
            .collect())
    }

    async fn announce(&self, channel: &str, text: &str) -> Option<PostedMessage> {
        match self.chat.post_message(channel, text).await {
            Ok(posted) => Some(posted),
            Err(e) => {
                warn!(channel, "failed to announce poll outcome: {e}");
                None
            }
        }
    }
}
