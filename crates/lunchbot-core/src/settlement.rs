// Settlement: turn a confirmed session into an expense split recorded in the
// external ledger, at most once per session.

use std::sync::Arc;

use chrono::{SubsecRound, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::Database;
use crate::error::{LunchError, Result};
use crate::gateway::LedgerGateway;
use crate::model::{ParticipantId, PollStatus, SettlementRecord, Split};
use crate::poll::PollSession;

/// Key under which a session's expense is created in the ledger.
pub fn idempotency_key(session_id: &str) -> String {
    format!("lunchbot-{session_id}")
}

fn invalid(message: impl Into<String>) -> LunchError {
    LunchError::InvalidSettlement {
        message: message.into(),
    }
}

/// Split `cost_cents` evenly over `participants` (in their given order). The
/// integer-cent remainder goes to `payer`, so the amounts always add up to
/// exactly `cost_cents`.
pub fn split_evenly(
    cost_cents: u64,
    participants: &[ParticipantId],
    payer: &str,
) -> Result<Vec<Split>> {
    if participants.is_empty() {
        return Err(invalid("no participants to split between"));
    }
    check_unique(participants.iter())?;
    if !participants.iter().any(|p| p == payer) {
        return Err(invalid(format!("payer {payer} is not a participant")));
    }

    let count = participants.len() as u64;
    let share = cost_cents / count;
    let remainder = cost_cents % count;

    Ok(participants
        .iter()
        .map(|p| Split {
            participant: p.clone(),
            amount_cents: if p == payer { share + remainder } else { share },
        })
        .collect())
}

/// Check a participant-specified split against the total cost.
pub fn validate_splits(cost_cents: u64, splits: &[Split]) -> Result<()> {
    if splits.is_empty() {
        return Err(invalid("no participants to split between"));
    }
    check_unique(splits.iter().map(|s| &s.participant))?;
    let total = splits
        .iter()
        .try_fold(0u64, |acc, s| acc.checked_add(s.amount_cents))
        .ok_or_else(|| invalid("split amounts overflow"))?;
    if total != cost_cents {
        return Err(invalid(format!(
            "split amounts add up to {total} cents, expected {cost_cents}"
        )));
    }
    Ok(())
}

fn check_unique<'a>(participants: impl Iterator<Item = &'a ParticipantId>) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for p in participants {
        if !seen.insert(p.as_str()) {
            return Err(invalid(format!("participant {p} listed twice")));
        }
    }
    Ok(())
}

/// What to settle for a confirmed session. Participant ids are chat user ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRequest {
    /// Defaults to the first participant when unset.
    pub payer: Option<ParticipantId>,
    pub participants: Vec<ParticipantId>,
    pub cost_cents: u64,
    /// Explicit amounts per participant instead of an even split.
    pub custom_splits: Option<Vec<Split>>,
    pub description: String,
}

impl SettlementRequest {
    pub fn even(
        payer: Option<ParticipantId>,
        participants: Vec<ParticipantId>,
        cost_cents: u64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            payer,
            participants,
            cost_cents,
            custom_splits: None,
            description: description.into(),
        }
    }

    /// Payer and chat-id splits this request resolves to.
    pub fn resolve(&self) -> Result<(ParticipantId, Vec<Split>)> {
        match &self.custom_splits {
            Some(splits) => {
                validate_splits(self.cost_cents, splits)?;
                let payer = match &self.payer {
                    Some(p) if splits.iter().any(|s| &s.participant == p) => p.clone(),
                    Some(p) => return Err(invalid(format!("payer {p} is not a participant"))),
                    None => splits[0].participant.clone(),
                };
                Ok((payer, splits.clone()))
            }
            None => {
                let payer = match &self.payer {
                    Some(p) => p.clone(),
                    None => self
                        .participants
                        .first()
                        .cloned()
                        .ok_or_else(|| invalid("no participants to split between"))?,
                };
                let splits = split_evenly(self.cost_cents, &self.participants, &payer)?;
                Ok((payer, splits))
            }
        }
    }
}

/// Records settlements in the ledger and the local store.
///
/// A session is settled at most once: an existing local record is returned
/// as is, and the ledger is asked for an expense under the session's
/// idempotency key before a new one is created.
pub struct SettlementReporter {
    db: Arc<Database>,
    ledger: Arc<dyn LedgerGateway>,
    /// Serializes reports so two concurrent calls cannot both create.
    guard: Mutex<()>,
}

impl SettlementReporter {
    pub fn new(db: Arc<Database>, ledger: Arc<dyn LedgerGateway>) -> Self {
        Self {
            db,
            ledger,
            guard: Mutex::new(()),
        }
    }

    pub async fn report(
        &self,
        session: &PollSession,
        request: &SettlementRequest,
    ) -> Result<SettlementRecord> {
        if session.status() != PollStatus::Confirmed {
            return Err(LunchError::SessionNotConfirmed {
                session_id: session.id().to_string(),
                status: session.status().to_string(),
            });
        }

        let _guard = self.guard.lock().await;

        if let Some(existing) = self.db.load_settlement(session.id())? {
            debug!(session = %session.id(), "settlement already recorded");
            return Ok(existing);
        }

        if !self.ledger.is_enabled() {
            return Err(LunchError::LedgerRejected {
                message: "no ledger configured".into(),
            });
        }

        let (payer, splits) = request.resolve()?;

        let ledger_payer = self.ledger_member(&payer)?;
        let ledger_splits = splits
            .iter()
            .map(|s| {
                Ok(Split {
                    participant: self.ledger_member(&s.participant)?,
                    amount_cents: s.amount_cents,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let key = idempotency_key(session.id());
        let external_ref = match self.ledger.lookup_by_idempotency_key(&key).await? {
            Some(existing) => {
                info!(session = %session.id(), %existing, "ledger already holds this expense");
                existing
            }
            None => {
                self.ledger
                    .create_expense_split(&key, &request.description, &ledger_payer, &ledger_splits)
                    .await?
            }
        };

        let record = SettlementRecord {
            session_id: session.id().to_string(),
            payer,
            splits,
            external_ref,
            // Stored timestamps keep millisecond precision.
            created_at: Utc::now().trunc_subsecs(3),
        };
        if !self.db.insert_settlement(&record)? {
            // Another process stored one first; that record is authoritative.
            if let Some(stored) = self.db.load_settlement(session.id())? {
                return Ok(stored);
            }
        }

        info!(
            session = %record.session_id,
            payer = %record.payer,
            total_cents = record.total_cents(),
            external_ref = %record.external_ref,
            "settlement recorded"
        );
        Ok(record)
    }

    fn ledger_member(&self, chat_user: &str) -> Result<String> {
        self.db
            .ledger_member_for(chat_user)?
            .ok_or_else(|| LunchError::LedgerRejected {
                message: format!("no ledger member mapped for chat user {chat_user}"),
            })
    }
}
