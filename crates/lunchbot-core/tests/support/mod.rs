// In-process chat and ledger fakes for end-to-end runs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lunchbot_core::config::VenueConfig;
use lunchbot_core::db::Database;
use lunchbot_core::gateway::{ChatError, ChatGateway, LedgerError, LedgerGateway, PostedMessage};
use lunchbot_core::model::{DeliveryType, MemberBalance, MemberMapping, ReactionEvent, Split, Vote};
use lunchbot_core::orchestrator::{OrchestratorSettings, RetryPolicy};
use lunchbot_core::poll::PollSettings;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// Replays a fixed list of reaction events on every subscription and records
/// every posted message.
#[derive(Default)]
pub struct ScriptedChat {
    pub script: Mutex<Vec<ReactionEvent>>,
    pub posts: Mutex<Vec<(String, String)>>,
    /// Number of posts that succeed before every further post fails.
    pub posts_before_failure: Mutex<Option<usize>>,
    pub fail_subscribe: AtomicBool,
    next_ts: AtomicU32,
}

impl ScriptedChat {
    pub fn with_script(script: Vec<ReactionEvent>) -> Self {
        Self {
            script: Mutex::new(script),
            ..Self::default()
        }
    }

    pub fn posted_texts(&self) -> Vec<String> {
        self.posts.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
    }
}

#[async_trait]
impl ChatGateway for ScriptedChat {
    async fn post_message(&self, channel: &str, text: &str) -> Result<PostedMessage, ChatError> {
        let mut posts = self.posts.lock().unwrap();
        if let Some(limit) = *self.posts_before_failure.lock().unwrap() {
            if posts.len() >= limit {
                return Err(ChatError::Api("not_in_channel".into()));
            }
        }
        posts.push((channel.to_string(), text.to_string()));
        let n = self.next_ts.fetch_add(1, Ordering::SeqCst);
        Ok(PostedMessage {
            channel: channel.to_string(),
            message_id: format!("1700000000.{n:06}"),
        })
    }

    async fn add_reaction(&self, _message: &PostedMessage, _name: &str) -> Result<(), ChatError> {
        Ok(())
    }

    async fn subscribe_reactions(
        &self,
        _message: &PostedMessage,
    ) -> Result<mpsc::Receiver<ReactionEvent>, ChatError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ChatError::Transport("connection reset".into()));
        }
        let script = self.script.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(script.len().max(1));
        for event in script {
            tx.try_send(event).expect("script fits in channel");
        }
        // Dropping `tx` ends the stream; the poll then waits for its timeout.
        Ok(rx)
    }
}

pub fn join(participant: &str) -> ReactionEvent {
    ReactionEvent::Cast {
        participant: participant.to_string(),
        vote: Vote::Join,
    }
}

pub fn decline(participant: &str) -> ReactionEvent {
    ReactionEvent::Cast {
        participant: participant.to_string(),
        vote: Vote::Decline,
    }
}

pub fn veto(participant: &str) -> ReactionEvent {
    ReactionEvent::Cast {
        participant: participant.to_string(),
        vote: Vote::Veto,
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLedger {
    /// Idempotency key -> (external ref, payer, splits).
    pub expenses: Mutex<HashMap<String, (String, String, Vec<Split>)>>,
    pub create_calls: AtomicU32,
    /// Creates that fail as unavailable before one succeeds.
    pub transient_failures: AtomicU32,
    pub balances: Mutex<Vec<MemberBalance>>,
    pub disabled: bool,
}

impl FakeLedger {
    pub fn with_balances(balances: &[(&str, i64)]) -> Self {
        Self {
            balances: Mutex::new(
                balances
                    .iter()
                    .map(|(id, cents)| MemberBalance {
                        member_id: id.to_string(),
                        nickname: id.to_uppercase(),
                        balance_cents: *cents,
                    })
                    .collect(),
            ),
            ..Self::default()
        }
    }

    pub fn creates(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerGateway for FakeLedger {
    async fn create_expense_split(
        &self,
        idempotency_key: &str,
        _description: &str,
        payer: &str,
        splits: &[Split],
    ) -> Result<String, LedgerError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(LedgerError::Unavailable("503 Service Unavailable".into()));
        }
        let mut expenses = self.expenses.lock().unwrap();
        let external = format!("expense-{}", expenses.len() + 1);
        expenses.insert(
            idempotency_key.to_string(),
            (external.clone(), payer.to_string(), splits.to_vec()),
        );
        Ok(external)
    }

    async fn lookup_by_idempotency_key(&self, key: &str) -> Result<Option<String>, LedgerError> {
        Ok(self
            .expenses
            .lock()
            .unwrap()
            .get(key)
            .map(|(external, _, _)| external.clone()))
    }

    async fn balances(&self) -> Result<Vec<MemberBalance>, LedgerError> {
        Ok(self.balances.lock().unwrap().clone())
    }

    fn is_enabled(&self) -> bool {
        !self.disabled
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn venue(id: &str, delivery: DeliveryType, price: Option<u64>) -> VenueConfig {
    VenueConfig {
        id: id.to_string(),
        name: format!("{}{}", id[..1].to_uppercase(), &id[1..]),
        emoji: None,
        delivery,
        instructions: String::new(),
        price_per_person_cents: price,
    }
}

/// In-memory database holding `venues` and mapping chat users `U<n>` to
/// ledger members `m-<n>` for n in 1..=4.
pub fn database(venues: &[VenueConfig]) -> Arc<Database> {
    database_at(":memory:", venues)
}

/// Same as [`database`], backed by the file at `path`.
pub fn database_at(path: &str, venues: &[VenueConfig]) -> Arc<Database> {
    let db = Database::open(path).expect("database should open");
    db.sync_venues(venues).unwrap();
    for n in 1..=4 {
        db.upsert_member_mapping(&MemberMapping {
            chat_user: format!("U{n}"),
            ledger_member: format!("m-{n}"),
            comment: String::new(),
        })
        .unwrap();
    }
    Arc::new(db)
}

pub fn settings(quorum: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        history_window: 3,
        poll: PollSettings {
            quorum,
            timeout: Duration::from_secs(90 * 60),
            prompt_reactions: vec!["bee".into(), "house".into()],
        },
        join_reactions: vec!["bee".into()],
        decline_reactions: vec!["house".into()],
        retry: RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(10),
        },
    }
}
