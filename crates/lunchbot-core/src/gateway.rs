// Contracts the core relies on from the chat platform and the expense ledger.
//
// Concrete clients live in their own crates; the core only ever talks to
// these traits so the poll and settlement logic can be driven by in-process
// fakes in tests.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{MemberBalance, ReactionEvent, Split};

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("chat transport failure: {0}")]
    Transport(String),

    #[error("chat API returned error `{0}`")]
    Api(String),

    #[error("chat API response missing field `{0}`")]
    MalformedResponse(String),

    #[error("rate limited after {attempts} attempts")]
    RateLimited { attempts: u32 },
}

/// Identifies a message posted by the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub channel: String,
    pub message_id: String,
}

#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Post `text` to `channel`, returning the id of the new message.
    async fn post_message(&self, channel: &str, text: &str) -> Result<PostedMessage, ChatError>;

    /// Attach a reaction to a message so participants can click it.
    async fn add_reaction(&self, message: &PostedMessage, name: &str) -> Result<(), ChatError>;

    /// Start streaming vote changes on `message`. The stream has no natural
    /// end; the caller drops the receiver when the poll closes. Calling this
    /// again for the same message starts a fresh subscription.
    async fn subscribe_reactions(
        &self,
        message: &PostedMessage,
    ) -> Result<mpsc::Receiver<ReactionEvent>, ChatError>;
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Network trouble, timeouts, 5xx: safe to retry later.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger refused the request (bad member, bad credentials, ...).
    #[error("ledger rejected request: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Record that `payer` paid and each split owes its amount. Payer and
    /// split participants are ledger member ids.
    async fn create_expense_split(
        &self,
        idempotency_key: &str,
        description: &str,
        payer: &str,
        splits: &[Split],
    ) -> Result<String, LedgerError>;

    /// Find a previously created expense by its idempotency key.
    async fn lookup_by_idempotency_key(&self, key: &str) -> Result<Option<String>, LedgerError>;

    /// Current balances of every ledger member.
    async fn balances(&self) -> Result<Vec<MemberBalance>, LedgerError>;

    /// False when no ledger is configured; settlement is skipped.
    fn is_enabled(&self) -> bool {
        true
    }
}
