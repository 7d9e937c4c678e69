// Domain types shared by selection, polling and settlement.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type VenueId = String;
pub type ParticipantId = String;
pub type SessionId = String;

// ---------------------------------------------------------------------------
// Venues
// ---------------------------------------------------------------------------

/// How the food reaches the group. Decides whether somebody pays for
/// everyone (and therefore whether a settlement is recorded).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryType {
    /// Somebody cycles over to pick it up and pays.
    Bike,
    /// Ordered for delivery; one person pays.
    Delivery,
    /// Everybody pays for themselves at the restaurant.
    EatingOut,
}

impl DeliveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryType::Bike => "bike",
            DeliveryType::Delivery => "delivery",
            DeliveryType::EatingOut => "eating_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bike" => Some(DeliveryType::Bike),
            "delivery" => Some(DeliveryType::Delivery),
            "eating_out" => Some(DeliveryType::EatingOut),
            _ => None,
        }
    }

    /// Whether one participant pays for the whole group.
    pub fn has_payer(&self) -> bool {
        !matches!(self, DeliveryType::EatingOut)
    }
}

/// A candidate restaurant together with its selection statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Venue {
    pub id: VenueId,
    pub name: String,
    /// Reaction/emoji name used when announcing the venue.
    pub emoji: String,
    pub instructions: String,
    pub delivery: DeliveryType,
    pub price_per_person_cents: Option<u64>,
    pub last_chosen_at: Option<DateTime<Utc>>,
    pub selection_count: u32,
}

// ---------------------------------------------------------------------------
// Votes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    /// "I'm joining for dinner."
    Join,
    /// "I'm eating at home / not going."
    Decline,
    /// Call the whole thing off.
    Veto,
}

impl Vote {
    pub fn is_positive(&self) -> bool {
        matches!(self, Vote::Join)
    }

    /// Precedence used when one participant holds several reactions.
    pub fn precedence(&self) -> u8 {
        match self {
            Vote::Join => 0,
            Vote::Decline => 1,
            Vote::Veto => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Vote::Join => "join",
            Vote::Decline => "decline",
            Vote::Veto => "veto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "join" => Some(Vote::Join),
            "decline" => Some(Vote::Decline),
            "veto" => Some(Vote::Veto),
            _ => None,
        }
    }
}

/// A change in one participant's reaction on the poll message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactionEvent {
    Cast {
        participant: ParticipantId,
        vote: Vote,
    },
    Withdrawn {
        participant: ParticipantId,
    },
    /// The gateway gave up on the subscription.
    Lost { message: String },
}

// ---------------------------------------------------------------------------
// Poll status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStatus {
    Open,
    Confirmed,
    Rejected,
    Expired,
}

impl PollStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollStatus::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollStatus::Open => "open",
            PollStatus::Confirmed => "confirmed",
            PollStatus::Rejected => "rejected",
            PollStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PollStatus::Open),
            "confirmed" => Some(PollStatus::Confirmed),
            "rejected" => Some(PollStatus::Rejected),
            "expired" => Some(PollStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for PollStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// One participant's share of the meal, in cents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Split {
    pub participant: ParticipantId,
    pub amount_cents: u64,
}

/// The durable result of settling a confirmed session. Never mutated once
/// stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub session_id: SessionId,
    pub payer: ParticipantId,
    pub splits: Vec<Split>,
    pub external_ref: String,
    pub created_at: DateTime<Utc>,
}

impl SettlementRecord {
    pub fn total_cents(&self) -> u64 {
        self.splits.iter().map(|s| s.amount_cents).sum()
    }
}

/// A ledger member's standing balance (negative means they owe the group).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberBalance {
    pub member_id: String,
    pub nickname: String,
    pub balance_cents: i64,
}

/// Link between a chat user and a ledger member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberMapping {
    pub chat_user: ParticipantId,
    pub ledger_member: String,
    pub comment: String,
}
