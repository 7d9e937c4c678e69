// SQLite persistence for venues, poll sessions, settlements and member
// mappings.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::catalog::RestaurantCatalog;
use crate::config::VenueConfig;
use crate::model::{
    DeliveryType, MemberMapping, PollStatus, SessionId, SettlementRecord, Split, Venue, Vote,
};
use crate::poll::PollSession;

/// SQLite-backed store shared by every component of the bot.
#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS venues (
                id                     TEXT PRIMARY KEY,
                name                   TEXT NOT NULL,
                emoji                  TEXT NOT NULL,
                instructions           TEXT NOT NULL DEFAULT '',
                delivery               TEXT NOT NULL,
                price_per_person_cents INTEGER,
                position               INTEGER NOT NULL DEFAULT 0,
                active                 INTEGER NOT NULL DEFAULT 1,
                selection_count        INTEGER NOT NULL DEFAULT 0,
                last_chosen_at         TEXT
            );

            CREATE TABLE IF NOT EXISTS poll_sessions (
                id          TEXT PRIMARY KEY,
                channel     TEXT NOT NULL,
                venue_id    TEXT NOT NULL REFERENCES venues(id),
                message_id  TEXT,
                quorum      INTEGER NOT NULL,
                status      TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                expires_at  TEXT NOT NULL,
                resolved_at TEXT,
                payer       TEXT
            );

            CREATE TABLE IF NOT EXISTS poll_votes (
                session_id  TEXT NOT NULL REFERENCES poll_sessions(id),
                participant TEXT NOT NULL,
                vote        TEXT NOT NULL,
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (session_id, participant)
            );

            CREATE TABLE IF NOT EXISTS venue_picks (
                session_id TEXT PRIMARY KEY REFERENCES poll_sessions(id),
                venue_id   TEXT NOT NULL REFERENCES venues(id),
                picked_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settlements (
                session_id   TEXT PRIMARY KEY REFERENCES poll_sessions(id),
                payer        TEXT NOT NULL,
                splits       TEXT NOT NULL,
                external_ref TEXT NOT NULL,
                created_at   TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS member_mappings (
                chat_user     TEXT PRIMARY KEY,
                ledger_member TEXT NOT NULL,
                comment       TEXT NOT NULL DEFAULT '',
                updated_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_poll_sessions_one_open
                ON poll_sessions(channel) WHERE status = 'open';
            CREATE INDEX IF NOT EXISTS idx_poll_sessions_channel
                ON poll_sessions(channel, created_at);
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock).
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Venues
    // ------------------------------------------------------------------

    /// Make the stored venues match `venues`: new ones are inserted,
    /// existing ones keep their statistics but take the configured
    /// definition, and venues no longer configured are deactivated.
    pub fn sync_venues(&self, venues: &[VenueConfig]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin venue sync")?;
        tx.execute("UPDATE venues SET active = 0", [])
            .context("failed to deactivate venues")?;
        for (position, venue) in venues.iter().enumerate() {
            let price = venue.price_per_person_cents.map(to_sql_cents).transpose()?;
            tx.execute(
                "INSERT INTO venues
                    (id, name, emoji, instructions, delivery, price_per_person_cents, position, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    emoji = excluded.emoji,
                    instructions = excluded.instructions,
                    delivery = excluded.delivery,
                    price_per_person_cents = excluded.price_per_person_cents,
                    position = excluded.position,
                    active = 1",
                params![
                    venue.id,
                    venue.name,
                    venue.emoji(),
                    venue.instructions,
                    venue.delivery.as_str(),
                    price,
                    position as i64,
                ],
            )
            .with_context(|| format!("failed to upsert venue {}", venue.id))?;
        }
        tx.commit().context("failed to commit venue sync")?;
        Ok(())
    }

    /// Active venues (in configured order) plus the full pick history.
    pub fn load_catalog(&self) -> Result<RestaurantCatalog> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {VENUE_COLUMNS} FROM venues WHERE active = 1 ORDER BY position, id"
            ))
            .context("failed to prepare load_catalog query")?;
        let rows = stmt
            .query_map([], VenueRow::from_row)
            .context("failed to query venues")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map venue rows")?;
        let venues = rows
            .into_iter()
            .map(VenueRow::into_venue)
            .collect::<Result<Vec<_>>>()?;

        let mut stmt = conn
            .prepare("SELECT venue_id FROM venue_picks ORDER BY picked_at, rowid")
            .context("failed to prepare history query")?;
        let history = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query pick history")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map pick history rows")?;

        Ok(RestaurantCatalog::new(venues, history))
    }

    /// Look up a venue by id, active or not.
    pub fn venue(&self, id: &str) -> Result<Option<Venue>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {VENUE_COLUMNS} FROM venues WHERE id = ?1"),
                params![id],
                VenueRow::from_row,
            )
            .optional()
            .context("failed to query venue")?;
        row.map(VenueRow::into_venue).transpose()
    }

    // ------------------------------------------------------------------
    // Poll sessions
    // ------------------------------------------------------------------

    /// Insert `session` as the Open session of its channel.
    ///
    /// Returns `false` when the channel already has an Open session. Open
    /// rows whose expiry has passed (left behind by a crashed process) are
    /// swept to Expired first.
    pub fn open_session(&self, session: &PollSession, now: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin open_session")?;
        let now = ts(now);

        let swept = tx
            .execute(
                "UPDATE poll_sessions SET status = 'expired', resolved_at = ?2
                 WHERE channel = ?1 AND status = 'open' AND expires_at < ?2",
                params![session.channel, now],
            )
            .context("failed to sweep stale sessions")?;
        if swept > 0 {
            tracing::warn!(channel = %session.channel, swept, "expired stale open poll sessions");
        }

        let inserted = tx.execute(
            "INSERT INTO poll_sessions
                (id, channel, venue_id, message_id, quorum, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7)",
            params![
                session.id,
                session.channel,
                session.venue_id,
                session.message_id,
                session.quorum as i64,
                ts(session.created_at),
                ts(session.expires_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                // The partial unique index on open sessions fired.
                return Ok(false);
            }
            Err(e) => return Err(e).context("failed to insert poll session"),
        }

        tx.commit().context("failed to commit open_session")?;
        Ok(true)
    }

    /// Id of the channel's Open session, if any.
    pub fn open_session_for(&self, channel: &str) -> Result<Option<SessionId>> {
        self.conn()
            .query_row(
                "SELECT id FROM poll_sessions WHERE channel = ?1 AND status = 'open'",
                params![channel],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query open session")
    }

    pub fn set_message_id(&self, session_id: &str, message_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE poll_sessions SET message_id = ?2 WHERE id = ?1",
                params![session_id, message_id],
            )
            .context("failed to set message id")?;
        Ok(())
    }

    /// Store (or overwrite) a participant's vote.
    pub fn record_vote(&self, session_id: &str, participant: &str, vote: Vote) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO poll_votes (session_id, participant, vote, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id, participant) DO UPDATE SET
                    vote = excluded.vote,
                    updated_at = excluded.updated_at",
                params![session_id, participant, vote.as_str(), ts(Utc::now())],
            )
            .context("failed to record vote")?;
        Ok(())
    }

    pub fn remove_vote(&self, session_id: &str, participant: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM poll_votes WHERE session_id = ?1 AND participant = ?2",
                params![session_id, participant],
            )
            .context("failed to remove vote")?;
        Ok(())
    }

    /// Persist the terminal status of `session`. For a Confirmed session the
    /// venue pick is committed to the history in the same transaction.
    ///
    /// Returns `false` (and changes nothing) when the stored session was no
    /// longer Open.
    pub fn resolve_session(&self, session: &PollSession, resolved_at: DateTime<Utc>) -> Result<bool> {
        if !session.status.is_terminal() {
            return Err(anyhow!("session {} is still open", session.id));
        }
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin resolve_session")?;
        let at = ts(resolved_at);

        let changed = tx
            .execute(
                "UPDATE poll_sessions SET status = ?2, resolved_at = ?3
                 WHERE id = ?1 AND status = 'open'",
                params![session.id, session.status.as_str(), at],
            )
            .context("failed to update session status")?;
        if changed == 0 {
            return Ok(false);
        }

        if session.status == PollStatus::Confirmed {
            let picked = tx
                .execute(
                    "INSERT OR IGNORE INTO venue_picks (session_id, venue_id, picked_at)
                     VALUES (?1, ?2, ?3)",
                    params![session.id, session.venue_id, at],
                )
                .context("failed to record venue pick")?;
            if picked > 0 {
                tx.execute(
                    "UPDATE venues SET selection_count = selection_count + 1, last_chosen_at = ?2
                     WHERE id = ?1",
                    params![session.venue_id, at],
                )
                .context("failed to update venue statistics")?;
            }
        }

        tx.commit().context("failed to commit resolve_session")?;
        Ok(true)
    }

    /// Remove an Open session and its votes. Used when the proposal could
    /// not be posted or the reaction stream was lost.
    pub fn discard_session(&self, session_id: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin discard_session")?;
        let open: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM poll_sessions WHERE id = ?1 AND status = 'open'",
                params![session_id],
                |row| row.get(0),
            )
            .context("failed to check session status")?;
        if open {
            tx.execute("DELETE FROM poll_votes WHERE session_id = ?1", params![session_id])
                .context("failed to delete votes")?;
            tx.execute("DELETE FROM poll_sessions WHERE id = ?1", params![session_id])
                .context("failed to delete session")?;
        }
        tx.commit().context("failed to commit discard_session")?;
        Ok(())
    }

    pub fn set_payer(&self, session_id: &str, payer: &str) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE poll_sessions SET payer = ?2 WHERE id = ?1",
                params![session_id, payer],
            )
            .context("failed to set payer")?;
        Ok(())
    }

    /// Load a session together with its votes.
    pub fn load_session(&self, session_id: &str) -> Result<Option<PollSession>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM poll_sessions WHERE id = ?1"),
                params![session_id],
                SessionRow::from_row,
            )
            .optional()
            .context("failed to query poll session")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let votes = load_votes(&conn, session_id)?;
        row.into_session(votes).map(Some)
    }

    /// Most recent session of `channel` with the given status.
    pub fn latest_session(&self, channel: &str, status: PollStatus) -> Result<Option<PollSession>> {
        let id: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM poll_sessions WHERE channel = ?1 AND status = ?2
                 ORDER BY created_at DESC LIMIT 1",
                params![channel, status.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query latest session")?;
        match id {
            Some(id) => self.load_session(&id),
            None => Ok(None),
        }
    }

    // ------------------------------------------------------------------
    // Settlements
    // ------------------------------------------------------------------

    pub fn load_settlement(&self, session_id: &str) -> Result<Option<SettlementRecord>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT session_id, payer, splits, external_ref, created_at
                 FROM settlements WHERE session_id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to query settlement")?;

        let Some((session_id, payer, splits_json, external_ref, created_at)) = row else {
            return Ok(None);
        };
        let splits: Vec<Split> =
            serde_json::from_str(&splits_json).context("failed to deserialize splits")?;
        Ok(Some(SettlementRecord {
            session_id,
            payer,
            splits,
            external_ref,
            created_at: parse_ts(&created_at)?,
        }))
    }

    /// Store a settlement. Uses INSERT OR IGNORE: the first record for a
    /// session wins and is never overwritten. Returns whether it was stored.
    pub fn insert_settlement(&self, record: &SettlementRecord) -> Result<bool> {
        let splits = serde_json::to_string(&record.splits).context("failed to serialize splits")?;
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO settlements
                    (session_id, payer, splits, external_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.session_id,
                    record.payer,
                    splits,
                    record.external_ref,
                    ts(record.created_at),
                ],
            )
            .context("failed to insert settlement")?;
        Ok(inserted > 0)
    }

    // ------------------------------------------------------------------
    // Member mappings
    // ------------------------------------------------------------------

    pub fn upsert_member_mapping(&self, mapping: &MemberMapping) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO member_mappings (chat_user, ledger_member, comment, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chat_user) DO UPDATE SET
                    ledger_member = excluded.ledger_member,
                    comment = excluded.comment,
                    updated_at = excluded.updated_at",
                params![
                    mapping.chat_user,
                    mapping.ledger_member,
                    mapping.comment,
                    ts(Utc::now())
                ],
            )
            .context("failed to upsert member mapping")?;
        Ok(())
    }

    pub fn member_mappings(&self) -> Result<Vec<MemberMapping>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT chat_user, ledger_member, comment FROM member_mappings ORDER BY chat_user")
            .context("failed to prepare member_mappings query")?;
        let mappings = stmt
            .query_map([], |row| {
                Ok(MemberMapping {
                    chat_user: row.get(0)?,
                    ledger_member: row.get(1)?,
                    comment: row.get(2)?,
                })
            })
            .context("failed to query member mappings")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map member mapping rows")?;
        Ok(mappings)
    }

    pub fn ledger_member_for(&self, chat_user: &str) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT ledger_member FROM member_mappings WHERE chat_user = ?1",
                params![chat_user],
                |row| row.get(0),
            )
            .optional()
            .context("failed to query member mapping")
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

const VENUE_COLUMNS: &str = "id, name, emoji, instructions, delivery, price_per_person_cents, \
                             last_chosen_at, selection_count";

struct VenueRow {
    id: String,
    name: String,
    emoji: String,
    instructions: String,
    delivery: String,
    price: Option<i64>,
    last_chosen_at: Option<String>,
    selection_count: i64,
}

impl VenueRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            emoji: row.get(2)?,
            instructions: row.get(3)?,
            delivery: row.get(4)?,
            price: row.get(5)?,
            last_chosen_at: row.get(6)?,
            selection_count: row.get(7)?,
        })
    }

    fn into_venue(self) -> Result<Venue> {
        let delivery = DeliveryType::parse(&self.delivery)
            .ok_or_else(|| anyhow!("venue {} has unknown delivery type {}", self.id, self.delivery))?;
        Ok(Venue {
            delivery,
            price_per_person_cents: self.price.map(from_sql_cents).transpose()?,
            last_chosen_at: self.last_chosen_at.as_deref().map(parse_ts).transpose()?,
            selection_count: u32::try_from(self.selection_count)
                .context("selection_count out of range")?,
            id: self.id,
            name: self.name,
            emoji: self.emoji,
            instructions: self.instructions,
        })
    }
}

const SESSION_COLUMNS: &str = "id, channel, venue_id, message_id, quorum, status, created_at, \
                               expires_at, resolved_at, payer";

struct SessionRow {
    id: String,
    channel: String,
    venue_id: String,
    message_id: Option<String>,
    quorum: i64,
    status: String,
    created_at: String,
    expires_at: String,
    resolved_at: Option<String>,
    payer: Option<String>,
}

impl SessionRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            channel: row.get(1)?,
            venue_id: row.get(2)?,
            message_id: row.get(3)?,
            quorum: row.get(4)?,
            status: row.get(5)?,
            created_at: row.get(6)?,
            expires_at: row.get(7)?,
            resolved_at: row.get(8)?,
            payer: row.get(9)?,
        })
    }

    fn into_session(self, votes: BTreeMap<String, Vote>) -> Result<PollSession> {
        let status = PollStatus::parse(&self.status)
            .ok_or_else(|| anyhow!("session {} has unknown status {}", self.id, self.status))?;
        Ok(PollSession {
            quorum: usize::try_from(self.quorum).context("quorum out of range")?,
            status,
            created_at: parse_ts(&self.created_at)?,
            expires_at: parse_ts(&self.expires_at)?,
            resolved_at: self.resolved_at.as_deref().map(parse_ts).transpose()?,
            votes,
            id: self.id,
            channel: self.channel,
            venue_id: self.venue_id,
            message_id: self.message_id,
            payer: self.payer,
        })
    }
}

fn load_votes(conn: &Connection, session_id: &str) -> Result<BTreeMap<String, Vote>> {
    let mut stmt = conn
        .prepare("SELECT participant, vote FROM poll_votes WHERE session_id = ?1")
        .context("failed to prepare votes query")?;
    let rows = stmt
        .query_map(params![session_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .context("failed to query votes")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .context("failed to map vote rows")?;

    rows.into_iter()
        .map(|(participant, vote)| {
            let vote = Vote::parse(&vote).ok_or_else(|| anyhow!("unknown vote {vote}"))?;
            Ok((participant, vote))
        })
        .collect()
}

/// Timestamps are stored as RFC 3339 UTC with millisecond precision, which
/// sorts lexicographically in time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp {s}"))
}

fn to_sql_cents(cents: u64) -> Result<i64> {
    i64::try_from(cents).context("amount out of range")
}

fn from_sql_cents(cents: i64) -> Result<u64> {
    u64::try_from(cents).context("negative amount stored")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
