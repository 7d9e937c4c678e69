// Command line surface of the lunch bot: argument parsing, wiring of config,
// database and gateways, and the mapping of outcomes to exit codes.

use std::process::ExitCode;
use std::sync::{Arc, OnceLock};

use clap::{Parser, Subcommand};
use lunchbot_core::catalog::RestaurantCatalog;
use lunchbot_core::config::{self, Config, ConfigError, VenueConfig};
use lunchbot_core::db::Database;
use lunchbot_core::gateway::LedgerError;
use lunchbot_core::model::{MemberMapping, PollStatus};
use lunchbot_core::orchestrator::{Orchestrator, OrchestratorSettings, RunReport, SettlementOutcome};
use lunchbot_core::LunchError;
use lunchbot_ledger::LedgerClient;
use lunchbot_slack::{SlackClient, SlackSettings};
use regex::Regex;
use thiserror::Error;
use tracing::{error, info, warn};

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "lunchbot")]
#[command(about = "Proposes a place to eat, polls the channel and splits the bill")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Propose a venue, wait for the poll and settle the result.
    Run {
        /// Channel to post in instead of the configured one.
        #[arg(long)]
        channel: Option<String>,
    },
    /// Record the debt of a confirmed session in the ledger.
    Settle {
        #[arg(long)]
        session: String,
        /// Total cost in cents; defaults to the venue price per person.
        #[arg(long)]
        cost: Option<u64>,
    },
    /// Repeat today's announcement.
    Remind {
        #[arg(long)]
        channel: Option<String>,
    },
    /// Link a chat user to a ledger member.
    MapMember {
        /// Ledger member id (a UUID).
        ledger_member: String,
        /// Chat user id or mention, e.g. `U012AB3CD` or `<@U012AB3CD|alice>`.
        chat_user: String,
        /// Free-form note, usually the person's name.
        comment: Vec<String>,
    },
    /// List the venues with their selection statistics.
    Venues,
}

// ---------------------------------------------------------------------------
// Errors and exit codes
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("failed to set up ledger client: {0}")]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Lunch(#[from] LunchError),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// How a command ended, as seen by the operator's scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failed,
    /// The meal is decided but the debt is not recorded.
    Partial,
    Misconfigured,
}

impl Status {
    pub fn code(self) -> u8 {
        match self {
            Status::Success => 0,
            Status::Failed => 1,
            Status::Partial => 2,
            Status::Misconfigured => 3,
        }
    }
}

impl From<Status> for ExitCode {
    fn from(status: Status) -> Self {
        ExitCode::from(status.code())
    }
}

impl AppError {
    pub fn status(&self) -> Status {
        match self {
            AppError::Config(_) | AppError::MissingCredential(_) | AppError::Ledger(_) => {
                Status::Misconfigured
            }
            AppError::InvalidArgument(_) | AppError::Storage(_) => Status::Failed,
            AppError::Lunch(e) if e.is_settlement_error() => Status::Partial,
            AppError::Lunch(_) => Status::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Member mapping arguments
// ---------------------------------------------------------------------------

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}$")
            .expect("uuid pattern is valid")
    })
}

fn user_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:<@(U[A-Z0-9]+)(?:\|[^>]*)?>|(U[A-Z0-9]+))$").expect("user pattern is valid")
    })
}

/// Validate `map-member` arguments and build the mapping they describe.
pub fn parse_member_mapping(
    ledger_member: &str,
    chat_user: &str,
    comment: &[String],
) -> Result<MemberMapping, AppError> {
    if !uuid_re().is_match(ledger_member) {
        return Err(AppError::InvalidArgument(format!(
            "ledger member must be a uuid, got `{ledger_member}`"
        )));
    }
    let caps = user_re().captures(chat_user).ok_or_else(|| {
        AppError::InvalidArgument(format!(
            "chat user must be a user id or an @ mention, got `{chat_user}`"
        ))
    })?;
    let user = caps
        .get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| AppError::InvalidArgument(format!("no user id in `{chat_user}`")))?;

    Ok(MemberMapping {
        chat_user: user,
        ledger_member: ledger_member.to_string(),
        comment: comment.join(" "),
    })
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// One line per venue: id, name, how often it was chosen and when last.
pub fn render_venues(catalog: &RestaurantCatalog) -> String {
    let mut out = String::new();
    for venue in catalog.venues() {
        let last = venue
            .last_chosen_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        out.push_str(&format!(
            "{:<16} {:<24} {:>4}  {}\n",
            venue.id, venue.name, venue.selection_count, last
        ));
    }
    out
}

fn render_report(report: &RunReport) -> String {
    let mut line = format!(
        "session {}: {} ({})",
        report.session.id(),
        report.status,
        report.venue.name
    );
    match &report.settlement {
        SettlementOutcome::NotApplicable(reason) => line.push_str(&format!(", not settled: {reason}")),
        SettlementOutcome::Recorded(record) => line.push_str(&format!(
            ", settled {} cents as {}",
            record.total_cents(),
            record.external_ref
        )),
        SettlementOutcome::Failed(e) => line.push_str(&format!(", settlement failed: {e}")),
    }
    if !report.announced {
        line.push_str(", announcement not posted");
    }
    line
}

/// Exit status of a finished run.
pub fn run_status(report: &RunReport) -> Status {
    if report.is_partial() {
        Status::Partial
    } else {
        Status::Success
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

fn open_database(config: &Config) -> Result<Database, AppError> {
    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), "could not create database directory: {e}");
            }
        }
    }
    open_store(&config.db_path, &config.venues)
}

/// Open the database at `path` and bring its venue table in line with
/// `venues`.
fn open_store(path: &str, venues: &[VenueConfig]) -> Result<Database, AppError> {
    let db = Database::open(path)?;
    db.sync_venues(venues)?;
    info!(path, venues = venues.len(), "database opened");
    Ok(db)
}

fn build_orchestrator(config: &Config, db: Database) -> Result<Orchestrator, AppError> {
    let token = config
        .credentials
        .slack_token
        .clone()
        .filter(|t| !t.is_empty())
        .ok_or(AppError::MissingCredential("slack_token"))?;
    let chat = SlackClient::new(SlackSettings::from_config(config, token));

    let ledger = LedgerClient::from_config(config)?;
    match &ledger {
        LedgerClient::Active(_) => info!("ledger client initialized"),
        LedgerClient::Disabled => info!("ledger client disabled (no list or credentials)"),
    }

    Ok(Orchestrator::new(
        Arc::new(db),
        Arc::new(chat),
        Arc::new(ledger),
        OrchestratorSettings::from_config(config),
    ))
}

/// Load the configuration and execute `cli`, reporting failures through the
/// log and the returned status.
pub async fn execute(cli: Cli) -> Status {
    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return Status::Misconfigured;
        }
    };
    match dispatch(cli.command, &config).await {
        Ok(status) => status,
        Err(e) => {
            error!("{e}");
            e.status()
        }
    }
}

/// Execute one command against an already loaded configuration.
pub async fn dispatch(command: Command, config: &Config) -> Result<Status, AppError> {
    match command {
        Command::Run { channel } => {
            let channel = channel.unwrap_or_else(|| config.channel.clone());
            let orchestrator = build_orchestrator(config, open_database(config)?)?;
            let report = orchestrator.run(&channel).await?;
            if let SettlementOutcome::Failed(e) = &report.settlement {
                warn!(session = report.session.id(), "meal decided but debt not recorded: {e}");
            }
            println!("{}", render_report(&report));
            Ok(run_status(&report))
        }
        Command::Settle { session, cost } => {
            let orchestrator = build_orchestrator(config, open_database(config)?)?;
            let record = orchestrator.settle(&session, cost).await?;
            println!(
                "session {}: {} cents paid by {}, recorded as {}",
                record.session_id,
                record.total_cents(),
                record.payer,
                record.external_ref
            );
            Ok(Status::Success)
        }
        Command::Remind { channel } => {
            let channel = channel.unwrap_or_else(|| config.channel.clone());
            let orchestrator = build_orchestrator(config, open_database(config)?)?;
            match orchestrator.remind(&channel).await? {
                Some(_) => println!("reminder posted in {channel}"),
                None => println!("no {} session today in {channel}", PollStatus::Confirmed),
            }
            Ok(Status::Success)
        }
        Command::MapMember {
            ledger_member,
            chat_user,
            comment,
        } => {
            let mapping = parse_member_mapping(&ledger_member, &chat_user, &comment)?;
            let db = open_database(config)?;
            db.upsert_member_mapping(&mapping)?;
            info!(chat_user = %mapping.chat_user, ledger_member = %mapping.ledger_member, "member mapped");
            println!(
                "saved {} -> {} ({})",
                mapping.chat_user, mapping.ledger_member, mapping.comment
            );
            Ok(Status::Success)
        }
        Command::Venues => {
            let db = open_database(config)?;
            print!("{}", render_venues(&db.load_catalog()?));
            Ok(Status::Success)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
