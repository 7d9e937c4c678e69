// Configuration loading and parsing (bot.toml, credentials.toml).

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::{DeliveryType, Vote};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Environment overrides for credentials
// ---------------------------------------------------------------------------

pub const ENV_SLACK_TOKEN: &str = "LUNCHBOT_SLACK_TOKEN";
pub const ENV_LEDGER_EMAIL: &str = "LUNCHBOT_LEDGER_EMAIL";
pub const ENV_LEDGER_PASSWORD: &str = "LUNCHBOT_LEDGER_PASSWORD";

const BOT_TOML: &str = "bot.toml";
const CREDENTIALS_TOML: &str = "credentials.toml";

/// Longest poll the bot will run.
pub const MAX_POLL_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub channel: String,
    pub selection: SelectionConfig,
    pub poll: PollConfig,
    pub settlement: SettlementConfig,
    pub slack: SlackConfig,
    pub ledger: LedgerConfig,
    pub venues: Vec<VenueConfig>,
    pub credentials: CredentialsConfig,
    pub db_path: String,
}

// ---------------------------------------------------------------------------
// bot.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire bot.toml file.
#[derive(Debug, Clone, Deserialize)]
struct BotFile {
    bot: BotSection,
    #[serde(default)]
    selection: SelectionConfig,
    poll: PollConfig,
    #[serde(default)]
    settlement: SettlementConfig,
    #[serde(default)]
    database: DatabaseSection,
    #[serde(default)]
    slack: SlackConfig,
    #[serde(default)]
    ledger: LedgerConfig,
    #[serde(default)]
    venues: Vec<VenueConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct BotSection {
    channel: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct DatabaseSection {
    path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    /// Number of most recent picks excluded from the next selection.
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            history_window: default_history_window(),
        }
    }
}

fn default_history_window() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    pub timeout_secs: u64,
    /// Positive votes that confirm the proposal before the timeout.
    pub quorum: usize,
    /// How often the chat gateway re-reads reactions.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    pub reactions: ReactionConfig,
}

fn default_poll_interval() -> u64 {
    30
}

/// Reaction names that count as each kind of vote.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ReactionConfig {
    pub join: Vec<String>,
    pub decline: Vec<String>,
    #[serde(default)]
    pub veto: Vec<String>,
}

impl ReactionConfig {
    /// Map a reaction name to the vote it expresses.
    pub fn vote_for(&self, name: &str) -> Option<Vote> {
        if self.veto.iter().any(|n| n == name) {
            Some(Vote::Veto)
        } else if self.decline.iter().any(|n| n == name) {
            Some(Vote::Decline)
        } else if self.join.iter().any(|n| n == name) {
            Some(Vote::Join)
        } else {
            None
        }
    }

    /// Reactions the bot pre-attaches to the proposal so they are one click
    /// away. The veto reaction is left off on purpose.
    pub fn prompt_reactions(&self) -> Vec<String> {
        self.join
            .iter()
            .take(1)
            .chain(self.decline.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettlementConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            currency: default_currency(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_currency() -> String {
    "EUR".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    #[serde(default = "default_slack_url")]
    pub base_url: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            base_url: default_slack_url(),
        }
    }
}

fn default_slack_url() -> String {
    "https://slack.com/api/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_url")]
    pub base_url: String,
    /// The shared expense list; the ledger is disabled without one.
    #[serde(default)]
    pub list_id: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: default_ledger_url(),
            list_id: None,
        }
    }
}

fn default_ledger_url() -> String {
    "https://api.wiebetaaltwat.nl".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct VenueConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub emoji: Option<String>,
    pub delivery: DeliveryType,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub price_per_person_cents: Option<u64>,
}

impl VenueConfig {
    pub fn emoji(&self) -> &str {
        self.emoji.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CredentialsConfig {
    pub slack_token: Option<String>,
    pub ledger_email: Option<String>,
    pub ledger_password: Option<String>,
}

impl CredentialsConfig {
    /// Replace file values with any non-empty value returned by `lookup`
    /// for the `LUNCHBOT_*` variables.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let pick = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(v) = pick(ENV_SLACK_TOKEN) {
            self.slack_token = Some(v);
        }
        if let Some(v) = pick(ENV_LEDGER_EMAIL) {
            self.ledger_email = Some(v);
        }
        if let Some(v) = pick(ENV_LEDGER_PASSWORD) {
            self.ledger_password = Some(v);
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/bot.toml` and (optionally)
/// `config/credentials.toml`, relative to `base_dir`. Environment overrides
/// are not applied here.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- bot.toml (required) ---
    let bot_path = config_dir.join(BOT_TOML);
    let bot_text = read_file(&bot_path)?;
    let bot_file: BotFile = toml::from_str(&bot_text).map_err(|e| ConfigError::ParseError {
        path: bot_path.clone(),
        source: e,
    })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join(CREDENTIALS_TOML);
    let credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        CredentialsConfig::default()
    };

    let db_path = bot_file
        .database
        .path
        .filter(|p| !p.is_empty())
        .unwrap_or_else(default_db_path);

    let config = Config {
        channel: bot_file.bot.channel,
        selection: bot_file.selection,
        poll: bot_file.poll,
        settlement: bot_file.settlement,
        slack: bot_file.slack,
        ledger: bot_file.ledger,
        venues: bot_file.venues,
        credentials,
        db_path,
    };

    validate(&config)?;

    Ok(config)
}

fn copy_error(message: String) -> ConfigError {
    ConfigError::DefaultsCopyError { message }
}

/// Shipped config files in `defaults_dir`, sorted by name. `.example` files
/// (e.g. `credentials.toml.example`) are templates and never installed.
fn default_files(defaults_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let entries = std::fs::read_dir(defaults_dir)
        .map_err(|e| copy_error(format!("failed to read {}: {e}", defaults_dir.display())))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|e| copy_error(format!("failed to read {}: {e}", defaults_dir.display())))?
            .path();
        let is_template = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".example"));
        if path.is_file() && !is_template {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Copy `source` to `target` unless `target` already exists. Returns whether
/// a copy was made; an operator's edited file is never replaced.
fn install_if_missing(source: &Path, target: &Path) -> Result<bool, ConfigError> {
    let mut dest = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(target)
    {
        Ok(dest) => dest,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => return Err(copy_error(format!("failed to create {}: {e}", target.display()))),
    };
    let content = std::fs::read(source)
        .map_err(|e| copy_error(format!("failed to read {}: {e}", source.display())))?;
    std::io::Write::write_all(&mut dest, &content)
        .map_err(|e| copy_error(format!("failed to write {}: {e}", target.display())))?;
    Ok(true)
}

/// Install the shipped `defaults/` files (`bot.toml` and friends) into
/// `config/` where they are missing. Returns the newly installed paths.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.is_dir() {
        if config_dir.is_dir() {
            return Ok(vec![]);
        }
        return Err(copy_error(format!(
            "neither defaults/ nor config/ directory found in {}; \
             cannot locate {BOT_TOML}",
            base_dir.display()
        )));
    }

    std::fs::create_dir_all(&config_dir)
        .map_err(|e| copy_error(format!("failed to create {}: {e}", config_dir.display())))?;

    let mut installed = Vec::new();
    for source in default_files(&defaults_dir)? {
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = config_dir.join(name);
        if install_if_missing(&source, &target)? {
            tracing::info!(file = %target.display(), "installed default config file");
            installed.push(target);
        }
    }
    Ok(installed)
}

/// Load config relative to the current working directory, copying defaults
/// first and applying `LUNCHBOT_*` environment overrides last.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    let mut config = load_config_from(&cwd)?;
    config
        .credentials
        .apply_overrides(|name| std::env::var(name).ok());
    Ok(config)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

/// `lunchbot.db` in the platform data directory, or the working directory
/// when no home directory can be determined.
fn default_db_path() -> String {
    directories::ProjectDirs::from("nl", "lunchbot", "lunchbot")
        .map(|dirs| dirs.data_dir().join("lunchbot.db"))
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| "lunchbot.db".to_string())
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.channel.trim().is_empty() {
        return Err(invalid("bot.channel", "must not be empty"));
    }

    let poll = &config.poll;
    if poll.timeout_secs == 0 {
        return Err(invalid("poll.timeout_secs", "must be > 0"));
    }
    if poll.timeout_secs > MAX_POLL_TIMEOUT_SECS {
        return Err(invalid(
            "poll.timeout_secs",
            format!("must be at most {MAX_POLL_TIMEOUT_SECS} (one week)"),
        ));
    }
    if poll.quorum == 0 {
        return Err(invalid("poll.quorum", "must be > 0"));
    }
    if poll.poll_interval_secs == 0 {
        return Err(invalid("poll.poll_interval_secs", "must be > 0"));
    }
    if poll.reactions.join.is_empty() {
        return Err(invalid("poll.reactions.join", "needs at least one reaction"));
    }
    if poll.reactions.decline.is_empty() {
        return Err(invalid("poll.reactions.decline", "needs at least one reaction"));
    }

    // A reaction name must express exactly one vote.
    let mut seen: HashMap<&str, &str> = HashMap::new();
    let groups: &[(&str, &[String])] = &[
        ("poll.reactions.join", &poll.reactions.join),
        ("poll.reactions.decline", &poll.reactions.decline),
        ("poll.reactions.veto", &poll.reactions.veto),
    ];
    for (field, names) in groups {
        for name in names.iter() {
            if let Some(other) = seen.insert(name.as_str(), *field) {
                if other != *field {
                    return Err(invalid(
                        field,
                        format!("reaction `{name}` is also listed in {other}"),
                    ));
                }
            }
        }
    }

    if config.settlement.retry_attempts == 0 {
        return Err(invalid("settlement.retry_attempts", "must be > 0"));
    }

    if config.venues.is_empty() {
        return Err(invalid("venues", "at least one venue is required"));
    }
    let mut ids = HashSet::new();
    for venue in &config.venues {
        if venue.id.trim().is_empty() {
            return Err(invalid("venues.id", "must not be empty"));
        }
        if !ids.insert(venue.id.as_str()) {
            return Err(invalid("venues.id", format!("duplicate venue id `{}`", venue.id)));
        }
        if venue.price_per_person_cents == Some(0) {
            return Err(invalid(
                "venues.price_per_person_cents",
                format!("venue `{}` must cost more than 0 when priced", venue.id),
            ));
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
