// WieBetaaltWat client implementing the core's LedgerGateway.
//
// The API is session based: signing in sets a cookie that the reqwest cookie
// store replays on later requests. Expenses carry their idempotency key in
// the name (`Dinner: Pizza [lunchbot-poll_...]`) so a retried settlement can
// find the expense an earlier attempt created.

use async_trait::async_trait;
use chrono::Utc;
use lunchbot_core::config::Config;
use lunchbot_core::gateway::{LedgerError, LedgerGateway};
use lunchbot_core::model::{MemberBalance, Split};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const API_VERSION_HEADER: &str = "Accept-Version";
const API_VERSION: &str = "6";

/// Expenses scanned when looking up an idempotency key.
const EXPENSE_PAGE_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Balance,
}

#[derive(Debug, Deserialize)]
struct Balance {
    member_totals: Vec<MemberTotalEntry>,
}

#[derive(Debug, Deserialize)]
struct MemberTotalEntry {
    member_total: MemberTotal,
}

#[derive(Debug, Deserialize)]
struct MemberTotal {
    member: Member,
    balance_total: Amount,
}

#[derive(Debug, Deserialize)]
struct Member {
    id: String,
    #[serde(default)]
    nickname: String,
}

#[derive(Debug, Deserialize)]
struct Amount {
    fractional: i64,
}

#[derive(Debug, Deserialize)]
struct ExpenseList {
    #[serde(default)]
    data: Vec<ExpenseEntry>,
}

#[derive(Debug, Deserialize)]
struct ExpenseEntry {
    expense: Expense,
}

#[derive(Debug, Deserialize)]
struct Expense {
    id: String,
    #[serde(default)]
    name: String,
}

// ---------------------------------------------------------------------------
// WbwClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct WbwSettings {
    pub base_url: String,
    pub list_id: String,
    pub email: String,
    pub password: String,
    pub currency: String,
}

pub struct WbwClient {
    http: reqwest::Client,
    settings: WbwSettings,
    signed_in: Mutex<bool>,
}

/// Tag appended to expense names; also the search key for lookups.
fn key_tag(idempotency_key: &str) -> String {
    format!("[{idempotency_key}]")
}

/// Map an unsuccessful HTTP status to the ledger error taxonomy: throttling
/// and server trouble are transient, everything else is permanent.
fn status_error(status: StatusCode, context: &str) -> LedgerError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        LedgerError::Unavailable(format!("{context}: HTTP {status}"))
    } else {
        LedgerError::Rejected(format!("{context}: HTTP {status}"))
    }
}

fn transport_error(e: reqwest::Error, context: &str) -> LedgerError {
    LedgerError::Unavailable(format!("{context}: {e}"))
}

impl WbwClient {
    pub fn new(settings: WbwSettings) -> Result<Self, LedgerError> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .build()
            .map_err(|e| LedgerError::Rejected(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            settings,
            signed_in: Mutex::new(false),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn sign_in(&self) -> Result<(), LedgerError> {
        let response = self
            .http
            .post(self.url("/api/users/sign_in"))
            .header(API_VERSION_HEADER, API_VERSION)
            .json(&json!({
                "user": {
                    "email": self.settings.email,
                    "password": self.settings.password,
                }
            }))
            .send()
            .await
            .map_err(|e| transport_error(e, "sign in"))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(LedgerError::Rejected("sign in: invalid credentials".into()));
        }
        if !status.is_success() {
            return Err(status_error(status, "sign in"));
        }
        debug!("signed in to WieBetaaltWat");
        Ok(())
    }

    /// Send a request built by `build`, signing in first if needed and once
    /// more if the session turns out to have expired.
    async fn send<F>(&self, context: &str, build: F) -> Result<Response, LedgerError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut signed_in = self.signed_in.lock().await;
        if !*signed_in {
            self.sign_in().await?;
            *signed_in = true;
        }

        let response = build()
            .header(API_VERSION_HEADER, API_VERSION)
            .send()
            .await
            .map_err(|e| transport_error(e, context))?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check(response, context);
        }

        warn!(context, "ledger session expired, signing in again");
        *signed_in = false;
        self.sign_in().await?;
        *signed_in = true;
        let response = build()
            .header(API_VERSION_HEADER, API_VERSION)
            .send()
            .await
            .map_err(|e| transport_error(e, context))?;
        check(response, context)
    }

    async fn expenses(&self) -> Result<Vec<Expense>, LedgerError> {
        let url = self.url(&format!("/api/lists/{}/expenses", self.settings.list_id));
        let response = self
            .send("list expenses", || {
                self.http
                    .get(&url)
                    .query(&[("per_page", EXPENSE_PAGE_SIZE)])
            })
            .await?;
        let list: ExpenseList = response
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("list expenses: invalid JSON: {e}")))?;
        Ok(list.data.into_iter().map(|e| e.expense).collect())
    }
}

fn check(response: Response, context: &str) -> Result<Response, LedgerError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(status_error(status, context))
    }
}

#[async_trait]
impl LedgerGateway for WbwClient {
    async fn create_expense_split(
        &self,
        idempotency_key: &str,
        description: &str,
        payer: &str,
        splits: &[Split],
    ) -> Result<String, LedgerError> {
        let currency = &self.settings.currency;
        let total: u64 = splits.iter().map(|s| s.amount_cents).sum();
        let shares: Vec<_> = splits
            .iter()
            .map(|s| {
                json!({
                    "member_id": s.participant,
                    "source_amount": { "fractional": s.amount_cents, "currency": currency },
                })
            })
            .collect();
        let body = json!({
            "expense": {
                "name": format!("{description} {}", key_tag(idempotency_key)),
                "payed_by_id": payer,
                "payed_on": Utc::now().format("%Y-%m-%d").to_string(),
                "source_amount": { "fractional": total, "currency": currency },
                "shares_attributes": shares,
            }
        });

        let url = self.url(&format!("/api/lists/{}/expenses", self.settings.list_id));
        let response = self
            .send("create expense", || self.http.post(&url).json(&body))
            .await?;
        let created: ExpenseEntry = response
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("create expense: invalid JSON: {e}")))?;

        info!(expense = %created.expense.id, idempotency_key, total, "expense created");
        Ok(created.expense.id)
    }

    async fn lookup_by_idempotency_key(&self, key: &str) -> Result<Option<String>, LedgerError> {
        let tag = key_tag(key);
        Ok(self
            .expenses()
            .await?
            .into_iter()
            .find(|e| e.name.contains(&tag))
            .map(|e| e.id))
    }

    async fn balances(&self) -> Result<Vec<MemberBalance>, LedgerError> {
        let url = self.url(&format!("/api/lists/{}/balance", self.settings.list_id));
        let response = self.send("balance", || self.http.get(&url)).await?;
        let parsed: BalanceResponse = response
            .json()
            .await
            .map_err(|e| LedgerError::Unavailable(format!("balance: invalid JSON: {e}")))?;

        Ok(parsed
            .balance
            .member_totals
            .into_iter()
            .map(|entry| MemberBalance {
                member_id: entry.member_total.member.id,
                nickname: entry.member_total.member.nickname,
                balance_cents: entry.member_total.balance_total.fractional,
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// LedgerClient
// ---------------------------------------------------------------------------

/// The ledger the bot settles with: WieBetaaltWat, or nothing when no list
/// and credentials are configured.
pub enum LedgerClient {
    Active(WbwClient),
    /// Runs still poll and announce, but nothing is settled.
    Disabled,
}

impl LedgerClient {
    /// Returns `Active` when a list id, email and password are all present,
    /// otherwise `Disabled`.
    pub fn from_config(config: &Config) -> Result<Self, LedgerError> {
        let creds = &config.credentials;
        match (
            config.ledger.list_id.as_deref(),
            creds.ledger_email.as_deref(),
            creds.ledger_password.as_deref(),
        ) {
            (Some(list), Some(email), Some(password))
                if !list.is_empty() && !email.is_empty() && !password.is_empty() =>
            {
                let client = WbwClient::new(WbwSettings {
                    base_url: config.ledger.base_url.clone(),
                    list_id: list.to_string(),
                    email: email.to_string(),
                    password: password.to_string(),
                    currency: config.settlement.currency.clone(),
                })?;
                Ok(LedgerClient::Active(client))
            }
            _ => Ok(LedgerClient::Disabled),
        }
    }

    fn disabled() -> LedgerError {
        LedgerError::Rejected("ledger not configured".into())
    }
}

#[async_trait]
impl LedgerGateway for LedgerClient {
    async fn create_expense_split(
        &self,
        idempotency_key: &str,
        description: &str,
        payer: &str,
        splits: &[Split],
    ) -> Result<String, LedgerError> {
        match self {
            LedgerClient::Active(client) => {
                client
                    .create_expense_split(idempotency_key, description, payer, splits)
                    .await
            }
            LedgerClient::Disabled => Err(Self::disabled()),
        }
    }

    async fn lookup_by_idempotency_key(&self, key: &str) -> Result<Option<String>, LedgerError> {
        match self {
            LedgerClient::Active(client) => client.lookup_by_idempotency_key(key).await,
            LedgerClient::Disabled => Err(Self::disabled()),
        }
    }

    async fn balances(&self) -> Result<Vec<MemberBalance>, LedgerError> {
        match self {
            LedgerClient::Active(client) => client.balances().await,
            LedgerClient::Disabled => Err(Self::disabled()),
        }
    }

    fn is_enabled(&self) -> bool {
        matches!(self, LedgerClient::Active(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const LIST: &str = "list-1";

    fn client(server: &MockServer) -> WbwClient {
        WbwClient::new(WbwSettings {
            base_url: server.base_url(),
            list_id: LIST.into(),
            email: "bot@example.nl".into(),
            password: "hunter2".into(),
            currency: "EUR".into(),
        })
        .unwrap()
    }

    async fn mock_sign_in(server: &MockServer) -> httpmock::Mock<'_> {
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/users/sign_in")
                    .header("Accept-Version", "6")
                    .json_body(json!({
                        "user": {"email": "bot@example.nl", "password": "hunter2"}
                    }));
                then.status(201)
                    .header("Set-Cookie", "_wbw_session=abc; Path=/")
                    .json_body(json!({"user": {"id": "me"}}));
            })
            .await
    }

    #[tokio::test]
    async fn balances_parse_member_totals() {
        let server = MockServer::start_async().await;
        let sign_in = mock_sign_in(&server).await;
        let balance = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(format!("/api/lists/{LIST}/balance"))
                    .header("Accept-Version", "6");
                then.status(200).json_body(json!({
                    "balance": {
                        "member_totals": [
                            {"member_total": {
                                "member": {"id": "m-1", "nickname": "Alice"},
                                "balance_total": {"fractional": -1250, "currency": "EUR"}
                            }},
                            {"member_total": {
                                "member": {"id": "m-2", "nickname": "Bob"},
                                "balance_total": {"fractional": 800, "currency": "EUR"}
                            }}
                        ]
                    }
                }));
            })
            .await;

        let balances = client(&server).balances().await.unwrap();

        sign_in.assert_async().await;
        balance.assert_async().await;
        assert_eq!(
            balances,
            vec![
                MemberBalance {
                    member_id: "m-1".into(),
                    nickname: "Alice".into(),
                    balance_cents: -1250,
                },
                MemberBalance {
                    member_id: "m-2".into(),
                    nickname: "Bob".into(),
                    balance_cents: 800,
                },
            ]
        );
    }

    #[tokio::test]
    async fn signs_in_only_once() {
        let server = MockServer::start_async().await;
        let sign_in = mock_sign_in(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/api/lists/{LIST}/balance"));
                then.status(200)
                    .json_body(json!({"balance": {"member_totals": []}}));
            })
            .await;

        let wbw = client(&server);
        wbw.balances().await.unwrap();
        wbw.balances().await.unwrap();
        assert_eq!(sign_in.hits_async().await, 1);
    }

    #[tokio::test]
    async fn bad_credentials_are_rejected() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/users/sign_in");
                then.status(401);
            })
            .await;

        let err = client(&server).balances().await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[tokio::test]
    async fn create_expense_tags_name_with_key() {
        let server = MockServer::start_async().await;
        mock_sign_in(&server).await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(format!("/api/lists/{LIST}/expenses"))
                    .body_contains("[lunchbot-poll_1]")
                    .body_contains("\"payed_by_id\":\"m-1\"");
                then.status(201)
                    .json_body(json!({"expense": {"id": "exp-42", "name": "x"}}));
            })
            .await;

        let splits = vec![
            Split {
                participant: "m-1".into(),
                amount_cents: 501,
            },
            Split {
                participant: "m-2".into(),
                amount_cents: 500,
            },
        ];
        let id = client(&server)
            .create_expense_split("lunchbot-poll_1", "Dinner: Pizza", "m-1", &splits)
            .await
            .unwrap();

        create.assert_async().await;
        assert_eq!(id, "exp-42");
    }

    #[tokio::test]
    async fn lookup_finds_expense_by_tag() {
        let server = MockServer::start_async().await;
        mock_sign_in(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(format!("/api/lists/{LIST}/expenses"))
                    .query_param("per_page", "100");
                then.status(200).json_body(json!({
                    "data": [
                        {"expense": {"id": "exp-1", "name": "Groceries"}},
                        {"expense": {"id": "exp-2", "name": "Dinner: Wok [lunchbot-poll_9]"}}
                    ]
                }));
            })
            .await;

        let wbw = client(&server);
        assert_eq!(
            wbw.lookup_by_idempotency_key("lunchbot-poll_9").await.unwrap(),
            Some("exp-2".to_string())
        );
        assert_eq!(wbw.lookup_by_idempotency_key("lunchbot-poll_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn server_errors_are_unavailable_and_client_errors_rejected() {
        let server = MockServer::start_async().await;
        mock_sign_in(&server).await;
        server
            .mock_async(|when, then| {
                when.method(GET).path(format!("/api/lists/{LIST}/balance"));
                then.status(503);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(format!("/api/lists/{LIST}/expenses"));
                then.status(422)
                    .json_body(json!({"errors": ["member not in list"]}));
            })
            .await;

        let wbw = client(&server);
        assert!(matches!(
            wbw.balances().await.unwrap_err(),
            LedgerError::Unavailable(_)
        ));
        assert!(matches!(
            wbw.create_expense_split("k", "d", "m-1", &[]).await.unwrap_err(),
            LedgerError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_ledger_is_unavailable() {
        let wbw = WbwClient::new(WbwSettings {
            base_url: "http://127.0.0.1:1".into(),
            list_id: LIST.into(),
            email: "a".into(),
            password: "b".into(),
            currency: "EUR".into(),
        })
        .unwrap();
        assert!(matches!(
            wbw.balances().await.unwrap_err(),
            LedgerError::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn disabled_client_refuses_everything() {
        let ledger = LedgerClient::Disabled;
        assert!(!ledger.is_enabled());
        assert!(matches!(
            ledger.balances().await.unwrap_err(),
            LedgerError::Rejected(_)
        ));
        assert!(ledger.lookup_by_idempotency_key("k").await.is_err());
    }
}
