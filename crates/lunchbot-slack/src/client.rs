// Slack Web API client implementing the core's ChatGateway.
//
// Every call is a form-encoded POST with a bot token. Rate-limited calls are
// retried with a linearly growing pause. Reaction subscriptions poll
// `reactions.get` on an interval from a background task and forward vote
// changes over an mpsc channel until the receiver is dropped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lunchbot_core::config::{Config, ReactionConfig};
use lunchbot_core::gateway::{ChatError, ChatGateway, PostedMessage};
use lunchbot_core::model::{ParticipantId, ReactionEvent, Vote};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, warn};

use crate::reactions::{diff, votes_from_reactions, ReactionSummary};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Attempts per API call while Slack answers `ratelimited`.
const MAX_API_RETRIES: u32 = 5;

/// Consecutive failed `reactions.get` polls before a subscription is lost.
const MAX_POLL_FAILURES: u32 = 5;

const REACTION_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// SlackClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SlackSettings {
    pub base_url: String,
    pub token: String,
    pub poll_interval: Duration,
    /// Pause before retry n (0-based) is `(n + 1) * ratelimit_backoff`.
    pub ratelimit_backoff: Duration,
    pub reactions: ReactionConfig,
}

impl SlackSettings {
    pub fn from_config(config: &Config, token: String) -> Self {
        Self {
            base_url: config.slack.base_url.clone(),
            token,
            poll_interval: Duration::from_secs(config.poll.poll_interval_secs),
            ratelimit_backoff: Duration::from_secs(2),
            reactions: config.poll.reactions.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SlackClient {
    http: reqwest::Client,
    settings: Arc<SlackSettings>,
    /// The bot's own user id, learned once from `auth.test`.
    bot_user: Arc<OnceCell<String>>,
}

impl SlackClient {
    pub fn new(settings: SlackSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings: Arc::new(settings),
            bot_user: Arc::new(OnceCell::new()),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), method)
    }

    /// Call a Web API method and return the JSON body of an `ok` response.
    async fn call(&self, method: &str, params: &[(&str, &str)]) -> Result<Value, ChatError> {
        for attempt in 0..MAX_API_RETRIES {
            let response = self
                .http
                .post(self.url(method))
                .bearer_auth(&self.settings.token)
                .form(params)
                .send()
                .await
                .map_err(|e| ChatError::Transport(format!("{method}: {e}")))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                self.backoff(method, attempt).await;
                continue;
            }
            if !status.is_success() {
                return Err(ChatError::Transport(format!("{method}: HTTP {status}")));
            }

            let body: Value = response
                .json()
                .await
                .map_err(|e| ChatError::Transport(format!("{method}: invalid JSON: {e}")))?;

            if body.get("ok").and_then(Value::as_bool) == Some(true) {
                return Ok(body);
            }
            let error = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            if error == "ratelimited" {
                self.backoff(method, attempt).await;
                continue;
            }
            return Err(ChatError::Api(error.to_string()));
        }
        Err(ChatError::RateLimited {
            attempts: MAX_API_RETRIES,
        })
    }

    async fn backoff(&self, method: &str, attempt: u32) {
        let delay = self.settings.ratelimit_backoff * (attempt + 1);
        debug!(method, attempt, ?delay, "rate limited by Slack");
        tokio::time::sleep(delay).await;
    }

    /// The bot's own user id, used to ignore its prompt reactions.
    pub async fn bot_user_id(&self) -> Result<&str, ChatError> {
        let id = self
            .bot_user
            .get_or_try_init(|| async {
                let body = self.call("auth.test", &[]).await?;
                body.get("user_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ChatError::MalformedResponse("user_id".into()))
            })
            .await?;
        Ok(id.as_str())
    }

    /// Current vote of every participant on `message`.
    pub async fn fetch_votes(
        &self,
        message: &PostedMessage,
        bot_user: Option<&str>,
    ) -> Result<BTreeMap<ParticipantId, Vote>, ChatError> {
        let body = self
            .call(
                "reactions.get",
                &[
                    ("channel", message.channel.as_str()),
                    ("timestamp", message.message_id.as_str()),
                    ("full", "true"),
                ],
            )
            .await?;

        let reactions: Vec<ReactionSummary> = match body.pointer("/message/reactions") {
            Some(list) => serde_json::from_value(list.clone())
                .map_err(|_| ChatError::MalformedResponse("message.reactions".into()))?,
            None => Vec::new(),
        };
        Ok(votes_from_reactions(
            &reactions,
            &self.settings.reactions,
            bot_user,
        ))
    }

    /// Poll `message` until the receiver side of `tx` is dropped or polling
    /// keeps failing.
    async fn poll_reactions(
        self,
        message: PostedMessage,
        bot_user: String,
        tx: mpsc::Sender<ReactionEvent>,
    ) {
        let mut known: BTreeMap<ParticipantId, Vote> = BTreeMap::new();
        let mut failures = 0;
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!(ts = %message.message_id, "reaction subscription closed");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.fetch_votes(&message, Some(&bot_user)).await {
                Ok(votes) => {
                    failures = 0;
                    for event in diff(&known, &votes) {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    known = votes;
                }
                Err(e) => {
                    failures += 1;
                    warn!(failures, ts = %message.message_id, "reactions.get failed: {e}");
                    if failures >= MAX_POLL_FAILURES {
                        let _ = tx
                            .send(ReactionEvent::Lost {
                                message: format!(
                                    "reactions.get failed {failures} times in a row: {e}"
                                ),
                            })
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ChatGateway for SlackClient {
    async fn post_message(&self, channel: &str, text: &str) -> Result<PostedMessage, ChatError> {
        let body = self
            .call("chat.postMessage", &[("channel", channel), ("text", text)])
            .await?;
        let message_id = body
            .get("ts")
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::MalformedResponse("ts".into()))?;
        // Slack answers with the channel id, which later calls need.
        let channel = body
            .get("channel")
            .and_then(Value::as_str)
            .unwrap_or(channel);
        Ok(PostedMessage {
            channel: channel.to_string(),
            message_id: message_id.to_string(),
        })
    }

    async fn add_reaction(&self, message: &PostedMessage, name: &str) -> Result<(), ChatError> {
        let result = self
            .call(
                "reactions.add",
                &[
                    ("channel", message.channel.as_str()),
                    ("timestamp", message.message_id.as_str()),
                    ("name", name),
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(ChatError::Api(e)) if e == "already_reacted" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn subscribe_reactions(
        &self,
        message: &PostedMessage,
    ) -> Result<mpsc::Receiver<ReactionEvent>, ChatError> {
        let bot_user = self.bot_user_id().await?.to_string();
        let (tx, rx) = mpsc::channel(REACTION_CHANNEL_CAPACITY);
        tokio::spawn(self.clone().poll_reactions(message.clone(), bot_user, tx));
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn settings(base_url: String) -> SlackSettings {
        SlackSettings {
            base_url,
            token: "xoxb-test".into(),
            poll_interval: Duration::from_millis(10),
            ratelimit_backoff: Duration::from_millis(1),
            reactions: ReactionConfig {
                join: vec!["bee".into()],
                decline: vec!["house".into()],
                veto: vec!["bomb".into()],
            },
        }
    }

    fn message() -> PostedMessage {
        PostedMessage {
            channel: "C123".into(),
            message_id: "1700000000.000100".into(),
        }
    }

    #[tokio::test]
    async fn post_message_returns_channel_id_and_ts() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/chat.postMessage")
                    .header("authorization", "Bearer xoxb-test")
                    .x_www_form_urlencoded_tuple("channel", "#dinner")
                    .x_www_form_urlencoded_tuple("text", "hello");
                then.status(200)
                    .json_body(json!({"ok": true, "channel": "C123", "ts": "1700.01"}));
            })
            .await;

        let client = SlackClient::new(settings(server.url("/")));
        let posted = client.post_message("#dinner", "hello").await.unwrap();

        mock.assert_async().await;
        assert_eq!(posted.channel, "C123");
        assert_eq!(posted.message_id, "1700.01");
    }

    #[tokio::test]
    async fn api_error_is_surfaced() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat.postMessage");
                then.status(200)
                    .json_body(json!({"ok": false, "error": "channel_not_found"}));
            })
            .await;

        let client = SlackClient::new(settings(server.url("/")));
        let err = client.post_message("#nope", "hi").await.unwrap_err();
        assert_eq!(err, ChatError::Api("channel_not_found".into()));
    }

    #[tokio::test]
    async fn ratelimited_calls_are_retried_then_give_up() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/reactions.add");
                then.status(200)
                    .json_body(json!({"ok": false, "error": "ratelimited"}));
            })
            .await;

        let client = SlackClient::new(settings(server.url("/")));
        let err = client.add_reaction(&message(), "bee").await.unwrap_err();

        assert_eq!(err, ChatError::RateLimited { attempts: 5 });
        assert_eq!(mock.hits_async().await, 5);
    }

    #[tokio::test]
    async fn already_reacted_is_not_an_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/reactions.add");
                then.status(200)
                    .json_body(json!({"ok": false, "error": "already_reacted"}));
            })
            .await;

        let client = SlackClient::new(settings(server.url("/")));
        assert!(client.add_reaction(&message(), "bee").await.is_ok());
    }

    #[tokio::test]
    async fn server_errors_are_transport_failures() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat.postMessage");
                then.status(502);
            })
            .await;

        let client = SlackClient::new(settings(server.url("/")));
        let err = client.post_message("#dinner", "hi").await.unwrap_err();
        assert!(matches!(err, ChatError::Transport(_)));
    }

    #[tokio::test]
    async fn subscription_emits_votes_without_bot_reactions() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/auth.test");
                then.status(200)
                    .json_body(json!({"ok": true, "user_id": "UBOT"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/reactions.get")
                    .x_www_form_urlencoded_tuple("timestamp", "1700000000.000100");
                then.status(200).json_body(json!({
                    "ok": true,
                    "type": "message",
                    "message": {
                        "reactions": [
                            {"name": "bee", "users": ["UBOT", "U1", "U2"], "count": 3},
                            {"name": "house", "users": ["UBOT", "U2", "U3"], "count": 3}
                        ]
                    }
                }));
            })
            .await;

        let client = SlackClient::new(settings(server.url("/")));
        let mut rx = client.subscribe_reactions(&message()).await.unwrap();

        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(rx.recv().await.unwrap());
        }
        assert_eq!(
            events,
            vec![
                ReactionEvent::Cast {
                    participant: "U1".into(),
                    vote: Vote::Join
                },
                ReactionEvent::Cast {
                    participant: "U2".into(),
                    vote: Vote::Decline
                },
                ReactionEvent::Cast {
                    participant: "U3".into(),
                    vote: Vote::Decline
                },
            ]
        );

        // Unchanged reactions produce no further events.
        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn subscription_is_lost_after_repeated_failures() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/auth.test");
                then.status(200)
                    .json_body(json!({"ok": true, "user_id": "UBOT"}));
            })
            .await;
        let failing = server
            .mock_async(|when, then| {
                when.method(POST).path("/reactions.get");
                then.status(500);
            })
            .await;

        let client = SlackClient::new(settings(server.url("/")));
        let mut rx = client.subscribe_reactions(&message()).await.unwrap();

        match rx.recv().await {
            Some(ReactionEvent::Lost { message }) => assert!(message.contains("5 times")),
            other => panic!("expected Lost, got {other:?}"),
        }
        assert!(rx.recv().await.is_none());
        assert_eq!(failing.hits_async().await, 5);
    }

    #[tokio::test]
    async fn bot_user_id_is_cached() {
        let server = MockServer::start_async().await;
        let auth = server
            .mock_async(|when, then| {
                when.method(POST).path("/auth.test");
                then.status(200)
                    .json_body(json!({"ok": true, "user_id": "UBOT"}));
            })
            .await;

        let client = SlackClient::new(settings(server.url("/")));
        assert_eq!(client.bot_user_id().await.unwrap(), "UBOT");
        assert_eq!(client.bot_user_id().await.unwrap(), "UBOT");
        assert_eq!(auth.hits_async().await, 1);
    }
}
