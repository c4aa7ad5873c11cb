//! Slack Web API connector.
//!
//! Slack answers `200 OK` for most failures and reports them as
//! `{"ok": false, "error": "..."}`; [`SlackConnector::call`] folds that into
//! `HttpError::Api` so callers see one error path.
//!
//! The duplicate-post guard only counts messages posted by this token's own
//! identity, resolved once through `auth.test`.

use super::detected;
use super::http::{build_client, send_json, str_field, HttpError, HttpResult};
use crate::connector::{parse_args, unknown_action, Allowlist, Connector};
use crate::error::{EnactError, Result};
use crate::models::{fields, ActionResult};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::OnceLock;

pub const SYSTEM: &str = "slack";

pub const DEFAULT_BASE_URL: &str = "https://slack.com/api";

pub const DEFAULT_ACTIONS: &[&str] = &["post_message"];

pub const ACTIONS: &[&str] = &["post_message", "delete_message"];

/// How far back `post_message` looks for an identical bot message.
const HISTORY_WINDOW: &str = "20";

/// Who this token posts as.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Identity {
    user_id: String,
    bot_id: Option<String>,
}

impl Identity {
    fn authored(&self, message: &Value) -> bool {
        match &self.bot_id {
            Some(own) => message.get("bot_id").and_then(Value::as_str) == Some(own.as_str()),
            None => message.get("user").and_then(Value::as_str) == Some(self.user_id.as_str()),
        }
    }
}

pub struct SlackConnector {
    client: Client,
    base_url: String,
    token: String,
    identity: OnceLock<Identity>,
    allowlist: Allowlist,
}

impl SlackConnector {
    pub fn new(token: impl Into<String>, allowed_actions: Option<Vec<String>>) -> Result<Self> {
        let client = build_client().map_err(|e| EnactError::ConnectorSetup {
            system: SYSTEM.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            token: token.into(),
            identity: OnceLock::new(),
            allowlist: Allowlist::or_defaults(allowed_actions, DEFAULT_ACTIONS),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Post `text` to `channel`. A user ID is accepted as the channel; Slack
    /// opens the DM and reports the resolved conversation ID, which is what
    /// gets recorded for rollback.
    pub fn post_message(&self, channel: &str, text: &str) -> Result<ActionResult> {
        const ACTION: &str = "post_message";
        self.check_allowed(ACTION)?;
        let run = || -> HttpResult<ActionResult> {
            if let Some((conversation, ts)) = detected(SYSTEM, ACTION, self.own_recent_message(channel, text)) {
                return Ok(ActionResult::already(
                    SYSTEM,
                    ACTION,
                    "posted",
                    fields(json!({"channel": conversation, "ts": ts})),
                ));
            }
            let response = self.call("chat.postMessage", json!({"channel": channel, "text": text}))?;
            let resolved = str_field(&response, "/channel")?.to_string();
            let ts = str_field(&response, "/ts")?.to_string();
            if resolved != channel {
                tracing::debug!(requested = channel, resolved = %resolved, "slack resolved channel");
            }
            Ok(ActionResult::mutated(
                SYSTEM,
                ACTION,
                fields(json!({"channel": resolved, "ts": ts})),
                fields(json!({"channel": resolved, "ts": ts})),
            ))
        };
        Ok(run().unwrap_or_else(|e| ActionResult::failure(SYSTEM, ACTION, e)))
    }

    fn identity(&self) -> HttpResult<&Identity> {
        if let Some(identity) = self.identity.get() {
            return Ok(identity);
        }
        let auth = self.call("auth.test", json!({}))?;
        let identity = Identity {
            user_id: str_field(&auth, "/user_id")?.to_string(),
            bot_id: auth.get("bot_id").and_then(Value::as_str).map(str::to_string),
        };
        tracing::debug!(user_id = %identity.user_id, bot_id = ?identity.bot_id, "slack identity resolved");
        Ok(self.identity.get_or_init(|| identity))
    }

    /// `(conversation, ts)` of a recent message with this exact text posted
    /// by this connector's own identity.
    fn own_recent_message(&self, channel: &str, text: &str) -> HttpResult<Option<(String, String)>> {
        let identity = self.identity()?;
        let history = self.call_get(
            "conversations.history",
            &[("channel", channel), ("limit", HISTORY_WINDOW)],
        )?;
        let found = history
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| {
                messages
                    .iter()
                    .find(|m| identity.authored(m) && m.get("text").and_then(Value::as_str) == Some(text))
            })
            .and_then(|m| {
                let ts = m.get("ts").and_then(Value::as_str)?;
                let conversation = m
                    .get("channel")
                    .or_else(|| history.get("channel"))
                    .and_then(Value::as_str)
                    .unwrap_or(channel);
                Some((conversation.to_string(), ts.to_string()))
            });
        Ok(found)
    }

    pub fn delete_message(&self, channel: &str, ts: &str) -> Result<ActionResult> {
        const ACTION: &str = "delete_message";
        self.check_allowed(ACTION)?;
        let output = fields(json!({"channel": channel, "ts": ts}));
        let result = match self.call("chat.delete", json!({"channel": channel, "ts": ts})) {
            Ok(_) => ActionResult::mutated(SYSTEM, ACTION, output, Map::new()),
            Err(HttpError::Api(code)) if code == "message_not_found" => {
                ActionResult::already(SYSTEM, ACTION, "deleted", output)
            }
            Err(e) => ActionResult::failure(SYSTEM, ACTION, e),
        };
        Ok(result)
    }

    fn call(&self, method: &str, body: Value) -> HttpResult<Value> {
        let request = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .json(&body);
        check_ok(send_json(request)?)
    }

    fn call_get(&self, method: &str, query: &[(&str, &str)]) -> HttpResult<Value> {
        let request = self
            .client
            .get(format!("{}/{}", self.base_url, method))
            .bearer_auth(&self.token)
            .query(query);
        check_ok(send_json(request)?)
    }
}

fn check_ok(body: Value) -> HttpResult<Value> {
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        Ok(body)
    } else {
        let code = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        Err(HttpError::Api(code))
    }
}

#[derive(Deserialize)]
struct PostArgs {
    channel: String,
    text: String,
}

#[derive(Deserialize)]
struct DeleteArgs {
    channel: String,
    ts: String,
}

impl Connector for SlackConnector {
    fn system(&self) -> &'static str {
        SYSTEM
    }

    fn allowlist(&self) -> &Allowlist {
        &self.allowlist
    }

    fn invoke(&self, action: &str, args: &Value) -> Result<ActionResult> {
        self.check_allowed(action)?;
        match action {
            "post_message" => {
                let a: PostArgs = parse_args(SYSTEM, action, args)?;
                self.post_message(&a.channel, &a.text)
            }
            "delete_message" => {
                let a: DeleteArgs = parse_args(SYSTEM, action, args)?;
                self.delete_message(&a.channel, &a.ts)
            }
            other => Err(unknown_action(SYSTEM, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ALREADY_DONE, NOT_DONE};
    use mockito::{Matcher, Server};

    fn connector(server: &Server, actions: &[&str]) -> SlackConnector {
        SlackConnector::new("xoxb-test", Some(actions.iter().map(|a| a.to_string()).collect()))
            .unwrap()
            .with_base_url(server.url())
    }

    fn auth(server: &mut Server, bot_id: &str) -> mockito::Mock {
        server
            .mock("POST", "/auth.test")
            .with_body(json!({"ok": true, "user_id": "U_ENACT", "bot_id": bot_id}).to_string())
    }

    fn empty_history(server: &mut Server) -> mockito::Mock {
        server
            .mock("GET", "/conversations.history")
            .match_query(Matcher::Any)
            .with_body(json!({"ok": true, "messages": []}).to_string())
            .create()
    }

    #[test]
    fn post_records_resolved_channel() {
        let mut server = Server::new();
        let _history = server
            .mock("GET", "/conversations.history")
            .match_query(Matcher::Any)
            .with_body(json!({"ok": false, "error": "channel_not_found"}).to_string())
            .create();
        let post = server
            .mock("POST", "/chat.postMessage")
            .match_header("authorization", "Bearer xoxb-test")
            .match_body(Matcher::PartialJson(json!({"channel": "U123", "text": "hi"})))
            .with_body(json!({"ok": true, "channel": "D456", "ts": "1700000000.000100"}).to_string())
            .expect(1)
            .create();

        let slack = connector(&server, &["post_message", "delete_message"]);
        let result = slack.post_message("U123", "hi").unwrap();
        assert!(result.success);
        assert_eq!(result.output[ALREADY_DONE], NOT_DONE);
        assert_eq!(result.rollback_data["channel"], "D456");
        assert_eq!(result.rollback_data["ts"], "1700000000.000100");
        post.assert();

        let delete = server
            .mock("POST", "/chat.delete")
            .match_body(Matcher::PartialJson(json!({"channel": "D456", "ts": "1700000000.000100"})))
            .with_body(json!({"ok": true}).to_string())
            .expect(1)
            .create();
        let undone = slack
            .invoke("delete_message", &Value::Object(result.rollback_data.clone()))
            .unwrap();
        assert!(undone.success);
        delete.assert();
    }

    #[test]
    fn identical_bot_message_is_already_posted() {
        let mut server = Server::new();
        let _auth = auth(&mut server, "B1").create();
        let _history = server
            .mock("GET", "/conversations.history")
            .match_query(Matcher::UrlEncoded("channel".into(), "C1".into()))
            .with_body(
                json!({"ok": true, "messages": [
                    {"text": "deploy done", "ts": "1.0"},
                    {"text": "deploy done", "ts": "2.0", "bot_id": "B1", "channel": "C1"},
                ]})
                .to_string(),
            )
            .create();
        let post = server.mock("POST", "/chat.postMessage").expect(0).create();

        let result = connector(&server, &["post_message"]).post_message("C1", "deploy done").unwrap();
        assert_eq!(result.already_done(), Some("posted"));
        assert_eq!(result.output["ts"], "2.0");
        assert_eq!(result.output["channel"], "C1");
        assert!(result.rollback_data.is_empty());
        post.assert();
    }

    #[test]
    fn another_integrations_message_does_not_count() {
        let mut server = Server::new();
        let auth = auth(&mut server, "B_ENACT").expect(1).create();
        let _history = server
            .mock("GET", "/conversations.history")
            .match_query(Matcher::Any)
            .with_body(
                json!({"ok": true, "messages": [
                    {"text": "deploy done", "ts": "9.0", "bot_id": "B_OTHER_INTEGRATION"},
                ]})
                .to_string(),
            )
            .create();
        let post = server
            .mock("POST", "/chat.postMessage")
            .with_body(json!({"ok": true, "channel": "C1", "ts": "10.0"}).to_string())
            .expect(2)
            .create();

        let slack = connector(&server, &["post_message"]);
        for _ in 0..2 {
            let result = slack.post_message("C1", "deploy done").unwrap();
            assert!(!result.is_already_done());
            assert_eq!(result.rollback_data["ts"], "10.0");
        }
        post.assert();
        // the identity is looked up once per connector
        auth.assert();
    }

    #[test]
    fn user_token_matches_on_user_id() {
        let identity = Identity {
            user_id: "U_ENACT".into(),
            bot_id: None,
        };
        assert!(identity.authored(&json!({"user": "U_ENACT"})));
        assert!(!identity.authored(&json!({"user": "U_OTHER"})));
        assert!(!identity.authored(&json!({"bot_id": "B9"})));
    }

    #[test]
    fn human_message_with_same_text_does_not_count() {
        let mut server = Server::new();
        let _auth = auth(&mut server, "B1").create();
        let _history = server
            .mock("GET", "/conversations.history")
            .match_query(Matcher::Any)
            .with_body(json!({"ok": true, "messages": [{"text": "hi", "ts": "1.0"}]}).to_string())
            .create();
        let post = server
            .mock("POST", "/chat.postMessage")
            .with_body(json!({"ok": true, "channel": "C1", "ts": "3.0"}).to_string())
            .expect(1)
            .create();

        let result = connector(&server, &["post_message"]).post_message("C1", "hi").unwrap();
        assert!(!result.is_already_done());
        post.assert();
    }

    #[test]
    fn api_error_is_a_failure_result() {
        let mut server = Server::new();
        let _auth = auth(&mut server, "B1").create();
        let _history = empty_history(&mut server);
        let _post = server
            .mock("POST", "/chat.postMessage")
            .with_body(json!({"ok": false, "error": "not_in_channel"}).to_string())
            .create();

        let result = connector(&server, &["post_message"]).post_message("C1", "hi").unwrap();
        assert!(!result.success);
        assert_eq!(result.error(), Some("not_in_channel"));
    }

    #[test]
    fn deleting_missing_message_is_already_deleted() {
        let mut server = Server::new();
        let _delete = server
            .mock("POST", "/chat.delete")
            .with_body(json!({"ok": false, "error": "message_not_found"}).to_string())
            .create();

        let result = connector(&server, &["delete_message"]).delete_message("C1", "1.0").unwrap();
        assert!(result.success);
        assert_eq!(result.already_done(), Some("deleted"));
    }

    #[test]
    fn delete_is_not_allowed_by_default() {
        let slack = SlackConnector::new("t", None).unwrap();
        assert!(slack.delete_message("C1", "1.0").unwrap_err().is_not_allowed());
    }
}
