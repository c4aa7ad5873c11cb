//! Blocking HTTP plumbing shared by the REST connectors.

use reqwest::blocking::{Client, RequestBuilder};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Every remote call returns within this bound, so an idempotency lookup can
/// never hang the happy path.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("enact/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: u16, message: String },

    /// Transport succeeded but the API reported an error in its body.
    #[error("{0}")]
    Api(String),

    #[error("unexpected response: {0}")]
    Shape(String),
}

impl HttpError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, HttpError::Status { status: 404, .. })
    }
}

pub type HttpResult<T> = std::result::Result<T, HttpError>;

pub fn build_client() -> std::result::Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

/// Send a request and decode a JSON body. Non-2xx statuses become
/// `HttpError::Status` carrying the API's `message` field when present.
pub fn send_json(request: RequestBuilder) -> HttpResult<Value> {
    let response = request.send()?;
    let status = response.status();
    let text = response.text()?;
    let body: Value = if text.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap_or(Value::String(text))
    };
    if !status.is_success() {
        let message = body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string());
        return Err(HttpError::Status {
            status: status.as_u16(),
            message,
        });
    }
    Ok(body)
}

pub fn str_field<'a>(value: &'a Value, pointer: &str) -> HttpResult<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| HttpError::Shape(format!("missing {pointer}")))
}

pub fn u64_field(value: &Value, pointer: &str) -> HttpResult<u64> {
    value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .ok_or_else(|| HttpError::Shape(format!("missing {pointer}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn not_found_detection() {
        let err = HttpError::Status {
            status: 404,
            message: "Not Found".to_string(),
        };
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "HTTP 404: Not Found");
        assert!(!HttpError::Api("ratelimited".into()).is_not_found());
    }

    #[test]
    fn field_helpers() {
        let body = json!({"object": {"sha": "abc"}, "number": 7});
        assert_eq!(str_field(&body, "/object/sha").unwrap(), "abc");
        assert_eq!(u64_field(&body, "/number").unwrap(), 7);
        assert!(matches!(str_field(&body, "/nope"), Err(HttpError::Shape(_))));
    }

    #[test]
    fn send_json_maps_error_status() {
        let mut server = mockito::Server::new();
        let _m = server
            .mock("GET", "/thing")
            .with_status(422)
            .with_body(r#"{"message":"Validation Failed"}"#)
            .create();
        let client = build_client().unwrap();
        let err = send_json(client.get(format!("{}/thing", server.url()))).unwrap_err();
        match err {
            HttpError::Status { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "Validation Failed");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn send_json_accepts_empty_body() {
        let mut server = mockito::Server::new();
        let _m = server.mock("DELETE", "/thing").with_status(204).create();
        let client = build_client().unwrap();
        let body = send_json(client.delete(format!("{}/thing", server.url()))).unwrap();
        assert!(body.is_null());
    }
}
