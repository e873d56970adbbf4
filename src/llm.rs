//! Anthropic Messages API client.
//!
//! One non-streaming client serves every model call the bot makes: replies,
//! YES/NO relevance checks, memory extraction, and episode summarization.
//! The caller picks the token ceiling per call; the transport is otherwise
//! identical.
//!
//! The system prompt travels in the top-level `system` field; the
//! conversation goes in `messages` with strictly alternating roles.

use std::time::Duration;

use serde_json::json;
use tracing::warn;

use crate::config::LlmConfig;
use crate::error::{BanterError, Result};

/// Role of one conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One turn of an alternating conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    /// Create a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Non-streaming Messages API client.
#[derive(Debug, Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    api_version: String,
}

impl LlmClient {
    /// API version header value.
    const API_VERSION: &'static str = "2023-06-01";

    /// Build a client from config, or `None` when no API key is resolvable.
    ///
    /// A missing key disables the chat brain rather than failing startup;
    /// the caller decides what still works without it.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn from_config(cfg: &LlmConfig) -> Result<Option<Self>> {
        let Some(api_key) = cfg.resolve_api_key() else {
            warn!("no LLM API key configured; model calls disabled");
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| BanterError::Llm(format!("HTTP client build failed: {e}")))?;
        Ok(Some(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            model: cfg.model.clone(),
            api_key,
            api_version: Self::API_VERSION.to_owned(),
        }))
    }

    /// Returns the configured model identifier.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Issue one completion request and return the concatenated text output.
    ///
    /// `messages` must alternate roles and end on a user turn; the Context
    /// Assembler guarantees this for reply calls.
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure, a non-success status, or a
    /// response with no text content.
    pub async fn complete(
        &self,
        system: Option<&str>,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String> {
        let body = build_request_body(&self.model, system, messages, max_tokens);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BanterError::Llm(format!("connection error: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read body".to_owned());
            return Err(map_http_error(status, &body));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BanterError::Llm(format!("response decode failed: {e}")))?;

        extract_text(&value)
            .ok_or_else(|| BanterError::Llm("response contained no text content".to_owned()))
    }
}

/// Build a Messages API request body.
fn build_request_body(
    model: &str,
    system: Option<&str>,
    messages: &[ChatMessage],
    max_tokens: u32,
) -> serde_json::Value {
    let wire_messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            json!({
                "role": m.role.as_str(),
                "content": [{"type": "text", "text": m.content}],
            })
        })
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": wire_messages,
    });
    if let Some(system) = system {
        body["system"] = serde_json::Value::String(system.to_owned());
    }
    body
}

/// Concatenate the text blocks of a Messages API response.
///
/// Unknown block types are skipped; returns `None` only when no text block
/// is present at all.
fn extract_text(value: &serde_json::Value) -> Option<String> {
    let blocks = value.get("content")?.as_array()?;
    let mut out = String::new();
    let mut found = false;
    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) == Some("text")
            && let Some(text) = block.get("text").and_then(|t| t.as_str())
        {
            out.push_str(text);
            found = true;
        }
    }
    found.then_some(out)
}

/// Map HTTP error responses to a descriptive error.
fn map_http_error(status: reqwest::StatusCode, body: &str) -> BanterError {
    let detail = extract_error_message(body);
    let msg = match status.as_u16() {
        401 | 403 => format!("authentication failed: {detail}"),
        429 => format!("rate limit exceeded: {detail}"),
        529 => format!("API overloaded: {detail}"),
        s if s >= 500 => format!("provider error ({status}): {detail}"),
        _ => format!("HTTP {status}: {detail}"),
    };
    BanterError::Llm(msg)
}

/// Extract a human-readable error message from an error response body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| {
            if body.is_empty() {
                "no response body".to_owned()
            } else {
                body.chars().take(500).collect()
            }
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(base_url: &str) -> LlmClient {
        let cfg = LlmConfig {
            base_url: base_url.to_owned(),
            model: "test-model".to_owned(),
            api_key: "test-key".to_owned(),
            ..LlmConfig::default()
        };
        LlmClient::from_config(&cfg)
            .expect("client build")
            .expect("key present")
    }

    fn message_response(text: &str) -> serde_json::Value {
        json!({
            "id": "msg_test",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": text}],
            "model": "test-model",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 5}
        })
    }

    #[test]
    fn body_includes_required_fields() {
        let messages = vec![ChatMessage::user("Hello")];
        let body = build_request_body("test-model", None, &messages, 300);

        assert_eq!(body["model"], "test-model");
        assert_eq!(body["max_tokens"], 300);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"][0]["text"], "Hello");
        assert!(body.get("system").is_none());
    }

    #[test]
    fn body_carries_system_at_top_level() {
        let messages = vec![ChatMessage::user("Hi")];
        let body = build_request_body("m", Some("You are Banter."), &messages, 100);
        assert_eq!(body["system"], "You are Banter.");
    }

    #[test]
    fn extract_text_concatenates_blocks() {
        let value = json!({
            "content": [
                {"type": "text", "text": "part one"},
                {"type": "tool_use", "id": "x"},
                {"type": "text", "text": " part two"}
            ]
        });
        assert_eq!(extract_text(&value).as_deref(), Some("part one part two"));
    }

    #[test]
    fn extract_text_none_without_text_blocks() {
        let value = json!({"content": [{"type": "tool_use", "id": "x"}]});
        assert!(extract_text(&value).is_none());
        assert!(extract_text(&json!({})).is_none());
    }

    #[test]
    fn from_config_without_key_is_none() {
        let cfg = LlmConfig {
            api_key: String::new(),
            ..LlmConfig::default()
        };
        // Only honor the env fallback if the test environment has it unset.
        if std::env::var(crate::config::LLM_API_KEY_ENV).is_err() {
            assert!(LlmClient::from_config(&cfg).expect("build").is_none());
        }
    }

    #[test]
    fn error_message_extraction() {
        let body = r#"{"type":"error","error":{"type":"auth_error","message":"Invalid API key"}}"#;
        assert_eq!(extract_error_message(body), "Invalid API key");
        assert_eq!(extract_error_message(""), "no response body");
        assert_eq!(extract_error_message("plain failure"), "plain failure");
    }

    #[tokio::test]
    async fn complete_sends_headers_and_parses_text() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .and(header("anthropic-version", "2023-06-01"))
            .and(body_partial_json(json!({
                "model": "test-model",
                "max_tokens": 300
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(message_response("oi, nice cat")),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(&mock_server.uri());
        let reply = client
            .complete(
                Some("persona"),
                &[ChatMessage::user("Dave: I adopted a cat")],
                300,
            )
            .await
            .expect("complete");
        assert_eq!(reply, "oi, nice cat");
    }

    #[tokio::test]
    async fn complete_maps_auth_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "type": "error",
                "error": {"type": "authentication_error", "message": "Invalid API key"}
            })))
            .mount(&mock_server)
            .await;

        let client = test_client(&mock_server.uri());
        let err = client
            .complete(None, &[ChatMessage::user("hi")], 100)
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("authentication failed"));
    }

    #[tokio::test]
    async fn complete_rejects_empty_content() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_test",
                "content": [],
                "stop_reason": "end_turn"
            })))
            .mount(&mock_server)
            .await;

        let client = test_client(&mock_server.uri());
        let err = client
            .complete(None, &[ChatMessage::user("hi")], 100)
            .await
            .expect_err("should fail");
        assert!(err.to_string().contains("no text content"));
    }
}
