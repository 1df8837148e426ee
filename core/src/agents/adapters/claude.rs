use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::{read_json, settle, transport, upstream_message, ProviderAdapter, MAX_REPLY_TOKENS};
use crate::agents::config::ProviderEndpoint;
use crate::agents::providers::{ProviderId, ProviderRoute};
use crate::errors::ProviderFailure;
use crate::transcript::ProviderResult;

const UNKNOWN_ERROR: &str = "알 수 없는 오류";
const NO_CONTENT: &str = "Claude에서 content가 없는 응답을 받았습니다.";
const EMPTY_CONTENT: &str = "Claude에서 빈 응답을 받았습니다.";
const NO_TEXT: &str = "Claude에서 텍스트가 없는 응답을 받았습니다.";

/// Anthropic Messages, either through the local intermediary (default) or
/// straight to the API. Both routes answer with the Messages response shape.
pub struct ClaudeAdapter {
    client: Client,
    endpoint: ProviderEndpoint,
}

impl ClaudeAdapter {
    pub fn new(client: Client, endpoint: ProviderEndpoint) -> Self {
        Self { client, endpoint }
    }

    async fn request(&self, prompt: &str, credential: &str) -> Result<String, ProviderFailure> {
        let request = match self.endpoint.route {
            ProviderRoute::Proxy => self
                .client
                .post(self.endpoint.url("/api/claude"))
                .json(&json!({ "message": prompt, "apiKey": credential })),
            ProviderRoute::Direct => self
                .client
                .post(self.endpoint.url("/v1/messages"))
                .header("x-api-key", credential)
                .header("anthropic-version", "2023-06-01")
                .json(&json!({
                    "model": self.endpoint.model,
                    "max_tokens": MAX_REPLY_TOKENS,
                    "messages": [{ "role": "user", "content": prompt }],
                })),
        };
        log::debug!("claude request via {} route", self.endpoint.route.as_str());

        let response = request.send().await.map_err(transport)?;
        let (status, body) = read_json(response).await?;
        log::debug!("Claude response ({status}): {body}");
        parse_reply(status, &body)
    }
}

#[async_trait]
impl ProviderAdapter for ClaudeAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Claude
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn call(&self, prompt: &str, credential: &str) -> ProviderResult {
        settle(ProviderId::Claude, self.request(prompt, credential).await)
    }
}

fn parse_reply(status: StatusCode, body: &Value) -> Result<String, ProviderFailure> {
    if !status.is_success() {
        log::error!("Claude API error ({status}): {body}");
        return Err(ProviderFailure::Upstream {
            provider: ProviderId::Claude,
            message: upstream_message(body).unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
        });
    }

    let malformed = |message: &'static str| {
        log::error!("{message} {body}");
        ProviderFailure::Malformed { provider: ProviderId::Claude, message }
    };

    let content = match body.get("content") {
        Some(content) if !is_blank(content) => content,
        _ => return Err(malformed(NO_CONTENT)),
    };
    let first = content
        .as_array()
        .and_then(|blocks| blocks.first())
        .ok_or_else(|| malformed(EMPTY_CONTENT))?;
    first
        .get("text")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed(NO_TEXT))
}

/// Null, `false`, zero and the empty string count as no content at all.
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_text_block() {
        let body = json!({
            "id": "msg_01",
            "type": "message",
            "content": [{"type": "text", "text": "Hello from Claude"}],
            "stop_reason": "end_turn"
        });
        assert_eq!(parse_reply(StatusCode::OK, &body).unwrap(), "Hello from Claude");
    }

    #[test]
    fn error_status_uses_nested_message_then_string_then_unknown() {
        let nested = json!({"type": "error", "error": {"type": "authentication_error", "message": "invalid x-api-key"}});
        assert_eq!(
            parse_reply(StatusCode::UNAUTHORIZED, &nested).unwrap_err().to_string(),
            "Claude 오류: invalid x-api-key"
        );

        let bare = json!({"error": "Missing apiKey"});
        assert_eq!(
            parse_reply(StatusCode::BAD_REQUEST, &bare).unwrap_err().to_string(),
            "Claude 오류: Missing apiKey"
        );

        assert_eq!(
            parse_reply(StatusCode::INTERNAL_SERVER_ERROR, &json!({})).unwrap_err().to_string(),
            format!("Claude 오류: {UNKNOWN_ERROR}")
        );
    }

    #[test]
    fn missing_content_field() {
        let err = parse_reply(StatusCode::OK, &json!({"id": "msg_01"})).unwrap_err();
        assert_eq!(err.to_string(), NO_CONTENT);
    }

    #[test]
    fn falsy_content_counts_as_missing() {
        for content in [json!(null), json!(""), json!(false), json!(0)] {
            let body = json!({ "content": content });
            assert_eq!(
                parse_reply(StatusCode::OK, &body).unwrap_err().to_string(),
                NO_CONTENT,
                "content = {content}"
            );
        }
    }

    #[test]
    fn empty_or_non_array_content() {
        assert_eq!(
            parse_reply(StatusCode::OK, &json!({"content": []})).unwrap_err().to_string(),
            EMPTY_CONTENT
        );
        assert_eq!(
            parse_reply(StatusCode::OK, &json!({"content": "text"})).unwrap_err().to_string(),
            EMPTY_CONTENT
        );
    }

    #[test]
    fn first_block_without_text() {
        let body = json!({"content": [{"type": "tool_use", "id": "toolu_1", "name": "x", "input": {}}]});
        assert_eq!(parse_reply(StatusCode::OK, &body).unwrap_err().to_string(), NO_TEXT);
    }
}
