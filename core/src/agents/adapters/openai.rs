use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::{read_json, settle, transport, upstream_message, ProviderAdapter, MAX_REPLY_TOKENS};
use crate::agents::config::ProviderEndpoint;
use crate::agents::providers::ProviderId;
use crate::errors::ProviderFailure;
use crate::transcript::ProviderResult;

const UNEXPECTED_RESPONSE: &str = "OpenAI에서 예상치 못한 응답을 받았습니다.";

/// Chat Completions, called directly with a bearer key.
pub struct OpenAiAdapter {
    client: Client,
    endpoint: ProviderEndpoint,
}

impl OpenAiAdapter {
    pub fn new(client: Client, endpoint: ProviderEndpoint) -> Self {
        Self { client, endpoint }
    }

    async fn request(&self, prompt: &str, credential: &str) -> Result<String, ProviderFailure> {
        let payload = json!({
            "model": self.endpoint.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": MAX_REPLY_TOKENS,
        });
        let response = self
            .client
            .post(self.endpoint.url("/v1/chat/completions"))
            .bearer_auth(credential)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;
        let (status, body) = read_json(response).await?;
        parse_reply(status, &body)
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::OpenAi
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn call(&self, prompt: &str, credential: &str) -> ProviderResult {
        settle(ProviderId::OpenAi, self.request(prompt, credential).await)
    }
}

fn parse_reply(status: StatusCode, body: &Value) -> Result<String, ProviderFailure> {
    if let Some(message) = upstream_message(body) {
        log::error!("OpenAI API error: {body}");
        return Err(ProviderFailure::Upstream { provider: ProviderId::OpenAi, message });
    }
    if !status.is_success() {
        log::error!("OpenAI API error ({status}): {body}");
        return Err(ProviderFailure::Upstream {
            provider: ProviderId::OpenAi,
            message: status.to_string(),
        });
    }
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            log::error!("Unexpected OpenAI response: {body}");
            ProviderFailure::Malformed { provider: ProviderId::OpenAi, message: UNEXPECTED_RESPONSE }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_choice() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "Hi there"}}]});
        assert_eq!(parse_reply(StatusCode::OK, &body).unwrap(), "Hi there");
    }

    #[test]
    fn structured_error_wins_over_status() {
        let body = json!({"error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}});
        let err = parse_reply(StatusCode::UNAUTHORIZED, &body).unwrap_err();
        assert_eq!(err.to_string(), "OpenAI 오류: Incorrect API key provided");
    }

    #[test]
    fn empty_choices_is_malformed() {
        let err = parse_reply(StatusCode::OK, &json!({"choices": []})).unwrap_err();
        assert_eq!(err.to_string(), UNEXPECTED_RESPONSE);
    }

    #[test]
    fn error_status_without_payload_is_upstream() {
        let err = parse_reply(StatusCode::BAD_GATEWAY, &json!({})).unwrap_err();
        assert_eq!(err.code(), "UPS-1001");
        assert!(err.to_string().starts_with("OpenAI 오류: 502"));
    }
}
