use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::{read_json, settle, transport, upstream_message, ProviderAdapter};
use crate::agents::config::ProviderEndpoint;
use crate::agents::providers::ProviderId;
use crate::errors::ProviderFailure;
use crate::transcript::ProviderResult;

const UNEXPECTED_RESPONSE: &str = "Gemini에서 예상치 못한 응답을 받았습니다.";

/// `generateContent`, called directly. The key travels in a header so it
/// never shows up in URLs or transport error messages.
pub struct GeminiAdapter {
    client: Client,
    endpoint: ProviderEndpoint,
}

impl GeminiAdapter {
    pub fn new(client: Client, endpoint: ProviderEndpoint) -> Self {
        Self { client, endpoint }
    }

    async fn request(&self, prompt: &str, credential: &str) -> Result<String, ProviderFailure> {
        let model = self.endpoint.model.trim_start_matches("models/");
        let url = self
            .endpoint
            .url(&format!("/v1beta/models/{model}:generateContent"));
        let payload = json!({
            "contents": [{ "parts": [{ "text": prompt }] }]
        });
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", credential)
            .json(&payload)
            .send()
            .await
            .map_err(transport)?;
        let (status, body) = read_json(response).await?;
        parse_reply(status, &body)
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider(&self) -> ProviderId {
        ProviderId::Gemini
    }

    fn model(&self) -> &str {
        &self.endpoint.model
    }

    async fn call(&self, prompt: &str, credential: &str) -> ProviderResult {
        settle(ProviderId::Gemini, self.request(prompt, credential).await)
    }
}

fn parse_reply(status: StatusCode, body: &Value) -> Result<String, ProviderFailure> {
    if let Some(message) = upstream_message(body) {
        log::error!("Gemini API error: {body}");
        return Err(ProviderFailure::Upstream { provider: ProviderId::Gemini, message });
    }
    if !status.is_success() {
        log::error!("Gemini API error ({status}): {body}");
        return Err(ProviderFailure::Upstream {
            provider: ProviderId::Gemini,
            message: status.to_string(),
        });
    }
    body.pointer("/candidates/0/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            log::error!("Unexpected Gemini response: {body}");
            ProviderFailure::Malformed { provider: ProviderId::Gemini, message: UNEXPECTED_RESPONSE }
        })
}
