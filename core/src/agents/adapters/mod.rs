//! One adapter per provider. Each owns its wire contract and turns whatever
//! comes back (reply, structured error, junk, nothing) into a
//! [`ProviderResult`]. Adapters never return errors to the caller.

mod claude;
mod gemini;
mod openai;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;

use super::config::ProviderEndpoint;
use super::providers::ProviderId;
use crate::errors::ProviderFailure;
use crate::transcript::ProviderResult;

pub use claude::ClaudeAdapter;
pub use gemini::GeminiAdapter;
pub use openai::OpenAiAdapter;

/// Reply budget sent to providers that require one.
pub const MAX_REPLY_TOKENS: u32 = 1000;

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> ProviderId;

    fn model(&self) -> &str;

    /// One stateless, single-turn call. Always settles.
    async fn call(&self, prompt: &str, credential: &str) -> ProviderResult;
}

pub fn build_http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(60))
        .user_agent("Trilogue-Core/0.1")
        .build()
        .context("failed to construct HTTP client")
}

/// Adapters for `endpoints`, sharing one HTTP client.
pub fn build_adapters(client: &Client, endpoints: &[ProviderEndpoint]) -> Vec<Arc<dyn ProviderAdapter>> {
    endpoints
        .iter()
        .map(|endpoint| -> Arc<dyn ProviderAdapter> {
            match endpoint.id {
                ProviderId::OpenAi => Arc::new(OpenAiAdapter::new(client.clone(), endpoint.clone())),
                ProviderId::Gemini => Arc::new(GeminiAdapter::new(client.clone(), endpoint.clone())),
                ProviderId::Claude => Arc::new(ClaudeAdapter::new(client.clone(), endpoint.clone())),
            }
        })
        .collect()
}

/// Status plus decoded JSON body. An unreadable body counts as a transport failure.
async fn read_json(response: Response) -> Result<(StatusCode, Value), ProviderFailure> {
    let status = response.status();
    let body = response
        .json::<Value>()
        .await
        .map_err(|err| ProviderFailure::Transport(err.to_string()))?;
    Ok((status, body))
}

fn transport(err: reqwest::Error) -> ProviderFailure {
    ProviderFailure::Transport(err.to_string())
}

/// `error.message`, or `error` itself when the provider sent a bare string.
fn upstream_message(body: &Value) -> Option<String> {
    let error = body.get("error").filter(|e| !e.is_null())?;
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    match error {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::String(_) => None,
        other => Some(other.to_string()),
    }
}

/// Final normalization shared by every adapter.
fn settle(provider: ProviderId, outcome: Result<String, ProviderFailure>) -> ProviderResult {
    match outcome {
        Ok(text) => {
            log::debug!("{provider} replied with {} chars", text.chars().count());
            ProviderResult::done(text)
        }
        Err(failure) => {
            log::warn!("{provider} call failed [{}]: {failure} ({})", failure.code(), failure.explain());
            ProviderResult::failed(failure.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upstream_message_prefers_nested_message() {
        let body = json!({"error": {"message": "invalid key", "code": 401}});
        assert_eq!(upstream_message(&body).as_deref(), Some("invalid key"));
    }

    #[test]
    fn upstream_message_accepts_bare_string() {
        let body = json!({"error": "proxy exploded"});
        assert_eq!(upstream_message(&body).as_deref(), Some("proxy exploded"));
    }

    #[test]
    fn upstream_message_absent_without_error_field() {
        assert_eq!(upstream_message(&json!({"choices": []})), None);
        assert_eq!(upstream_message(&json!({"error": null})), None);
    }

    #[test]
    fn build_adapters_keeps_endpoint_order() {
        let client = build_http_client().unwrap();
        let endpoints: Vec<_> = ProviderId::ALL.iter().map(|id| ProviderEndpoint::seeded(*id)).collect();
        let adapters = build_adapters(&client, &endpoints);
        let ids: Vec<_> = adapters.iter().map(|a| a.provider()).collect();
        assert_eq!(ids, ProviderId::ALL.to_vec());
        assert_eq!(adapters[0].model(), "gpt-4o-mini");
    }
}
