//! Fan-out of one user prompt to every participating provider.
//!
//! A turn is committed in two writes: the user turn plus an all-pending
//! placeholder before any request leaves, then the full settlement once every
//! adapter has answered. Nothing is revealed in between.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::join_all;
use reqwest::Client;
use serde_json::json;
use tokio::task::spawn_blocking;

use super::adapters::{build_adapters, ProviderAdapter};
use super::config::{self, FanOutPolicy};
use super::providers::ProviderId;
use crate::credentials::{CredentialStore, Credentials};
use crate::db::DbPool;
use crate::errors::TrilogueError;
use crate::logging::{credential_fingerprint, log_event};
use crate::render::RenderSink;
use crate::session::ChatSession;
use crate::transcript::{AssistantTurn, ProviderResult, ResultStatus, TranscriptStore, Turn, UserTurn};

const PREVIEW_CHARS: usize = 200;

pub struct FanOutOrchestrator {
    pool: DbPool,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    credentials: CredentialStore,
    transcript: TranscriptStore,
    sink: Arc<dyn RenderSink>,
}

impl FanOutOrchestrator {
    pub fn new(pool: DbPool, adapters: Vec<Arc<dyn ProviderAdapter>>, sink: Arc<dyn RenderSink>) -> Self {
        Self {
            credentials: CredentialStore::new(pool.clone()),
            transcript: TranscriptStore::new(pool.clone()),
            pool,
            adapters,
            sink,
        }
    }

    /// Build adapters from the endpoints stored in `ai_providers`.
    pub fn from_settings(pool: DbPool, client: &Client, sink: Arc<dyn RenderSink>) -> anyhow::Result<Self> {
        let endpoints = {
            let conn = pool.get()?;
            config::resolve_endpoints(&conn)?
        };
        let adapters = build_adapters(client, &endpoints);
        Ok(Self::new(pool, adapters, sink))
    }

    pub fn providers(&self) -> Vec<ProviderId> {
        self.adapters.iter().map(|a| a.provider()).collect()
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn transcript(&self) -> &TranscriptStore {
        &self.transcript
    }

    /// Run one turn to completion and return the settled assistant turn.
    ///
    /// Refusals (`EmptyPrompt`, `TurnInFlight`, `MissingCredential`) leave
    /// the transcript untouched and make no network calls.
    pub async fn submit(&self, session: &ChatSession, prompt: &str) -> Result<AssistantTurn, TrilogueError> {
        if prompt.trim().is_empty() {
            return Err(TrilogueError::EmptyPrompt);
        }
        let Some(guard) = session.begin_turn() else {
            log::debug!("submission ignored: a turn is already in flight");
            return Err(TrilogueError::TurnInFlight);
        };

        let (credentials, policy) = {
            let credentials = self.credentials.clone();
            let pool = self.pool.clone();
            blocking(move || {
                let conn = pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
                Ok((credentials.get_all()?, config::load_policy(&conn)?))
            })
            .await?
        };

        let participants = match self.select_participants(&credentials, policy) {
            Ok(participants) => participants,
            Err(missing) => {
                drop(guard);
                session.open_credentials();
                self.sink.credentials_required(&missing);
                let refusal = TrilogueError::MissingCredential(missing);
                self.record_refusal(&refusal).await;
                return Err(refusal);
            }
        };

        let user = UserTurn::new(prompt);
        let ids: Vec<ProviderId> = participants.iter().map(|a| a.provider()).collect();
        let mut placeholder = AssistantTurn::placeholder(&ids);
        log::info!("turn {} started for {:?}", placeholder.id, ids);

        let turns = {
            let store = self.transcript.clone();
            let user = Turn::User(user);
            let pending = Turn::Assistant(placeholder.clone());
            blocking(move || {
                store.append(&user)?;
                store.append(&pending)?;
                store.get_all()
            })
            .await?
        };
        self.sink.transcript_changed(&turns);

        let calls = participants.iter().map(|adapter| {
            let provider = adapter.provider();
            let secret = credentials.get(provider).unwrap_or_default();
            async move { (provider, adapter.call(prompt, secret).await) }
        });
        let results: BTreeMap<ProviderId, ProviderResult> = join_all(calls).await.into_iter().collect();

        self.record_outcomes(&placeholder.id, &participants, &credentials, &results).await;
        placeholder.settle(results)?;

        let turns = {
            let store = self.transcript.clone();
            let settled = placeholder.clone();
            blocking(move || {
                if let Err(err) = store.update_last(&settled) {
                    // Keep the stored turn from staying pending even though
                    // this submission is reported as failed.
                    match store.settle_by_id(&settled) {
                        Ok(true) => log::warn!("turn {} settled out of order: {err}", settled.id),
                        Ok(false) => log::warn!("turn {} vanished before settling: {err}", settled.id),
                        Err(fallback) => log::error!("turn {} left pending: {fallback}", settled.id),
                    }
                    return Err(err);
                }
                store.get_all()
            })
            .await?
        };
        drop(guard);
        log::info!("turn {} settled", placeholder.id);
        self.sink.transcript_changed(&turns);
        Ok(placeholder)
    }

    /// Empty the transcript. Refused while a turn is in flight.
    pub async fn clear(&self, session: &ChatSession) -> Result<(), TrilogueError> {
        // Held until the delete lands so no turn can start underneath it.
        let Some(guard) = session.claim() else {
            return Err(TrilogueError::TurnInFlight);
        };
        let store = self.transcript.clone();
        blocking(move || store.clear()).await?;
        drop(guard);
        self.sink.transcript_changed(&[]);
        Ok(())
    }

    /// Adapters taking part in this turn, or the providers whose keys are missing.
    fn select_participants(
        &self,
        credentials: &Credentials,
        policy: FanOutPolicy,
    ) -> Result<Vec<Arc<dyn ProviderAdapter>>, Vec<ProviderId>> {
        let all = self.providers();
        let missing = credentials.missing_for(&all);
        match policy {
            FanOutPolicy::RequireAll if !missing.is_empty() => Err(missing),
            FanOutPolicy::ConfiguredOnly if missing.len() == all.len() => Err(missing),
            _ => Ok(self
                .adapters
                .iter()
                .filter(|a| credentials.contains(a.provider()))
                .cloned()
                .collect()),
        }
    }

    async fn record_refusal(&self, refusal: &TrilogueError) {
        let pool = self.pool.clone();
        let missing: Vec<&'static str> = match refusal {
            TrilogueError::MissingCredential(missing) => missing.iter().map(|p| p.as_str()).collect(),
            _ => Vec::new(),
        };
        let (code, explain) = (refusal.code(), refusal.explain());
        log::warn!("turn refused, missing API keys for {missing:?}");
        let _ = blocking(move || {
            let conn = pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
            let _ = log_event(
                &conn,
                "warn",
                Some(code),
                "chat.turn",
                "turn refused: API keys missing",
                Some(explain),
                Some(json!({ "missing": missing })),
            );
            Ok(())
        })
        .await;
    }

    async fn record_outcomes(
        &self,
        turn_id: &str,
        participants: &[Arc<dyn ProviderAdapter>],
        credentials: &Credentials,
        results: &BTreeMap<ProviderId, ProviderResult>,
    ) {
        let pool = self.pool.clone();
        let records: Vec<_> = participants
            .iter()
            .filter_map(|adapter| {
                let provider = adapter.provider();
                let result = results.get(&provider)?;
                Some(json!({
                    "turn_id": turn_id,
                    "provider": provider.as_str(),
                    "model": adapter.model(),
                    "status": result.status,
                    "preview": result.text.chars().take(PREVIEW_CHARS).collect::<String>(),
                    "key_fingerprint": credentials.get(provider).map(credential_fingerprint),
                }))
            })
            .collect();

        let outcome = blocking(move || {
            let conn = pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
            for data in records {
                let failed = data["status"] == json!(ResultStatus::Failed);
                let (level, code, message) = if failed {
                    ("warn", "AI-0201", "AI provider invocation failed")
                } else {
                    ("info", "AI-0200", "AI chat invocation succeeded")
                };
                log_event(&conn, level, Some(code), "ai.runtime", message, None, Some(data))
                    .map_err(|e| anyhow!(e))?;
            }
            Ok(())
        })
        .await;
        if let Err(err) = outcome {
            log::warn!("failed to record provider outcomes: {err}");
        }
    }
}

/// Run store work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, TrilogueError>
where
    F: FnOnce() -> Result<T, TrilogueError> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(work)
        .await
        .map_err(|err| TrilogueError::Storage(anyhow!(err.to_string())))?
}
