//! Version 1 of the front-end command surface.
//!
//! Commands are thin wrappers that validate input, push database work onto
//! the blocking pool, and return serializable payloads. Errors cross the
//! boundary as strings, except for turn refusals which the UI needs to act on.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::spawn_blocking;

use crate::agents::config::{self, AiProviderInfo, FanOutPolicy, ProviderUpdate};
use crate::agents::{FanOutOrchestrator, ProviderId, ProviderRoute};
use crate::db::DbPool;
use crate::errors::TrilogueError;
use crate::logging::{self, log_event, EventRecord};
use crate::session::{ChatSession, SessionPhase};
use crate::transcript::{AssistantTurn, Turn};

/// Shared state handed to every command.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub orchestrator: Arc<FanOutOrchestrator>,
    pub session: Arc<ChatSession>,
}

/// Inspect the SQLite catalog to confirm the database is reachable.
pub fn db_status(state: &ApiState) -> Result<serde_json::Value, String> {
    let conn = state.db.get().map_err(|e| e.to_string())?;
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
        .map_err(|e| e.to_string())?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| e.to_string())?;
    let mut names = Vec::new();
    for r in rows {
        names.push(r.map_err(|e| e.to_string())?);
    }
    Ok(json!({ "ok": true, "tables": names }))
}

/// One row of the credential screen. Never carries the secret itself.
#[derive(Debug, Serialize)]
pub struct CredentialStatus {
    pub provider: ProviderId,
    pub display_name: String,
    pub description: Option<String>,
    pub key_url: Option<String>,
    pub has_key: bool,
}

impl From<AiProviderInfo> for CredentialStatus {
    fn from(info: AiProviderInfo) -> Self {
        Self {
            provider: info.id,
            display_name: info.display_name,
            description: info.description,
            key_url: info.key_url,
            has_key: info.has_credentials,
        }
    }
}

pub async fn credentials_status(state: &ApiState) -> Result<Vec<CredentialStatus>, String> {
    let pool = state.db.clone();
    let providers = spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        config::list_providers(&conn).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())??;
    Ok(providers.into_iter().map(CredentialStatus::from).collect())
}

#[derive(Debug, Deserialize)]
pub struct SaveCredentialsInput {
    /// Providers left out are not touched; blank values remove a key.
    pub keys: BTreeMap<ProviderId, String>,
}

/// Save keys from the credential screen and close it.
pub async fn save_credentials(
    state: &ApiState,
    input: SaveCredentialsInput,
) -> Result<Vec<CredentialStatus>, String> {
    let store = state.orchestrator.credentials().clone();
    let pool = state.db.clone();
    spawn_blocking(move || {
        for (provider, value) in &input.keys {
            store.set(*provider, value).map_err(|e| e.to_string())?;
        }
        let conn = pool.get().map_err(|e| e.to_string())?;
        let saved: Vec<&str> = input.keys.keys().map(|p| p.as_str()).collect();
        let _ = log_event(
            &conn,
            "info",
            Some("KEY-0100"),
            "ai.settings",
            "API keys updated",
            None,
            Some(json!({ "providers": saved })),
        );
        Ok::<_, String>(())
    })
    .await
    .map_err(|e| e.to_string())??;
    state.session.close_credentials();
    credentials_status(state).await
}

pub fn open_credentials(state: &ApiState) -> SessionPhase {
    state.session.open_credentials();
    state.session.phase()
}

pub fn close_credentials(state: &ApiState) -> SessionPhase {
    state.session.close_credentials();
    state.session.phase()
}

pub fn session_phase(state: &ApiState) -> SessionPhase {
    state.session.phase()
}

#[derive(Debug, Deserialize)]
pub struct ChatSubmitInput {
    pub prompt: String,
}

/// Result of a submission as seen by the UI.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChatSubmitOutput {
    Settled { turn: AssistantTurn },
    Refused {
        code: String,
        message: String,
        explain: String,
        missing: Vec<ProviderId>,
    },
}

/// Send one prompt to every provider and wait for all of them.
pub async fn chat_submit(state: &ApiState, input: ChatSubmitInput) -> Result<ChatSubmitOutput, String> {
    let err = match state.orchestrator.submit(&state.session, &input.prompt).await {
        Ok(turn) => return Ok(ChatSubmitOutput::Settled { turn }),
        Err(err) => err,
    };
    let missing = match &err {
        TrilogueError::MissingCredential(missing) => missing.clone(),
        TrilogueError::EmptyPrompt | TrilogueError::TurnInFlight => Vec::new(),
        _ => return Err(format!("{} {}", err.code(), err)),
    };
    Ok(ChatSubmitOutput::Refused {
        code: err.code().to_string(),
        message: err.to_string(),
        explain: err.explain().to_string(),
        missing,
    })
}

pub async fn chat_history(state: &ApiState) -> Result<Vec<Turn>, String> {
    let store = state.orchestrator.transcript().clone();
    spawn_blocking(move || store.get_all().map_err(|e| e.to_string()))
        .await
        .map_err(|e| e.to_string())?
}

pub async fn chat_clear(state: &ApiState) -> Result<(), String> {
    state
        .orchestrator
        .clear(&state.session)
        .await
        .map_err(|e| e.to_string())
}

/// Settle turns left pending by a previous run. Called once at start-up.
pub async fn chat_recover(state: &ApiState) -> Result<Vec<AssistantTurn>, String> {
    let store = state.orchestrator.transcript().clone();
    spawn_blocking(move || store.recover_interrupted().map_err(|e| e.to_string()))
        .await
        .map_err(|e| e.to_string())?
}

pub async fn ai_list_providers(state: &ApiState) -> Result<Vec<AiProviderInfo>, String> {
    let pool = state.db.clone();
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        config::list_providers(&conn).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}

#[derive(Debug, Deserialize)]
pub struct AiUpdateProviderInput {
    pub provider_id: ProviderId,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub route: Option<ProviderRoute>,
}

/// Update a provider endpoint. Takes effect on the next start, when the
/// adapters are rebuilt from settings.
pub async fn ai_update_provider(
    state: &ApiState,
    input: AiUpdateProviderInput,
) -> Result<AiProviderInfo, String> {
    let pool = state.db.clone();
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let info = config::update_provider(
            &conn,
            ProviderUpdate {
                provider_id: input.provider_id,
                base_url: input.base_url,
                model: input.model,
                route: input.route,
            },
        )
        .map_err(|e| e.to_string())?;
        config::audit_settings_change(&conn, "AI provider endpoint updated");
        Ok::<_, String>(info)
    })
    .await
    .map_err(|e| e.to_string())?
}

pub async fn ai_get_policy(state: &ApiState) -> Result<FanOutPolicy, String> {
    let pool = state.db.clone();
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        config::load_policy(&conn).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}

pub async fn ai_set_policy(state: &ApiState, policy: FanOutPolicy) -> Result<FanOutPolicy, String> {
    let pool = state.db.clone();
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        config::set_policy(&conn, policy).map_err(|e| e.to_string())?;
        config::audit_settings_change(&conn, "fan-out policy updated");
        Ok::<_, String>(policy)
    })
    .await
    .map_err(|e| e.to_string())?
}

/// Return recent AI runtime events for diagnostics.
pub async fn list_ai_events(state: &ApiState, limit: Option<usize>) -> Result<Vec<EventRecord>, String> {
    let pool = state.db.clone();
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        logging::list_events(&conn, "ai.runtime", limit).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}
