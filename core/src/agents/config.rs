use anyhow::{anyhow, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::providers::{ProviderId, ProviderRoute, PROVIDER_SEEDS};
use crate::logging::log_event;

const POLICY_KEY: &str = "chat.fanout_policy";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiProviderInfo {
    pub id: ProviderId,
    pub display_name: String,
    pub description: Option<String>,
    pub key_url: Option<String>,
    pub base_url: String,
    pub model: String,
    pub route: ProviderRoute,
    pub has_credentials: bool,
}

/// Where and how one adapter talks to its provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub id: ProviderId,
    pub base_url: String,
    pub model: String,
    pub route: ProviderRoute,
}

impl ProviderEndpoint {
    /// Defaults from the provider seeds, without touching the database.
    pub fn seeded(id: ProviderId) -> Self {
        let seed = PROVIDER_SEEDS
            .iter()
            .find(|s| s.id == id)
            .unwrap_or(&PROVIDER_SEEDS[0]);
        Self {
            id,
            base_url: seed.base_url.to_string(),
            model: seed.model.to_string(),
            route: seed.route,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_route(mut self, route: ProviderRoute) -> Self {
        self.route = route;
        self
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProviderUpdate {
    pub provider_id: ProviderId,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub route: Option<ProviderRoute>,
}

/// Which providers take part in a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutPolicy {
    /// Every provider must have a key; otherwise the turn is refused.
    #[default]
    RequireAll,
    /// Only providers with a saved key are called. At least one is required.
    ConfiguredOnly,
}

impl FanOutPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequireAll => "require_all",
            Self::ConfiguredOnly => "configured_only",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "require_all" => Some(Self::RequireAll),
            "configured_only" => Some(Self::ConfiguredOnly),
            _ => None,
        }
    }
}

pub fn seed_defaults(conn: &rusqlite::Connection) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    for seed in PROVIDER_SEEDS {
        conn.execute(
            "INSERT INTO ai_providers (id, display_name, description, key_url, base_url, model, route, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT(id) DO NOTHING",
            params![
                seed.id.as_str(),
                seed.id.display_name(),
                seed.description,
                seed.key_url,
                seed.base_url,
                seed.model,
                seed.route.as_str(),
                now,
            ],
        )?;
    }

    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO NOTHING",
        params![POLICY_KEY, FanOutPolicy::default().as_str(), now],
    )?;

    Ok(())
}

const PROVIDER_COLUMNS: &str = "p.id, p.display_name, p.description, p.key_url, p.base_url, p.model, p.route, \
     (SELECT COUNT(1) FROM ai_credentials c WHERE c.provider_id = p.id) as has_secret";

pub fn list_providers(conn: &rusqlite::Connection) -> Result<Vec<AiProviderInfo>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROVIDER_COLUMNS} FROM ai_providers p"
    ))?;
    let rows = stmt.query_map([], map_provider)?;

    let mut providers = Vec::new();
    for row in rows {
        providers.push(row?);
    }
    providers.sort_by_key(|p| p.id);
    Ok(providers)
}

pub fn get_provider(conn: &rusqlite::Connection, provider_id: ProviderId) -> Result<AiProviderInfo> {
    conn.query_row(
        &format!("SELECT {PROVIDER_COLUMNS} FROM ai_providers p WHERE p.id = ?1"),
        params![provider_id.as_str()],
        map_provider,
    )
    .map_err(|_| anyhow!("Unknown AI provider: {provider_id}"))
}

pub fn update_provider(conn: &rusqlite::Connection, update: ProviderUpdate) -> Result<AiProviderInfo> {
    let current = get_provider(conn, update.provider_id)?;
    let base_url = update
        .base_url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or(current.base_url);
    let model = update
        .model
        .map(|m| m.trim().to_string())
        .filter(|m| !m.is_empty())
        .unwrap_or(current.model);
    let route = update.route.unwrap_or(current.route);

    conn.execute(
        "UPDATE ai_providers SET base_url = ?1, model = ?2, route = ?3, updated_at = ?4 WHERE id = ?5",
        params![
            base_url,
            model,
            route.as_str(),
            OffsetDateTime::now_utc().unix_timestamp(),
            update.provider_id.as_str()
        ],
    )?;
    get_provider(conn, update.provider_id)
}

/// Endpoints for every provider, in display order.
pub fn resolve_endpoints(conn: &rusqlite::Connection) -> Result<Vec<ProviderEndpoint>> {
    Ok(list_providers(conn)?
        .into_iter()
        .map(|p| ProviderEndpoint {
            id: p.id,
            base_url: p.base_url,
            model: p.model,
            route: p.route,
        })
        .collect())
}

pub fn load_policy(conn: &rusqlite::Connection) -> Result<FanOutPolicy> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![POLICY_KEY],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value
        .as_deref()
        .and_then(FanOutPolicy::parse)
        .unwrap_or_default())
}

pub fn set_policy(conn: &rusqlite::Connection, policy: FanOutPolicy) -> Result<()> {
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![POLICY_KEY, policy.as_str(), OffsetDateTime::now_utc().unix_timestamp()],
    )?;
    Ok(())
}

fn map_provider(row: &Row) -> rusqlite::Result<AiProviderInfo> {
    let id: String = row.get(0)?;
    let route: String = row.get(6)?;
    let id = id.parse::<ProviderId>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(AiProviderInfo {
        id,
        display_name: row.get(1)?,
        description: row.get(2)?,
        key_url: row.get(3)?,
        base_url: row.get(4)?,
        model: row.get(5)?,
        route: ProviderRoute::parse(&route).unwrap_or(ProviderRoute::Direct),
        has_credentials: row.get::<_, i64>(7)? > 0,
    })
}

pub fn audit_settings_change(conn: &rusqlite::Connection, message: &str) {
    let _ = log_event(
        conn,
        "info",
        Some("AI-0001"),
        "ai.settings",
        message,
        Some("AI configuration updated"),
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    #[test]
    fn seeds_match_the_default_wire_contracts() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().to_path_buf()).unwrap();
        let conn = pool.get().unwrap();

        let endpoints = resolve_endpoints(&conn).unwrap();
        let ids: Vec<_> = endpoints.iter().map(|e| e.id).collect();
        assert_eq!(ids, ProviderId::ALL.to_vec());
        assert_eq!(endpoints[0].model, "gpt-4o-mini");
        assert_eq!(endpoints[1].model, "gemini-pro");
        assert_eq!(endpoints[2].route, ProviderRoute::Proxy);
        assert_eq!(endpoints[2], ProviderEndpoint::seeded(ProviderId::Claude));
    }

    #[test]
    fn update_survives_reseeding() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().to_path_buf()).unwrap();
        {
            let conn = pool.get().unwrap();
            let updated = update_provider(
                &conn,
                ProviderUpdate {
                    provider_id: ProviderId::Claude,
                    base_url: Some("https://api.anthropic.com".into()),
                    route: Some(ProviderRoute::Direct),
                    ..Default::default()
                },
            )
            .unwrap();
            assert_eq!(updated.route, ProviderRoute::Direct);
            assert_eq!(updated.model, "claude-3-5-sonnet-20241022");
        }
        drop(pool);

        let pool = init_db(dir.path().to_path_buf()).unwrap();
        let conn = pool.get().unwrap();
        let claude = get_provider(&conn, ProviderId::Claude).unwrap();
        assert_eq!(claude.base_url, "https://api.anthropic.com");
        assert_eq!(claude.route, ProviderRoute::Direct);
    }

    #[test]
    fn policy_defaults_to_require_all() {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().to_path_buf()).unwrap();
        let conn = pool.get().unwrap();
        assert_eq!(load_policy(&conn).unwrap(), FanOutPolicy::RequireAll);
        set_policy(&conn, FanOutPolicy::ConfiguredOnly).unwrap();
        assert_eq!(load_policy(&conn).unwrap(), FanOutPolicy::ConfiguredOnly);
    }
}
