//! Per-provider API keys persisted in `ai_credentials`.
//!
//! Secrets are base64-encoded at rest. Nothing here validates key format;
//! a blank value removes the stored key.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use r2d2_sqlite::rusqlite::{params, OptionalExtension};
use time::OffsetDateTime;

use crate::agents::ProviderId;
use crate::db::DbPool;

/// Snapshot of the saved secrets. Only non-empty secrets are present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials(BTreeMap<ProviderId, String>);

impl Credentials {
    pub fn get(&self, provider: ProviderId) -> Option<&str> {
        self.0.get(&provider).map(String::as_str)
    }

    pub fn insert(&mut self, provider: ProviderId, secret: impl Into<String>) {
        let secret = secret.into();
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            self.0.remove(&provider);
        } else {
            self.0.insert(provider, trimmed.to_string());
        }
    }

    pub fn contains(&self, provider: ProviderId) -> bool {
        self.0.contains_key(&provider)
    }

    /// Providers among `wanted` that have no usable secret.
    pub fn missing_for(&self, wanted: &[ProviderId]) -> Vec<ProviderId> {
        wanted.iter().copied().filter(|p| !self.contains(*p)).collect()
    }
}

impl FromIterator<(ProviderId, String)> for Credentials {
    fn from_iter<T: IntoIterator<Item = (ProviderId, String)>>(iter: T) -> Self {
        let mut creds = Credentials::default();
        for (provider, secret) in iter {
            creds.insert(provider, secret);
        }
        creds
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: DbPool,
}

impl CredentialStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn get(&self, provider: ProviderId) -> Result<Option<String>> {
        let conn = self.pool.get().map_err(|err| anyhow!(err.to_string()))?;
        let secret: Option<String> = conn
            .query_row(
                "SELECT secret FROM ai_credentials WHERE provider_id = ?1",
                params![provider.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        secret.map(|s| decode_secret(&s)).transpose()
    }

    pub fn set(&self, provider: ProviderId, value: &str) -> Result<()> {
        let conn = self.pool.get().map_err(|err| anyhow!(err.to_string()))?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            conn.execute(
                "DELETE FROM ai_credentials WHERE provider_id = ?1",
                params![provider.as_str()],
            )?;
            return Ok(());
        }
        let encoded = B64_ENGINE.encode(trimmed.as_bytes());
        let now = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO ai_credentials (provider_id, secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(provider_id) DO UPDATE SET secret = excluded.secret, updated_at = excluded.updated_at",
            params![provider.as_str(), encoded, now],
        )?;
        Ok(())
    }

    pub fn get_all(&self) -> Result<Credentials> {
        let conn = self.pool.get().map_err(|err| anyhow!(err.to_string()))?;
        let mut stmt = conn.prepare("SELECT provider_id, secret FROM ai_credentials")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut creds = Credentials::default();
        for row in rows {
            let (provider_id, secret) = row?;
            // Rows for providers this build no longer knows are ignored.
            let Ok(provider) = provider_id.parse::<ProviderId>() else {
                continue;
            };
            creds.insert(provider, decode_secret(&secret)?);
        }
        Ok(creds)
    }
}

fn decode_secret(stored: &str) -> Result<String> {
    let decoded = B64_ENGINE
        .decode(stored.as_bytes())
        .map_err(|_| anyhow!("Failed to decode stored credential"))?;
    String::from_utf8(decoded).map_err(|_| anyhow!("Stored credential was not valid UTF-8"))
}
