//! Append-only transcript of user and assistant turns.
//!
//! The only in-place mutation allowed is the single settlement of the most
//! recent assistant turn, and [`AssistantTurn::settle`] is the one place that
//! enforces what a settlement may change.

use std::collections::BTreeMap;

use anyhow::Context;
use r2d2_sqlite::rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::agents::ProviderId;
use crate::db::DbPool;
use crate::errors::TrilogueError;
use crate::logging::log_event;

/// Text stored for providers that were still pending when the app stopped.
pub const INTERRUPTED_MESSAGE: &str = "응답이 중단되었습니다.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub status: ResultStatus,
    pub text: String,
}

impl ProviderResult {
    pub fn pending() -> Self {
        Self { status: ResultStatus::Pending, text: String::new() }
    }

    pub fn done(text: impl Into<String>) -> Self {
        Self { status: ResultStatus::Done, text: text.into() }
    }

    pub fn failed(text: impl Into<String>) -> Self {
        Self { status: ResultStatus::Failed, text: text.into() }
    }

    pub fn is_settled(&self) -> bool {
        self.status != ResultStatus::Pending
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTurn {
    pub id: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl UserTurn {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssistantTurn {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub per_provider: BTreeMap<ProviderId, ProviderResult>,
}

impl AssistantTurn {
    /// A turn with every participant pending.
    pub fn placeholder(participants: &[ProviderId]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: OffsetDateTime::now_utc(),
            per_provider: participants
                .iter()
                .map(|p| (*p, ProviderResult::pending()))
                .collect(),
        }
    }

    pub fn providers(&self) -> impl Iterator<Item = ProviderId> + '_ {
        self.per_provider.keys().copied()
    }

    pub fn is_settled(&self) -> bool {
        self.per_provider.values().all(ProviderResult::is_settled)
    }

    /// Replace every pending result in one step.
    ///
    /// `results` must carry exactly this turn's providers, each settled, and
    /// none of the current entries may already be settled.
    pub fn settle(
        &mut self,
        results: BTreeMap<ProviderId, ProviderResult>,
    ) -> Result<(), TrilogueError> {
        if !results.keys().eq(self.per_provider.keys()) {
            return Err(TrilogueError::InvalidSettlement(format!(
                "expected providers {:?}, got {:?}",
                self.per_provider.keys().collect::<Vec<_>>(),
                results.keys().collect::<Vec<_>>()
            )));
        }
        if let Some((id, _)) = self.per_provider.iter().find(|(_, r)| r.is_settled()) {
            return Err(TrilogueError::InvalidSettlement(format!("{id} already settled")));
        }
        if let Some((id, _)) = results.iter().find(|(_, r)| !r.is_settled()) {
            return Err(TrilogueError::InvalidSettlement(format!("{id} is still pending")));
        }
        self.per_provider = results;
        Ok(())
    }

    /// Settle whatever is still pending with a failure message.
    fn abandon_pending(&mut self, message: &str) -> bool {
        let mut changed = false;
        for result in self.per_provider.values_mut() {
            if !result.is_settled() {
                *result = ProviderResult::failed(message);
                changed = true;
            }
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Turn {
    User(UserTurn),
    Assistant(AssistantTurn),
}

impl Turn {
    pub fn id(&self) -> &str {
        match self {
            Turn::User(t) => &t.id,
            Turn::Assistant(t) => &t.id,
        }
    }

    fn role(&self) -> &'static str {
        match self {
            Turn::User(_) => "user",
            Turn::Assistant(_) => "assistant",
        }
    }

    fn timestamp(&self) -> OffsetDateTime {
        match self {
            Turn::User(t) => t.timestamp,
            Turn::Assistant(t) => t.timestamp,
        }
    }
}

/// SQLite-backed transcript, ordered by insertion.
#[derive(Clone)]
pub struct TranscriptStore {
    pool: DbPool,
}

impl TranscriptStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn append(&self, turn: &Turn) -> Result<(), TrilogueError> {
        let conn = self.pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
        let body = serde_json::to_string(turn).context("failed to encode turn")?;
        conn.execute(
            "INSERT INTO transcript_turns (id, role, body, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![turn.id(), turn.role(), body, turn.timestamp().unix_timestamp()],
        )
        .context("failed to append turn")?;
        Ok(())
    }

    /// Commit the settlement of the most recent assistant turn.
    pub fn update_last(&self, turn: &AssistantTurn) -> Result<(), TrilogueError> {
        let mut conn = self.pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
        let tx = conn.transaction().context("failed to open transaction")?;
        let last: Option<(String, String, String)> = tx
            .query_row(
                "SELECT id, role, body FROM transcript_turns ORDER BY seq DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("failed to read last turn")?;

        let Some((id, role, body)) = last else {
            return Err(TrilogueError::NoPendingTurn);
        };
        if role != "assistant" || id != turn.id {
            return Err(TrilogueError::NoPendingTurn);
        }
        write_settlement(&tx, &id, &body, turn)?;
        tx.commit().context("failed to commit settlement")?;
        Ok(())
    }

    /// Settle an assistant turn wherever it sits in the transcript.
    ///
    /// Fallback for when `update_last` refused because other rows landed
    /// after the turn. Returns `false` if the turn is no longer stored.
    pub fn settle_by_id(&self, turn: &AssistantTurn) -> Result<bool, TrilogueError> {
        let mut conn = self.pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
        let tx = conn.transaction().context("failed to open transaction")?;
        let body: Option<String> = tx
            .query_row(
                "SELECT body FROM transcript_turns WHERE id = ?1 AND role = 'assistant'",
                params![turn.id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read turn")?;
        let Some(body) = body else {
            return Ok(false);
        };
        write_settlement(&tx, &turn.id, &body, turn)?;
        tx.commit().context("failed to commit settlement")?;
        Ok(true)
    }

    pub fn get_all(&self) -> Result<Vec<Turn>, TrilogueError> {
        let conn = self.pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
        let mut stmt = conn
            .prepare("SELECT body FROM transcript_turns ORDER BY seq ASC")
            .context("failed to query transcript")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("failed to query transcript")?;

        let mut turns = Vec::new();
        for row in rows {
            let body = row.context("failed to read turn")?;
            turns.push(serde_json::from_str(&body).context("failed to decode turn")?);
        }
        Ok(turns)
    }

    pub fn clear(&self) -> Result<(), TrilogueError> {
        let conn = self.pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
        let removed = conn
            .execute("DELETE FROM transcript_turns", [])
            .context("failed to clear transcript")?;
        if removed > 0 {
            let _ = log_event(
                &conn,
                "info",
                Some("TRN-0100"),
                "transcript",
                "transcript cleared",
                None,
                Some(json!({ "removed": removed })),
            );
        }
        Ok(())
    }

    /// Fail every provider still pending in any stored assistant turn.
    ///
    /// Returns the repaired turns in transcript order.
    pub fn recover_interrupted(&self) -> Result<Vec<AssistantTurn>, TrilogueError> {
        let mut conn = self.pool.get().map_err(|_| TrilogueError::DbUnavailable)?;
        let tx = conn.transaction().context("failed to open transaction")?;
        let rows: Vec<(String, String)> = {
            let mut stmt = tx
                .prepare("SELECT id, body FROM transcript_turns WHERE role = 'assistant' ORDER BY seq ASC")
                .context("failed to query assistant turns")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .context("failed to query assistant turns")?;
            rows.collect::<Result<_, _>>()
                .context("failed to read assistant turn")?
        };

        let mut repaired = Vec::new();
        for (id, body) in rows {
            let Turn::Assistant(mut turn) =
                serde_json::from_str::<Turn>(&body).context("failed to decode turn")?
            else {
                continue;
            };
            if !turn.abandon_pending(INTERRUPTED_MESSAGE) {
                continue;
            }
            let body = serde_json::to_string(&Turn::Assistant(turn.clone()))
                .context("failed to encode turn")?;
            tx.execute(
                "UPDATE transcript_turns SET body = ?1 WHERE id = ?2",
                params![body, id],
            )
            .context("failed to repair turn")?;
            let _ = log_event(
                &tx,
                "warn",
                Some("TRN-0101"),
                "transcript",
                "interrupted turn settled as failed",
                Some("The app stopped before every provider answered"),
                Some(json!({ "turn_id": id })),
            );
            repaired.push(turn);
        }
        tx.commit().context("failed to commit recovery")?;
        Ok(repaired)
    }
}

/// Apply `turn`'s results to the stored body of the same turn.
fn write_settlement(
    conn: &Connection,
    id: &str,
    stored_body: &str,
    turn: &AssistantTurn,
) -> Result<(), TrilogueError> {
    let mut stored = match serde_json::from_str::<Turn>(stored_body).context("failed to decode turn")? {
        Turn::Assistant(t) => t,
        Turn::User(_) => return Err(TrilogueError::NoPendingTurn),
    };
    stored.settle(turn.per_provider.clone())?;

    let body = serde_json::to_string(&Turn::Assistant(stored)).context("failed to encode turn")?;
    conn.execute(
        "UPDATE transcript_turns SET body = ?1 WHERE id = ?2",
        params![body, id],
    )
    .context("failed to settle turn")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;

    fn store() -> (tempfile::TempDir, TranscriptStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = init_db(dir.path().to_path_buf()).unwrap();
        (dir, TranscriptStore::new(pool))
    }

    fn settled(openai: &str) -> BTreeMap<ProviderId, ProviderResult> {
        BTreeMap::from([
            (ProviderId::OpenAi, ProviderResult::done(openai)),
            (ProviderId::Gemini, ProviderResult::failed("Gemini 오류: quota")),
            (ProviderId::Claude, ProviderResult::done("hello")),
        ])
    }

    #[test]
    fn settle_rejects_changed_key_set() {
        let mut turn = AssistantTurn::placeholder(&ProviderId::ALL);
        let mut results = settled("hi");
        results.remove(&ProviderId::Claude);
        assert!(matches!(turn.settle(results), Err(TrilogueError::InvalidSettlement(_))));
        assert!(!turn.is_settled());
    }

    #[test]
    fn settle_happens_exactly_once() {
        let mut turn = AssistantTurn::placeholder(&ProviderId::ALL);
        turn.settle(settled("first")).unwrap();
        assert!(turn.is_settled());
        let err = turn.settle(settled("second")).unwrap_err();
        assert!(matches!(err, TrilogueError::InvalidSettlement(_)));
        assert_eq!(turn.per_provider[&ProviderId::OpenAi].text, "first");
    }

    #[test]
    fn settle_rejects_pending_results() {
        let mut turn = AssistantTurn::placeholder(&ProviderId::ALL);
        let mut results = settled("hi");
        results.insert(ProviderId::Gemini, ProviderResult::pending());
        assert!(turn.settle(results).is_err());
    }

    #[test]
    fn turns_serialize_with_role_tag_and_rfc3339_timestamp() {
        let turn = Turn::User(UserTurn::new("hello"));
        let value = serde_json::to_value(&turn).unwrap();
        assert_eq!(value["role"], "user");
        assert_eq!(value["text"], "hello");
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));

        let assistant = Turn::Assistant(AssistantTurn::placeholder(&ProviderId::ALL));
        let value = serde_json::to_value(&assistant).unwrap();
        assert_eq!(value["per_provider"]["gemini"]["status"], "pending");
    }

    #[test]
    fn append_update_last_and_restore() {
        let (_dir, store) = store();
        let user = UserTurn::new("hello");
        let mut assistant = AssistantTurn::placeholder(&ProviderId::ALL);
        store.append(&Turn::User(user.clone())).unwrap();
        store.append(&Turn::Assistant(assistant.clone())).unwrap();

        assistant.settle(settled("Hi there")).unwrap();
        store.update_last(&assistant).unwrap();

        let turns = store.get_all().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0], Turn::User(user));
        assert_eq!(turns[1], Turn::Assistant(assistant.clone()));

        // A second settlement of the same turn is refused.
        assert!(store.update_last(&assistant).is_err());
    }

    #[test]
    fn update_last_requires_assistant_turn_at_the_end() {
        let (_dir, store) = store();
        let mut assistant = AssistantTurn::placeholder(&ProviderId::ALL);
        assistant.settle(settled("x")).unwrap();
        assert!(matches!(store.update_last(&assistant), Err(TrilogueError::NoPendingTurn)));

        store.append(&Turn::User(UserTurn::new("q"))).unwrap();
        assert!(matches!(store.update_last(&assistant), Err(TrilogueError::NoPendingTurn)));
    }

    #[test]
    fn clear_is_idempotent() {
        let (_dir, store) = store();
        store.append(&Turn::User(UserTurn::new("hello"))).unwrap();
        store.clear().unwrap();
        assert!(store.get_all().unwrap().is_empty());
        store.clear().unwrap();
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn recover_interrupted_fails_pending_providers() {
        let (_dir, store) = store();
        store.append(&Turn::User(UserTurn::new("hello"))).unwrap();
        store
            .append(&Turn::Assistant(AssistantTurn::placeholder(&ProviderId::ALL)))
            .unwrap();

        let repaired = store.recover_interrupted().unwrap();
        assert_eq!(repaired.len(), 1);
        assert!(repaired[0].is_settled());
        assert!(repaired[0]
            .per_provider
            .values()
            .all(|r| r.text == INTERRUPTED_MESSAGE));
        assert!(store.recover_interrupted().unwrap().is_empty());
    }

    #[test]
    fn pending_turn_behind_a_settled_one_is_still_recovered() {
        let (_dir, store) = store();
        let stuck = AssistantTurn::placeholder(&ProviderId::ALL);
        store.append(&Turn::User(UserTurn::new("first"))).unwrap();
        store.append(&Turn::Assistant(stuck.clone())).unwrap();

        let mut later = AssistantTurn::placeholder(&ProviderId::ALL);
        store.append(&Turn::User(UserTurn::new("second"))).unwrap();
        store.append(&Turn::Assistant(later.clone())).unwrap();
        later.settle(settled("ok")).unwrap();
        store.update_last(&later).unwrap();

        let repaired = store.recover_interrupted().unwrap();
        assert_eq!(repaired.len(), 1);
        assert_eq!(repaired[0].id, stuck.id);
        let turns = store.get_all().unwrap();
        assert!(turns.iter().all(|t| match t {
            Turn::Assistant(a) => a.is_settled(),
            Turn::User(_) => true,
        }));
        assert_eq!(turns[3], Turn::Assistant(later));
    }

    #[test]
    fn settle_by_id_reaches_a_turn_that_is_no_longer_last() {
        let (_dir, store) = store();
        let mut assistant = AssistantTurn::placeholder(&ProviderId::ALL);
        store.append(&Turn::User(UserTurn::new("hello"))).unwrap();
        store.append(&Turn::Assistant(assistant.clone())).unwrap();
        store.append(&Turn::User(UserTurn::new("typed mid-turn"))).unwrap();

        assistant.settle(settled("Hi there")).unwrap();
        assert!(matches!(store.update_last(&assistant), Err(TrilogueError::NoPendingTurn)));
        assert!(store.settle_by_id(&assistant).unwrap());
        assert_eq!(store.get_all().unwrap()[1], Turn::Assistant(assistant.clone()));

        store.clear().unwrap();
        assert!(!store.settle_by_id(&assistant).unwrap());
    }
}
