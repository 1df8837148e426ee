//! End-to-end turns: real adapters, mock providers, SQLite transcript.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use trilogue_core::agents::config::{self, ProviderUpdate};
use trilogue_core::agents::{build_http_client, FanOutOrchestrator, ProviderId};
use trilogue_core::db::{init_db, DbPool};
use trilogue_core::errors::{TrilogueError, TRANSPORT_FAILURE_PREFIX};
use trilogue_core::render::NullSink;
use trilogue_core::session::{ChatSession, SessionPhase};
use trilogue_core::transcript::{ProviderResult, ResultStatus, TranscriptStore, Turn, INTERRUPTED_MESSAGE};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn point_at(pool: &DbPool, provider: ProviderId, base_url: &str) {
    let conn = pool.get().unwrap();
    config::update_provider(
        &conn,
        ProviderUpdate {
            provider_id: provider,
            base_url: Some(base_url.to_string()),
            ..Default::default()
        },
    )
    .unwrap();
}

fn orchestrator(pool: &DbPool) -> FanOutOrchestrator {
    let client = build_http_client().unwrap();
    let orchestrator = FanOutOrchestrator::from_settings(pool.clone(), &client, Arc::new(NullSink)).unwrap();
    for provider in ProviderId::ALL {
        orchestrator.credentials().set(provider, "test-key").unwrap();
    }
    orchestrator
}

async fn mount_openai(server: &MockServer, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"choices": [{"message": {"role": "assistant", "content": "Hi there"}}]}))
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn one_slow_failure_does_not_block_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_db(dir.path().to_path_buf()).unwrap();
    let server = MockServer::start().await;
    mount_openai(&server, Duration::ZERO).await;
    Mock::given(method("POST"))
        .and(path("/api/claude"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "msg_1", "type": "message"})))
        .mount(&server)
        .await;

    point_at(&pool, ProviderId::OpenAi, &server.uri());
    point_at(&pool, ProviderId::Gemini, "http://127.0.0.1:1");
    point_at(&pool, ProviderId::Claude, &server.uri());
    let orchestrator = orchestrator(&pool);
    let session = ChatSession::new();

    let turn = orchestrator.submit(&session, "hello").await.unwrap();

    assert_eq!(turn.per_provider[&ProviderId::OpenAi], ProviderResult::done("Hi there"));
    let gemini = &turn.per_provider[&ProviderId::Gemini];
    assert_eq!(gemini.status, ResultStatus::Failed);
    assert!(gemini.text.starts_with(TRANSPORT_FAILURE_PREFIX));
    assert_eq!(
        turn.per_provider[&ProviderId::Claude],
        ProviderResult::failed("Claude에서 content가 없는 응답을 받았습니다.")
    );

    let turns = orchestrator.transcript().get_all().unwrap();
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[1], Turn::Assistant(turn));
    assert_eq!(session.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn second_submission_during_a_turn_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_db(dir.path().to_path_buf()).unwrap();
    let server = MockServer::start().await;
    mount_openai(&server, Duration::from_millis(300)).await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-pro:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "b"}]}}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/claude"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": [{"type": "text", "text": "c"}]})))
        .mount(&server)
        .await;
    for provider in ProviderId::ALL {
        point_at(&pool, provider, &server.uri());
    }
    let orchestrator = orchestrator(&pool);
    let session = ChatSession::new();

    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        orchestrator.submit(&session, "second").await
    };
    let (first, second) = tokio::join!(orchestrator.submit(&session, "first"), second);

    assert!(first.unwrap().is_settled());
    assert!(matches!(second, Err(TrilogueError::TurnInFlight)));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
    let turns = orchestrator.transcript().get_all().unwrap();
    assert_eq!(turns.len(), 2);
    assert!(matches!(&turns[0], Turn::User(u) if u.text == "first"));
}

#[tokio::test]
async fn turn_left_pending_is_settled_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_db(dir.path().to_path_buf()).unwrap();
    let store = TranscriptStore::new(pool.clone());
    let placeholder = trilogue_core::transcript::AssistantTurn::placeholder(&ProviderId::ALL);
    store
        .append(&Turn::User(trilogue_core::transcript::UserTurn::new("hello")))
        .unwrap();
    store.append(&Turn::Assistant(placeholder.clone())).unwrap();

    let recovered = store.recover_interrupted().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, placeholder.id);
    assert!(recovered[0]
        .per_provider
        .values()
        .all(|r| *r == ProviderResult::failed(INTERRUPTED_MESSAGE)));
    assert!(store.recover_interrupted().unwrap().is_empty());
}
