mod render;

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use directories::ProjectDirs;
use log::LevelFilter;
use tokio::io::{stdin, AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::mpsc;
use trilogue_core::agents::{build_http_client, FanOutOrchestrator, ProviderId};
use trilogue_core::api::v1::{self, ApiState, ChatSubmitInput, ChatSubmitOutput, SaveCredentialsInput};
use trilogue_core::db::init_db;
use trilogue_core::session::{ChatSession, SessionPhase};

use render::TerminalSink;

type InputLines = Lines<BufReader<Stdin>>;

fn workspace_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("TRILOGUE_HOME") {
        return PathBuf::from(home);
    }
    if let Some(proj) = ProjectDirs::from("com", "Trilogue", "Trilogue") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("Trilogue")
    }
}

fn init_logger(workspace: &Path) {
    use log4rs::append::file::FileAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    let config_path = std::env::var("LOG4RS_CONFIG").unwrap_or_else(|_| "log4rs.yaml".to_string());
    if log4rs::init_file(&config_path, Default::default()).is_ok() {
        return;
    }

    let pattern = "{d(%Y-%m-%d %H:%M:%S)} [{l}] {t} - {m}{n}";
    let logfile = match FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build(workspace.join("logs").join("trilogue.log"))
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("[INIT] Failed to create log file: {e}");
            return;
        }
    };

    let config = match Config::builder()
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .build(Root::builder().appender("logfile").build(LevelFilter::Debug))
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[INIT] Failed to build logger config: {e}");
            return;
        }
    };

    if let Err(e) = log4rs::init_config(config) {
        eprintln!("[INIT] Failed to initialize logger: {e}");
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Empty,
    Keys,
    Clear,
    History,
    Events,
    Quit,
    Unknown(String),
    Prompt(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Self::Empty;
        }
        match trimmed {
            "/keys" => Self::Keys,
            "/clear" => Self::Clear,
            "/history" => Self::History,
            "/events" => Self::Events,
            "/quit" | "/exit" => Self::Quit,
            other if other.starts_with('/') && !other.contains(char::is_whitespace) => {
                Self::Unknown(other.to_string())
            }
            _ => Self::Prompt(line.to_string()),
        }
    }
}

const HELP: &str = "ChatGPT, Gemini, Claude를 한번에\n\
    명령: /keys API 키 설정, /clear 대화 초기화, /history 전체 보기, /events 최근 호출 기록, /quit 종료";

#[tokio::main]
async fn main() -> Result<()> {
    let workspace = workspace_dir();
    std::fs::create_dir_all(&workspace)?;
    init_logger(&workspace);
    log::info!("workspace: {}", workspace.display());

    let db = init_db(workspace)?;
    let client = build_http_client()?;
    let (keys_tx, mut keys_rx) = mpsc::unbounded_channel();
    let sink = Arc::new(TerminalSink::new(keys_tx));
    let orchestrator = FanOutOrchestrator::from_settings(db.clone(), &client, sink)?;
    let state = ApiState {
        db,
        orchestrator: Arc::new(orchestrator),
        session: Arc::new(ChatSession::new()),
    };

    let status = v1::db_status(&state).map_err(anyhow::Error::msg)?;
    log::info!("database ready: {}", status["tables"]);
    for turn in v1::chat_recover(&state).await.map_err(anyhow::Error::msg)? {
        log::warn!("turn {} was interrupted by the previous run", turn.id);
    }
    println!("{HELP}\n");
    render::print_transcript(&v1::chat_history(&state).await.map_err(anyhow::Error::msg)?);

    let mut lines = BufReader::new(stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match Command::parse(&line) {
                    Command::Empty => {}
                    Command::Quit => break,
                    Command::Keys => {
                        if v1::open_credentials(&state) == SessionPhase::CredentialsRequired {
                            enter_keys(&state, &mut lines, &[]).await?;
                        } else {
                            println!("응답을 기다리는 중에는 키를 바꿀 수 없습니다.");
                        }
                    }
                    Command::Clear => {
                        if let Err(err) = v1::chat_clear(&state).await {
                            println!("{err}");
                        }
                    }
                    Command::History => match v1::chat_history(&state).await {
                        Ok(turns) => render::print_transcript(&turns),
                        Err(err) => println!("{err}"),
                    },
                    Command::Events => print_events(&state).await,
                    Command::Unknown(name) => println!("알 수 없는 명령: {name}\n{HELP}"),
                    Command::Prompt(prompt) => spawn_turn(&state, prompt),
                }
            }
            Some(missing) = keys_rx.recv() => {
                if v1::session_phase(&state) == SessionPhase::CredentialsRequired {
                    enter_keys(&state, &mut lines, &missing).await?;
                }
            }
        }
    }
    log::info!("shutting down");
    Ok(())
}

/// Run one turn in the background so the input loop keeps reading. Lines
/// typed meanwhile are refused by the session and dropped.
fn spawn_turn(state: &ApiState, prompt: String) {
    if state.session.is_awaiting_turn() {
        log::debug!("input ignored while a turn is in flight");
        return;
    }
    let state = state.clone();
    tokio::spawn(async move {
        match v1::chat_submit(&state, ChatSubmitInput { prompt }).await {
            Ok(ChatSubmitOutput::Settled { .. }) => {}
            Ok(ChatSubmitOutput::Refused { code, message, explain, .. }) => {
                log::debug!("submission refused ({code}): {message} {explain}");
            }
            Err(err) => {
                log::error!("turn failed: {err}");
                println!("{err}");
            }
        }
    });
}

/// Credential entry screen. Blank input keeps the stored key.
async fn enter_keys(state: &ApiState, lines: &mut InputLines, missing: &[ProviderId]) -> Result<()> {
    let statuses = v1::credentials_status(state).await.map_err(anyhow::Error::msg)?;
    println!("\nAPI 키 설정");
    let mut keys = BTreeMap::new();
    for status in statuses {
        let mark = if missing.contains(&status.provider) || !status.has_key {
            "필요"
        } else {
            "저장됨"
        };
        println!("{} ({mark})", status.display_name);
        if let Some(description) = &status.description {
            println!("  {description}");
        }
        if let Some(url) = &status.key_url {
            println!("  발급받기 → {url}");
        }
        print!("  키 입력 (Enter: 유지): ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            v1::close_credentials(state);
            return Ok(());
        };
        let line = line.trim();
        if !line.is_empty() {
            keys.insert(status.provider, line.to_string());
        }
    }

    let saved = v1::save_credentials(state, SaveCredentialsInput { keys })
        .await
        .map_err(anyhow::Error::msg)?;
    let still_missing: Vec<String> = saved
        .iter()
        .filter(|s| !s.has_key)
        .map(|s| s.display_name.clone())
        .collect();
    if still_missing.is_empty() {
        println!("저장했습니다. 세 AI에게 동시에 질문해보세요!\n");
    } else {
        println!("저장했습니다. 아직 키가 없는 AI: {}\n", still_missing.join(", "));
    }
    Ok(())
}

async fn print_events(state: &ApiState) {
    match v1::list_ai_events(state, Some(20)).await {
        Ok(events) if events.is_empty() => println!("기록된 호출이 없습니다."),
        Ok(events) => {
            for event in events {
                let data = event.data.unwrap_or(serde_json::Value::Null);
                println!(
                    "{} [{}] {} {} {} {}",
                    event.ts,
                    event.level,
                    event.code.as_deref().unwrap_or("-"),
                    data["provider"].as_str().unwrap_or("-"),
                    data["status"].as_str().unwrap_or("-"),
                    event.message,
                );
            }
        }
        Err(err) => println!("{err}"),
    }
}
