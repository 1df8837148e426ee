//! Terminal rendering of the transcript.

use std::fmt::Write as _;

use tokio::sync::mpsc::UnboundedSender;
use trilogue_core::agents::ProviderId;
use trilogue_core::render::RenderSink;
use trilogue_core::transcript::{AssistantTurn, ResultStatus, Turn};

const PENDING_TEXT: &str = "응답을 기다리는 중...";

/// Prints transcript changes to stdout and forwards credential refusals to
/// the input loop, which owns stdin.
pub struct TerminalSink {
    keys_needed: UnboundedSender<Vec<ProviderId>>,
}

impl TerminalSink {
    pub fn new(keys_needed: UnboundedSender<Vec<ProviderId>>) -> Self {
        Self { keys_needed }
    }
}

impl RenderSink for TerminalSink {
    fn transcript_changed(&self, turns: &[Turn]) {
        match turns.last() {
            None => println!("{}", empty_state()),
            Some(Turn::Assistant(turn)) => println!("{}", format_assistant(turn)),
            Some(Turn::User(_)) => {}
        }
    }

    fn credentials_required(&self, missing: &[ProviderId]) {
        let names: Vec<&str> = missing.iter().map(|p| p.display_name()).collect();
        println!("먼저 설정에서 API 키를 모두 입력해주세요! ({})", names.join(", "));
        if self.keys_needed.send(missing.to_vec()).is_err() {
            log::warn!("input loop is gone; credential prompt dropped");
        }
    }
}

pub fn empty_state() -> &'static str {
    "세 AI에게 동시에 질문해보세요!\n하나의 질문으로 다양한 관점을 얻을 수 있습니다."
}

pub fn format_turn(turn: &Turn) -> String {
    match turn {
        Turn::User(user) => format!("나> {}", user.text),
        Turn::Assistant(assistant) => format_assistant(assistant),
    }
}

/// One block per provider, in the fixed provider order.
pub fn format_assistant(turn: &AssistantTurn) -> String {
    let mut out = String::new();
    for (provider, result) in &turn.per_provider {
        let body = match result.status {
            ResultStatus::Pending => PENDING_TEXT,
            ResultStatus::Done | ResultStatus::Failed => result.text.as_str(),
        };
        let marker = if result.status == ResultStatus::Failed { "!" } else { " " };
        let _ = writeln!(out, "{marker}[{}]", provider.display_name());
        for line in body.lines() {
            let _ = writeln!(out, "    {line}");
        }
    }
    out
}

pub fn print_transcript(turns: &[Turn]) {
    if turns.is_empty() {
        println!("{}", empty_state());
        return;
    }
    for turn in turns {
        println!("{}", format_turn(turn));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use trilogue_core::transcript::{ProviderResult, UserTurn};

    #[test]
    fn placeholder_shows_every_provider_waiting() {
        let turn = AssistantTurn::placeholder(&ProviderId::ALL);
        let text = format_assistant(&turn);
        assert_eq!(text.matches(PENDING_TEXT).count(), 3);
        let chatgpt = text.find("[ChatGPT]").unwrap();
        let gemini = text.find("[Gemini]").unwrap();
        let claude = text.find("[Claude]").unwrap();
        assert!(chatgpt < gemini && gemini < claude);
    }

    #[test]
    fn failures_are_marked() {
        let mut turn = AssistantTurn::placeholder(&[ProviderId::OpenAi, ProviderId::Gemini]);
        let results = BTreeMap::from([
            (ProviderId::OpenAi, ProviderResult::done("Hi there")),
            (ProviderId::Gemini, ProviderResult::failed("오류가 발생했습니다: timeout")),
        ]);
        turn.settle(results).unwrap();

        let text = format_assistant(&turn);
        assert!(text.contains(" [ChatGPT]\n    Hi there"));
        assert!(text.contains("![Gemini]\n    오류가 발생했습니다: timeout"));
        assert!(!text.contains(PENDING_TEXT));
    }

    #[test]
    fn user_turn_is_prefixed() {
        let turn = Turn::User(UserTurn::new("hello"));
        assert_eq!(format_turn(&turn), "나> hello");
    }

    #[test]
    fn refusal_is_forwarded_to_input_loop() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = TerminalSink::new(tx);
        sink.credentials_required(&[ProviderId::Claude]);
        assert_eq!(rx.try_recv().unwrap(), vec![ProviderId::Claude]);
    }
}
