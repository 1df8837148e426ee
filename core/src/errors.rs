use thiserror::Error;

use crate::agents::ProviderId;

/// Prefix shared by every transport-level failure shown to the user.
pub const TRANSPORT_FAILURE_PREFIX: &str = "오류가 발생했습니다: ";

#[derive(Debug, Error)]
pub enum TrilogueError {
    #[error("Prompt is empty")] EmptyPrompt,
    #[error("A turn is still awaiting responses")] TurnInFlight,
    #[error("먼저 설정에서 API 키를 모두 입력해주세요! (missing: {})", join_ids(.0))]
    MissingCredential(Vec<ProviderId>),
    #[error("Transcript has no pending assistant turn")] NoPendingTurn,
    #[error("Settlement does not match the pending turn: {0}")] InvalidSettlement(String),
    #[error("Database unavailable")] DbUnavailable,
    #[error(transparent)] Storage(#[from] anyhow::Error),
}

impl TrilogueError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "CHT-1001",
            Self::TurnInFlight => "CHT-1002",
            Self::MissingCredential(_) => "KEY-1001",
            Self::NoPendingTurn => "TRN-1001",
            Self::InvalidSettlement(_) => "TRN-1002",
            Self::DbUnavailable => "DB-1001",
            Self::Storage(_) => "GEN-1000",
        }
    }
    pub fn explain(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "Nothing was sent because the prompt only contained whitespace.",
            Self::TurnInFlight => "Only one turn may be in flight; wait for every provider to answer.",
            Self::MissingCredential(_) => "Every provider needs an API key before a turn can start.",
            Self::NoPendingTurn => "The last transcript entry is not the assistant turn being settled.",
            Self::InvalidSettlement(_) => "An assistant turn can only settle its own providers, once each.",
            Self::DbUnavailable => "The application could not access the SQLite database.",
            Self::Storage(_) => "An unspecified storage error occurred.",
        }
    }
}

/// Per-provider failure. `Display` is the exact text stored in a failed result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderFailure {
    #[error("오류가 발생했습니다: {0}")] Transport(String),
    #[error("{} 오류: {message}", .provider.vendor_label())]
    Upstream { provider: ProviderId, message: String },
    #[error("{message}")] Malformed { provider: ProviderId, message: &'static str },
}

impl ProviderFailure {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "NET-1001",
            Self::Upstream { .. } => "UPS-1001",
            Self::Malformed { .. } => "RSP-1001",
        }
    }
    pub fn explain(&self) -> &'static str {
        match self {
            Self::Transport(_) => "The request never produced a readable response.",
            Self::Upstream { .. } => "The provider answered with a structured error.",
            Self::Malformed { .. } => "The provider answered without the expected reply fields.",
        }
    }
}

fn join_ids(ids: &[ProviderId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}
