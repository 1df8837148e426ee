use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The three providers every turn fans out to.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    #[default]
    OpenAi,
    Gemini,
    Claude,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::OpenAi, ProviderId::Gemini, ProviderId::Claude];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::OpenAi => "ChatGPT",
            Self::Gemini => "Gemini",
            Self::Claude => "Claude",
        }
    }

    /// Vendor label used as the prefix of provider error messages.
    pub fn vendor_label(&self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Gemini => "Gemini",
            Self::Claude => "Claude",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" | "gpt" | "chatgpt" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            "claude" | "anthropic" => Ok(Self::Claude),
            other => Err(format!("Unknown AI provider: {other}")),
        }
    }
}

/// Whether a provider is called directly or through the local intermediary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderRoute {
    Direct,
    Proxy,
}

impl ProviderRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proxy => "proxy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "direct" => Some(Self::Direct),
            "proxy" => Some(Self::Proxy),
            _ => None,
        }
    }
}

pub struct ProviderSeed {
    pub id: ProviderId,
    pub description: &'static str,
    pub key_url: &'static str,
    pub base_url: &'static str,
    pub model: &'static str,
    pub route: ProviderRoute,
}

pub const PROVIDER_SEEDS: &[ProviderSeed] = &[
    ProviderSeed {
        id: ProviderId::OpenAi,
        description: "가장 대중적인 AI 모델",
        key_url: "https://platform.openai.com/api-keys",
        base_url: "https://api.openai.com",
        model: "gpt-4o-mini",
        route: ProviderRoute::Direct,
    },
    ProviderSeed {
        id: ProviderId::Gemini,
        description: "구글의 최신 AI 모델",
        key_url: "https://aistudio.google.com/app/apikey",
        base_url: "https://generativelanguage.googleapis.com",
        model: "gemini-pro",
        route: ProviderRoute::Direct,
    },
    ProviderSeed {
        id: ProviderId::Claude,
        description: "안전하고 정확한 AI",
        key_url: "https://console.anthropic.com/settings/keys",
        base_url: "http://127.0.0.1:3000",
        model: "claude-3-5-sonnet-20241022",
        route: ProviderRoute::Proxy,
    },
];
