// ── Broadcast Engine: Error Types ──────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (I/O, DB, Provider, Config…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • `EngineError` → `String` conversion is provided via `Display`.
//   • No variant carries secret material (AI API keys, transport tokens).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// AI processor HTTP or API-level failure (non-secret detail only).
    #[error("AI processor error: {0}")]
    Provider(String),

    /// Messaging transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operator is not in the authorized set.
    #[error("Unauthorized")]
    Unauthorized,

    /// Input did not satisfy a flow step's expected grammar.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Several store methods (mirroring SessionStore in the teacher) still return
// Result<T, String>; this lets `?` lift them into EngineError at call sites.
impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl EngineError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Classify an AI-processor failure into the operator-facing category
    /// spec §6.1/§7 calls for: quota exhaustion vs connectivity vs other.
    pub fn friendly_ai_message(&self) -> String {
        let text = self.to_string().to_lowercase();
        if text.contains("429") || text.contains("exhausted") || text.contains("quota") {
            "The AI service quota is exhausted right now — try again later, or REGEN once it recovers.".to_string()
        } else if text.contains("timeout") || text.contains("timed out") || text.contains("socket hang up") || text.contains("connect") {
            "Could not reach the AI service (connectivity issue) — please retry.".to_string()
        } else {
            format!("AI service error: {self}")
        }
    }
}
