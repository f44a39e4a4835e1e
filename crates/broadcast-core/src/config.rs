// Engine configuration — operator identity, chat targets, pricing, and
// timing defaults (spec §3, §4.6, §9). Grounded on the teacher's per-channel
// config structs (e.g. engine/whatsapp.rs's WhatsAppConfig): a plain,
// serde-derived record with a `Default` impl, loaded from a TOML file on
// disk rather than environment variables.

use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The line every level-3 ("urgent") draft must carry. The AI processor is
/// expected to include it; the engine double-checks (see `ai_client`).
pub const TOP_PICK_MARKER: &str = "\u{2b50} TOP PICK";

/// Default minimum spacing between two sends to the same target, used both
/// by the default schedule offset (`/schedule` with no argument) and by the
/// Queue Dispatcher's pacing guard (spec §4.6).
pub const DEFAULT_MIN_INTERVAL_MINUTES: i64 = 47;

/// Default absolute expiry for a FlowState row when none is configured
/// (spec §4.3).
pub const DEFAULT_STATE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Operator phone numbers / JIDs authorized to drive the bot (spec §4.7).
    pub operator_ids: Vec<String>,
    /// Production chat group id the bot broadcasts into.
    pub production_chat_id: String,
    /// Dev/staging chat group id, used for `/senddev` and `/scheduledev`.
    pub dev_chat_id: String,
    /// Flat markup applied on top of a supplier's listed price (spec §3.3).
    #[serde(default)]
    pub currency_markup: i64,
    /// Minimum minutes between two sends to the same target.
    #[serde(default = "default_min_interval")]
    pub min_interval_minutes: i64,
    /// FlowState TTL in minutes.
    #[serde(default = "default_state_ttl")]
    pub state_ttl_minutes: i64,
    /// Directory the Media Cache writes downloaded/generated files under.
    pub media_dir: PathBuf,
    /// Path to the SQLite database file.
    pub database_path: PathBuf,
    /// Base URL of the AI Processor HTTP service.
    pub ai_processor_url: String,
}

fn default_min_interval() -> i64 {
    DEFAULT_MIN_INTERVAL_MINUTES
}

fn default_state_ttl() -> i64 {
    DEFAULT_STATE_TTL_MINUTES
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            operator_ids: Vec::new(),
            production_chat_id: String::new(),
            dev_chat_id: String::new(),
            currency_markup: 0,
            min_interval_minutes: DEFAULT_MIN_INTERVAL_MINUTES,
            state_ttl_minutes: DEFAULT_STATE_TTL_MINUTES,
            media_dir: PathBuf::from("media"),
            database_path: PathBuf::from("broadcast.db"),
            ai_processor_url: "http://127.0.0.1:8090".into(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {e}", path.display())))?;
        let config: EngineConfig =
            toml::from_str(&text).map_err(|e| EngineError::Config(format!("parsing {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn is_operator(&self, id: &str) -> bool {
        self.operator_ids.iter().any(|o| o == id)
    }

    fn validate(&self) -> EngineResult<()> {
        if self.production_chat_id.is_empty() {
            return Err(EngineError::Config("production_chat_id must not be empty".into()));
        }
        if self.min_interval_minutes < 0 {
            return Err(EngineError::Config("min_interval_minutes must be >= 0".into()));
        }
        Ok(())
    }
}

/// Runtime-mutable mirror of the two chat targets, seeded from
/// `EngineConfig` at startup. `/setgroup` (spec §6.3) rebinds a target for
/// the life of the process without touching the on-disk config file, so
/// the Router and the Queue Dispatcher share one registry rather than each
/// reading `EngineConfig`'s fixed fields.
pub struct GroupRegistry {
    production: parking_lot::RwLock<String>,
    dev: parking_lot::RwLock<String>,
}

impl GroupRegistry {
    pub fn new(config: &EngineConfig) -> Self {
        GroupRegistry {
            production: parking_lot::RwLock::new(config.production_chat_id.clone()),
            dev: parking_lot::RwLock::new(config.dev_chat_id.clone()),
        }
    }

    pub fn get(&self, target: crate::types::ChatTarget) -> String {
        match target {
            crate::types::ChatTarget::Production => self.production.read().clone(),
            crate::types::ChatTarget::Dev => self.dev.read().clone(),
        }
    }

    pub fn set(&self, target: crate::types::ChatTarget, chat_id: String) {
        match target {
            crate::types::ChatTarget::Production => *self.production.write() = chat_id,
            crate::types::ChatTarget::Dev => *self.dev.write() = chat_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_well_formed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            operator_ids = ["+1555"]
            production_chat_id = "grp-prod"
            dev_chat_id = "grp-dev"
            media_dir = "media"
            database_path = "broadcast.db"
            ai_processor_url = "http://localhost:9000"
            "#,
        )
        .unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.min_interval_minutes, DEFAULT_MIN_INTERVAL_MINUTES);
        assert!(cfg.is_operator("+1555"));
        assert!(!cfg.is_operator("+1999"));
    }

    #[test]
    fn rejects_missing_production_chat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            operator_ids = []
            production_chat_id = ""
            dev_chat_id = ""
            media_dir = "media"
            database_path = "broadcast.db"
            ai_processor_url = "http://localhost:9000"
            "#,
        )
        .unwrap();
        assert!(EngineConfig::load(&path).is_err());
    }
}
