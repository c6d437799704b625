//! Configuration types.
//!
//! The pipeline reads a JSON file (see `leadflow.example.json`) and then lets
//! environment variables override paths and secrets.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Default config file location when neither `--config` nor `LEADFLOW_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "./leadflow.json";

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub quarantine: QuarantineConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub drafting: DraftingConfig,
    #[serde(default)]
    pub research: ResearchConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    #[serde(default)]
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/leadflow.db")
}

/// A monitored mailbox.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub email: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub imap: Option<ImapSettings>,
    #[serde(default)]
    pub features: AccountFeatures,
}

fn default_folder() -> String {
    "INBOX".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    /// Name of the environment variable holding the password.
    pub password_env: String,
}

fn default_imap_port() -> u16 {
    993
}

/// Per-account pipeline switches. Everything defaults on.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AccountFeatures {
    #[serde(default = "yes")]
    pub scoring: bool,
    #[serde(default = "yes")]
    pub labels: bool,
    #[serde(default = "yes")]
    pub stage_tracking: bool,
    #[serde(default = "yes")]
    pub draft_generation: bool,
    #[serde(default = "yes")]
    pub escalation: bool,
}

impl Default for AccountFeatures {
    fn default() -> Self {
        Self {
            scoring: true,
            labels: true,
            stage_tracking: true,
            draft_generation: true,
            escalation: true,
        }
    }
}

fn yes() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuarantineConfig {
    #[serde(default = "default_scanner_model")]
    pub scanner_model: String,
    /// Scanner failure holds the message. Setting this to false lets
    /// unscannable mail through with a warning.
    #[serde(default = "yes")]
    pub fail_closed: bool,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            scanner_model: default_scanner_model(),
            fail_closed: true,
        }
    }
}

fn default_scanner_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_scoring_model")]
    pub model: String,
    #[serde(default = "default_rubric_path")]
    pub rubric_path: PathBuf,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            model: default_scoring_model(),
            rubric_path: default_rubric_path(),
        }
    }
}

fn default_scoring_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_rubric_path() -> PathBuf {
    PathBuf::from("./config/rubric.md")
}

#[derive(Debug, Clone, Deserialize)]
pub struct DraftingConfig {
    #[serde(default = "default_scoring_model")]
    pub writer_model: String,
    #[serde(default = "default_scanner_model")]
    pub reviewer_model: String,
    #[serde(default = "default_templates_dir")]
    pub templates_dir: PathBuf,
}

impl Default for DraftingConfig {
    fn default() -> Self {
        Self {
            writer_model: default_scoring_model(),
            reviewer_model: default_scanner_model(),
            templates_dir: default_templates_dir(),
        }
    }
}

fn default_templates_dir() -> PathBuf {
    PathBuf::from("./templates")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResearchConfig {
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_max_page_size_kb")]
    pub max_page_size_kb: u64,
    #[serde(default = "default_cache_days")]
    pub cache_days: i64,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: default_fetch_timeout_ms(),
            max_page_size_kb: default_max_page_size_kb(),
            cache_days: default_cache_days(),
        }
    }
}

impl ResearchConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

fn default_fetch_timeout_ms() -> u64 {
    5000
}
fn default_max_page_size_kb() -> u64 {
    512
}

/// Upper bound for day-count settings (ten years).
const MAX_DAYS: i64 = 3650;

fn default_cache_days() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_emails_per_poll")]
    pub max_emails_per_poll: usize,
    #[serde(default = "default_backfill_days")]
    pub backfill_days: i64,
    #[serde(default = "default_max_backfill")]
    pub max_backfill: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_alert_after_failures")]
    pub alert_after_failures: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_emails_per_poll: default_max_emails_per_poll(),
            backfill_days: default_backfill_days(),
            max_backfill: default_max_backfill(),
            retry_attempts: default_retry_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            alert_after_failures: default_alert_after_failures(),
        }
    }
}

fn default_interval_secs() -> u64 {
    300
}
fn default_max_emails_per_poll() -> usize {
    50
}
fn default_backfill_days() -> i64 {
    90
}
fn default_max_backfill() -> usize {
    25
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_alert_after_failures() -> u32 {
    3
}

/// Outbound notification / task-system endpoints. Secrets come from env.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EscalationConfig {
    #[serde(default)]
    pub tasks_url: Option<String>,
    #[serde(skip)]
    pub telegram: Option<TelegramSettings>,
}

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: SecretString,
    pub chat_id: String,
}

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    #[default]
    Anthropic,
    OpenAi,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub backend: LlmBackend,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub api_key: Option<SecretString>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            backend: LlmBackend::default(),
            timeout_secs: default_llm_timeout_secs(),
            api_key: None,
        }
    }
}

impl LlmSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_llm_timeout_secs() -> u64 {
    60
}

impl PipelineConfig {
    /// Parse a JSON document. No env overrides, no validation.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from a file, apply env overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::MissingRequired {
                    key: path.display().to_string(),
                    hint: "Create it from leadflow.example.json or pass --config".to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        let mut config = Self::from_json(&text)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Resolve the config path from an explicit flag, `LEADFLOW_CONFIG`, or the default.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("LEADFLOW_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Overlay environment variables onto the parsed file.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("LEADFLOW_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }

        let key_var = match self.llm.backend {
            LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
            LlmBackend::OpenAi => "OPENAI_API_KEY",
        };
        if let Ok(key) = std::env::var(key_var) {
            self.llm.api_key = Some(SecretString::from(key));
        }

        if let (Ok(token), Ok(chat)) = (
            std::env::var("LEADFLOW_TELEGRAM_TOKEN"),
            std::env::var("LEADFLOW_TELEGRAM_CHAT"),
        ) {
            self.escalation.telegram = Some(TelegramSettings {
                bot_token: SecretString::from(token),
                chat_id: chat,
            });
        }

        if let Ok(url) = std::env::var("LEADFLOW_TASKS_URL") {
            self.escalation.tasks_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "accounts".into(),
                message: "at least one account is required".into(),
            });
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "accounts".into(),
                    message: format!("duplicate account id '{}'", account.id),
                });
            }
        }

        if self.polling.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "polling.retry_attempts".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.polling.max_emails_per_poll == 0 {
            return Err(ConfigError::InvalidValue {
                key: "polling.max_emails_per_poll".into(),
                message: "must be at least 1".into(),
            });
        }
        if !(0..=MAX_DAYS).contains(&self.research.cache_days) {
            return Err(ConfigError::InvalidValue {
                key: "research.cache_days".into(),
                message: format!("must be between 0 and {MAX_DAYS}"),
            });
        }
        if !(1..=MAX_DAYS).contains(&self.polling.backfill_days) {
            return Err(ConfigError::InvalidValue {
                key: "polling.backfill_days".into(),
                message: format!("must be between 1 and {MAX_DAYS}"),
            });
        }
        Ok(())
    }

    pub fn account(&self, id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }
}
