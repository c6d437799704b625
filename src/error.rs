//! Error types for leadflow.

use std::net::IpAddr;
use std::time::Duration;

/// Top-level error type for the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Research error: {0}")]
    Research(#[from] ResearchError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Draft error: {0}")]
    Draft(#[from] DraftError),

    #[error("Escalation error: {0}")]
    Escalation(#[from] EscalationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Model {model} timed out after {timeout:?}")]
    Timeout { model: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Model {model} not available on provider {provider}")]
    ModelNotAvailable { provider: String, model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A model answered, but the answer is missing or malformed for a
/// safety-relevant field. Never papered over with a default.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("{component}: malformed model response: {reason}")]
    MalformedResponse { component: String, reason: String },

    #[error("{component}: missing required field `{field}`")]
    MissingField { component: String, field: String },

    #[error("{component}: field `{field}` out of range: {value}")]
    OutOfRange {
        component: String,
        field: String,
        value: String,
    },
}

/// State-integrity violations. Rejected with no partial mutation.
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    #[error(
        "Illegal stage transition for message {message_id}: {from} -> {to} (allowed: {allowed})"
    )]
    IllegalTransition {
        message_id: String,
        from: String,
        to: String,
        allowed: String,
    },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),
}

/// Domain research errors.
#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Domain {domain} resolves to a forbidden address: {addresses:?}")]
    SsrfBlocked {
        domain: String,
        addresses: Vec<IpAddr>,
    },

    #[error("DNS resolution failed for {domain}: {reason}")]
    Resolve { domain: String, reason: String },

    #[error("Fetch failed for {domain}: {reason}")]
    Fetch { domain: String, reason: String },

    #[error("Page for {domain} exceeds {limit_kb} KB")]
    TooLarge { domain: String, limit_kb: u64 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Mail-source errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    #[error("IMAP login failed for account {account}")]
    LoginFailed { account: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Message uid {uid} not found for account {account}")]
    NotFound { account: String, uid: u32 },

    #[error("Failed to parse message uid {uid}: {reason}")]
    Parse { uid: u32, reason: String },

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Draft generation errors.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("No template for account {account}, bucket {bucket}")]
    TemplateMissing { account: String, bucket: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Escalation channel errors.
#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("Notification failed: {0}")]
    Notify(String),

    #[error("Task creation failed: {0}")]
    Task(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Pipeline-related errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Quarantine failed for {message_id}: {reason}")]
    Quarantine { message_id: String, reason: String },

    #[error("Scoring failed for {message_id}: {reason}")]
    Scoring { message_id: String, reason: String },

    #[error("Poll of account {account} failed after {attempts} attempts: {reason}")]
    PollExhausted {
        account: String,
        attempts: u32,
        reason: String,
    },

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),
}

/// Result type alias for the pipeline.
pub type Result<T> = std::result::Result<T, Error>;
