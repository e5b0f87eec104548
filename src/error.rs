//! Error types for the listing harvester.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised while loading identity profiles, proxies, and cookies.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors surfaced by a browser session.
///
/// Variants are distinguishable so callers can tell timeouts, missing
/// elements, failed navigations, and "page shows text X" apart.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Selector not found: {0}")]
    SelectorNotFound(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("Failed to launch session: {0}")]
    Launch(String),

    #[error("Operation not supported by this session: {0}")]
    Unsupported(String),

    #[error("Browser error: {0}")]
    Browser(String),
}

impl SessionError {
    /// Whether a retry on the same session has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::SelectorNotFound(_)
            | Self::Navigation(_)
            | Self::Network(_)
            | Self::Browser(_) => true,
            Self::HttpStatus(status) => *status == 403 || *status >= 500,
            Self::Launch(_) | Self::Unsupported(_) => false,
        }
    }
}

/// Outcome classification for a single task attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// Worth retrying locally on the same worker and session.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The identity has been told to stop. Never retried locally.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Not retryable on this worker; the task joins the failed set.
    #[error("Task failed: {0}")]
    Failed(String),
}

impl TaskError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

impl From<SessionError> for TaskError {
    fn from(err: SessionError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::Failed(err.to_string())
        }
    }
}

impl From<TranslateError> for TaskError {
    fn from(err: TranslateError) -> Self {
        match err {
            // Translator quotas are not identity quotas.
            TranslateError::RateLimited { .. }
            | TranslateError::RequestFailed { .. }
            | TranslateError::EmptyResponse { .. } => Self::Transient(err.to_string()),
            TranslateError::Client(_) => Self::Failed(err.to_string()),
        }
    }
}

/// Errors from partitioning work across identities.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DistributionError {
    #[error("No identities available for processing")]
    NoIdentities,

    #[error("No tasks to process")]
    NoTasks,
}

/// Durable snapshot errors. Logged, never fatal to the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// AI translator errors.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Empty response from {provider} for {step}")]
    EmptyResponse { provider: String, step: String },

    #[error("Client setup failed: {0}")]
    Client(String),
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("Failed to read attachment {path}: {source}")]
    Attachment {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SMTP send failed: {0}")]
    Send(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Run-level pipeline errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No identities passed the credential check")]
    NoHealthyIdentities,

    #[error("AI mode requested but no translator is configured")]
    TranslatorMissing,

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
}
