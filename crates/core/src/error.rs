use thiserror::Error;

/// Error taxonomy by kind, not by origin — every variant maps to a log
/// entry, a pub/sub event, or a status transition on the owning query.
#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("upstream returned status {status}")]
    ResponseStatus { status: u16 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid url: {0}")]
    Validation(String),

    #[error("duplicate query: {0}")]
    Uniqueness(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("publisher unavailable: {0}")]
    PublisherUnavailable(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl NotifierError {
    /// Name used in `request_url_error` publications (§6.2) — stable
    /// regardless of the underlying Display message.
    pub fn kind_name(&self) -> &'static str {
        match self {
            NotifierError::Network(_) => "Network",
            NotifierError::Timeout(_) => "Timeout",
            NotifierError::ResponseStatus { .. } => "ResponseStatus",
            NotifierError::Parse(_) => "Parse",
            NotifierError::Validation(_) => "Validation",
            NotifierError::Uniqueness(_) => "Uniqueness",
            NotifierError::NotFound(_) => "NotFound",
            NotifierError::PublisherUnavailable(_) => "PublisherUnavailable",
            NotifierError::Config(_) => "Config",
            NotifierError::Database(_) => "Database",
            NotifierError::Other(_) => "Other",
        }
    }
}
