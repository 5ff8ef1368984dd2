use thiserror::Error;

/// Typed application error hierarchy for the ingestion pipeline and QA engine.
///
/// Stage handlers classify failures as `Transient` (retried with backoff up
/// to the per-type attempt cap) or `Permanent` (the episode is failed
/// immediately). Infrastructure variants map onto that split via
/// [`AppError::is_transient`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Enqueue rejected: an identical unit of work is already queued or active.
    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    /// Question answering requested for a podcast with no indexed episodes.
    #[error("No indexed content: {0}")]
    NoIndexedContent(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Recoverable stage failure (network, external tooling).
    #[error("{0}")]
    Transient(String),

    /// Unrecoverable stage failure (corrupt audio, contract violation).
    #[error("{0}")]
    Permanent(String),

    #[error("{0}")]
    Database(String),

    #[error("{0}")]
    Io(String),

    #[error("{0}")]
    Http(String),

    #[error("Feed parse error: {0}")]
    Feed(String),

    #[error("{0}")]
    Json(String),
}

impl AppError {
    /// Whether a stage handler failing with this error should be retried.
    ///
    /// Database errors count as transient: the realistic failure there is a
    /// busy/locked database, not bad data.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Transient(_) | AppError::Http(_) | AppError::Io(_) | AppError::Database(_)
        )
    }
}

// ==== Conversions ====

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Database(e.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Json(e.to_string())
    }
}

impl From<feed_rs::parser::ParseFeedError> for AppError {
    fn from(e: feed_rs::parser::ParseFeedError) -> Self {
        AppError::Feed(e.to_string())
    }
}
