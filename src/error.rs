// Engine error taxonomy.
//
// Validation errors are rejected synchronously with no state change.
// Contention errors are retryable by the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("duel not found")]
    DuelNotFound,

    #[error("user is not a participant of this duel")]
    NotParticipant,

    #[error("duel is in state {actual}, operation requires {expected}")]
    WrongState {
        expected: &'static str,
        actual: String,
    },

    #[error("player already guessed this round")]
    AlreadyGuessed,

    #[error("invalid coordinates: lat={lat}, lng={lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },

    #[error("transaction conflict, retry the operation")]
    Contention(#[source] sqlx::Error),

    #[error("location provider exhausted its retry budget")]
    ProviderExhausted,

    #[error("upstream http request failed")]
    Http(#[from] reqwest::Error),

    #[error("database error")]
    Db(#[from] sqlx::Error),

    #[error("corrupt duel record: {0}")]
    CorruptRecord(String),
}

impl EngineError {
    /// Stable machine-readable category, surfaced to API callers.
    pub fn category(&self) -> &'static str {
        match self {
            Self::DuelNotFound => "not_found",
            Self::NotParticipant => "not_participant",
            Self::WrongState { .. } => "wrong_state",
            Self::AlreadyGuessed => "already_guessed",
            Self::InvalidCoordinates { .. } => "invalid_coordinates",
            Self::Contention(_) => "contention",
            Self::ProviderExhausted => "provider_exhausted",
            Self::Http(_) => "upstream",
            Self::Db(_) => "internal",
            Self::CorruptRecord(_) => "internal",
        }
    }

    /// Whether the caller should retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention(_))
    }
}

/// Classify a sqlx error: lock/busy conflicts become retryable contention,
/// everything else is a store failure.
pub fn classify_db_error(e: sqlx::Error) -> EngineError {
    if let sqlx::Error::Database(ref db_err) = e {
        let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
        // SQLITE_BUSY / SQLITE_LOCKED; MySQL lock wait timeout / deadlock.
        if matches!(code.as_str(), "5" | "6" | "1205" | "1213") {
            return EngineError::Contention(e);
        }
    }
    EngineError::Db(e)
}

pub type EngineResult<T> = Result<T, EngineError>;
