use thiserror::Error;

/// Errors surfaced by the messaging engine.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Pool(#[from] r2d2::Error),
    #[error(transparent)]
    Encoding(#[from] serde_json::Error),
}

impl ChatError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Stable machine-readable kind used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::Storage(_) | Self::Pool(_) | Self::Encoding(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;

/// Returns true when the sqlite error is a uniqueness/constraint violation.
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
