use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Error type for the ingestion core.
///
/// Mirrors the shape of `rsky_indexer::IndexerError`: storage errors carry
/// enough of the original `tokio_postgres` error to let callers classify
/// unique-violation (`23505`) vs foreign-key-violation (`23503`) without
/// every call site re-parsing SQLSTATE strings.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("invalid uri: {0}")]
    InvalidUri(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("identity resolution failed for {0}")]
    IdentityNotFound(String),

    #[error("missing prerequisite {prereq} ({kind:?})")]
    MissingPrerequisite { kind: PrereqKind, prereq: String },

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Which of the deferred-op reconciler's queues a missing prerequisite
/// belongs in — mirrors `deferred::QueueKind` but lives here so plugin code
/// that only needs to report "blocked on X" doesn't depend on the
/// reconciler's internals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrereqKind {
    Post,
    User,
    List,
    UserCreation,
}

impl CoreError {
    pub fn from_pg(err: tokio_postgres::Error) -> Self {
        CoreError::Database(err.into())
    }

    /// Unique-constraint conflict: "Treated as success (idempotent receive)."
    pub fn is_unique_violation(&self) -> bool {
        self.sql_state_str()
            .map(|s| s.contains("duplicate key") || s.contains("23505"))
            .unwrap_or(false)
    }

    /// Foreign-key-prerequisite missing: queued for deferred retry.
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sql_state_str()
            .map(|s| s.contains("foreign key") || s.contains("23503"))
            .unwrap_or(false)
    }

    fn sql_state_str(&self) -> Option<String> {
        match self {
            CoreError::Database(e) => Some(e.to_string().to_lowercase()),
            _ => None,
        }
    }

    /// Matches `IndexerError::is_expected_error`: things that should be
    /// logged at WARN, not ERROR, because they are routine under concurrent
    /// or replayed arrival.
    pub fn is_expected(&self) -> bool {
        self.is_unique_violation()
            || self
                .sql_state_str()
                .map(|s| s.contains("invalid byte sequence for encoding"))
                .unwrap_or(false)
    }

    pub fn missing_prereq(&self) -> Option<(PrereqKind, &str)> {
        match self {
            CoreError::MissingPrerequisite { kind, prereq } => Some((*kind, prereq.as_str())),
            _ => None,
        }
    }
}

/// Classify a raw `tokio_postgres::Error` by SQLSTATE: storage must raise a
/// code-bearing error on (a) primary-key / unique-constraint conflicts and
/// (b) foreign-key reference failures, so the core can distinguish the two.
pub fn classify_pg_error(err: &tokio_postgres::Error) -> PgErrorClass {
    match err.code() {
        Some(code) if *code == SqlState::UNIQUE_VIOLATION => PgErrorClass::UniqueViolation,
        Some(code) if *code == SqlState::FOREIGN_KEY_VIOLATION => {
            PgErrorClass::ForeignKeyViolation
        }
        _ => PgErrorClass::Other,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgErrorClass {
    UniqueViolation,
    ForeignKeyViolation,
    Other,
}

pub type CoreResult<T> = Result<T, CoreError>;
