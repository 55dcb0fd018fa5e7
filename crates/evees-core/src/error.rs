use std::fmt;

/// Library result type.
pub type Result<T, E = EveesError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// EveesError
// ---------------------------------------------------------------------------

/// Every failure the core can report.
///
/// Merge conflicts are deliberately absent: the merge is total and always
/// produces a result.
#[derive(Debug, thiserror::Error)]
pub enum EveesError {
    /// The id recomputed from an object differs from the id asserted for it.
    #[error("hash mismatch: asserted {asserted}, computed {computed}")]
    HashMismatch {
        /// The id supplied by the caller.
        asserted: String,
        /// The id derived from the object itself.
        computed: String,
    },

    /// An authoritative base returned fewer entities than requested.
    #[error("short read from base: requested {requested} entities, received {received}")]
    ShortRead {
        /// How many hashes were asked for.
        requested: usize,
        /// How many entities came back.
        received: usize,
    },

    /// A single-entity lookup found nothing.
    #[error("entity not found: {0}")]
    EntityNotFound(String),

    /// A perspective is unknown to the client or was deleted.
    #[error("perspective not found: {0}")]
    PerspectiveNotFound(String),

    /// A perspective names a remote that is not registered.
    #[error("perspective {perspective_id} is owned by unregistered remote '{remote}'")]
    UnresolvableRemote {
        /// The perspective being routed.
        perspective_id: String,
        /// The remote named in the perspective.
        remote: String,
    },

    /// An `oldDetails` precondition did not hold against current state.
    #[error(
        "precondition failed on {perspective_id}: expected head {expected:?}, found {actual:?}"
    )]
    PreconditionFailed {
        /// The perspective being updated.
        perspective_id: String,
        /// Head the update expected.
        expected: Option<String>,
        /// Head actually recorded.
        actual: Option<String>,
    },

    /// An entity exists but its object does not have the expected shape.
    #[error("malformed entity {id}: {reason}")]
    MalformedEntity {
        /// The entity id.
        id: String,
        /// What failed to decode.
        reason: String,
    },

    /// A remote reported a failure while handling a request.
    #[error("remote '{remote}' failed: {reason}")]
    Remote {
        /// Remote id.
        remote: String,
        /// Failure description.
        reason: String,
    },

    /// SQLite storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// Filesystem failure around the local store.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl EveesError {
    /// Machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::HashMismatch { .. } => ErrorCode::HashMismatch,
            Self::ShortRead { .. } => ErrorCode::ShortRead,
            Self::EntityNotFound(_) => ErrorCode::EntityNotFound,
            Self::PerspectiveNotFound(_) => ErrorCode::PerspectiveNotFound,
            Self::UnresolvableRemote { .. } => ErrorCode::UnresolvableRemote,
            Self::PreconditionFailed { .. } => ErrorCode::PreconditionFailed,
            Self::MalformedEntity { .. } => ErrorCode::MalformedEntity,
            Self::Remote { .. } => ErrorCode::RemoteFailure,
            Self::Storage(_) | Self::Io(_) => ErrorCode::StorageFailure,
            Self::Serialization(_) => ErrorCode::SerializationFailure,
            Self::Config(_) => ErrorCode::ConfigParseError,
        }
    }

    pub(crate) fn malformed(id: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::MalformedEntity {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn remote(remote: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Remote {
            remote: remote.into(),
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    EntityNotFound,
    PerspectiveNotFound,
    PreconditionFailed,
    HashMismatch,
    ShortRead,
    MalformedEntity,
    UnresolvableRemote,
    RemoteFailure,
    StorageFailure,
    SerializationFailure,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::EntityNotFound => "E2001",
            Self::PerspectiveNotFound => "E2002",
            Self::PreconditionFailed => "E2003",
            Self::HashMismatch => "E3001",
            Self::ShortRead => "E3002",
            Self::MalformedEntity => "E3003",
            Self::UnresolvableRemote => "E4001",
            Self::RemoteFailure => "E4002",
            Self::StorageFailure => "E5001",
            Self::SerializationFailure => "E5002",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Project not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::EntityNotFound => "Entity not found",
            Self::PerspectiveNotFound => "Perspective not found",
            Self::PreconditionFailed => "Perspective head moved concurrently",
            Self::HashMismatch => "Content hash mismatch",
            Self::ShortRead => "Base store returned fewer entities than requested",
            Self::MalformedEntity => "Entity has an unexpected shape",
            Self::UnresolvableRemote => "No remote registered for perspective",
            Self::RemoteFailure => "Remote request failed",
            Self::StorageFailure => "Local storage failure",
            Self::SerializationFailure => "Serialization failure",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `evees init` to initialize this directory."),
            Self::ConfigParseError => Some("Fix syntax in .evees/config.toml and retry."),
            Self::EntityNotFound | Self::PerspectiveNotFound => None,
            Self::PreconditionFailed => Some("Refresh the perspective and retry the update."),
            Self::HashMismatch => Some("Report a bug: hashing is deterministic."),
            Self::ShortRead => Some("The base store is incomplete; check the remote's health."),
            Self::MalformedEntity => None,
            Self::UnresolvableRemote => Some("Register the remote named by the perspective."),
            Self::RemoteFailure => Some("Retry once. If persistent, check the remote."),
            Self::StorageFailure => Some("Check disk space and write permissions."),
            Self::SerializationFailure => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
