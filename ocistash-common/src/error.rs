/// Classified failure of a backend operation.
///
/// Callers branch on the kind: `NotFound` is routinely tolerated
/// (idempotent remove, rename retries), `SizeMismatch` means a save must be
/// repeated as a whole, and `InvalidRange` is a caller bug that never
/// reaches the network.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid blob name: {0:?}")]
    InvalidName(String),

    #[error("wrote {actual} bytes instead of the expected {expected} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("invalid range specified: start={start} end={end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("{op}: {source}")]
    Remote {
        op: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Consumer(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    pub fn remote(
        op: &'static str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Remote { op, source: source.into() }
    }

    /// True when the error means the addressed object does not exist.
    pub fn is_not_exist(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Consumer(e) => e
                .downcast_ref::<BackendError>()
                .is_some_and(BackendError::is_not_exist),
            _ => false,
        }
    }
}
