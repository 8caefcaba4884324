/// Status codes returned by the communication operations.
///
/// Every `Retry*` variant is recoverable: the caller either loops on the
/// operation while calling [progress][crate::Device::progress], or the engine
/// absorbs the operation into its backlog queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LciError {
    /// Generic transient failure, try again later
    Retry,
    /// A try-lock failed, purely local contention
    RetryLock,
    /// The backend ran out of resources (send slots, posted receives, packets)
    RetryNomem,
    /// The requested variant of the operation is not supported
    FeatureNotAvailable,
    /// An internal invariant or a caller contract was violated
    Fatal,
}

impl LciError {
    /// true for every variant that can be resolved by trying again
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            LciError::Retry | LciError::RetryLock | LciError::RetryNomem
        )
    }
}

impl std::fmt::Display for LciError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LciError::Retry => write!(f, "operation should be retried"),
            LciError::RetryLock => write!(f, "lock contention, operation should be retried"),
            LciError::RetryNomem => {
                write!(f, "backend resources exhausted, operation should be retried")
            }
            LciError::FeatureNotAvailable => write!(f, "feature not available"),
            LciError::Fatal => write!(f, "fatal error"),
        }
    }
}

impl std::error::Error for LciError {}

pub type LciResult<T> = Result<T, LciError>;

/// Logs the failure and aborts the current operation by panicking.
///
/// Used for conditions with no recovery path (broken invariants, caller
/// contract violations, unrecoverable resource exhaustion).
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        tracing::error!(file = file!(), line = line!(), "{}", msg);
        panic!("[LCI FATAL] {} ({}:{})", msg, file!(), line!());
    }};
}
pub(crate) use fatal;
