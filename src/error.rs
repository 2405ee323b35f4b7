use {
    core::fmt,
    std::time::Duration,
    thiserror::Error,
    tokio::task::JoinError,
};

///
/// Failure of a single store endpoint.
///
/// Every variant counts as a non-vote when the coordinator tallies a quorum,
/// the variants only exist so diagnostics can tell them apart.
///
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("redis error: {0}")]
    Redis(redis::RedisError),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("endpoint task failed: {0}")]
    Join(#[from] JoinError),
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("ttl {0:?} does not fit a store expiry")]
    TtlOutOfRange(Duration),
}

impl From<redis::RedisError> for EndpointError {
    ///
    /// Transport failures (refused, dropped or timed out connections) become [`EndpointError::Unreachable`],
    /// everything the server itself answered stays a [`EndpointError::Redis`].
    ///
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() || e.is_timeout() {
            EndpointError::Unreachable(e.to_string())
        } else {
            EndpointError::Redis(e)
        }
    }
}

///
/// An [`EndpointError`] tagged with the endpoint it came from.
///
#[derive(Debug)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub error: EndpointError,
}

impl fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.endpoint, self.error)
    }
}

fn join_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" :: ")
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("quorum not reached for `{resource}`: {accepted}/{quorum} endpoints accepted [{}]", join_failures(.failures))]
    QuorumNotReached {
        resource: String,
        accepted: usize,
        quorum: usize,
        failures: Vec<EndpointFailure>,
    },

    #[error("validity exhausted for `{resource}` after {elapsed:?}")]
    ValidityExhausted {
        resource: String,
        accepted: usize,
        elapsed: Duration,
    },

    #[error("gave up after {attempts} attempts: {last}")]
    RetryBudgetExhausted {
        attempts: usize,
        #[source]
        last: Box<LockError>,
    },

    #[error("acquisition of `{0}` cancelled")]
    Cancelled(String),

    #[error("lock on `{0}` was already released")]
    AlreadyReleased(String),
}

impl LockError {
    ///
    /// Returns true for failures caused by contention or slow endpoints, the ones a new attempt may fix.
    ///
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LockError::QuorumNotReached { .. } | LockError::ValidityExhausted { .. }
        )
    }

    ///
    /// The underlying failure, looking through [`LockError::RetryBudgetExhausted`].
    ///
    pub fn root(&self) -> &LockError {
        match self {
            LockError::RetryBudgetExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}
