use {
    crate::{
        drift::{DriftModel, DEFAULT_CLOCK_RESOLUTION, DEFAULT_DRIFT_FACTOR},
        endpoint::MAX_TTL,
        error::LockError,
    },
    serde::{Deserialize, Serialize},
    std::{ops::RangeInclusive, path::Path, time::Duration},
};

pub const DEFAULT_ENDPOINT: &str = "redis://localhost:6379";

///
/// Tunables for a [`crate::quorum::Redlock`] coordinator.
///
/// Durations are expressed in milliseconds so the struct maps one-to-one onto a JSON file:
///
/// ```json
/// {
///     "endpoints": ["redis://10.0.0.1:6379", "redis://10.0.0.2:6379", "redis://10.0.0.3:6379"],
///     "default_ttl_ms": 10000,
///     "retry_count": 3,
///     "retry_delay_min_ms": 100,
///     "retry_delay_max_ms": 300,
///     "endpoint_timeout_ms": 50,
///     "drift_factor": 0.01,
///     "clock_resolution_ms": 2
/// }
/// ```
///
/// Missing fields take their default value.
///
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedlockConfig {
    pub endpoints: Vec<String>,
    pub default_ttl_ms: u64,
    ///
    /// Maximum number of acquisition attempts, the first one included.
    ///
    pub retry_count: usize,
    pub retry_delay_min_ms: u64,
    pub retry_delay_max_ms: u64,
    pub endpoint_timeout_ms: u64,
    pub drift_factor: f64,
    pub clock_resolution_ms: u64,
}

impl Default for RedlockConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            default_ttl_ms: 10_000,
            retry_count: 3,
            retry_delay_min_ms: 100,
            retry_delay_max_ms: 300,
            endpoint_timeout_ms: 50,
            drift_factor: DEFAULT_DRIFT_FACTOR,
            clock_resolution_ms: DEFAULT_CLOCK_RESOLUTION.as_millis() as u64,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] LockError),
}

impl RedlockConfig {
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn endpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.endpoint_timeout_ms)
    }

    pub fn retry_delay_range(&self) -> RangeInclusive<Duration> {
        Duration::from_millis(self.retry_delay_min_ms)..=Duration::from_millis(self.retry_delay_max_ms)
    }

    pub fn drift_model(&self) -> DriftModel {
        DriftModel::new(
            self.drift_factor,
            Duration::from_millis(self.clock_resolution_ms),
        )
    }

    pub fn validate(&self) -> Result<(), LockError> {
        if self.endpoints.is_empty() {
            return Err(LockError::InvalidArgument(
                "at least one endpoint must be configured".to_string(),
            ));
        }
        self.validate_tunables()
    }

    ///
    /// Same as [`RedlockConfig::validate`] without the endpoint list, for coordinators built from
    /// explicit endpoints.
    ///
    pub fn validate_tunables(&self) -> Result<(), LockError> {
        let invalid =
            |msg: &str| -> Result<(), LockError> { Err(LockError::InvalidArgument(msg.to_string())) };
        if self.default_ttl_ms == 0 {
            return invalid("default ttl must be positive");
        }
        if self.default_ttl() > MAX_TTL {
            return invalid("default ttl exceeds the store maximum");
        }
        if self.retry_count == 0 {
            return invalid("retry count must be at least 1");
        }
        if self.retry_delay_min_ms > self.retry_delay_max_ms {
            return invalid("retry delay min must not exceed max");
        }
        if self.endpoint_timeout_ms == 0 {
            return invalid("endpoint timeout must be positive");
        }
        if !(0.0..1.0).contains(&self.drift_factor) {
            return invalid("drift factor must be in [0, 1)");
        }
        Ok(())
    }
}
