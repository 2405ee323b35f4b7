use {
    crate::{error::LockError, lock::LockHandle, quorum::Redlock},
    retry::delay::Range,
    std::{ops::RangeInclusive, time::Duration},
    tracing::{error, warn},
};

///
/// Uniformly jittered delays drawn from `delay_range`, enough for `max_attempts` attempts.
///
/// Delays are drawn up front, the thread-local rng must not live across an await.
///
pub fn jittered_delays(max_attempts: usize, delay_range: RangeInclusive<Duration>) -> Vec<Duration> {
    let min = delay_range.start().as_millis() as u64;
    let max = (delay_range.end().as_millis() as u64).max(min);
    Range::from_millis_inclusive(min, max)
        .take(max_attempts.saturating_sub(1))
        .collect()
}

impl Redlock {
    ///
    /// Acquires `resource` using the configured attempt budget and delay range.
    ///
    pub async fn lock(&self, resource: &str, ttl: Duration) -> Result<LockHandle, LockError> {
        self.acquire_with_retry(
            resource,
            ttl,
            self.config.retry_count,
            self.config.retry_delay_range(),
        )
        .await
    }

    ///
    /// Tries [`Redlock::acquire`] up to `max_attempts` times, sleeping a random duration from `delay_range`
    /// between attempts.
    ///
    /// Every attempt uses a brand new token. When the budget runs out the last failure is returned wrapped
    /// in [`LockError::RetryBudgetExhausted`].
    ///
    pub async fn acquire_with_retry(
        &self,
        resource: &str,
        ttl: Duration,
        max_attempts: usize,
        delay_range: RangeInclusive<Duration>,
    ) -> Result<LockHandle, LockError> {
        if max_attempts == 0 {
            return Err(LockError::InvalidArgument(
                "max attempts must be at least 1".to_string(),
            ));
        }
        self.lock_with_strategy(resource, ttl, jittered_delays(max_attempts, delay_range))
            .await
    }

    ///
    /// Retries acquisition following `retry_strategy`: one attempt, then one more per yielded delay.
    ///
    /// Only contention failures are retried, argument errors are returned right away.
    ///
    /// Examples
    ///
    /// ```no_run
    /// use redlock_utils::{config::RedlockConfig, quorum::Redlock};
    /// use retry::delay::Fixed;
    /// use std::time::Duration;
    ///
    /// # async fn run() -> Result<(), redlock_utils::error::LockError> {
    /// let redlock = Redlock::connect(RedlockConfig::default())?;
    ///
    /// // Poll every 200ms for at most 5 seconds.
    /// let handle = redlock
    ///     .lock_with_strategy("my-resource", Duration::from_secs(30), Fixed::from_millis(200).take(25))
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    pub async fn lock_with_strategy(
        &self,
        resource: &str,
        ttl: Duration,
        retry_strategy: impl IntoIterator<Item = Duration>,
    ) -> Result<LockHandle, LockError> {
        let mut retry_strategy = retry_strategy.into_iter();
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.acquire(resource, ttl).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retriable() => match retry_strategy.next() {
                    Some(delay) => {
                        warn!("attempt {attempts} to lock {resource} failed: {e}, retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!("giving up on {resource} after {attempts} attempts");
                        return Err(LockError::RetryBudgetExhausted {
                            attempts,
                            last: Box::new(e),
                        });
                    }
                },
                Err(e) => {
                    error!("failed to lock {resource}: {e}");
                    return Err(e);
                }
            }
        }
    }
}
