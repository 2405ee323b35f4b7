use {
    crate::{
        config::RedlockConfig,
        drift::DriftModel,
        endpoint::{RedisEndpoint, StoreEndpoint, MAX_TTL},
        error::{EndpointError, EndpointFailure, LockError},
        lock::{unique_token, LockHandle},
    },
    futures::future::join_all,
    std::{future::Future, sync::Arc, time::Duration},
    tokio::{
        task::{JoinError, JoinHandle},
        time::Instant,
    },
    tracing::{debug, info, trace, warn},
};

type EndpointCall = JoinHandle<Result<bool, EndpointError>>;
type EndpointResult = Result<Result<bool, EndpointError>, JoinError>;

///
/// Strict majority of `n` endpoints.
///
pub fn quorum_of(n: usize) -> usize {
    n / 2 + 1
}

///
/// Outcome of one fan-out round.
///
struct Tally {
    accepted: usize,
    failures: Vec<EndpointFailure>,
}

#[derive(Clone, Copy)]
enum SetMode {
    IfAbsent,
    Force,
}

///
/// Redlock coordinator over a fixed, ordered set of independent store endpoints.
///
/// All lock state lives in the stores. The coordinator only holds the endpoint set and the tunables,
/// cloning it is cheap and clones share the same endpoints.
///
/// # Safety caveat
///
/// Redlock gives a best-effort mutual exclusion under bounded clock drift and bounded network delay.
/// It is not a linearizable consensus primitive: a holder paused past its validity deadline may still
/// act on the resource. Critical sections that must never overlap need fencing tokens on top of it.
///
/// Examples
///
/// ```no_run
/// use redlock_utils::{config::RedlockConfig, quorum::Redlock};
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), redlock_utils::error::LockError> {
/// let config = RedlockConfig {
///     endpoints: vec![
///         "redis://127.0.0.1:6380".to_string(),
///         "redis://127.0.0.1:6381".to_string(),
///         "redis://127.0.0.1:6382".to_string(),
///     ],
///     ..Default::default()
/// };
/// let redlock = Redlock::connect(config)?;
///
/// let handle = redlock.lock("my-resource", Duration::from_secs(10)).await?;
/// // critical section, bounded by handle.remaining_validity()
/// redlock.release(&handle).await;
/// # Ok(())
/// # }
/// ```
///
#[derive(Clone)]
pub struct Redlock {
    endpoints: Arc<[Arc<dyn StoreEndpoint>]>,
    pub(crate) config: Arc<RedlockConfig>,
    drift: DriftModel,
}

impl Redlock {
    ///
    /// Builds a coordinator over explicitly constructed endpoints.
    ///
    /// `config.endpoints` is ignored here, only the tunables are used.
    ///
    pub fn new(
        endpoints: Vec<Arc<dyn StoreEndpoint>>,
        config: RedlockConfig,
    ) -> Result<Self, LockError> {
        if endpoints.is_empty() {
            return Err(LockError::InvalidArgument(
                "endpoint set must not be empty".to_string(),
            ));
        }
        config.validate_tunables()?;
        let drift = config.drift_model();
        Ok(Self {
            endpoints: endpoints.into(),
            config: Arc::new(config),
            drift,
        })
    }

    ///
    /// Builds one [`RedisEndpoint`] per configured URL. No connection is made until the first operation.
    ///
    pub fn connect(config: RedlockConfig) -> Result<Self, LockError> {
        config.validate()?;
        let endpoints = config
            .endpoints
            .iter()
            .map(|url| {
                RedisEndpoint::open(url)
                    .map(|e| Arc::new(e) as Arc<dyn StoreEndpoint>)
                    .map_err(|e| LockError::InvalidArgument(format!("endpoint {url}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(endpoints, config)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn quorum(&self) -> usize {
        quorum_of(self.endpoints.len())
    }

    pub fn config(&self) -> &RedlockConfig {
        &self.config
    }

    ///
    /// Per-endpoint timeout for acquire and extend, always a fraction of the TTL so a hung endpoint
    /// cannot eat the whole validity budget.
    ///
    fn round_timeout(&self, ttl: Duration) -> Duration {
        self.config.endpoint_timeout().min(ttl / 10)
    }

    fn check_args(resource: &str, ttl: Duration) -> Result<(), LockError> {
        if resource.is_empty() {
            return Err(LockError::InvalidArgument(
                "resource name must not be empty".to_string(),
            ));
        }
        if ttl.is_zero() {
            return Err(LockError::InvalidArgument("ttl must be positive".to_string()));
        }
        if ttl > MAX_TTL {
            return Err(LockError::InvalidArgument(format!(
                "ttl {ttl:?} exceeds the maximum of {MAX_TTL:?}"
            )));
        }
        Ok(())
    }

    fn validity_deadline(start: Instant, validity: Duration) -> Result<Instant, LockError> {
        start.checked_add(validity).ok_or_else(|| {
            LockError::InvalidArgument(format!("validity {validity:?} overflows the monotonic clock"))
        })
    }

    ///
    /// Spawns `f` against every endpoint, each call bounded by `timeout`.
    ///
    /// Calls run as their own tasks so they keep going even if the caller stops polling.
    ///
    fn dispatch<F, Fut>(&self, timeout: Duration, f: F) -> Vec<EndpointCall>
    where
        F: Fn(Arc<dyn StoreEndpoint>) -> Fut,
        Fut: Future<Output = Result<bool, EndpointError>> + Send + 'static,
    {
        self.endpoints
            .iter()
            .map(|endpoint| {
                let fut = f(Arc::clone(endpoint));
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(EndpointError::Timeout(timeout)),
                    }
                })
            })
            .collect()
    }

    fn tally(&self, op: &str, results: Vec<EndpointResult>) -> Tally {
        let mut tally = Tally {
            accepted: 0,
            failures: Vec::new(),
        };
        for (endpoint, result) in self.endpoints.iter().zip(results) {
            match result.map_err(EndpointError::from).and_then(|r| r) {
                Ok(true) => tally.accepted += 1,
                Ok(false) => trace!("{op} rejected by {}", endpoint.name()),
                Err(e) => {
                    warn!("{op} failed on {}: {e}", endpoint.name());
                    tally.failures.push(EndpointFailure {
                        endpoint: endpoint.name().to_string(),
                        error: e,
                    });
                }
            }
        }
        tally
    }

    async fn fan_out<F, Fut>(&self, op: &str, timeout: Duration, f: F) -> Tally
    where
        F: Fn(Arc<dyn StoreEndpoint>) -> Fut,
        Fut: Future<Output = Result<bool, EndpointError>> + Send + 'static,
    {
        let results = join_all(self.dispatch(timeout, f)).await;
        self.tally(op, results)
    }

    ///
    /// Deletes `token` under `resource` on every endpoint, whichever accepted it or not.
    ///
    /// Never fails: an endpoint we could not reach keeps an orphan key until its own TTL runs out.
    ///
    async fn unlock_all(&self, resource: &str, token: &str) -> usize {
        let resource: Arc<str> = Arc::from(resource);
        let token: Arc<str> = Arc::from(token);
        let tally = self
            .fan_out("compare_delete", self.config.endpoint_timeout(), |endpoint| {
                let resource = Arc::clone(&resource);
                let token = Arc::clone(&token);
                async move { endpoint.compare_delete(&resource, &token).await }
            })
            .await;
        if !tally.failures.is_empty() {
            warn!(
                "could not release `{resource}` on {} endpoint(s), keys will expire on their own",
                tally.failures.len()
            );
        }
        tally.accepted
    }

    ///
    /// Single acquisition attempt.
    ///
    /// Fails with [`LockError::QuorumNotReached`] or [`LockError::ValidityExhausted`], in which case
    /// every endpoint has been asked to drop the partial acquisition before returning.
    ///
    pub async fn acquire(&self, resource: &str, ttl: Duration) -> Result<LockHandle, LockError> {
        self.acquire_until(resource, ttl, std::future::pending::<()>())
            .await
    }

    ///
    /// Like [`Redlock::acquire`] but takes over the resource even if another holder has it.
    ///
    pub async fn acquire_forced(
        &self,
        resource: &str,
        ttl: Duration,
    ) -> Result<LockHandle, LockError> {
        self.acquire_with_mode(resource, ttl, SetMode::Force, std::future::pending::<()>())
            .await
    }

    ///
    /// Acquisition attempt that gives up when `cancel` resolves.
    ///
    /// On cancellation in-flight endpoint calls still run up to their own timeout, then the partial
    /// acquisition is rolled back and [`LockError::Cancelled`] is returned.
    ///
    pub async fn acquire_until<C>(
        &self,
        resource: &str,
        ttl: Duration,
        cancel: C,
    ) -> Result<LockHandle, LockError>
    where
        C: Future<Output = ()>,
    {
        self.acquire_with_mode(resource, ttl, SetMode::IfAbsent, cancel)
            .await
    }

    async fn acquire_with_mode<C>(
        &self,
        resource: &str,
        ttl: Duration,
        mode: SetMode,
        cancel: C,
    ) -> Result<LockHandle, LockError>
    where
        C: Future<Output = ()>,
    {
        Self::check_args(resource, ttl)?;
        let token = unique_token();
        let timeout = self.round_timeout(ttl);
        let quorum = self.quorum();

        trace!("trying to lock {resource} with timeout {timeout:?} per endpoint");
        let start = Instant::now();
        let calls = {
            let resource: Arc<str> = Arc::from(resource);
            let token: Arc<str> = Arc::from(token.as_str());
            self.dispatch(timeout, move |endpoint| {
                let resource = Arc::clone(&resource);
                let token = Arc::clone(&token);
                async move {
                    match mode {
                        SetMode::IfAbsent => endpoint.try_set(&resource, &token, ttl).await,
                        SetMode::Force => endpoint.force_set(&resource, &token, ttl).await,
                    }
                }
            })
        };

        let mut joined = std::pin::pin!(join_all(calls));
        let results = tokio::select! {
            results = &mut joined => results,
            _ = cancel => {
                debug!("acquisition of {resource} cancelled, waiting for in-flight calls before rollback");
                let _ = joined.await;
                self.unlock_all(resource, &token).await;
                return Err(LockError::Cancelled(resource.to_string()));
            }
        };
        let tally = self.tally("try_set", results);
        let elapsed = start.elapsed();
        let validity = self.drift.compute_validity(ttl, elapsed);

        if tally.accepted >= quorum && !validity.is_zero() {
            let deadline = match Self::validity_deadline(start, validity) {
                Ok(deadline) => deadline,
                Err(e) => {
                    self.unlock_all(resource, &token).await;
                    return Err(e);
                }
            };
            info!(
                "locked {resource} on {}/{} endpoints, validity {validity:?}",
                tally.accepted,
                self.endpoints.len()
            );
            return Ok(LockHandle::new(
                resource.to_string(),
                token,
                deadline,
                tally.accepted,
            ));
        }

        self.unlock_all(resource, &token).await;
        if tally.accepted >= quorum {
            debug!("lock on {resource} reached quorum but validity was exhausted after {elapsed:?}");
            Err(LockError::ValidityExhausted {
                resource: resource.to_string(),
                accepted: tally.accepted,
                elapsed,
            })
        } else {
            debug!(
                "lock on {resource} failed: {}/{quorum} endpoints accepted",
                tally.accepted
            );
            Err(LockError::QuorumNotReached {
                resource: resource.to_string(),
                accepted: tally.accepted,
                quorum,
                failures: tally.failures,
            })
        }
    }

    ///
    /// Resets the expiry of a held lock to `ttl` on every endpoint still holding its token.
    ///
    /// Returns a new handle with a fresh validity deadline. On failure nothing is rolled back: the
    /// previous handle's deadline still applies, but the caller must not rely on the new TTL.
    ///
    /// An expired handle is not short-circuited, the outcome reflects what the stores hold.
    ///
    pub async fn extend(&self, handle: &LockHandle, ttl: Duration) -> Result<LockHandle, LockError> {
        let resource = handle.resource();
        Self::check_args(resource, ttl)?;
        if handle.is_released() {
            return Err(LockError::AlreadyReleased(resource.to_string()));
        }
        let timeout = self.round_timeout(ttl);
        let quorum = self.quorum();

        let start = Instant::now();
        let tally = {
            let resource: Arc<str> = Arc::from(resource);
            let token: Arc<str> = Arc::from(handle.token());
            self.fan_out("compare_extend", timeout, move |endpoint| {
                let resource = Arc::clone(&resource);
                let token = Arc::clone(&token);
                async move { endpoint.compare_extend(&resource, &token, ttl).await }
            })
            .await
        };
        let elapsed = start.elapsed();
        let validity = self.drift.compute_validity(ttl, elapsed);

        if tally.accepted < quorum {
            debug!(
                "extend of {resource} failed: {}/{quorum} endpoints accepted",
                tally.accepted
            );
            return Err(LockError::QuorumNotReached {
                resource: resource.to_string(),
                accepted: tally.accepted,
                quorum,
                failures: tally.failures,
            });
        }
        if validity.is_zero() {
            return Err(LockError::ValidityExhausted {
                resource: resource.to_string(),
                accepted: tally.accepted,
                elapsed,
            });
        }
        let deadline = Self::validity_deadline(start, validity)?;
        debug!("extended {resource} on {} endpoints, validity {validity:?}", tally.accepted);
        Ok(LockHandle::new(
            resource.to_string(),
            handle.token().to_string(),
            deadline,
            tally.accepted,
        ))
    }

    ///
    /// Best-effort release on every endpoint.
    ///
    /// Always completes, bounded by the per-endpoint timeout. Releasing the same handle twice is a no-op.
    /// Returns how many endpoints actually deleted the key.
    ///
    pub async fn release(&self, handle: &LockHandle) -> usize {
        if !handle.mark_released() {
            trace!("{} already released", handle.resource());
            return 0;
        }
        let deleted = self.unlock_all(handle.resource(), handle.token()).await;
        info!("released {} on {deleted} endpoint(s)", handle.resource());
        deleted
    }
}
