use {
    crate::error::EndpointError,
    async_trait::async_trait,
    redis::{aio::ConnectionManager, Script},
    std::time::Duration,
    tokio::sync::OnceCell,
    tracing::{debug, trace},
};

const COMPARE_DELETE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end"#;

const COMPARE_EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end"#;

///
/// One independent key-value store taking part in the quorum.
///
/// Every operation must be atomic on the store side. Implementations do not retry and do not
/// enforce timeouts, the coordinator bounds each call.
///
#[async_trait]
pub trait StoreEndpoint: Send + Sync {
    ///
    /// Name used in logs and diagnostics.
    ///
    fn name(&self) -> &str;

    ///
    /// Writes `value` under `resource` with expiry `ttl` only if `resource` is absent.
    ///
    async fn try_set(&self, resource: &str, value: &str, ttl: Duration)
        -> Result<bool, EndpointError>;

    ///
    /// Writes `value` under `resource` with expiry `ttl`, overwriting any previous holder.
    ///
    async fn force_set(&self, resource: &str, value: &str, ttl: Duration)
        -> Result<bool, EndpointError>;

    ///
    /// Deletes `resource` only if it currently holds `value`.
    ///
    async fn compare_delete(&self, resource: &str, value: &str) -> Result<bool, EndpointError>;

    ///
    /// Resets the expiry of `resource` to `ttl` only if it currently holds `value`.
    ///
    async fn compare_extend(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EndpointError>;
}

///
/// Largest TTL a store accepts, redis parses `PX` and `PEXPIRE` arguments as signed 64-bit milliseconds.
///
pub const MAX_TTL: Duration = Duration::from_millis(i64::MAX as u64);

fn ttl_millis(ttl: Duration) -> Result<u64, EndpointError> {
    if ttl > MAX_TTL {
        return Err(EndpointError::TtlOutOfRange(ttl));
    }
    let millis = u64::try_from(ttl.as_millis()).map_err(|_| EndpointError::TtlOutOfRange(ttl))?;
    // PX rejects 0, round sub-millisecond TTLs up.
    Ok(millis.max(1))
}

///
/// [`StoreEndpoint`] backed by a single redis instance.
///
/// The URL is parsed eagerly but the connection is established on first use, so an instance that is down
/// at startup simply votes "no" until it comes back. The underlying [`ConnectionManager`] multiplexes
/// concurrent requests and reconnects on its own.
///
pub struct RedisEndpoint {
    name: String,
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    delete_script: Script,
    extend_script: Script,
}

impl RedisEndpoint {
    pub fn open(url: &str) -> Result<Self, EndpointError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            name: url.to_string(),
            client,
            conn: OnceCell::new(),
            delete_script: Script::new(COMPARE_DELETE_SCRIPT),
            extend_script: Script::new(COMPARE_EXTEND_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, EndpointError> {
        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!("connecting to {}", self.name);
                ConnectionManager::new(self.client.clone()).await
            })
            .await?;
        Ok(conn.clone())
    }

    async fn set(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
        only_if_absent: bool,
    ) -> Result<bool, EndpointError> {
        let px = ttl_millis(ttl)?;
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(resource).arg(value);
        if only_if_absent {
            cmd.arg("NX");
        }
        cmd.arg("PX").arg(px);
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        trace!("SET {resource} on {} replied {reply:?}", self.name);
        Ok(reply.is_some())
    }
}

#[async_trait]
impl StoreEndpoint for RedisEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_set(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EndpointError> {
        self.set(resource, value, ttl, true).await
    }

    async fn force_set(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EndpointError> {
        self.set(resource, value, ttl, false).await
    }

    async fn compare_delete(&self, resource: &str, value: &str) -> Result<bool, EndpointError> {
        let mut conn = self.connection().await?;
        let deleted: i64 = self
            .delete_script
            .key(resource)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn compare_extend(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EndpointError> {
        let px = ttl_millis(ttl)?;
        let mut conn = self.connection().await?;
        let extended: i64 = self
            .extend_script
            .key(resource)
            .arg(value)
            .arg(px)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}
