#![allow(dead_code)]

use {
    async_trait::async_trait,
    redlock_utils::{endpoint::StoreEndpoint, EndpointError, Redlock, RedlockConfig},
    std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    },
    tokio::time::Instant,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Healthy,
    /// Never answers, the coordinator's timeout has to kick in.
    Hang,
    /// Fails every call like a refused connection.
    Refuse,
}

#[derive(Default)]
pub struct Calls {
    pub try_set: AtomicUsize,
    pub force_set: AtomicUsize,
    pub compare_delete: AtomicUsize,
    pub compare_extend: AtomicUsize,
}

///
/// In-memory store with per-key expiry, injectable latency and failures.
///
pub struct FakeEndpoint {
    name: String,
    behavior: Mutex<Behavior>,
    latency: Mutex<Duration>,
    data: Mutex<HashMap<String, (String, Instant)>>,
    seen_values: Mutex<Vec<String>>,
    pub calls: Calls,
}

impl FakeEndpoint {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behavior: Mutex::new(Behavior::Healthy),
            latency: Mutex::new(Duration::ZERO),
            data: Mutex::new(HashMap::new()),
            seen_values: Mutex::new(Vec::new()),
            calls: Calls::default(),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    ///
    /// Current live value of `resource`, if any.
    ///
    pub fn get(&self, resource: &str) -> Option<String> {
        let data = self.data.lock().unwrap();
        data.get(resource)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value.clone())
    }

    pub fn expires_at(&self, resource: &str) -> Option<Instant> {
        self.data.lock().unwrap().get(resource).map(|(_, e)| *e)
    }

    ///
    /// Simulates another holder overwriting the key.
    ///
    pub fn steal(&self, resource: &str, value: &str, ttl: Duration) {
        self.data
            .lock()
            .unwrap()
            .insert(resource.to_string(), (value.to_string(), Instant::now() + ttl));
    }

    pub fn seen_values(&self) -> Vec<String> {
        self.seen_values.lock().unwrap().clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn simulate(&self) -> Result<(), EndpointError> {
        let behavior = *self.behavior.lock().unwrap();
        let latency = *self.latency.lock().unwrap();
        match behavior {
            Behavior::Healthy => {
                if !latency.is_zero() {
                    tokio::time::sleep(latency).await;
                }
                Ok(())
            }
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Behavior::Refuse => Err(EndpointError::Unreachable(format!(
                "{}: connection refused",
                self.name
            ))),
        }
    }

    fn set(&self, resource: &str, value: &str, ttl: Duration, only_if_absent: bool) -> bool {
        self.seen_values.lock().unwrap().push(value.to_string());
        let mut data = self.data.lock().unwrap();
        let now = Instant::now();
        let live = data
            .get(resource)
            .map(|(_, expires_at)| *expires_at > now)
            .unwrap_or(false);
        if only_if_absent && live {
            return false;
        }
        data.insert(resource.to_string(), (value.to_string(), now + ttl));
        true
    }
}

#[async_trait]
impl StoreEndpoint for FakeEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_set(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EndpointError> {
        self.calls.try_set.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(self.set(resource, value, ttl, true))
    }

    async fn force_set(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EndpointError> {
        self.calls.force_set.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        Ok(self.set(resource, value, ttl, false))
    }

    async fn compare_delete(&self, resource: &str, value: &str) -> Result<bool, EndpointError> {
        self.calls.compare_delete.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        let mut data = self.data.lock().unwrap();
        match data.get(resource) {
            Some((current, expires_at)) if current == value && *expires_at > Instant::now() => {
                data.remove(resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_extend(
        &self,
        resource: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, EndpointError> {
        self.calls.compare_extend.fetch_add(1, Ordering::SeqCst);
        self.simulate().await?;
        let mut data = self.data.lock().unwrap();
        let now = Instant::now();
        match data.get_mut(resource) {
            Some((current, expires_at)) if current == value && *expires_at > now => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub fn test_config() -> RedlockConfig {
    RedlockConfig {
        endpoints: vec![],
        retry_count: 3,
        retry_delay_min_ms: 5,
        retry_delay_max_ms: 15,
        endpoint_timeout_ms: 50,
        ..Default::default()
    }
}

pub fn fake_endpoints(n: usize) -> Vec<Arc<FakeEndpoint>> {
    (0..n).map(|i| FakeEndpoint::new(format!("fake-{i}"))).collect()
}

pub fn redlock_over(endpoints: &[Arc<FakeEndpoint>], config: RedlockConfig) -> Redlock {
    let endpoints = endpoints
        .iter()
        .map(|e| Arc::clone(e) as Arc<dyn StoreEndpoint>)
        .collect();
    Redlock::new(endpoints, config).expect("failed to build redlock")
}

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
