use {
    rand::{rngs::OsRng, Rng},
    std::{
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    },
    tokio::time::Instant,
};

///
/// Generates a fresh 128-bit ownership token, hex encoded.
///
/// Tokens come from the OS entropy source and are never derived from the resource name or time.
///
pub fn unique_token() -> String {
    format!("{:032x}", OsRng.gen::<u128>())
}

///
/// Proof of one successful acquisition.
///
/// A handle is immutable apart from its release flag: extending a lock yields a new handle.
/// It is considered held while its validity deadline is in the future and it has not been released.
///
/// The handle is not meant to be extended and released concurrently from different tasks.
///
#[derive(Debug)]
pub struct LockHandle {
    resource: String,
    token: String,
    validity_deadline: Instant,
    accepted: usize,
    released: AtomicBool,
}

impl LockHandle {
    pub(crate) fn new(
        resource: String,
        token: String,
        validity_deadline: Instant,
        accepted: usize,
    ) -> Self {
        Self {
            resource,
            token,
            validity_deadline,
            accepted,
            released: AtomicBool::new(false),
        }
    }

    ///
    /// Rebuilds a handle from a token obtained by another process, e.g. printed by `redlock lock`.
    ///
    /// The handle carries no validity and no accept count, it is only useful to release or extend the lock.
    ///
    pub fn detached(resource: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(resource.into(), token.into(), Instant::now(), 0)
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    ///
    /// The opaque ownership token stored under the resource key on each endpoint.
    ///
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn validity_deadline(&self) -> Instant {
        self.validity_deadline
    }

    ///
    /// Number of endpoints that accepted the acquisition (or extension) behind this handle.
    ///
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    ///
    /// Time left before the holder must consider the lock expired, measured on the monotonic clock.
    ///
    pub fn remaining_validity(&self) -> Duration {
        self.validity_deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_validity().is_zero()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_held(&self) -> bool {
        !self.is_released() && !self.is_expired()
    }

    ///
    /// Flags the handle as released, returns false if it already was.
    ///
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}
