//!
//! Redlock: distributed mutual exclusion over N independent, unreplicated redis instances.
//!
//! A lock is granted when a strict majority of the instances accept it within a fraction of its TTL.
//! The holder may rely on it for the TTL minus the time spent acquiring it and a clock drift allowance.
//!
//! This is a best-effort mutual exclusion hint that holds under bounded clock drift and network delay,
//! not a linearizable consensus primitive. Writes made by a holder after its lock expired are not fenced:
//! critical sections that must never overlap need their own fencing tokens or idempotent writes.
//!

///
/// Single store instance: atomic set-if-absent, compare-and-delete and compare-and-extend.
///
pub mod endpoint;

///
/// Quorum coordinator: acquire, extend and release across every endpoint.
///
pub mod quorum;

///
/// Lock handle returned by a successful acquisition.
///
pub mod lock;

///
/// Jittered retries around acquisition.
pub mod retry;

///
/// Validity computation with clock drift compensation.
pub mod drift;

pub mod config;

pub mod error;

pub use {
    config::RedlockConfig,
    error::{EndpointError, LockError},
    lock::LockHandle,
    quorum::Redlock,
};
