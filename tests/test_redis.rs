use std::time::Duration;

use common::random_str;
use redlock_utils::{LockError, Redlock, RedlockConfig};
mod common;

fn local_redlock() -> Redlock {
    let config = RedlockConfig {
        endpoints: vec!["redis://localhost:6379".to_string()],
        endpoint_timeout_ms: 200,
        ..Default::default()
    };
    Redlock::connect(config).expect("failed to build redlock")
}

#[tokio::test]
#[ignore = "requires a redis server on localhost:6379"]
async fn test_locking() {
    let redlock = local_redlock();
    let lock_name = random_str(10);

    let handle = redlock
        .acquire(&lock_name, Duration::from_secs(10))
        .await
        .expect("failed to lock");
    assert_eq!(redlock.release(&handle).await, 1);

    let handle = redlock
        .acquire(&lock_name, Duration::from_secs(10))
        .await
        .expect("failed to re-acquire released lock");
    redlock.release(&handle).await;
}

#[tokio::test]
#[ignore = "requires a redis server on localhost:6379"]
async fn it_should_fail_to_lock_already_taken_lock() {
    let redlock = local_redlock();
    let lock_name = random_str(10);

    let handle = redlock
        .acquire(&lock_name, Duration::from_secs(10))
        .await
        .expect("failed to lock");
    let result = redlock.acquire(&lock_name, Duration::from_secs(10)).await;

    assert!(matches!(result, Err(LockError::QuorumNotReached { .. })));
    redlock.release(&handle).await;
}

#[tokio::test]
#[ignore = "requires a redis server on localhost:6379"]
async fn lock_expires_on_the_store() {
    let redlock = local_redlock();
    let lock_name = random_str(10);

    let _handle = redlock
        .acquire(&lock_name, Duration::from_millis(300))
        .await
        .expect("failed to lock");
    tokio::time::sleep(Duration::from_millis(400)).await;

    redlock
        .acquire(&lock_name, Duration::from_secs(10))
        .await
        .expect("expired lock should be free");
}

#[tokio::test]
#[ignore = "requires a redis server on localhost:6379"]
async fn extend_keeps_the_lock_alive() {
    let redlock = local_redlock();
    let lock_name = random_str(10);

    let handle = redlock
        .acquire(&lock_name, Duration::from_millis(500))
        .await
        .expect("failed to lock");
    tokio::time::sleep(Duration::from_millis(300)).await;
    let handle = redlock
        .extend(&handle, Duration::from_secs(2))
        .await
        .expect("failed to extend");
    tokio::time::sleep(Duration::from_millis(400)).await;

    let result = redlock.acquire(&lock_name, Duration::from_secs(1)).await;
    assert!(matches!(result, Err(LockError::QuorumNotReached { .. })));
    redlock.release(&handle).await;
}
