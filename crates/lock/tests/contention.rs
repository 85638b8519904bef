//! Mutual exclusion under concurrent contenders.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::RequestContext;
use lock::{InMemoryLockManager, LockManager, LockSettings};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn only_one_contender_wins_try_lock() {
    let manager = Arc::new(InMemoryLockManager::new(LockSettings::default()));
    let winners = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..32 {
        let manager = manager.clone();
        let winners = winners.clone();
        handles.push(tokio::spawn(async move {
            let ctx = RequestContext::new();
            let lock = manager
                .new_lock("deduct-inventory:42", Duration::from_secs(30))
                .await
                .unwrap();
            if lock.try_lock(&ctx).await.unwrap() {
                winners.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocking_lock_serialises_critical_sections() {
    let manager = Arc::new(InMemoryLockManager::new(LockSettings {
        retry_delay: Duration::from_millis(2),
        ..LockSettings::default()
    }));
    let inside = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = manager.clone();
        let inside = inside.clone();
        let completed = completed.clone();
        handles.push(tokio::spawn(async move {
            let ctx = RequestContext::new();
            let lock = manager
                .new_lock("critical", Duration::from_secs(30))
                .await
                .unwrap();
            lock.lock(&ctx).await.unwrap();
            assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
            tokio::time::sleep(Duration::from_millis(5)).await;
            inside.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
            lock.unlock(&ctx).await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(completed.load(Ordering::SeqCst), 8);
    assert_eq!(manager.active_leases().await, 0);
}
