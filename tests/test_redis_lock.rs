//! 分布式锁的集成测试，需要可用的Redis（REDIS_HOST）。
//! 默认ignore，本地跑：cargo test --test test_redis_lock -- --ignored

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use redis::Client;
use uuid::Uuid;

use rust_dca::coordination::RedisLock;

fn redis_client() -> Client {
    dotenv().ok();
    let url = std::env::var("REDIS_HOST").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    Client::open(url).expect("redis client")
}

#[tokio::test]
#[ignore]
async fn lock_is_mutually_exclusive() {
    let client = redis_client();
    let lock = RedisLock::connect(&client).await.expect("connect");
    let key = format!("test-lock:{}", Uuid::new_v4());

    // 8个任务抢同一把锁，临界区内持有者计数必须始终为1
    let holders = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock = lock.clone();
        let key = key.clone();
        let holders = holders.clone();
        handles.push(tokio::spawn(async move {
            let token = lock
                .acquire(&key, 5000, 10_000)
                .await
                .expect("acquire")
                .expect("should get lock within wait window");
            let inside = holders.fetch_add(1, Ordering::SeqCst);
            assert_eq!(inside, 0, "two holders inside the critical section");
            tokio::time::sleep(Duration::from_millis(30)).await;
            holders.fetch_sub(1, Ordering::SeqCst);
            assert!(lock.release(&key, &token).await);
        }));
    }
    for h in handles {
        h.await.expect("task");
    }
}

#[tokio::test]
#[ignore]
async fn release_with_wrong_token_is_noop() {
    let client = redis_client();
    let lock = RedisLock::connect(&client).await.expect("connect");
    let key = format!("test-lock:{}", Uuid::new_v4());

    let token = lock
        .acquire(&key, 5000, 1000)
        .await
        .expect("acquire")
        .expect("lock");

    // 错token删不掉
    assert!(!lock.release(&key, "not-the-token").await);
    // 锁还在，别人拿不到
    assert!(lock.acquire(&key, 5000, 0).await.expect("acquire").is_none());
    // 正确token可以删
    assert!(lock.release(&key, &token).await);
}

#[tokio::test]
#[ignore]
async fn renew_extends_the_lease() {
    let client = redis_client();
    let lock = RedisLock::connect(&client).await.expect("connect");
    let key = format!("test-lock:{}", Uuid::new_v4());

    let token = lock
        .acquire(&key, 500, 1000)
        .await
        .expect("acquire")
        .expect("lock");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(lock.renew(&key, &token, 500).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    // 没续约的话500ms早就过期了
    assert!(lock.acquire(&key, 500, 0).await.expect("acquire").is_none());
    assert!(lock.release(&key, &token).await);

    // token不匹配时续约失败
    assert!(!lock.renew(&key, &token, 500).await);
}
