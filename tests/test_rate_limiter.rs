//! 令牌桶限流器的集成测试，需要可用的Redis（REDIS_HOST）。
//! 默认ignore，本地跑：cargo test --test test_rate_limiter -- --ignored

use dotenv::dotenv;
use redis::Client;
use uuid::Uuid;

use rust_dca::coordination::RateLimiter;

fn redis_client() -> Client {
    dotenv().ok();
    let url = std::env::var("REDIS_HOST").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    Client::open(url).expect("redis client")
}

/// 每个测试用独立的桶key，避免互相污染（未知交易所容量=50）
fn fresh_key() -> String {
    format!("testex:{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore]
async fn bucket_exhausts_at_capacity() {
    let limiter = RateLimiter::connect(&redis_client()).await.expect("connect");
    let key = fresh_key();

    // 一口气取走全部50个
    assert!(limiter.acquire(&key, 50, 500).await);
    // 窗口内再取应该被拒（timeout短于1s的补充窗口）
    assert!(!limiter.acquire(&key, 1, 200).await);
}

#[tokio::test]
#[ignore]
async fn over_capacity_request_is_rejected_immediately() {
    let limiter = RateLimiter::connect(&redis_client()).await.expect("connect");
    let key = fresh_key();
    assert!(!limiter.acquire(&key, 51, 100).await);
}

#[tokio::test]
#[ignore]
async fn release_returns_tokens_capped_at_capacity() {
    let limiter = RateLimiter::connect(&redis_client()).await.expect("connect");
    let key = fresh_key();

    assert!(limiter.acquire(&key, 50, 500).await);
    let after = limiter.release(&key, 10).await.expect("release");
    assert_eq!(after, 10);
    // 归还的令牌马上可用
    assert!(limiter.acquire(&key, 10, 200).await);

    // 超量归还封顶到容量
    let after = limiter.release(&key, 1000).await.expect("release");
    assert_eq!(after, 50);
}
