//! 分布式互斥锁（Redis）
//!
//! - acquire: SET key token NX PX ttl，带抖动退避重试
//! - release: Lua脚本，仅当value与token一致时删除
//! - renew:   Lua脚本，仅当value与token一致时延长TTL
//!
//! 同一个key在任意时刻最多只有一个持有者拥有有效token，
//! 这是多worker并发下"每个bot同时只有一次执行"的唯一保证。

use std::time::{Duration, Instant};

use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::AppError;

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("DEL", KEYS[1])
else
  return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
  return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
  return 0
end
"#;

#[derive(Clone)]
pub struct RedisLock {
    conn: MultiplexedConnection,
    unlock_script: Script,
    renew_script: Script,
}

impl RedisLock {
    pub async fn connect(client: &Client) -> Result<Self, AppError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            unlock_script: Script::new(UNLOCK_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
        })
    }

    /// 尝试获取锁，在 wait_ms 内重试，超时返回 None。
    /// 返回的token是唯一的持锁凭证，release/renew都要带上它。
    pub async fn acquire(
        &self,
        key: &str,
        ttl_ms: u64,
        wait_ms: u64,
    ) -> Result<Option<String>, AppError> {
        let token = Uuid::new_v4().to_string();
        let start = Instant::now();
        let mut retry_delay_ms: u64 = 100;
        let mut conn = self.conn.clone();

        loop {
            let res: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&token)
                .arg("PX")
                .arg(ttl_ms)
                .arg("NX")
                .query_async(&mut conn)
                .await?;
            if res.is_some() {
                return Ok(Some(token));
            }
            if start.elapsed() > Duration::from_millis(wait_ms) {
                return Ok(None);
            }
            // jittered backoff
            let jitter = rand::thread_rng().gen_range(0..retry_delay_ms);
            tokio::time::sleep(Duration::from_millis(retry_delay_ms + jitter)).await;
            // 指数退避，封顶1秒
            retry_delay_ms = (retry_delay_ms * 3 / 2).min(1000);
        }
    }

    /// 只有token匹配时才删除（原子）。token不匹配说明锁已过期并被他人持有，
    /// 此时不能删，返回false。
    pub async fn release(&self, key: &str, token: &str) -> bool {
        let mut conn = self.conn.clone();
        let res: Result<i64, redis::RedisError> = self
            .unlock_script
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await;
        match res {
            Ok(n) => n == 1,
            Err(err) => {
                // best-effort
                error!("RedisLock.release error: {}", err);
                false
            }
        }
    }

    /// 只有token匹配时才延长TTL（原子）
    pub async fn renew(&self, key: &str, token: &str, ttl_ms: u64) -> bool {
        let mut conn = self.conn.clone();
        let res: Result<i64, redis::RedisError> = self
            .renew_script
            .key(key)
            .arg(token)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await;
        match res {
            Ok(n) => n == 1,
            Err(err) => {
                error!("RedisLock.renew error: {}", err);
                false
            }
        }
    }

    /// 启动一个周期续约任务，guard被drop时任务立即停止。
    /// 续约周期 = max(ttl - threshold, 1s)，保证剩余TTL不会低于安全阈值。
    pub fn spawn_renewal(
        &self,
        key: &str,
        token: &str,
        ttl_ms: u64,
        renew_threshold_ms: u64,
    ) -> RenewalGuard {
        let lock = self.clone();
        let key = key.to_string();
        let token = token.to_string();
        let period_ms = ttl_ms.saturating_sub(renew_threshold_ms).max(1000);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
            interval.tick().await; // 第一个tick立即返回，跳过
            loop {
                interval.tick().await;
                if !lock.renew(&key, &token, ttl_ms).await {
                    warn!("lock renew failed, key={}", key);
                }
            }
        });
        RenewalGuard { handle }
    }
}

/// 持锁期间的续约守卫，随临界区一起结束（成功、失败、panic都会drop）
pub struct RenewalGuard {
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for RenewalGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
