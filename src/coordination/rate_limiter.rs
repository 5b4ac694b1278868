//! 每个交易所凭证一个令牌桶（Redis），在多worker间共享限流配额。
//!
//! bucket key按"交易所id + 凭证指纹"生成，永远不会把原始secret写进key。
//! 桶缺失时按满容量初始化并带上补充窗口TTL；自愈逻辑：发现key丢失TTL
//! （计数还在但永不过期）时原地恢复TTL，不重置计数，避免永久拒绝。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

use crate::error::AppError;

/// 补充窗口（毫秒）
const REFILL_MS: u64 = 1000;
/// 未知交易所的默认容量
const DEFAULT_CAPACITY: i64 = 50;

// if key missing initialize to cap; if v>=n then DECRBY and admit
const ACQUIRE_SCRIPT: &str = r#"
local v = tonumber(redis.call('GET', KEYS[1]) or '-1')
if v == -1 then
  redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  v = tonumber(ARGV[2])
end
if v >= tonumber(ARGV[1]) then
  redis.call('DECRBY', KEYS[1], ARGV[1])
  return 1
else
  return 0
end
"#;

// add back reserved-but-unused tokens, capped at capacity, TTL preserved
const RELEASE_SCRIPT: &str = r#"
local v = redis.call('GET', KEYS[1])
if not v then
  local nv = tonumber(ARGV[1])
  if nv > tonumber(ARGV[2]) then nv = tonumber(ARGV[2]) end
  redis.call('SET', KEYS[1], nv, 'PX', ARGV[3])
  return nv
else
  local nv = redis.call('INCRBY', KEYS[1], ARGV[1])
  if tonumber(nv) > tonumber(ARGV[2]) then
    local overflow = tonumber(nv) - tonumber(ARGV[2])
    redis.call('DECRBY', KEYS[1], overflow)
    nv = tonumber(ARGV[2])
  end
  return tonumber(nv)
end
"#;

const INSPECT_SCRIPT: &str = r#"
return {redis.call('GET', KEYS[1]) or '-1', redis.call('PTTL', KEYS[1])}
"#;

/// 按"<exchange_id>:<sha256前10位>"生成凭证指纹，没有api key时用anon
pub fn credential_fingerprint(exchange_id: &str, api_key: Option<&str>) -> String {
    let short = match api_key {
        Some(k) if !k.is_empty() => {
            let digest = Sha256::digest(k.as_bytes());
            hex::encode(digest)[..10].to_string()
        }
        _ => "anon".to_string(),
    };
    format!("{}:{}", exchange_id, short)
}

#[derive(Clone)]
pub struct RateLimiter {
    conn: MultiplexedConnection,
    capacities: HashMap<String, i64>,
    refill_ms: u64,
    acquire_script: Script,
    release_script: Script,
    inspect_script: Script,
}

impl RateLimiter {
    pub async fn connect(client: &Client) -> Result<Self, AppError> {
        let conn = client.get_multiplexed_async_connection().await?;
        // 各交易所调用频率上限（按交易所文档调整）
        let mut capacities = HashMap::new();
        capacities.insert("bybit".to_string(), 80);
        capacities.insert("mexc".to_string(), 60);
        Ok(Self {
            conn,
            capacities,
            refill_ms: REFILL_MS,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            inspect_script: Script::new(INSPECT_SCRIPT),
        })
    }

    fn capacity_for(&self, exchange_key: &str) -> i64 {
        let exchange_id = exchange_key.split(':').next().unwrap_or("");
        self.capacities
            .get(exchange_id)
            .copied()
            .unwrap_or(DEFAULT_CAPACITY)
    }

    fn bucket_key(exchange_key: &str) -> String {
        format!("tokens:{}", exchange_key)
    }

    /// 在 timeout_ms 内尝试取走 n 个令牌，超时返回 false（软失败，调用方
    /// 放弃本轮操作即可，不要panic）。
    pub async fn acquire(&self, exchange_key: &str, n: i64, timeout_ms: u64) -> bool {
        let cap = self.capacity_for(exchange_key);
        if n > cap {
            error!(
                "[RateLimiter] requested tokens {} > cap {} for {}",
                n, cap, exchange_key
            );
            return false;
        }
        let key = Self::bucket_key(exchange_key);
        let start = Instant::now();
        let mut conn = self.conn.clone();

        loop {
            let res: Result<i64, redis::RedisError> = self
                .acquire_script
                .key(&key)
                .arg(n)
                .arg(cap)
                .arg(self.refill_ms)
                .invoke_async(&mut conn)
                .await;
            match res {
                Ok(1) => return true,
                Ok(_) => {}
                Err(err) => {
                    // 瞬时redis故障按拒绝处理，退避后重试
                    error!("[RateLimiter] redis eval error: {}", err);
                }
            }

            // 检查桶状态：如果计数还在但TTL丢了（pttl == -1），原地恢复TTL
            if let Ok((_value, pttl)) = self
                .inspect_script
                .key(&key)
                .invoke_async::<_, (String, i64)>(&mut conn)
                .await
            {
                if pttl == -1 {
                    let restored: Result<i64, redis::RedisError> = redis::cmd("PEXPIRE")
                        .arg(&key)
                        .arg(self.refill_ms)
                        .query_async(&mut conn)
                        .await;
                    if restored.is_ok() {
                        warn!("[RateLimiter] restored TTL for {} (px={})", key, self.refill_ms);
                    }
                    if start.elapsed() > Duration::from_millis(timeout_ms) {
                        return false;
                    }
                    let pause = 50 + rand::thread_rng().gen_range(0..100);
                    tokio::time::sleep(Duration::from_millis(pause)).await;
                    continue;
                }
            }

            if start.elapsed() > Duration::from_millis(timeout_ms) {
                return false;
            }
            let pause = 100 + rand::thread_rng().gen_range(0..200);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
    }

    /// 归还预留但未消耗的令牌（封顶到容量，保留TTL），返回归还后的计数
    pub async fn release(&self, exchange_key: &str, n: i64) -> Option<i64> {
        let cap = self.capacity_for(exchange_key);
        let key = Self::bucket_key(exchange_key);
        let mut conn = self.conn.clone();
        let res: Result<i64, redis::RedisError> = self
            .release_script
            .key(&key)
            .arg(n)
            .arg(cap)
            .arg(self.refill_ms)
            .invoke_async(&mut conn)
            .await;
        match res {
            Ok(v) => Some(v),
            Err(err) => {
                error!("[RateLimiter] redis release error: {}", err);
                None
            }
        }
    }
}
