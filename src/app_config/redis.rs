use std::env;

use anyhow::Result;
use redis::aio::MultiplexedConnection;
use redis::Client;

/// 根据 REDIS_HOST 构建 Redis 客户端。
/// 锁、限流器、任务队列都从这里拿到自己的 Client（显式注入，不走全局单例）。
pub fn redis_client() -> Result<Client> {
    let url = env::var("REDIS_HOST").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let client = Client::open(url)?;
    Ok(client)
}

/// Get a Redis multiplexed async connection
pub async fn get_redis_connection(client: &Client) -> Result<MultiplexedConnection> {
    let conn = client.get_multiplexed_async_connection().await?;
    Ok(conn)
}
