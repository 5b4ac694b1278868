use std::sync::Arc;

use anyhow::Result;
use dotenv::dotenv;
use tracing::{info, warn};

use rust_dca::app_config::db::init_db;
use rust_dca::app_config::env::{env_is_true, env_num};
use rust_dca::app_config::log::setup_logging;
use rust_dca::app_config::redis::redis_client;
use rust_dca::coordination::{RateLimiter, RedisLock};
use rust_dca::job::bot_worker::BotWorker;
use rust_dca::job::queue::JobQueue;
use rust_dca::job::recon_job::ReconWorker;
use rust_dca::trading::exchange::gateway::GatewayFactory;
use rust_dca::trading::exchange::GatewayRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    setup_logging().await?;
    init_db().await;

    let client = redis_client()?;
    let lock = RedisLock::connect(&client).await?;
    let limiter = RateLimiter::connect(&client).await?;
    let queue = JobQueue::connect(&client).await?;

    // 交易所适配器在这里注册（registry.register("bybit", ...)）
    let registry = GatewayRegistry::new();
    if registry.is_empty() {
        warn!("no exchange gateway adapters registered, order paths will fail fast");
    }
    let factory: Arc<dyn GatewayFactory> = Arc::new(registry);

    let mut handles = Vec::new();

    if env_is_true("IS_RUN_BOT_WORKER", true) {
        let concurrency: usize = env_num("WORKER_CONCURRENCY", 4usize);
        info!("starting {} bot worker loops", concurrency);
        for _ in 0..concurrency {
            let worker = Arc::new(BotWorker::new(
                lock.clone(),
                limiter.clone(),
                queue.clone(),
                factory.clone(),
            ));
            handles.push(tokio::spawn(async move { worker.run_loop().await }));
        }
    }

    if env_is_true("IS_RUN_RECON", true) {
        let recon = ReconWorker::new(
            lock.clone(),
            limiter.clone(),
            queue.clone(),
            factory.clone(),
        );
        handles.push(tokio::spawn(async move { recon.run_loop().await }));
    }

    if handles.is_empty() {
        warn!("both IS_RUN_BOT_WORKER and IS_RUN_RECON are off, nothing to do");
        return Ok(());
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping workers");
    for handle in &handles {
        handle.abort();
    }
    Ok(())
}
