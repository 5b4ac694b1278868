//! bot生命周期worker：start / tick / delete三类任务的执行者。
//!
//! tick的关键顺序约定：
//! 1. 先拿bot锁（拿不到且bot还在running就带抖动重新入队，不算失败）
//! 2. 持锁期间由RenewalGuard自动续约，临界区结束guard一drop就停
//! 3. 每个周期先判退出再判入场，同时满足时只卖不买
//! 4. 锁释放永远发生在重新调度决策之前
//!
//! 所有对交易所的调用前都要先过该凭证的令牌桶。

use std::sync::Arc;

use rand::Rng;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::app_config::env::env_num;
use crate::coordination::rate_limiter::credential_fingerprint;
use crate::coordination::{RateLimiter, RedisLock};
use crate::error::AppError;
use crate::job::queue::{BotJob, BotJobKind, JobQueue};
use crate::time_util;
use crate::trading::exchange::executor::OrderExecutor;
use crate::trading::exchange::gateway::{GatewayFactory, OrderParams, OrderSide, OrderType};
use crate::trading::model::bot::{BotEntity, BotEntry, BotStatus, BotsModel};
use crate::trading::model::bot_log::{log_bot, log_bot_with};
use crate::trading::model::bot_order::{BotOrdersModel, NewBotOrder};
use crate::trading::model::metrics::MetricsModel;
use crate::trading::model::user::{UserEntity, UsersModel};
use crate::trading::services::recon_service::{apply_sell_fifo, SellProjection};
use crate::trading::strategy::dca::{self, DcaMetrics, EntryDecision, ExitKind};

fn lock_ttl_ms() -> u64 {
    env_num("LOCK_TTL_MS", 30_000u64)
}
fn lock_wait_ms() -> u64 {
    env_num("LOCK_WAIT_MS", 5_000u64)
}
fn lock_renew_threshold_ms() -> u64 {
    env_num("LOCK_RENEW_THRESHOLD_MS", 10_000u64)
}
fn bot_tick_ms() -> u64 {
    env_num("BOT_TICK_MS", 60_000u64)
}
fn rate_wait_ms() -> u64 {
    env_num("RATE_WAIT_MS", 10_000u64)
}

pub fn bot_lock_key(bot_id: &str) -> String {
    format!("bot-lock:{}", bot_id)
}

/// tick提前结束的原因。都不是故障，不触发任务重试。
#[derive(Debug, Error)]
pub enum TickAbort {
    #[error("bot lock busy")]
    LockBusy,
    #[error("bot {0} not found")]
    BotMissing(String),
    #[error("bot {0} is not running")]
    NotRunning(String),
    #[error("user {0} missing or has no api keys")]
    UserMissing(String),
    #[error("rate limited at stage {0}")]
    RateLimited(&'static str),
    #[error("no usable ticker price for {0}")]
    NoTicker(String),
}

#[derive(Debug)]
pub enum TickOutcome {
    Aborted(TickAbort),
    /// 全仓退出，bot已closed，不再调度
    Exited(ExitKind),
    /// 加了一笔仓
    Entered,
    /// 本周期无动作
    Held,
}

/// 任务结束后的下一跳。tick/delete的任务id是固定的，在任务还没
/// complete之前重新入队会命中自己的去重占位而丢失，所以下一跳
/// 必须由run_loop在complete释放id之后入队。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reschedule {
    pub kind: BotJobKind,
    pub bot_id: String,
    pub delay_ms: u64,
}

/// 锁竞争时的短延迟抖动重试
fn lock_busy_reschedule(kind: BotJobKind, bot_id: &str) -> Reschedule {
    Reschedule {
        kind,
        bot_id: bot_id.to_string(),
        delay_ms: 1000 + rand::thread_rng().gen_range(0..2000),
    }
}

pub struct BotWorker {
    lock: RedisLock,
    limiter: RateLimiter,
    queue: JobQueue,
    factory: Arc<dyn GatewayFactory>,
}

impl BotWorker {
    pub fn new(
        lock: RedisLock,
        limiter: RateLimiter,
        queue: JobQueue,
        factory: Arc<dyn GatewayFactory>,
    ) -> Self {
        Self {
            lock,
            limiter,
            queue,
            factory,
        }
    }

    /// 执行一个任务，返回需要在complete之后入队的下一跳
    pub async fn handle(&self, job: &BotJob) -> Result<Option<Reschedule>, AppError> {
        match job.kind {
            BotJobKind::StartBot => {
                self.start_bot(&job.bot_id).await?;
                Ok(None)
            }
            BotJobKind::BotTick => {
                let outcome = self.tick_bot(&job.bot_id).await?;
                self.reschedule_after_tick(&job.bot_id, &outcome).await
            }
            BotJobKind::DeleteBot => self.delete_bot(&job.bot_id).await,
        }
    }

    /// created -> running，并立即排第一个tick
    pub async fn start_bot(&self, bot_id: &str) -> Result<(), AppError> {
        let bots = BotsModel::new();
        let bot = match bots.find_by_id(bot_id).await? {
            Some(b) => b,
            None => {
                warn!("start_bot: bot {} not found", bot_id);
                return Ok(());
            }
        };
        match bot.status() {
            Some(BotStatus::Created) => {
                bots.update_status(bot_id, BotStatus::Running).await?;
                log_bot(bot_id, "bot_started").await;
            }
            Some(BotStatus::Running) => {
                // 已经在跑，只需要保证tick在队（幂等入队）
            }
            _ => {
                info!("start_bot: bot {} in status {}, skip", bot_id, bot.status);
                return Ok(());
            }
        }
        self.queue.enqueue(BotJobKind::BotTick, bot_id, 0).await?;
        Ok(())
    }

    /// 一个完整的tick周期
    pub async fn tick_bot(&self, bot_id: &str) -> Result<TickOutcome, AppError> {
        let bots = BotsModel::new();
        let bot = match bots.find_by_id(bot_id).await? {
            Some(b) => b,
            None => return Ok(TickOutcome::Aborted(TickAbort::BotMissing(bot_id.to_string()))),
        };
        if bot.status() != Some(BotStatus::Running) {
            return Ok(TickOutcome::Aborted(TickAbort::NotRunning(
                bot_id.to_string(),
            )));
        }

        let key = bot_lock_key(bot_id);
        let token = match self.lock.acquire(&key, lock_ttl_ms(), lock_wait_ms()).await? {
            Some(t) => t,
            None => {
                // 有别的worker在处理，由下一跳带抖动重试
                return Ok(TickOutcome::Aborted(TickAbort::LockBusy));
            }
        };
        log_bot(bot_id, "tick_started").await;

        let outcome = {
            let _renewal =
                self.lock
                    .spawn_renewal(&key, &token, lock_ttl_ms(), lock_renew_threshold_ms());
            self.tick_locked(bot_id).await
        };

        // 锁先还，调度决策在后
        self.lock.release(&key, &token).await;
        outcome
    }

    /// 持锁临界区。返回Err会走任务重试，Aborted都按正常结束处理。
    async fn tick_locked(&self, bot_id: &str) -> Result<TickOutcome, AppError> {
        let bots = BotsModel::new();
        // 等锁期间状态可能已经变了，拿到锁后重读
        let bot = match bots.find_by_id(bot_id).await? {
            Some(b) => b,
            None => return Ok(TickOutcome::Aborted(TickAbort::BotMissing(bot_id.to_string()))),
        };
        if bot.status() != Some(BotStatus::Running) {
            return Ok(TickOutcome::Aborted(TickAbort::NotRunning(
                bot_id.to_string(),
            )));
        }

        let user = match UsersModel::new().find_by_id(&bot.user_id).await? {
            Some(u) if u.has_api_keys() => u,
            _ => {
                log_bot_with(bot_id, "tick_skipped", "warn", json!({"reason": "no api keys"}))
                    .await;
                return Ok(TickOutcome::Aborted(TickAbort::UserMissing(
                    bot.user_id.clone(),
                )));
            }
        };
        let gateway = self.factory.connect(&user)?;
        let executor = OrderExecutor::new(gateway.clone());
        let rate_key = credential_fingerprint(user.exchange_id(), user.api_key.as_deref());

        if !self.limiter.acquire(&rate_key, 1, rate_wait_ms()).await {
            return Ok(TickOutcome::Aborted(TickAbort::RateLimited("ticker")));
        }
        let ticker = gateway.fetch_ticker(&bot.pair).await?;
        let price = match ticker.last_or_close().or_else(|| ticker.best_estimate()) {
            Some(p) if p > 0.0 => p,
            _ => {
                return Ok(TickOutcome::Aborted(TickAbort::NoTicker(bot.pair.clone())))
            }
        };
        log_bot_with(bot_id, "ticker_fetched", "info", json!({"price": price})).await;

        let cfg = bot.parse_config();
        let entries = bot.parse_entries();

        // 先判退出，命中就直接返回，本周期不再评估买入
        if let Some(exit) = dca::check_exit(&bot.pair, &cfg, &entries, price) {
            return self
                .execute_exit(&bot, &executor, &rate_key, &entries, exit.params, exit.kind, exit.reason, price)
                .await;
        }

        let metrics = self.load_metrics(&bot.pair).await;
        match dca::run_dca_step(&bot.pair, &cfg, &entries, price, &metrics) {
            EntryDecision::Skip(reason) => {
                log_bot_with(bot_id, "entry_skipped", "info", json!({"reason": reason})).await;
                Ok(TickOutcome::Held)
            }
            EntryDecision::Place(params) => {
                self.execute_entry(&bot, &executor, &rate_key, params, price)
                    .await
            }
        }
    }

    async fn load_metrics(&self, pair: &str) -> DcaMetrics {
        match MetricsModel::new().find_by_pair(pair).await {
            Ok(Some(m)) => m.parse_indicators(),
            Ok(None) => DcaMetrics::default(),
            Err(err) => {
                warn!("metrics lookup failed for {}: {}", pair, err);
                DcaMetrics::default()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_exit(
        &self,
        bot: &BotEntity,
        executor: &OrderExecutor,
        rate_key: &str,
        entries: &[BotEntry],
        params: OrderParams,
        kind: ExitKind,
        reason: String,
        ticker_price: f64,
    ) -> Result<TickOutcome, AppError> {
        log_bot_with(
            &bot.id,
            "exit_decision",
            "info",
            json!({"kind": kind.as_str(), "reason": reason}),
        )
        .await;

        if !self.limiter.acquire(rate_key, 1, rate_wait_ms()).await {
            return Ok(TickOutcome::Aborted(TickAbort::RateLimited("exit_order")));
        }
        let placed = match executor.create_order(&params).await {
            Ok(p) => p,
            Err(err) => {
                log_bot_with(
                    &bot.id,
                    "sell_order_failed",
                    "error",
                    json!({"error": err.to_string()}),
                )
                .await;
                return Err(err);
            }
        };

        let exec_amount = placed.executed_amount().unwrap_or(params.amount);
        let exec_price = placed
            .executed_price()
            .filter(|p| *p > 0.0)
            .unwrap_or(ticker_price);

        // 订单已经在交易所成交，落库失败只告警，对账会补
        let persisted = BotOrdersModel::new()
            .insert(NewBotOrder {
                bot_id: bot.id.clone(),
                order_id: placed.id.clone(),
                side: OrderSide::Sell,
                amount: exec_amount,
                price: exec_price,
                raw: placed.raw.clone(),
                trade_ids: Vec::new(),
                exit_type: Some(kind.as_str().to_string()),
                reason: Some(reason),
                reconciled: false,
            })
            .await;
        if let Err(err) = persisted {
            warn!("exit order persist failed for bot {}: {}", bot.id, err);
        }

        let (realized_pnl, realized_notional) =
            match apply_sell_fifo(entries, exec_amount, exec_price) {
                SellProjection::Closed {
                    realized_pnl,
                    realized_notional,
                } => (realized_pnl, realized_notional),
                SellProjection::Truncated {
                    realized_pnl,
                    realized_notional,
                    ..
                } => {
                    // 全仓卖出本不该有剩余，多半是精度/部分成交，照样关
                    warn!("exit sell left residual lots for bot {}", bot.id);
                    (realized_pnl, realized_notional)
                }
            };

        let bots = BotsModel::new();
        bots.set_entries(&bot.id, &[]).await?;
        bots.set_closed(&bot.id, Some(realized_pnl), Some(realized_notional))
            .await?;
        self.queue
            .remove(&BotJob::job_id(BotJobKind::BotTick, &bot.id))
            .await?;
        log_bot_with(
            &bot.id,
            "bot_closed",
            "info",
            json!({"exit": kind.as_str(), "realized_pnl": realized_pnl}),
        )
        .await;
        Ok(TickOutcome::Exited(kind))
    }

    async fn execute_entry(
        &self,
        bot: &BotEntity,
        executor: &OrderExecutor,
        rate_key: &str,
        params: OrderParams,
        ticker_price: f64,
    ) -> Result<TickOutcome, AppError> {
        if !self.limiter.acquire(rate_key, 1, rate_wait_ms()).await {
            return Ok(TickOutcome::Aborted(TickAbort::RateLimited("entry_order")));
        }
        let placed = match executor.create_order(&params).await {
            Ok(p) => p,
            Err(err) => {
                log_bot_with(
                    &bot.id,
                    "buy_order_failed",
                    "error",
                    json!({"error": err.to_string()}),
                )
                .await;
                return Err(err);
            }
        };
        log_bot_with(
            &bot.id,
            "buy_order_placed",
            "info",
            json!({"order_id": placed.id, "amount": params.amount}),
        )
        .await;

        let exec_amount = placed.executed_amount().unwrap_or(params.amount);
        let exec_price = placed
            .executed_price()
            .filter(|p| *p > 0.0)
            .unwrap_or(ticker_price);

        if let Err(err) = BotOrdersModel::new()
            .insert(NewBotOrder {
                bot_id: bot.id.clone(),
                order_id: placed.id.clone(),
                side: OrderSide::Buy,
                amount: exec_amount,
                price: exec_price,
                raw: placed.raw.clone(),
                trade_ids: Vec::new(),
                exit_type: None,
                reason: None,
                reconciled: false,
            })
            .await
        {
            warn!("entry order persist failed for bot {}: {}", bot.id, err);
        }

        let entry = BotEntry {
            order_id: placed.id.clone(),
            price: exec_price,
            amount: exec_amount,
            ts: time_util::now_millis(),
        };
        BotsModel::new().push_entry(&bot.id, &entry).await?;
        log_bot_with(
            &bot.id,
            "entry_added",
            "info",
            json!({"price": exec_price, "amount": exec_amount}),
        )
        .await;
        Ok(TickOutcome::Entered)
    }

    /// tick结束后的调度决策：锁竞争短延迟重试，bot还在running就排
    /// 下一个周期。只做决策不入队，入队由run_loop在complete之后做。
    async fn reschedule_after_tick(
        &self,
        bot_id: &str,
        outcome: &TickOutcome,
    ) -> Result<Option<Reschedule>, AppError> {
        match outcome {
            TickOutcome::Exited(_) => return Ok(None),
            TickOutcome::Aborted(TickAbort::LockBusy) => {
                return Ok(Some(lock_busy_reschedule(BotJobKind::BotTick, bot_id)));
            }
            TickOutcome::Aborted(TickAbort::BotMissing(_))
            | TickOutcome::Aborted(TickAbort::NotRunning(_)) => return Ok(None),
            _ => {}
        }
        let bots = BotsModel::new();
        let still_running = bots
            .find_by_id(bot_id)
            .await?
            .and_then(|b| b.status())
            .map(|s| s == BotStatus::Running)
            .unwrap_or(false);
        if still_running {
            return Ok(Some(Reschedule {
                kind: BotJobKind::BotTick,
                bot_id: bot_id.to_string(),
                delay_ms: bot_tick_ms(),
            }));
        }
        Ok(None)
    }

    /// 删除流程：持锁下强平剩余仓位，撤销tick任务，置deleted。
    /// 锁竞争不算失败（正在tick的bot可以持锁30秒），带抖动重排，
    /// 不消耗任务的重试预算。
    pub async fn delete_bot(&self, bot_id: &str) -> Result<Option<Reschedule>, AppError> {
        let bots = BotsModel::new();
        let bot = match bots.find_by_id(bot_id).await? {
            Some(b) => b,
            None => {
                warn!("delete_bot: bot {} not found", bot_id);
                return Ok(None);
            }
        };
        if bot.status() == Some(BotStatus::Deleted) {
            return Ok(None);
        }

        let key = bot_lock_key(bot_id);
        let token = match self.lock.acquire(&key, lock_ttl_ms(), lock_wait_ms()).await? {
            Some(t) => t,
            None => {
                info!("delete_bot: lock busy for {}, will retry", bot_id);
                return Ok(Some(lock_busy_reschedule(BotJobKind::DeleteBot, bot_id)));
            }
        };

        let result = {
            let _renewal =
                self.lock
                    .spawn_renewal(&key, &token, lock_ttl_ms(), lock_renew_threshold_ms());
            self.delete_locked(&bot).await
        };
        self.lock.release(&key, &token).await;
        result?;
        Ok(None)
    }

    async fn delete_locked(&self, bot: &BotEntity) -> Result<(), AppError> {
        let bots = BotsModel::new();
        bots.update_status(&bot.id, BotStatus::Deleting).await?;
        log_bot(&bot.id, "bot_deleting").await;

        let total_amount = bot.total_open_amount();
        if total_amount > 0.0 {
            let user = UsersModel::new()
                .find_by_id(&bot.user_id)
                .await?
                .filter(|u| u.has_api_keys());
            match user {
                Some(user) => {
                    self.force_sell(bot, &user, total_amount).await?;
                }
                None => {
                    log_bot_with(
                        &bot.id,
                        "delete_skip_sell",
                        "warn",
                        json!({"reason": "no api keys, position left on exchange"}),
                    )
                    .await;
                }
            }
        }

        self.queue
            .remove(&BotJob::job_id(BotJobKind::BotTick, &bot.id))
            .await?;
        bots.set_entries(&bot.id, &[]).await?;
        bots.mark_deleted(&bot.id).await?;
        log_bot(&bot.id, "bot_deleted").await;
        Ok(())
    }

    async fn force_sell(
        &self,
        bot: &BotEntity,
        user: &UserEntity,
        total_amount: f64,
    ) -> Result<(), AppError> {
        let gateway = self.factory.connect(user)?;
        let executor = OrderExecutor::new(gateway.clone());
        let rate_key = credential_fingerprint(user.exchange_id(), user.api_key.as_deref());

        if !self.limiter.acquire(&rate_key, 1, rate_wait_ms()).await {
            return Err(AppError::BizError(format!(
                "delete_bot: rate limited selling for {}",
                bot.id
            )));
        }
        let params = OrderParams {
            symbol: bot.pair.clone(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            amount: total_amount,
            price: None,
        };
        let placed = executor.create_order(&params).await?;

        let exec_amount = placed.executed_amount().unwrap_or(total_amount);
        // 交易所没回价格时用ticker兜底
        let exec_price = match placed.executed_price().filter(|p| *p > 0.0) {
            Some(p) => p,
            None => match gateway.fetch_ticker(&bot.pair).await {
                Ok(t) => t.last_or_close().or_else(|| t.best_estimate()).unwrap_or(0.0),
                Err(_) => 0.0,
            },
        };

        if let Err(err) = BotOrdersModel::new()
            .insert(NewBotOrder {
                bot_id: bot.id.clone(),
                order_id: placed.id.clone(),
                side: OrderSide::Sell,
                amount: exec_amount,
                price: exec_price,
                raw: placed.raw.clone(),
                trade_ids: Vec::new(),
                exit_type: Some("manual_delete".to_string()),
                reason: Some("bot deleted by user".to_string()),
                reconciled: false,
            })
            .await
        {
            warn!("delete sell persist failed for bot {}: {}", bot.id, err);
        }
        log_bot_with(
            &bot.id,
            "force_sell_executed",
            "info",
            json!({"amount": exec_amount, "price": exec_price}),
        )
        .await;
        Ok(())
    }

    /// worker主循环：轮询队列，逐个执行
    pub async fn run_loop(&self) {
        info!("bot worker loop started");
        loop {
            let job = match self.queue.next_job().await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    self.queue.idle_pause().await;
                    continue;
                }
                Err(err) => {
                    warn!("job queue poll failed: {}", err);
                    self.queue.idle_pause().await;
                    continue;
                }
            };
            match self.handle(&job).await {
                Ok(next) => {
                    // 先complete释放当前任务的去重占位，再排下一跳，
                    // 顺序反了的话固定id的入队会命中自己直接丢失
                    if let Err(err) = self.queue.complete(&job).await {
                        warn!("job {} complete failed: {}", job.id, err);
                    }
                    if let Some(r) = next {
                        if let Err(err) =
                            self.queue.enqueue(r.kind, &r.bot_id, r.delay_ms).await
                        {
                            warn!("job {} reschedule failed: {}", job.id, err);
                        }
                    }
                }
                Err(err) => {
                    if let Err(qerr) = self.queue.fail(&job, &err.to_string()).await {
                        warn!("job {} fail-requeue failed: {}", job.id, qerr);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_busy_retry_keeps_kind_and_uses_short_jitter() {
        // 锁竞争的重排不走失败重试，是短延迟抖动的下一跳
        for _ in 0..50 {
            let r = lock_busy_reschedule(BotJobKind::DeleteBot, "bot-1");
            assert_eq!(r.kind, BotJobKind::DeleteBot);
            assert_eq!(r.bot_id, "bot-1");
            assert!((1000..3000).contains(&r.delay_ms));
        }
        let r = lock_busy_reschedule(BotJobKind::BotTick, "bot-2");
        assert_eq!(r.kind, BotJobKind::BotTick);
    }
}
