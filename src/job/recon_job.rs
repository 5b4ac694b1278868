//! 对账进程：周期性把交易所侧的真实成交投影回数据库。
//!
//! 三个pass，全部幂等，可以随时重跑：
//! 1. trades pass  按成交记录补齐漏记的买入/卖出（trade id去重）
//! 2. orders pass  对已知订单补部分成交的增量
//! 3. balance pass 余额快照 + 交易所侧已经清零的仓位强制close
//!
//! 互斥层级：先拿per-user锁再拿per-bot锁，和tick worker抢同一把
//! bot锁，保证对账写入时该bot没有tick在跑。任何单个用户/bot的失败
//! 只告警，不影响同一轮里的其他对象。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::app_config::env::env_num;
use crate::coordination::rate_limiter::credential_fingerprint;
use crate::coordination::{RateLimiter, RedisLock};
use crate::error::AppError;
use crate::job::bot_worker::bot_lock_key;
use crate::job::queue::{BotJob, BotJobKind, JobQueue};
use crate::time_util;
use crate::trading::exchange::gateway::{
    split_symbol, BalanceSnapshot, ExchangeGateway, GatewayFactory, OrderSide, TradeFill,
};
use crate::trading::model::bot::{BotEntity, BotEntry, BotStatus, BotsModel};
use crate::trading::model::bot_log::log_bot_with;
use crate::trading::model::bot_order::{BotOrderEntity, BotOrdersModel, NewBotOrder};
use crate::trading::model::metrics::MetricsModel;
use crate::trading::model::user::{UserEntity, UsersModel};
use crate::trading::services::pnl_service::compute_realized_pnl;
use crate::trading::services::recon_service::{
    apply_sell_fifo, is_duplicate_entry, plan_known_order_update, position_drained, FillPlan,
    SellProjection, MATCH_EPSILON,
};

fn recon_interval_ms() -> u64 {
    env_num("RECON_INTERVAL_MS", 15_000u64)
}
fn recon_user_batch() -> u32 {
    env_num("RECON_USER_BATCH", 20u32)
}
fn recon_trades_limit() -> usize {
    env_num("RECON_TRADES_LIMIT", 200usize)
}
fn user_lock_wait_ms() -> u64 {
    env_num("RECON_USER_LOCK_WAIT_MS", 2_000u64)
}
fn bot_lock_wait_ms() -> u64 {
    env_num("RECON_BOT_LOCK_WAIT_MS", 1_000u64)
}
fn lock_ttl_ms() -> u64 {
    env_num("LOCK_TTL_MS", 30_000u64)
}
fn lock_renew_threshold_ms() -> u64 {
    env_num("LOCK_RENEW_THRESHOLD_MS", 10_000u64)
}
fn rate_wait_ms() -> u64 {
    env_num("RATE_WAIT_MS", 10_000u64)
}

fn user_lock_key(user_id: &str) -> String {
    format!("recon-user-lock:{}", user_id)
}

pub struct ReconWorker {
    lock: RedisLock,
    limiter: RateLimiter,
    queue: JobQueue,
    factory: Arc<dyn GatewayFactory>,
}

impl ReconWorker {
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

    pub async fn run_loop(&self) {
        info!("recon loop started, interval={}ms", recon_interval_ms());
        let mut interval = tokio::time::interval(Duration::from_millis(recon_interval_ms()));
        loop {
            interval.tick().await;
            if let Err(err) = self.run_cycle().await {
                warn!("recon cycle failed: {}", err);
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<(), AppError> {
        let users = UsersModel::new()
            .find_with_api_keys(recon_user_batch())
            .await?;
        for user in users {
            let key = user_lock_key(&user.id);
            let token = match self
                .lock
                .acquire(&key, lock_ttl_ms(), user_lock_wait_ms())
                .await?
            {
                Some(t) => t,
                None => continue, // 别的对账实例在处理这个用户
            };
            let result = {
                let _renewal = self.lock.spawn_renewal(
                    &key,
                    &token,
                    lock_ttl_ms(),
                    lock_renew_threshold_ms(),
                );
                self.recon_user(&user).await
            };
            self.lock.release(&key, &token).await;
            if let Err(err) = result {
                warn!("recon failed for user {}: {}", user.id, err);
            }
        }
        Ok(())
    }

    async fn recon_user(&self, user: &UserEntity) -> Result<(), AppError> {
        let gateway = self.factory.connect(user)?;
        let rate_key = credential_fingerprint(user.exchange_id(), user.api_key.as_deref());
        let bots = BotsModel::new().find_by_user(&user.id).await?;
        let active: Vec<BotEntity> = bots
            .into_iter()
            .filter(|b| b.status() == Some(BotStatus::Running))
            .collect();
        if active.is_empty() {
            return Ok(());
        }

        // 余额每轮每用户只取一次，具体要不要强制close由持锁的
        // per-bot对账拿最新entries判断
        if !self.limiter.acquire(&rate_key, 1, rate_wait_ms()).await {
            return Err(AppError::BizError(format!(
                "recon rate limited (balance) for user {}",
                user.id
            )));
        }
        let balance: BalanceSnapshot = gateway.fetch_balance().await?;

        for bot in &active {
            let key = bot_lock_key(&bot.id);
            let token = match self
                .lock
                .acquire(&key, lock_ttl_ms(), bot_lock_wait_ms())
                .await?
            {
                Some(t) => t,
                None => continue, // tick在跑，下一轮再对
            };
            let result = {
                let _renewal = self.lock.spawn_renewal(
                    &key,
                    &token,
                    lock_ttl_ms(),
                    lock_renew_threshold_ms(),
                );
                self.recon_bot(bot, gateway.as_ref(), &rate_key, &balance)
                    .await
            };
            self.lock.release(&key, &token).await;
            if let Err(err) = result {
                warn!("recon failed for bot {}: {}", bot.id, err);
            }
        }
        Ok(())
    }

    /// 单个bot的trades pass + orders pass + balance pass（持该bot的锁）
    async fn recon_bot(
        &self,
        bot: &BotEntity,
        gateway: &dyn ExchangeGateway,
        rate_key: &str,
        balance: &BalanceSnapshot,
    ) -> Result<(), AppError> {
        // 持锁后重读，拿到最新entries
        let bots = BotsModel::new();
        let bot = match bots.find_by_id(&bot.id).await? {
            Some(b) if b.status() == Some(BotStatus::Running) => b,
            _ => return Ok(()),
        };

        if !self.limiter.acquire(rate_key, 1, rate_wait_ms()).await {
            return Err(AppError::BizError(format!(
                "recon rate limited for bot {}",
                bot.id
            )));
        }
        let trades = gateway
            .fetch_my_trades(&bot.pair, recon_trades_limit())
            .await?;
        let mut entries = bot.parse_entries();
        self.trades_pass(&bot, &trades, &mut entries).await?;
        self.orders_pass(&bot, gateway, rate_key).await?;
        // entries跟着前两个pass走，是锁内的最新仓位
        self.balance_pass(&bot, gateway, balance, &entries).await?;
        Ok(())
    }

    async fn trades_pass(
        &self,
        bot: &BotEntity,
        trades: &[TradeFill],
        entries: &mut Vec<BotEntry>,
    ) -> Result<(), AppError> {
        // 有order id的成交按订单聚合，没有的单笔处理
        let mut by_order: HashMap<String, Vec<&TradeFill>> = HashMap::new();
        let mut orphans: Vec<&TradeFill> = Vec::new();
        for t in trades {
            match t.order_id.as_deref() {
                Some(oid) => by_order.entry(oid.to_string()).or_default().push(t),
                None => orphans.push(t),
            }
        }

        let orders_model = BotOrdersModel::new();

        for (order_id, fills) in &by_order {
            match orders_model.find_by_order_id(order_id).await? {
                Some(rec) => {
                    self.apply_known_order_fills(&rec, fills).await?;
                }
                None => {
                    self.project_unknown_execution(
                        bot,
                        Some(order_id.as_str()),
                        fills,
                        entries,
                    )
                    .await?;
                }
            }
        }

        for t in orphans {
            if orders_model.find_by_trade_id(&t.trade_id).await?.is_some() {
                continue;
            }
            self.project_unknown_execution(bot, None, &[t], entries)
                .await?;
        }
        Ok(())
    }

    /// 已知订单：只补增量，trade id列表是幂等判据（判定在recon_service里）
    async fn apply_known_order_fills(
        &self,
        rec: &BotOrderEntity,
        fills: &[&TradeFill],
    ) -> Result<(), AppError> {
        let known = rec.parse_trade_ids();
        match plan_known_order_update(rec.amount, rec.price, &known, fills) {
            FillPlan::UpToDate => Ok(()),
            FillPlan::Register {
                amount,
                price,
                new_trade_ids,
            } => {
                let orders_model = BotOrdersModel::new();
                for tid in &new_trade_ids {
                    orders_model
                        .apply_fill_delta(&rec.id, amount, price, Some(tid))
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// 数据库完全不知道的一次执行（漏记的买入或卖出）
    async fn project_unknown_execution(
        &self,
        bot: &BotEntity,
        order_id: Option<&str>,
        fills: &[&TradeFill],
        entries: &mut Vec<BotEntry>,
    ) -> Result<(), AppError> {
        let total: f64 = fills.iter().map(|t| t.amount).sum();
        if total <= 0.0 {
            return Ok(());
        }
        let notional: f64 = fills.iter().map(|t| t.amount * t.price).sum();
        let avg_price = notional / total;
        let side = fills[0].side;
        let trade_ids: Vec<String> = fills.iter().map(|t| t.trade_id.clone()).collect();
        let raw = json!(fills.iter().map(|t| &t.raw).collect::<Vec<_>>());

        let bots = BotsModel::new();
        match side {
            OrderSide::Buy => {
                if is_duplicate_entry(entries, order_id, avg_price, total) {
                    return Ok(());
                }
                BotOrdersModel::new()
                    .insert(NewBotOrder {
                        bot_id: bot.id.clone(),
                        order_id: order_id.map(|s| s.to_string()),
                        side: OrderSide::Buy,
                        amount: total,
                        price: avg_price,
                        raw,
                        trade_ids,
                        exit_type: None,
                        reason: Some("recovered by reconciliation".to_string()),
                        reconciled: true,
                    })
                    .await?;
                let entry = BotEntry {
                    order_id: order_id.map(|s| s.to_string()),
                    price: avg_price,
                    amount: total,
                    ts: time_util::now_millis(),
                };
                bots.push_entry(&bot.id, &entry).await?;
                entries.push(entry);
                log_bot_with(
                    &bot.id,
                    "recon_entry_recovered",
                    "warn",
                    json!({"price": avg_price, "amount": total}),
                )
                .await;
            }
            OrderSide::Sell => {
                BotOrdersModel::new()
                    .insert(NewBotOrder {
                        bot_id: bot.id.clone(),
                        order_id: order_id.map(|s| s.to_string()),
                        side: OrderSide::Sell,
                        amount: total,
                        price: avg_price,
                        raw,
                        trade_ids,
                        exit_type: Some("recon".to_string()),
                        reason: Some("recovered by reconciliation".to_string()),
                        reconciled: true,
                    })
                    .await?;
                match apply_sell_fifo(entries, total, avg_price) {
                    SellProjection::Closed {
                        realized_pnl,
                        realized_notional,
                    } => {
                        bots.set_entries(&bot.id, &[]).await?;
                        bots.set_closed(&bot.id, Some(realized_pnl), Some(realized_notional))
                            .await?;
                        self.queue
                            .remove(&BotJob::job_id(BotJobKind::BotTick, &bot.id))
                            .await?;
                        entries.clear();
                        log_bot_with(
                            &bot.id,
                            "recon_closed",
                            "warn",
                            json!({"realized_pnl": realized_pnl}),
                        )
                        .await;
                    }
                    SellProjection::Truncated {
                        entries: remaining,
                        realized_pnl,
                        ..
                    } => {
                        bots.set_entries(&bot.id, &remaining).await?;
                        *entries = remaining;
                        log_bot_with(
                            &bot.id,
                            "recon_sell_applied",
                            "warn",
                            json!({"realized_pnl": realized_pnl}),
                        )
                        .await;
                    }
                }
            }
        }
        Ok(())
    }

    /// orders pass：对已知订单补部分成交的增量。
    /// 交易所不支持全量订单查询时回退到open orders。
    async fn orders_pass(
        &self,
        bot: &BotEntity,
        gateway: &dyn ExchangeGateway,
        rate_key: &str,
    ) -> Result<(), AppError> {
        if !self.limiter.acquire(rate_key, 1, rate_wait_ms()).await {
            return Err(AppError::BizError(format!(
                "recon rate limited (orders) for bot {}",
                bot.id
            )));
        }
        let orders = match gateway.fetch_orders(&bot.pair, recon_trades_limit()).await {
            Ok(list) => list,
            Err(_) => {
                gateway
                    .fetch_open_orders(&bot.pair, recon_trades_limit())
                    .await?
            }
        };
        let orders_model = BotOrdersModel::new();
        for ex in &orders {
            let order_id = match ex.order_id.as_deref() {
                Some(id) => id,
                None => continue,
            };
            if let Some(rec) = orders_model.find_by_order_id(order_id).await? {
                let filled = ex.filled_or_amount();
                if filled > rec.amount + MATCH_EPSILON {
                    let price = ex
                        .average
                        .or(ex.price)
                        .filter(|p| *p > 0.0)
                        .unwrap_or(rec.price);
                    orders_model
                        .apply_fill_delta(&rec.id, filled, price, None)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// 余额快照 + 强制close：交易所里base资产已经清零、bot却还挂着仓位，
    /// 说明仓位在库外被卖掉了，直接close防止继续按幻影仓位做决策。
    /// 调用方持有该bot的锁，entries是trades/orders pass之后的最新仓位。
    async fn balance_pass(
        &self,
        bot: &BotEntity,
        gateway: &dyn ExchangeGateway,
        balance: &BalanceSnapshot,
        entries: &[BotEntry],
    ) -> Result<(), AppError> {
        let (base, _quote) = split_symbol(&bot.pair);
        let free = balance.free_of(base);
        let snapshot = json!({
            "free": free,
            "asset": base,
            "exchange": gateway.exchange_id(),
        });
        if let Err(err) = MetricsModel::new()
            .upsert_balance_snapshot(&bot.pair, &snapshot)
            .await
        {
            warn!("balance snapshot upsert failed for {}: {}", bot.pair, err);
        }

        let open: f64 = entries.iter().map(|e| e.amount).sum();
        if !position_drained(open, free) {
            return Ok(());
        }

        // 已实现盈亏从订单流算，不能丢掉库外卖出已经补录的那部分
        let ledger = BotOrdersModel::new().list_by_bot(&bot.id).await?;
        let realized = compute_realized_pnl(&ledger);
        let bots_model = BotsModel::new();
        bots_model.set_entries(&bot.id, &[]).await?;
        bots_model
            .set_closed(&bot.id, Some(realized.pnl), Some(realized.sell_notional))
            .await?;
        self.queue
            .remove(&BotJob::job_id(BotJobKind::BotTick, &bot.id))
            .await?;
        log_bot_with(
            &bot.id,
            "recon_force_closed",
            "warn",
            json!({
                "exchange_free": free,
                "recorded_open": open,
                "realized_pnl": realized.pnl,
            }),
        )
        .await;
        Ok(())
    }
}
