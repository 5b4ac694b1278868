//! DCA决策引擎：纯函数，输入(bot配置, 当前lot列表, 实时价格, 指标)，
//! 输出本周期的决策。每个周期固定先判退出再判入场，同一个周期里
//! 同时满足退出和加仓条件时只卖不买。

use serde::{Deserialize, Serialize};

use crate::trading::exchange::gateway::{OrderParams, OrderSide, OrderType};
use crate::trading::model::bot::{BotConfig, BotEntry};

/// 第2笔加仓要求相对第1笔跌幅≥10%，第3笔相对第2笔≥15%。
/// 固定策略常量，不开放给用户配置。
const SECOND_ENTRY_DROP_PCT: f64 = -10.0;
const THIRD_ENTRY_DROP_PCT: f64 = -15.0;
/// RSI入场阈值
const RSI_ENTRY_THRESHOLD: f64 = 40.0;
/// 决策阶段的数量精度（执行层还会按交易所精度再处理一次）
const AMOUNT_DECIMALS: i32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    TakeProfit,
    StopLoss,
}

impl ExitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitKind::TakeProfit => "tp",
            ExitKind::StopLoss => "sl",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub params: OrderParams,
    pub kind: ExitKind,
    pub reason: String,
}

/// 入场判定结果
#[derive(Debug, Clone)]
pub enum EntryDecision {
    Place(OrderParams),
    Skip(String),
}

impl EntryDecision {
    pub fn order(&self) -> Option<&OrderParams> {
        match self {
            EntryDecision::Place(p) => Some(p),
            EntryDecision::Skip(_) => None,
        }
    }
}

/// 技术指标gating用的市场指标（外部数据管道按pair维护）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DcaMetrics {
    pub ema200_4h: Option<f64>,
    pub rsi_4h: Option<f64>,
    pub btc_1h: Option<f64>,
    pub btc_1h_ema200: Option<f64>,
}

pub fn pct_diff(current: f64, from: f64) -> f64 {
    (current - from) / from * 100.0
}

fn round_amount(amount: f64) -> f64 {
    let factor = 10f64.powi(AMOUNT_DECIMALS);
    (amount * factor).round() / factor
}

/// 数量加权均价。价格或数量为0的脏lot跳过不计。
/// 返回 (avg_price, total_amount, total_notional)
pub fn compute_avg_price_and_amount(entries: &[BotEntry]) -> (f64, f64, f64) {
    let mut total_notional = 0.0;
    let mut total_amount = 0.0;
    for e in entries {
        if e.price <= 0.0 || e.amount <= 0.0 {
            continue;
        }
        total_notional += e.price * e.amount;
        total_amount += e.amount;
    }
    let avg = if total_amount > 0.0 {
        total_notional / total_amount
    } else {
        0.0
    };
    (avg, total_amount, total_notional)
}

/// 退出判定：偏离均价≥止盈线 => 全仓市价卖出(tp)；
/// 配置了止损且偏离≤-|止损线| => 全仓市价卖出(sl)。
pub fn check_exit(
    pair: &str,
    cfg: &BotConfig,
    entries: &[BotEntry],
    price: f64,
) -> Option<ExitDecision> {
    if entries.is_empty() || price <= 0.0 {
        return None;
    }
    let (avg_price, total_amount, _) = compute_avg_price_and_amount(entries);
    if total_amount <= 0.0 || avg_price <= 0.0 {
        return None;
    }

    let pnl_pct = pct_diff(price, avg_price);

    let sell = |kind: ExitKind, reason: String| ExitDecision {
        params: OrderParams {
            symbol: pair.to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            amount: round_amount(total_amount),
            price: None,
        },
        kind,
        reason,
    };

    if cfg.take_profit_pct > 0.0 && pnl_pct >= cfg.take_profit_pct {
        return Some(sell(
            ExitKind::TakeProfit,
            format!("tp reached ({:.2}% >= {}%)", pnl_pct, cfg.take_profit_pct),
        ));
    }

    if let Some(sl) = cfg.stop_loss_pct {
        if pnl_pct <= -sl.abs() {
            return Some(sell(
                ExitKind::StopLoss,
                format!("sl reached ({:.2}% <= -{}%)", pnl_pct, sl.abs()),
            ));
        }
    }

    None
}

/// 入场判定，只在没有退出信号时调用。
/// 顺序：指标gating（可关） -> 最大加仓次数 -> 阶梯跌幅 -> 仓位上限与最小下单额。
pub fn run_dca_step(
    pair: &str,
    cfg: &BotConfig,
    entries: &[BotEntry],
    price: f64,
    metrics: &DcaMetrics,
) -> EntryDecision {
    if price <= 0.0 {
        return EntryDecision::Skip("no price".to_string());
    }

    if cfg.enable_indicators {
        let below_ema = metrics.ema200_4h.map(|v| price < v).unwrap_or(false);
        let rsi_ok = metrics.rsi_4h.map(|v| v < RSI_ENTRY_THRESHOLD).unwrap_or(false);
        let btc_trend_ok = match (metrics.btc_1h, metrics.btc_1h_ema200) {
            (Some(px), Some(ema)) => px > ema,
            _ => false,
        };

        let mut failed: Vec<&str> = Vec::new();
        if !below_ema {
            failed.push("price is above the 4H EMA200");
        }
        if !rsi_ok {
            failed.push("RSI 4H is too high");
        }
        if !btc_trend_ok {
            failed.push("BTC 1H is below its EMA200 (downtrend)");
        }
        if !failed.is_empty() {
            return EntryDecision::Skip(format!(
                "entry conditions not met: {}",
                failed.join(", ")
            ));
        }
    }

    if entries.len() >= cfg.max_entries {
        return EntryDecision::Skip("max entries reached".to_string());
    }

    // 阶梯跌幅：不满足跌幅就不追加
    if let Some(last) = entries.last() {
        let drop = pct_diff(price, last.price);
        if entries.len() == 1 && drop > SECOND_ENTRY_DROP_PCT {
            return EntryDecision::Skip("not dropped enough for 2nd entry".to_string());
        }
        if entries.len() == 2 && drop > THIRD_ENTRY_DROP_PCT {
            return EntryDecision::Skip("not dropped enough for 3rd entry".to_string());
        }
    }

    // 仓位计算
    let allocation_usd = (cfg.portfolio_usd * cfg.per_buy_pct / 100.0)
        .floor()
        .max(cfg.min_order_usd);
    let existing_notional: f64 = entries.iter().map(|e| e.price * e.amount).sum();
    let max_alloc_usd = cfg.portfolio_usd * cfg.max_alloc_pct / 100.0;
    if existing_notional + allocation_usd > max_alloc_usd {
        return EntryDecision::Skip("exceeds max allocation".to_string());
    }

    let amount = round_amount(allocation_usd / price);
    if allocation_usd < cfg.min_order_usd || amount <= 0.0 {
        return EntryDecision::Skip("order too small".to_string());
    }

    EntryDecision::Place(OrderParams {
        symbol: pair.to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        amount,
        price: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_util;

    fn entry(price: f64, amount: f64) -> BotEntry {
        BotEntry {
            order_id: None,
            price,
            amount,
            ts: time_util::now_millis(),
        }
    }

    fn cfg() -> BotConfig {
        BotConfig::default()
    }

    #[test]
    fn first_entry_allowed_unconditionally_when_gates_pass() {
        let decision = run_dca_step("BTC/USDT", &cfg(), &[], 100.0, &DcaMetrics::default());
        let params = decision.order().expect("first buy should pass");
        assert_eq!(params.side, OrderSide::Buy);
        // alloc = max(10, floor(100*5/100)) = 10 => amount = 0.1
        assert!((params.amount - 0.1).abs() < 1e-9);
    }

    #[test]
    fn second_entry_requires_ten_pct_drop() {
        let entries = vec![entry(100.0, 0.1)];
        let m = DcaMetrics::default();
        let rejected = run_dca_step("BTC/USDT", &cfg(), &entries, 91.0, &m);
        assert!(rejected.order().is_none(), "9% drop must be rejected");
        let allowed = run_dca_step("BTC/USDT", &cfg(), &entries, 89.0, &m);
        assert!(allowed.order().is_some(), "11% drop must pass");
    }

    #[test]
    fn third_entry_requires_fifteen_pct_drop() {
        // 小仓位保证不会先撞到max_alloc上限
        let entries = vec![entry(100.0, 0.05), entry(89.0, 0.05)];
        let m = DcaMetrics::default();
        // 76.5相对89只跌了约14%
        let rejected = run_dca_step("BTC/USDT", &cfg(), &entries, 76.5, &m);
        assert!(rejected.order().is_none());
        let allowed = run_dca_step("BTC/USDT", &cfg(), &entries, 75.0, &m);
        assert!(allowed.order().is_some());
    }

    #[test]
    fn max_entries_blocks_further_buys() {
        let entries = vec![entry(100.0, 0.1), entry(89.0, 0.1), entry(75.0, 0.1)];
        let decision = run_dca_step("BTC/USDT", &cfg(), &entries, 50.0, &DcaMetrics::default());
        assert!(decision.order().is_none());
    }

    #[test]
    fn max_allocation_blocks_buy() {
        let mut c = cfg();
        c.max_alloc_pct = 10.0; // 上限10 USD
        let entries = vec![entry(100.0, 0.05)]; // 已占用5 USD，再买10会超
        let decision = run_dca_step("BTC/USDT", &c, &entries, 89.0, &DcaMetrics::default());
        assert!(decision.order().is_none());
    }

    #[test]
    fn indicator_gating_rejects_when_conditions_fail() {
        let mut c = cfg();
        c.enable_indicators = true;
        let m = DcaMetrics {
            ema200_4h: Some(90.0), // price 100 > ema => fail
            rsi_4h: Some(35.0),
            btc_1h: Some(50000.0),
            btc_1h_ema200: Some(49000.0),
        };
        let decision = run_dca_step("BTC/USDT", &c, &[], 100.0, &m);
        assert!(decision.order().is_none());

        // 全部满足时放行
        let m_ok = DcaMetrics {
            ema200_4h: Some(110.0),
            ..m
        };
        let decision = run_dca_step("BTC/USDT", &c, &[], 100.0, &m_ok);
        assert!(decision.order().is_some());
    }

    #[test]
    fn take_profit_fires_on_weighted_average() {
        let entries = vec![entry(100.0, 1.0), entry(80.0, 1.0)]; // avg 90
        // tp 18% => 需要 >= 106.2，用106.3避开浮点边界
        let exit = check_exit("BTC/USDT", &cfg(), &entries, 106.3).expect("tp");
        assert_eq!(exit.kind, ExitKind::TakeProfit);
        assert!((exit.params.amount - 2.0).abs() < 1e-9);
        assert!(check_exit("BTC/USDT", &cfg(), &entries, 106.0).is_none());
    }

    #[test]
    fn stop_loss_fires_only_when_configured() {
        let entries = vec![entry(100.0, 1.0)];
        let mut c = cfg();
        assert!(check_exit("BTC/USDT", &c, &entries, 80.0).is_none());
        c.stop_loss_pct = Some(12.0);
        let exit = check_exit("BTC/USDT", &c, &entries, 87.0).expect("sl");
        assert_eq!(exit.kind, ExitKind::StopLoss);
    }

    #[test]
    fn exit_wins_over_entry_in_same_cycle() {
        // 止盈和入场条件同时满足时，本周期只会产生卖出决策：
        // worker固定先check_exit，命中即返回，不再评估买入。
        let mut c = cfg();
        c.enable_indicators = false;
        let entries = vec![entry(100.0, 0.05)];
        let price = 120.0; // +20% >= tp 18%
        let exit = check_exit("BTC/USDT", &c, &entries, price);
        assert!(exit.is_some());
        // 入场侧本身也可能放行（证明确实是顺序在起作用）
        let entry_decision = run_dca_step("BTC/USDT", &c, &[], price, &DcaMetrics::default());
        assert!(entry_decision.order().is_some());
    }
}
