//! 对账的纯投影部分：给定数据库里的lot列表和一笔交易所成交，
//! 算出应该落成什么状态。IO（取成交、写库）在job::recon_job里，
//! 这里只做可以直接单测的判定和FIFO折算。

use crate::trading::exchange::gateway::TradeFill;
use crate::trading::model::bot::BotEntry;
use crate::trading::services::pnl_service::round8;

/// 价格/数量比对用的容差
pub const MATCH_EPSILON: f64 = 1e-8;

/// 买入去重：order_id相同，或者价格和数量都在容差内相同，
/// 都视为已记录过的同一笔买入。
pub fn is_duplicate_entry(
    entries: &[BotEntry],
    order_id: Option<&str>,
    price: f64,
    amount: f64,
) -> bool {
    entries.iter().any(|e| {
        if let (Some(eid), Some(oid)) = (e.order_id.as_deref(), order_id) {
            if eid == oid {
                return true;
            }
        }
        (e.price - price).abs() < MATCH_EPSILON && (e.amount - amount).abs() < MATCH_EPSILON
    })
}

/// 已知订单对一批成交的补账计划。known里已经登记过的trade不再计入，
/// 这是"同一笔成交重放多少次都只入账一次"的判据；成交总量超过已
/// 记录量才调整数量/价格，否则只登记trade id。
#[derive(Debug, Clone, PartialEq)]
pub enum FillPlan {
    /// 没有新成交，什么都不用写
    UpToDate,
    /// 登记新trade id，必要时把数量/价格补到成交总量
    Register {
        amount: f64,
        price: f64,
        new_trade_ids: Vec<String>,
    },
}

pub fn plan_known_order_update(
    recorded_amount: f64,
    recorded_price: f64,
    known_trade_ids: &[String],
    fills: &[&TradeFill],
) -> FillPlan {
    let new_trade_ids: Vec<String> = fills
        .iter()
        .filter(|t| !known_trade_ids.contains(&t.trade_id))
        .map(|t| t.trade_id.clone())
        .collect();
    if new_trade_ids.is_empty() {
        return FillPlan::UpToDate;
    }

    let total: f64 = fills.iter().map(|t| t.amount).sum();
    let notional: f64 = fills.iter().map(|t| t.amount * t.price).sum();
    if total > recorded_amount + MATCH_EPSILON && total > 0.0 {
        FillPlan::Register {
            amount: total,
            price: notional / total,
            new_trade_ids,
        }
    } else {
        // 下单路径已经记全了数量，只登记trade id防止重复入账
        FillPlan::Register {
            amount: recorded_amount,
            price: recorded_price,
            new_trade_ids,
        }
    }
}

/// 交易所free余额相对本地仓位是否已经清零（容忍1%以内的粉尘）
pub fn position_drained(open_amount: f64, exchange_free: f64) -> bool {
    open_amount > 0.0 && exchange_free < open_amount * 0.01
}

/// 一笔卖出成交对在手lot的投影结果
#[derive(Debug, Clone, PartialEq)]
pub enum SellProjection {
    /// 仓位清零，bot应置为closed
    Closed {
        realized_pnl: f64,
        realized_notional: f64,
    },
    /// 还有剩余lot，重写entries
    Truncated {
        entries: Vec<BotEntry>,
        realized_pnl: f64,
        realized_notional: f64,
    },
}

impl SellProjection {
    pub fn realized_pnl(&self) -> f64 {
        match self {
            SellProjection::Closed { realized_pnl, .. } => *realized_pnl,
            SellProjection::Truncated { realized_pnl, .. } => *realized_pnl,
        }
    }
}

/// 把一笔卖出按FIFO冲销lot列表。
/// 卖出数量超过在手总量时，超出部分零成本计入收益（和pnl_service一致）。
pub fn apply_sell_fifo(entries: &[BotEntry], sell_amount: f64, sell_price: f64) -> SellProjection {
    let mut remaining_lots: Vec<BotEntry> = entries.to_vec();
    let mut to_consume = sell_amount;
    let mut pnl = 0.0;

    while to_consume > 0.0 && !remaining_lots.is_empty() {
        let lot = &mut remaining_lots[0];
        let consumed = lot.amount.min(to_consume);
        pnl += (sell_price - lot.price) * consumed;
        lot.amount -= consumed;
        to_consume -= consumed;
        if lot.amount <= MATCH_EPSILON {
            remaining_lots.remove(0);
        }
    }
    if to_consume > MATCH_EPSILON {
        pnl += sell_price * to_consume;
    }

    let realized_pnl = round8(pnl);
    let realized_notional = round8(sell_amount * sell_price);
    if remaining_lots.is_empty() {
        SellProjection::Closed {
            realized_pnl,
            realized_notional,
        }
    } else {
        SellProjection::Truncated {
            entries: remaining_lots,
            realized_pnl,
            realized_notional,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    fn entry(order_id: Option<&str>, price: f64, amount: f64) -> BotEntry {
        BotEntry {
            order_id: order_id.map(|s| s.to_string()),
            price,
            amount,
            ts: 0,
        }
    }

    #[test]
    fn duplicate_by_order_id() {
        let entries = vec![entry(Some("o-1"), 100.0, 0.1)];
        assert!(is_duplicate_entry(&entries, Some("o-1"), 101.0, 0.2));
        assert!(!is_duplicate_entry(&entries, Some("o-2"), 101.0, 0.2));
    }

    #[test]
    fn duplicate_by_price_and_amount() {
        // 旧数据没有order_id，靠价格+数量兜底去重
        let entries = vec![entry(None, 100.0, 0.1)];
        assert!(is_duplicate_entry(&entries, Some("o-9"), 100.0, 0.1));
        assert!(!is_duplicate_entry(&entries, Some("o-9"), 100.0, 0.2));
    }

    #[test]
    fn full_sell_closes_position() {
        let entries = vec![entry(None, 10.0, 1.0), entry(None, 12.0, 1.0)];
        match apply_sell_fifo(&entries, 2.0, 15.0) {
            SellProjection::Closed {
                realized_pnl,
                realized_notional,
            } => {
                assert!(approx_eq!(f64, realized_pnl, 8.0, epsilon = 1e-9));
                assert!(approx_eq!(f64, realized_notional, 30.0, epsilon = 1e-9));
            }
            other => panic!("expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn partial_sell_truncates_fifo() {
        let entries = vec![entry(None, 10.0, 1.0), entry(None, 12.0, 1.0)];
        match apply_sell_fifo(&entries, 1.5, 15.0) {
            SellProjection::Truncated {
                entries: rest,
                realized_pnl,
                ..
            } => {
                assert!(approx_eq!(f64, realized_pnl, 6.5, epsilon = 1e-9));
                assert_eq!(rest.len(), 1);
                assert!(approx_eq!(f64, rest[0].amount, 0.5, epsilon = 1e-9));
                assert!(approx_eq!(f64, rest[0].price, 12.0, epsilon = 1e-9));
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    fn fill(trade_id: &str, amount: f64, price: f64) -> TradeFill {
        use crate::trading::exchange::gateway::OrderSide;
        TradeFill {
            trade_id: trade_id.to_string(),
            order_id: Some("o-1".to_string()),
            side: OrderSide::Buy,
            amount,
            price,
            fee: 0.0,
            timestamp: 0,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn replaying_same_fills_registers_exactly_once() {
        // 下单路径已记1.0@10，交易所返回同一笔成交
        let fills_owned = vec![fill("t-1", 1.0, 10.0)];
        let fills: Vec<&TradeFill> = fills_owned.iter().collect();

        // 第一轮：登记trade id，数量不变（没有超出已记录量）
        let plan = plan_known_order_update(1.0, 10.0, &[], &fills);
        match plan {
            FillPlan::Register {
                amount,
                price,
                new_trade_ids,
            } => {
                assert!(approx_eq!(f64, amount, 1.0, epsilon = 1e-9));
                assert!(approx_eq!(f64, price, 10.0, epsilon = 1e-9));
                assert_eq!(new_trade_ids, vec!["t-1".to_string()]);
            }
            other => panic!("expected Register, got {:?}", other),
        }

        // 第二轮重放同一批成交：trade id已登记，不再入账
        let known = vec!["t-1".to_string()];
        assert_eq!(
            plan_known_order_update(1.0, 10.0, &known, &fills),
            FillPlan::UpToDate
        );
    }

    #[test]
    fn late_partial_fill_grows_recorded_amount() {
        // 已记0.5@10，交易所显示又成交了0.5@12
        let fills_owned = vec![fill("t-1", 0.5, 10.0), fill("t-2", 0.5, 12.0)];
        let fills: Vec<&TradeFill> = fills_owned.iter().collect();
        let known = vec!["t-1".to_string()];

        match plan_known_order_update(0.5, 10.0, &known, &fills) {
            FillPlan::Register {
                amount,
                price,
                new_trade_ids,
            } => {
                assert!(approx_eq!(f64, amount, 1.0, epsilon = 1e-9));
                assert!(approx_eq!(f64, price, 11.0, epsilon = 1e-9));
                assert_eq!(new_trade_ids, vec!["t-2".to_string()]);
            }
            other => panic!("expected Register, got {:?}", other),
        }

        // 重放：两个id都已登记
        let known = vec!["t-1".to_string(), "t-2".to_string()];
        assert_eq!(
            plan_known_order_update(1.0, 11.0, &known, &fills),
            FillPlan::UpToDate
        );
    }

    #[test]
    fn position_drained_tolerates_dust_only() {
        assert!(position_drained(1.0, 0.0));
        assert!(position_drained(1.0, 0.009));
        assert!(!position_drained(1.0, 0.5));
        assert!(!position_drained(1.0, 1.0));
        // 本地没有仓位就谈不上清零
        assert!(!position_drained(0.0, 0.0));
    }

    #[test]
    fn oversell_counts_excess_as_gain() {
        let entries = vec![entry(None, 10.0, 1.0)];
        match apply_sell_fifo(&entries, 1.5, 20.0) {
            SellProjection::Closed { realized_pnl, .. } => {
                // 1@10卖20赚10，多出的0.5零成本再赚10
                assert!(approx_eq!(f64, realized_pnl, 20.0, epsilon = 1e-9));
            }
            other => panic!("expected Closed, got {:?}", other),
        }
    }
}
