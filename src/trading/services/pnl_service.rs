//! 盈亏计算：对订单流做FIFO撮合得到已实现盈亏，
//! 对未平仓lot按现价算浮动盈亏。全部是纯函数，金额统一round到8位。

use crate::trading::exchange::gateway::OrderSide;
use crate::trading::model::bot::BotEntry;
use crate::trading::model::bot_order::BotOrderEntity;

pub fn round8(v: f64) -> f64 {
    (v * 1e8).round() / 1e8
}

/// FIFO队列里一笔还没被卖出冲销的买入
#[derive(Debug, Clone, PartialEq)]
pub struct OpenLot {
    pub amount: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RealizedPnl {
    pub pnl: f64,
    /// 卖出总成交额
    pub sell_notional: f64,
    /// FIFO撮合后剩下的买入lot
    pub remaining: Vec<OpenLot>,
}

/// 按时间升序的订单流做FIFO撮合。
///
/// 卖出数量超过在手买入时，超出部分按零成本计（全额计为收益）：
/// 对账补录的订单可能早于对应买入入库，宁可多计后由下一轮修正，
/// 也不丢弃交易所确实发生过的成交。
pub fn compute_realized_pnl(orders: &[BotOrderEntity]) -> RealizedPnl {
    let mut queue: Vec<OpenLot> = Vec::new();
    let mut pnl = 0.0;
    let mut sell_notional = 0.0;

    for order in orders {
        let side = match order.side() {
            Some(s) => s,
            None => continue,
        };
        if order.amount <= 0.0 || order.price <= 0.0 {
            continue;
        }
        match side {
            OrderSide::Buy => queue.push(OpenLot {
                amount: order.amount,
                price: order.price,
            }),
            OrderSide::Sell => {
                let mut remaining = order.amount;
                sell_notional += order.amount * order.price;
                while remaining > 0.0 && !queue.is_empty() {
                    let lot = &mut queue[0];
                    let consumed = lot.amount.min(remaining);
                    pnl += (order.price - lot.price) * consumed;
                    lot.amount -= consumed;
                    remaining -= consumed;
                    if lot.amount <= 1e-12 {
                        queue.remove(0);
                    }
                }
                if remaining > 0.0 {
                    // 无对应买入，零成本入账
                    pnl += order.price * remaining;
                }
            }
        }
    }

    RealizedPnl {
        pnl: round8(pnl),
        sell_notional: round8(sell_notional),
        remaining: queue,
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnrealizedPnl {
    pub avg_price: f64,
    pub total_amount: f64,
    pub cost_basis: f64,
    pub market_value: f64,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// 未平仓lot的浮动盈亏
pub fn compute_unrealized_pnl(entries: &[BotEntry], current_price: f64) -> UnrealizedPnl {
    let mut cost_basis = 0.0;
    let mut total_amount = 0.0;
    for e in entries {
        if e.price <= 0.0 || e.amount <= 0.0 {
            continue;
        }
        cost_basis += e.price * e.amount;
        total_amount += e.amount;
    }
    if total_amount <= 0.0 {
        return UnrealizedPnl::default();
    }
    let avg_price = cost_basis / total_amount;
    let market_value = current_price * total_amount;
    let pnl = market_value - cost_basis;
    UnrealizedPnl {
        avg_price: round8(avg_price),
        total_amount: round8(total_amount),
        cost_basis: round8(cost_basis),
        market_value: round8(market_value),
        pnl: round8(pnl),
        pnl_pct: if cost_basis > 0.0 {
            round8(pnl / cost_basis * 100.0)
        } else {
            0.0
        },
    }
}
