//! 数量精度与最小下单额的计算。
//! 先向下取整到交易所允许的小数位，再按最小数量/最小名义价值向上补足。

use super::gateway::MarketInfo;

fn pow10(n: u32) -> f64 {
    10f64.powi(n as i32)
}

/// 向下取整到指定小数位，precision为None时原样返回
pub fn round_down_to_precision(amount: f64, precision: Option<u32>) -> f64 {
    match precision {
        Some(p) => {
            let factor = pow10(p);
            (amount * factor).floor() / factor
        }
        None => amount,
    }
}

/// 向上取整到指定小数位
pub fn round_up_to_precision(amount: f64, precision: Option<u32>) -> f64 {
    match precision {
        Some(p) => {
            let factor = pow10(p);
            (amount * factor).ceil() / factor
        }
        None => amount,
    }
}

/// 计算同时满足精度、最小数量、最小名义价值的下单数量。
/// 无法构造时返回None，调用方应当直接失败而不是提交一笔注定被拒的订单。
pub fn compute_amount_for_min_notional(
    desired_amount: f64,
    price: f64,
    market: Option<&MarketInfo>,
) -> Option<f64> {
    let market = match market {
        Some(m) => m,
        None => return Some(desired_amount),
    };
    let precision = market.amount_precision;

    let mut amt = round_down_to_precision(desired_amount, precision);

    // 最小名义价值：需要 amount * price >= min_notional
    if let Some(min_notional) = market.min_notional {
        if min_notional > 0.0 && price > 0.0 {
            let required = round_up_to_precision(min_notional / price, precision);
            if amt < required {
                amt = required;
            }
        }
    }

    // 最小数量
    if let Some(min_amount) = market.min_amount {
        if min_amount > 0.0 {
            let min_rounded = round_up_to_precision(min_amount, precision);
            if amt < min_rounded {
                amt = min_rounded;
            }
        }
    }

    // 补足过程可能产生超出精度的尾数，最后再向下取整一次
    amt = round_down_to_precision(amt, precision);

    if !amt.is_finite() || amt <= 0.0 {
        return None;
    }
    Some(amt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::approx_eq;

    fn market(
        amount_precision: Option<u32>,
        min_amount: Option<f64>,
        min_notional: Option<f64>,
    ) -> MarketInfo {
        MarketInfo {
            amount_precision,
            price_precision: Some(2),
            min_amount,
            min_notional,
            market_buy_requires_price: true,
        }
    }

    #[test]
    fn rounds_down_to_precision() {
        assert!(approx_eq!(
            f64,
            round_down_to_precision(0.123456789, Some(4)),
            0.1234,
            epsilon = 1e-12
        ));
        assert_eq!(round_down_to_precision(0.5, None), 0.5);
    }

    #[test]
    fn raises_amount_to_meet_min_notional() {
        // price=20000, min_notional=10 => 至少需要 0.0005
        let m = market(Some(4), None, Some(10.0));
        let amt = compute_amount_for_min_notional(0.0001, 20000.0, Some(&m)).unwrap();
        assert!(approx_eq!(f64, amt, 0.0005, epsilon = 1e-12));
    }

    #[test]
    fn raises_amount_to_meet_min_amount() {
        let m = market(Some(3), Some(0.01), None);
        let amt = compute_amount_for_min_notional(0.002, 100.0, Some(&m)).unwrap();
        assert!(approx_eq!(f64, amt, 0.01, epsilon = 1e-12));
    }

    #[test]
    fn keeps_valid_amount_unchanged() {
        let m = market(Some(6), Some(0.001), Some(5.0));
        let amt = compute_amount_for_min_notional(0.5, 100.0, Some(&m)).unwrap();
        assert!(approx_eq!(f64, amt, 0.5, epsilon = 1e-12));
    }

    #[test]
    fn impossible_amount_returns_none() {
        let m = market(Some(0), None, None);
        // 精度0位小数，0.4向下取整后为0，无法构造
        assert!(compute_amount_for_min_notional(0.4, 100.0, Some(&m)).is_none());
    }

    #[test]
    fn no_market_passes_through() {
        assert_eq!(compute_amount_for_min_notional(0.42, 10.0, None), Some(0.42));
    }
}
