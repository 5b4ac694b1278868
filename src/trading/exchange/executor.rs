//! 下单执行器：在网关之上套一层精度/最小名义价值处理。
//!
//! 提交前先把数量round down到交易所精度，再按最小数量与最小名义价值
//! round up补足；无法构造合法数量时直接报InvalidAmount，绝不提交一笔
//! 注定被拒的订单。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::trading::exchange::gateway::{
    ExchangeGateway, MarketInfo, OrderParams, OrderSide, OrderType, PlacedOrder,
};
use crate::trading::exchange::precision::{
    compute_amount_for_min_notional, round_down_to_precision,
};

/// 市价买单需要附带price参数时加的保守滑点缓冲（0.1%）
const MARKET_BUY_SLIPPAGE: f64 = 0.001;

pub struct OrderExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    // 每个执行器实例内的简单市场元数据缓存
    markets: Mutex<HashMap<String, Option<MarketInfo>>>,
}

impl OrderExecutor {
    pub fn new(gateway: Arc<dyn ExchangeGateway>) -> Self {
        Self {
            gateway,
            markets: Mutex::new(HashMap::new()),
        }
    }

    pub fn gateway(&self) -> &Arc<dyn ExchangeGateway> {
        &self.gateway
    }

    async fn market(&self, symbol: &str) -> Result<Option<MarketInfo>, AppError> {
        {
            let cache = self.markets.lock().await;
            if let Some(market) = cache.get(symbol) {
                return Ok(market.clone());
            }
        }
        let market = self.gateway.load_market(symbol).await?;
        let mut cache = self.markets.lock().await;
        cache.insert(symbol.to_string(), market.clone());
        Ok(market)
    }

    /// 估算执行价：显式price > ticker(ask/last/bid) > 订单簿最优价
    async fn estimate_price(&self, symbol: &str, explicit: Option<f64>) -> f64 {
        if let Some(p) = explicit {
            if p > 0.0 {
                return p;
            }
        }
        match self.gateway.fetch_ticker(symbol).await {
            Ok(ticker) => {
                if let Some(p) = ticker.best_estimate() {
                    return p;
                }
            }
            Err(err) => {
                debug!("estimate_price: fetch_ticker failed for {}: {}", symbol, err);
            }
        }
        match self.gateway.fetch_order_book(symbol, 5).await {
            Ok(book) => {
                let best_ask = book.asks.first().map(|(p, _)| *p);
                let best_bid = book.bids.first().map(|(p, _)| *p);
                best_ask.or(best_bid).unwrap_or(0.0)
            }
            Err(err) => {
                debug!(
                    "estimate_price: fetch_order_book failed for {}: {}",
                    symbol, err
                );
                0.0
            }
        }
    }

    pub async fn create_order(&self, params: &OrderParams) -> Result<PlacedOrder, AppError> {
        if params.amount <= 0.0 || !params.amount.is_finite() {
            return Err(AppError::InvalidAmount(format!(
                "create_order missing or invalid amount for {}",
                params.symbol
            )));
        }

        let market = self.market(&params.symbol).await?;
        let exec_price = self.estimate_price(&params.symbol, params.price).await;

        let adjusted = compute_amount_for_min_notional(params.amount, exec_price, market.as_ref())
            .ok_or_else(|| {
                AppError::InvalidAmount(format!(
                    "unable to compute a valid amount for {} (amount={}, price={}) per market precision/min notional",
                    params.symbol, params.amount, exec_price
                ))
            })?;
        if (adjusted - params.amount).abs() > f64::EPSILON {
            debug!(
                "create_order adjusted amount {} -> {} for {}",
                params.amount, adjusted, params.symbol
            );
        }

        let price_arg = self.price_arg_for(params, market.as_ref(), exec_price)?;

        let placed = self
            .gateway
            .place_order(
                &params.symbol,
                params.order_type,
                params.side,
                adjusted,
                price_arg,
            )
            .await
            .map_err(|err| {
                // 带上市场元数据方便诊断精度/最小下单额类的拒单
                warn!(
                    "place_order rejected for {}: {} (market={:?})",
                    params.symbol, err, market
                );
                AppError::ExchangeError(format!(
                    "exchange create_order failed: {} market_meta={}",
                    err,
                    serde_json::to_string(&market).unwrap_or_default()
                ))
            })?;
        Ok(placed)
    }

    /// 市价买单在要求price参数的交易所上要附带一个保守估价：
    /// 向下取整到价格精度后加0.1%滑点缓冲再取整。限价单透传显式price，
    /// 市价卖单不带price。
    fn price_arg_for(
        &self,
        params: &OrderParams,
        market: Option<&MarketInfo>,
        exec_price: f64,
    ) -> Result<Option<f64>, AppError> {
        let is_market_buy =
            params.order_type == OrderType::Market && params.side == OrderSide::Buy;
        let requires_price = market.map(|m| m.market_buy_requires_price).unwrap_or(false);

        if is_market_buy && requires_price {
            if exec_price <= 0.0 {
                return Err(AppError::InvalidAmount(
                    "cannot supply price for market buy: no valid market price".to_string(),
                ));
            }
            let price_precision = market.and_then(|m| m.price_precision);
            let mut price_arg = round_down_to_precision(exec_price, price_precision);
            price_arg *= 1.0 + MARKET_BUY_SLIPPAGE;
            price_arg = round_down_to_precision(price_arg, price_precision);
            return Ok(Some(price_arg));
        }

        Ok(match params.order_type {
            OrderType::Market => None,
            OrderType::Limit => params.price,
        })
    }
}
