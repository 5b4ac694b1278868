//! 交易所网关抽象
//!
//! 所有交易所返回的记录在这一层统一成规范形状（字段名回退只发生在
//! 网关实现内部），核心逻辑永远不做ad hoc的字段名兜底。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::trading::model::user::UserEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Some(OrderSide::Buy),
            "sell" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

/// 下单参数（决策引擎的输出）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderParams {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ticker {
    pub last: Option<f64>,
    pub ask: Option<f64>,
    pub bid: Option<f64>,
    pub close: Option<f64>,
}

impl Ticker {
    /// 市价单的成交价估计：优先卖一价，其次最新价，最后买一价
    pub fn best_estimate(&self) -> Option<f64> {
        self.ask.or(self.last).or(self.bid)
    }

    /// 持久化兜底价：最新价或收盘价
    pub fn last_or_close(&self) -> Option<f64> {
        self.last.or(self.close)
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderBook {
    /// (price, amount)，按价格升序
    pub asks: Vec<(f64, f64)>,
    /// (price, amount)，按价格降序
    pub bids: Vec<(f64, f64)>,
}

/// 交易对的精度与下限约束
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarketInfo {
    pub amount_precision: Option<u32>,
    pub price_precision: Option<u32>,
    pub min_amount: Option<f64>,
    pub min_notional: Option<f64>,
    /// 部分交易所的市价买单必须附带price参数用来估算cost
    pub market_buy_requires_price: bool,
}

/// 已提交订单的规范形状。filled/price以交易所回报为准，
/// 缺失时由调用方用估算值兜底。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub id: Option<String>,
    pub amount: Option<f64>,
    pub filled: Option<f64>,
    pub price: Option<f64>,
    pub average: Option<f64>,
    pub status: Option<String>,
    pub raw: Value,
}

impl PlacedOrder {
    pub fn executed_amount(&self) -> Option<f64> {
        self.filled.filter(|v| *v > 0.0).or(self.amount)
    }

    pub fn executed_price(&self) -> Option<f64> {
        self.price.filter(|v| *v > 0.0).or(self.average)
    }
}

/// 单笔成交（trade），网关实现负责把order id的各种拼写归一到order_id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeFill {
    pub trade_id: String,
    pub order_id: Option<String>,
    pub side: OrderSide,
    pub amount: f64,
    pub price: f64,
    pub fee: f64,
    pub timestamp: i64,
    pub raw: Value,
}

/// 交易所侧的订单记录（对账用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: Option<String>,
    pub side: OrderSide,
    pub amount: f64,
    pub filled: f64,
    pub price: Option<f64>,
    pub average: Option<f64>,
    pub status: Option<String>,
    pub timestamp: i64,
    pub raw: Value,
}

impl ExchangeOrder {
    pub fn filled_or_amount(&self) -> f64 {
        if self.filled > 0.0 {
            self.filled
        } else {
            self.amount
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BalanceSnapshot {
    pub free: HashMap<String, f64>,
    pub raw: Value,
}

impl BalanceSnapshot {
    pub fn free_of(&self, asset: &str) -> f64 {
        self.free.get(asset).copied().unwrap_or(0.0)
    }
}

/// "BTC/USDT" -> ("BTC", "USDT")
pub fn split_symbol(pair: &str) -> (&str, &str) {
    match pair.split_once('/') {
        Some((base, quote)) => (base, quote),
        None => (pair, ""),
    }
}

#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    fn exchange_id(&self) -> &str;

    async fn load_market(&self, symbol: &str) -> Result<Option<MarketInfo>, AppError>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, AppError>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> Result<OrderBook, AppError>;

    async fn fetch_my_trades(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<TradeFill>, AppError>;

    /// 部分交易所不支持全量订单查询，实现可返回Err，调用方回退到open orders
    async fn fetch_orders(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>, AppError>;

    async fn fetch_open_orders(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>, AppError>;

    async fn fetch_balance(&self) -> Result<BalanceSnapshot, AppError>;

    async fn place_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: f64,
        price: Option<f64>,
    ) -> Result<PlacedOrder, AppError>;
}

/// 按用户凭证构建网关实例。worker/对账进程通过它拿到每个用户自己的连接，
/// 方便测试时替换成假实现。
pub trait GatewayFactory: Send + Sync {
    fn connect(&self, user: &UserEntity) -> Result<Arc<dyn ExchangeGateway>, AppError>;
}
