//! OrderExecutor的单元级测试：用假网关验证精度补足、市价买单的
//! price参数规则和非法数量的快速失败。不需要任何外部服务。

use std::sync::Arc;

use async_trait::async_trait;
use float_cmp::approx_eq;
use serde_json::json;
use tokio::sync::Mutex;

use rust_dca::error::AppError;
use rust_dca::trading::exchange::gateway::{
    BalanceSnapshot, ExchangeGateway, ExchangeOrder, MarketInfo, OrderBook, OrderParams,
    OrderSide, OrderType, PlacedOrder, Ticker, TradeFill,
};
use rust_dca::trading::exchange::OrderExecutor;

#[derive(Debug, Clone)]
struct PlacedArgs {
    order_type: OrderType,
    side: OrderSide,
    amount: f64,
    price: Option<f64>,
}

struct FakeGateway {
    market: Option<MarketInfo>,
    ticker: Ticker,
    placed: Mutex<Vec<PlacedArgs>>,
}

impl FakeGateway {
    fn new(market: Option<MarketInfo>, ticker: Ticker) -> Arc<Self> {
        Arc::new(Self {
            market,
            ticker,
            placed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ExchangeGateway for FakeGateway {
    fn exchange_id(&self) -> &str {
        "fake"
    }

    async fn load_market(&self, _symbol: &str) -> Result<Option<MarketInfo>, AppError> {
        Ok(self.market.clone())
    }

    async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker, AppError> {
        Ok(self.ticker.clone())
    }

    async fn fetch_order_book(
        &self,
        _symbol: &str,
        _depth: usize,
    ) -> Result<OrderBook, AppError> {
        Ok(OrderBook::default())
    }

    async fn fetch_my_trades(
        &self,
        _symbol: &str,
        _limit: usize,
    ) -> Result<Vec<TradeFill>, AppError> {
        Ok(Vec::new())
    }

    async fn fetch_orders(
        &self,
        _symbol: &str,
        _limit: usize,
    ) -> Result<Vec<ExchangeOrder>, AppError> {
        Ok(Vec::new())
    }

    async fn fetch_open_orders(
        &self,
        _symbol: &str,
        _limit: usize,
    ) -> Result<Vec<ExchangeOrder>, AppError> {
        Ok(Vec::new())
    }

    async fn fetch_balance(&self) -> Result<BalanceSnapshot, AppError> {
        Ok(BalanceSnapshot::default())
    }

    async fn place_order(
        &self,
        _symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: f64,
        price: Option<f64>,
    ) -> Result<PlacedOrder, AppError> {
        self.placed.lock().await.push(PlacedArgs {
            order_type,
            side,
            amount,
            price,
        });
        Ok(PlacedOrder {
            id: Some("ord-1".to_string()),
            amount: Some(amount),
            filled: Some(amount),
            price,
            average: None,
            status: Some("closed".to_string()),
            raw: json!({}),
        })
    }
}

fn ticker(ask: f64) -> Ticker {
    Ticker {
        last: Some(ask),
        ask: Some(ask),
        bid: Some(ask - 0.1),
        close: Some(ask),
    }
}

fn buy_market(symbol: &str, amount: f64) -> OrderParams {
    OrderParams {
        symbol: symbol.to_string(),
        side: OrderSide::Buy,
        order_type: OrderType::Market,
        amount,
        price: None,
    }
}

#[tokio::test]
async fn amount_is_raised_to_min_notional() {
    let market = MarketInfo {
        amount_precision: Some(4),
        price_precision: Some(2),
        min_amount: None,
        min_notional: Some(10.0),
        market_buy_requires_price: false,
    };
    let gateway = FakeGateway::new(Some(market), ticker(20000.0));
    let executor = OrderExecutor::new(gateway.clone());

    // 0.0001 * 20000 = 2 < 10，应补足到 0.0005
    executor
        .create_order(&buy_market("BTC/USDT", 0.0001))
        .await
        .expect("order");
    let placed = gateway.placed.lock().await;
    assert_eq!(placed.len(), 1);
    assert!(approx_eq!(f64, placed[0].amount, 0.0005, epsilon = 1e-12));
}

#[tokio::test]
async fn market_buy_carries_slippage_price_when_venue_requires_it() {
    let market = MarketInfo {
        amount_precision: Some(4),
        price_precision: Some(2),
        min_amount: None,
        min_notional: None,
        market_buy_requires_price: true,
    };
    let gateway = FakeGateway::new(Some(market), ticker(100.0));
    let executor = OrderExecutor::new(gateway.clone());

    executor
        .create_order(&buy_market("ETH/USDT", 1.0))
        .await
        .expect("order");
    let placed = gateway.placed.lock().await;
    // floor(100.00)加0.1%缓冲再floor到2位小数，落在(100.0, 100.1]区间
    let price = placed[0].price.expect("price arg required");
    assert!(price > 100.0 && price <= 100.1 + 1e-9, "price={}", price);
}

#[tokio::test]
async fn market_sell_sends_no_price() {
    let gateway = FakeGateway::new(None, ticker(100.0));
    let executor = OrderExecutor::new(gateway.clone());

    let params = OrderParams {
        symbol: "ETH/USDT".to_string(),
        side: OrderSide::Sell,
        order_type: OrderType::Market,
        amount: 1.0,
        price: None,
    };
    executor.create_order(&params).await.expect("order");
    let placed = gateway.placed.lock().await;
    assert!(placed[0].price.is_none());
    assert_eq!(placed[0].side, OrderSide::Sell);
    assert_eq!(placed[0].order_type, OrderType::Market);
}

#[tokio::test]
async fn non_positive_amount_fails_before_gateway() {
    let gateway = FakeGateway::new(None, ticker(100.0));
    let executor = OrderExecutor::new(gateway.clone());

    let err = executor
        .create_order(&buy_market("ETH/USDT", 0.0))
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::InvalidAmount(_)));
    assert!(gateway.placed.lock().await.is_empty());
}

#[tokio::test]
async fn market_buy_without_any_price_fails() {
    let market = MarketInfo {
        amount_precision: Some(4),
        price_precision: Some(2),
        min_amount: None,
        min_notional: None,
        market_buy_requires_price: true,
    };
    // ticker和订单簿都给不出价格
    let gateway = FakeGateway::new(Some(market), Ticker::default());
    let executor = OrderExecutor::new(gateway.clone());

    let err = executor
        .create_order(&buy_market("ETH/USDT", 1.0))
        .await
        .expect_err("must fail");
    assert!(matches!(err, AppError::InvalidAmount(_)));
    assert!(gateway.placed.lock().await.is_empty());
}
