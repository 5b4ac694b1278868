pub mod executor;
pub mod factory;
pub mod gateway;
pub mod precision;

pub use executor::OrderExecutor;
pub use factory::GatewayRegistry;
pub use gateway::{
    BalanceSnapshot, ExchangeGateway, ExchangeOrder, GatewayFactory, MarketInfo, OrderParams,
    OrderSide, OrderType, PlacedOrder, Ticker, TradeFill,
};
