pub mod bot;
pub mod bot_log;
pub mod bot_order;
pub mod metrics;
pub mod user;
