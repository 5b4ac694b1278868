//! 网关注册表：按exchange id注册构建函数，按用户凭证实例化网关。
//!
//! 本crate只定义网关trait和这张注册表，具体交易所适配器由部署方
//! 在启动时注册进来；没注册的交易所在下单前就快速失败。

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::trading::exchange::gateway::{ExchangeGateway, GatewayFactory};
use crate::trading::model::user::UserEntity;

pub type GatewayBuilder =
    Arc<dyn Fn(&UserEntity) -> Result<Arc<dyn ExchangeGateway>, AppError> + Send + Sync>;

#[derive(Default, Clone)]
pub struct GatewayRegistry {
    builders: HashMap<String, GatewayBuilder>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, exchange_id: &str, builder: GatewayBuilder) {
        self.builders.insert(exchange_id.to_string(), builder);
    }

    pub fn is_empty(&self) -> bool {
        self.builders.is_empty()
    }
}

impl GatewayFactory for GatewayRegistry {
    fn connect(&self, user: &UserEntity) -> Result<Arc<dyn ExchangeGateway>, AppError> {
        let exchange_id = user.exchange_id();
        match self.builders.get(exchange_id) {
            Some(builder) => builder(user),
            None => Err(AppError::ExchangeError(format!(
                "no gateway adapter registered for exchange {}",
                exchange_id
            ))),
        }
    }
}
