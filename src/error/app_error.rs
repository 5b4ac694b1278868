use thiserror::Error;

/// 应用错误
#[derive(Error, Debug)]
pub enum AppError {
    /// 业务错误
    #[error("业务错误: {0}")]
    BizError(String),

    /// 数据库错误
    #[error("数据库错误: {0}")]
    DbError(String),

    /// Redis协调存储错误
    #[error("Redis错误: {0}")]
    RedisError(String),

    /// 交易所网关错误
    #[error("交易所错误: {0}")]
    ExchangeError(String),

    /// 无法根据精度/最小下单额构造合法的下单数量
    #[error("无效下单数量: {0}")]
    InvalidAmount(String),

    /// 未知错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

impl From<rbatis::Error> for AppError {
    fn from(err: rbatis::Error) -> Self {
        AppError::DbError(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::RedisError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Unknown(err.to_string())
    }
}

/// 把任何错误转换为AppError类型
pub fn to_err<E: std::error::Error + Send + Sync + 'static>(err: E) -> AppError {
    AppError::Unknown(err.to_string())
}
