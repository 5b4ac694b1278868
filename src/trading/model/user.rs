use rbatis::{crud, RBatis};
use rbs::to_value;
use serde::{Deserialize, Serialize};

use crate::app_config::db;
use crate::error::AppError;

/// table: users（只关心交易所凭证相关字段）
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct UserEntity {
    pub id: String,
    pub exchange: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl UserEntity {
    pub fn exchange_id(&self) -> &str {
        self.exchange.as_deref().unwrap_or("bybit")
    }

    pub fn has_api_keys(&self) -> bool {
        self.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false)
    }
}

crud!(UserEntity {}, "users");

pub struct UsersModel {
    db: &'static RBatis,
}

impl UsersModel {
    pub fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<UserEntity>, AppError> {
        let rows = UserEntity::select_by_column(self.db, "id", id).await?;
        Ok(rows.into_iter().next())
    }

    /// 有API key的用户（对账扫描的遍历对象），按批次取
    pub async fn find_with_api_keys(&self, limit: u32) -> Result<Vec<UserEntity>, AppError> {
        let rows: Vec<UserEntity> = self
            .db
            .query_decode(
                "select * from users where api_key is not null and api_key != '' limit ?",
                vec![to_value!(limit)],
            )
            .await?;
        Ok(rows)
    }
}
