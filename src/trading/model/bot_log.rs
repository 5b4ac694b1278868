use rbatis::{crud, RBatis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::app_config::db;
use crate::time_util;

/// table: bot_logs
/// 审计事件流：tick_started / lock_acquired / ticker_fetched / exit_decision
/// / buy_order_placed / sell_order_failed / entry_added / bot_closed ...
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct BotLogEntity {
    pub id: String,
    pub bot_id: String,
    pub event: String,
    pub severity: String,
    pub payload: String,
    pub created_at: i64,
}

crud!(BotLogEntity {}, "bot_logs");

pub struct BotLogsModel {
    db: &'static RBatis,
}

impl BotLogsModel {
    pub fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    /// 审计写入永远不把错误抛给触发它的操作
    pub async fn append(&self, bot_id: &str, event: &str, severity: &str, payload: Value) {
        let entity = BotLogEntity {
            id: Uuid::new_v4().to_string(),
            bot_id: bot_id.to_string(),
            event: event.to_string(),
            severity: severity.to_string(),
            payload: payload.to_string(),
            created_at: time_util::now_millis(),
        };
        if let Err(err) = BotLogEntity::insert(self.db, &entity).await {
            warn!("bot log write failed: event={} err={}", event, err);
        }
    }
}

/// 常用的三个严重级别入口
pub async fn log_bot(bot_id: &str, event: &str) {
    BotLogsModel::new()
        .append(bot_id, event, "info", Value::Null)
        .await;
}

pub async fn log_bot_with(bot_id: &str, event: &str, severity: &str, payload: Value) {
    BotLogsModel::new()
        .append(bot_id, event, severity, payload)
        .await;
}
