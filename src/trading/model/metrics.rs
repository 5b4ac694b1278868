use rbatis::{crud, impl_select, RBatis};
use rbs::to_value;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app_config::db;
use crate::error::AppError;
use crate::time_util;
use crate::trading::strategy::dca::DcaMetrics;

/// table: metrics
/// 每个交易对一行：入场指标（外部数据管道写入）+ 对账进程的余额快照
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct MetricsEntity {
    pub pair: String,
    pub indicators: Option<String>,
    pub balance_snapshot: Option<String>,
    pub updated_at: i64,
}

impl MetricsEntity {
    pub fn parse_indicators(&self) -> DcaMetrics {
        self.indicators
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default()
    }
}

crud!(MetricsEntity {}, "metrics");
impl_select!(MetricsEntity{select_by_pair(pair:&str) => "`where pair = #{pair}`"}, "metrics");

pub struct MetricsModel {
    db: &'static RBatis,
}

impl MetricsModel {
    pub fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn find_by_pair(&self, pair: &str) -> Result<Option<MetricsEntity>, AppError> {
        let rows = MetricsEntity::select_by_pair(self.db, pair).await?;
        Ok(rows.into_iter().next())
    }

    /// 对账进程的余额快照，按pair upsert
    pub async fn upsert_balance_snapshot(
        &self,
        pair: &str,
        snapshot: &Value,
    ) -> Result<(), AppError> {
        let snapshot_json = snapshot.to_string();
        self.db
            .exec(
                "insert into metrics (pair, balance_snapshot, updated_at) values (?, ?, ?) \
                 on duplicate key update balance_snapshot = values(balance_snapshot), \
                 updated_at = values(updated_at)",
                vec![
                    to_value!(pair),
                    to_value!(snapshot_json),
                    to_value!(time_util::now_millis()),
                ],
            )
            .await?;
        Ok(())
    }
}
