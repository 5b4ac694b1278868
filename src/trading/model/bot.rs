use rbatis::{crud, impl_select, RBatis};
use rbs::to_value;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app_config::db;
use crate::error::AppError;
use crate::time_util;

/// bot状态机。closed由tick/对账路径在完全退出时内部设置，
/// deleted只能由删除流程设置；deleting/deleted的bot永远不会回到running。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Created,
    Running,
    Closed,
    Deleting,
    Deleted,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Created => "created",
            BotStatus::Running => "running",
            BotStatus::Closed => "closed",
            BotStatus::Deleting => "deleting",
            BotStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(BotStatus::Created),
            "running" => Some(BotStatus::Running),
            "closed" => Some(BotStatus::Closed),
            "deleting" => Some(BotStatus::Deleting),
            "deleted" => Some(BotStatus::Deleted),
            _ => None,
        }
    }
}

fn default_portfolio_usd() -> f64 {
    100.0
}
fn default_take_profit_pct() -> f64 {
    18.0
}
fn default_max_entries() -> usize {
    3
}
fn default_min_order_usd() -> f64 {
    10.0
}
fn default_max_alloc_pct() -> f64 {
    20.0
}
fn default_per_buy_pct() -> f64 {
    5.0
}

/// DCA策略配置（bots.config JSON列）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BotConfig {
    #[serde(default = "default_portfolio_usd")]
    pub portfolio_usd: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_min_order_usd")]
    pub min_order_usd: f64,
    #[serde(default = "default_max_alloc_pct")]
    pub max_alloc_pct: f64,
    #[serde(default = "default_per_buy_pct")]
    pub per_buy_pct: f64,
    #[serde(default)]
    pub enable_indicators: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        serde_json::from_value(json!({})).expect("BotConfig defaults")
    }
}

/// 一笔未平仓的买入lot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BotEntry {
    #[serde(default)]
    pub order_id: Option<String>,
    pub price: f64,
    pub amount: f64,
    /// 毫秒时间戳
    pub ts: i64,
}

/// table: bots
/// config/entries是JSON列，存成字符串由应用层解析
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct BotEntity {
    pub id: String,
    pub user_id: String,
    pub pair: String,
    pub config: String,
    pub status: String,
    pub entries: String,
    pub realized_pnl: Option<f64>,
    pub realized_notional: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub closed_at: Option<i64>,
}

impl BotEntity {
    pub fn status(&self) -> Option<BotStatus> {
        BotStatus::parse(&self.status)
    }

    pub fn parse_config(&self) -> BotConfig {
        serde_json::from_str(&self.config).unwrap_or_default()
    }

    pub fn parse_entries(&self) -> Vec<BotEntry> {
        serde_json::from_str(&self.entries).unwrap_or_default()
    }

    pub fn total_open_amount(&self) -> f64 {
        self.parse_entries().iter().map(|e| e.amount).sum()
    }
}

crud!(BotEntity {}, "bots");
impl_select!(BotEntity{select_by_status(status:&str) => "`where status = #{status}`"}, "bots");
impl_select!(BotEntity{select_by_user(user_id:&str) => "`where user_id = #{user_id}`"}, "bots");

pub struct BotsModel {
    db: &'static RBatis,
}

impl BotsModel {
    pub fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<BotEntity>, AppError> {
        let rows = BotEntity::select_by_column(self.db, "id", id).await?;
        Ok(rows.into_iter().next())
    }

    pub async fn find_by_status(&self, status: BotStatus) -> Result<Vec<BotEntity>, AppError> {
        let rows = BotEntity::select_by_status(self.db, status.as_str()).await?;
        Ok(rows)
    }

    pub async fn find_by_user(&self, user_id: &str) -> Result<Vec<BotEntity>, AppError> {
        let rows = BotEntity::select_by_user(self.db, user_id).await?;
        Ok(rows)
    }

    pub async fn update_status(&self, id: &str, status: BotStatus) -> Result<(), AppError> {
        self.db
            .exec(
                "update bots set status = ?, updated_at = ? where id = ?",
                vec![
                    to_value!(status.as_str()),
                    to_value!(time_util::now_millis()),
                    to_value!(id),
                ],
            )
            .await?;
        Ok(())
    }

    /// 完全退出：status=closed并落盘已实现盈亏
    pub async fn set_closed(
        &self,
        id: &str,
        realized_pnl: Option<f64>,
        realized_notional: Option<f64>,
    ) -> Result<(), AppError> {
        let now = time_util::now_millis();
        self.db
            .exec(
                "update bots set status = 'closed', closed_at = ?, updated_at = ?, \
                 realized_pnl = coalesce(?, realized_pnl), \
                 realized_notional = coalesce(?, realized_notional) where id = ?",
                vec![
                    to_value!(now),
                    to_value!(now),
                    to_value!(realized_pnl),
                    to_value!(realized_notional),
                    to_value!(id),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_deleted(&self, id: &str) -> Result<(), AppError> {
        self.update_status(id, BotStatus::Deleted).await
    }

    /// 原子地向entries JSON数组追加一个lot。
    /// 必须是单条SQL，不能读-改-写，否则会和对账进程互相覆盖。
    pub async fn push_entry(&self, id: &str, entry: &BotEntry) -> Result<(), AppError> {
        let entry_json = serde_json::to_string(entry)?;
        self.db
            .exec(
                "update bots set entries = json_array_append(coalesce(entries, '[]'), '$', cast(? as json)), \
                 updated_at = ? where id = ?",
                vec![
                    to_value!(entry_json),
                    to_value!(time_util::now_millis()),
                    to_value!(id),
                ],
            )
            .await?;
        Ok(())
    }

    /// 整体重写entries（只允许在持有bot锁时调用，对账的FIFO截断用）
    pub async fn set_entries(&self, id: &str, entries: &[BotEntry]) -> Result<(), AppError> {
        let entries_json = serde_json::to_string(entries)?;
        self.db
            .exec(
                "update bots set entries = ?, updated_at = ? where id = ?",
                vec![
                    to_value!(entries_json),
                    to_value!(time_util::now_millis()),
                    to_value!(id),
                ],
            )
            .await?;
        Ok(())
    }
}
