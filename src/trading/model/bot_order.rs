use rbatis::{crud, impl_select, RBatis};
use rbs::to_value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_config::db;
use crate::error::AppError;
use crate::time_util;
use crate::trading::exchange::gateway::OrderSide;

/// table: bot_orders
///
/// 每笔归属于bot的交易所订单都留一条只追加的记录，既是审计凭证，
/// 也是对账引擎判断"这笔成交是否已知"的依据。除了补记成交增量之外
/// 不允许修改。
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
pub struct BotOrderEntity {
    pub id: String,
    pub bot_id: String,
    pub order_id: Option<String>,
    pub side: String,
    pub amount: f64,
    pub price: f64,
    /// 交易所原始响应（JSON字符串）
    pub raw: String,
    /// 已计入此订单的trade id列表（JSON数组），对账幂等的关键
    pub trade_ids: String,
    /// 退出分类：tp / sl / manual_delete
    pub exit_type: Option<String>,
    pub reason: Option<String>,
    /// 是否由对账进程补录
    pub reconciled: bool,
    pub created_at: i64,
}

impl BotOrderEntity {
    pub fn side(&self) -> Option<OrderSide> {
        OrderSide::parse(&self.side)
    }

    pub fn parse_trade_ids(&self) -> Vec<String> {
        serde_json::from_str(&self.trade_ids).unwrap_or_default()
    }
}

/// 插入用的构造参数
#[derive(Debug, Clone)]
pub struct NewBotOrder {
    pub bot_id: String,
    pub order_id: Option<String>,
    pub side: OrderSide,
    pub amount: f64,
    pub price: f64,
    pub raw: serde_json::Value,
    pub trade_ids: Vec<String>,
    pub exit_type: Option<String>,
    pub reason: Option<String>,
    pub reconciled: bool,
}

crud!(BotOrderEntity {}, "bot_orders");
impl_select!(BotOrderEntity{select_by_order_id(order_id:&str) => "`where order_id = #{order_id}`"}, "bot_orders");
impl_select!(BotOrderEntity{select_by_bot_asc(bot_id:&str) => "`where bot_id = #{bot_id} order by created_at asc`"}, "bot_orders");

pub struct BotOrdersModel {
    db: &'static RBatis,
}

impl BotOrdersModel {
    pub fn new() -> Self {
        Self {
            db: db::get_db_client(),
        }
    }

    pub async fn insert(&self, order: NewBotOrder) -> Result<BotOrderEntity, AppError> {
        let entity = BotOrderEntity {
            id: Uuid::new_v4().to_string(),
            bot_id: order.bot_id,
            order_id: order.order_id,
            side: order.side.as_str().to_string(),
            amount: order.amount,
            price: order.price,
            raw: serde_json::to_string(&order.raw)?,
            trade_ids: serde_json::to_string(&order.trade_ids)?,
            exit_type: order.exit_type,
            reason: order.reason,
            reconciled: order.reconciled,
            created_at: time_util::now_millis(),
        };
        BotOrderEntity::insert(self.db, &entity).await?;
        Ok(entity)
    }

    pub async fn find_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<BotOrderEntity>, AppError> {
        let rows = BotOrderEntity::select_by_order_id(self.db, order_id).await?;
        Ok(rows.into_iter().next())
    }

    /// trade id兜底查询：订单id缺失时按已计入的trade id找
    pub async fn find_by_trade_id(
        &self,
        trade_id: &str,
    ) -> Result<Option<BotOrderEntity>, AppError> {
        let rows: Vec<BotOrderEntity> = self
            .db
            .query_decode(
                "select * from bot_orders where json_contains(trade_ids, json_quote(?)) limit 1",
                vec![to_value!(trade_id)],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    /// bot的全部订单，按时间升序（FIFO盈亏计算要求ASC）
    pub async fn list_by_bot(&self, bot_id: &str) -> Result<Vec<BotOrderEntity>, AppError> {
        let rows = BotOrderEntity::select_by_bot_asc(self.db, bot_id).await?;
        Ok(rows)
    }

    /// 补记一笔成交增量：更新累计数量/价格并原子追加trade id
    pub async fn apply_fill_delta(
        &self,
        id: &str,
        new_amount: f64,
        price: f64,
        trade_id: Option<&str>,
    ) -> Result<(), AppError> {
        match trade_id {
            Some(tid) => {
                self.db
                    .exec(
                        "update bot_orders set amount = ?, price = ?, \
                         trade_ids = json_array_append(coalesce(trade_ids, '[]'), '$', ?) where id = ?",
                        vec![
                            to_value!(new_amount),
                            to_value!(price),
                            to_value!(tid),
                            to_value!(id),
                        ],
                    )
                    .await?;
            }
            None => {
                self.db
                    .exec(
                        "update bot_orders set amount = ?, price = ? where id = ?",
                        vec![to_value!(new_amount), to_value!(price), to_value!(id)],
                    )
                    .await?;
            }
        }
        Ok(())
    }
}
