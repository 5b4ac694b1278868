//! Redis任务队列：pending列表 + delayed有序集合 + 按job id去重。
//!
//! 幂等入队是这里的核心约定：同一个bot的tick任务id固定为tick:<bot_id>，
//! 重复入队不报错，直接返回已存在的任务id（调用方视为成功）。
//! 失败任务指数退避重试，超过次数后进入failed列表留底，人工排查。

use std::time::Duration;

use rand::Rng;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::AppError;
use crate::time_util;

const PENDING_KEY: &str = "dca:jobs:pending";
const DELAYED_KEY: &str = "dca:jobs:delayed";
const FAILED_KEY: &str = "dca:jobs:failed";
const DATA_PREFIX: &str = "dca:jobs:data:";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotJobKind {
    StartBot,
    BotTick,
    DeleteBot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotJob {
    pub id: String,
    pub kind: BotJobKind,
    pub bot_id: String,
    pub attempts_made: u32,
    pub enqueued_at: i64,
}

impl BotJob {
    /// tick/delete用固定id实现"每个bot最多一个在队任务"，start不去重
    pub fn job_id(kind: BotJobKind, bot_id: &str) -> String {
        match kind {
            BotJobKind::StartBot => format!("start:{}", uuid::Uuid::new_v4()),
            BotJobKind::BotTick => format!("tick:{}", bot_id),
            BotJobKind::DeleteBot => format!("delete:{}", bot_id),
        }
    }
}

/// 入队结果：新任务或命中去重（两者对调用方都算成功）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(String),
    Duplicate(String),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueOutcome::Created(id) => id,
            EnqueueOutcome::Duplicate(id) => id,
        }
    }
}

#[derive(Clone)]
pub struct JobQueue {
    conn: MultiplexedConnection,
}

impl JobQueue {
    pub async fn connect(client: &Client) -> Result<Self, AppError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    fn data_key(job_id: &str) -> String {
        format!("{}{}", DATA_PREFIX, job_id)
    }

    /// 入队。delay_ms=0直接进pending，否则进delayed等promote。
    /// id已存在时不重复入队，返回Duplicate。
    pub async fn enqueue(
        &self,
        kind: BotJobKind,
        bot_id: &str,
        delay_ms: u64,
    ) -> Result<EnqueueOutcome, AppError> {
        let job_id = BotJob::job_id(kind, bot_id);
        let job = BotJob {
            id: job_id.clone(),
            kind,
            bot_id: bot_id.to_string(),
            attempts_made: 0,
            enqueued_at: time_util::now_millis(),
        };
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();

        // SET NX既是存储也是去重判据
        let created: Option<String> = redis::cmd("SET")
            .arg(Self::data_key(&job_id))
            .arg(&payload)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if created.is_none() {
            return Ok(EnqueueOutcome::Duplicate(job_id));
        }

        if delay_ms == 0 {
            conn.lpush::<_, _, ()>(PENDING_KEY, &job_id).await?;
        } else {
            let run_at = time_util::now_millis() + delay_ms as i64;
            conn.zadd::<_, _, _, ()>(DELAYED_KEY, &job_id, run_at).await?;
        }
        Ok(EnqueueOutcome::Created(job_id))
    }

    /// 把到期的delayed任务搬进pending
    pub async fn promote_due(&self) -> Result<usize, AppError> {
        let mut conn = self.conn.clone();
        let now = time_util::now_millis();
        let due: Vec<String> = conn.zrangebyscore(DELAYED_KEY, 0i64, now).await?;
        for job_id in &due {
            conn.zrem::<_, _, ()>(DELAYED_KEY, job_id).await?;
            conn.lpush::<_, _, ()>(PENDING_KEY, job_id).await?;
        }
        Ok(due.len())
    }

    /// 取下一个待执行任务，没有则返回None。
    /// 数据体丢失（已被remove）的id直接丢弃。
    pub async fn next_job(&self) -> Result<Option<BotJob>, AppError> {
        self.promote_due().await?;
        let mut conn = self.conn.clone();
        loop {
            let job_id: Option<String> = conn.rpop(PENDING_KEY, None).await?;
            let job_id = match job_id {
                Some(id) => id,
                None => return Ok(None),
            };
            let payload: Option<String> = conn.get(Self::data_key(&job_id)).await?;
            match payload {
                Some(p) => match serde_json::from_str::<BotJob>(&p) {
                    Ok(job) => return Ok(Some(job)),
                    Err(err) => {
                        warn!("dropping undecodable job {}: {}", job_id, err);
                        conn.del::<_, ()>(Self::data_key(&job_id)).await?;
                    }
                },
                None => {
                    // 被remove掉的任务
                    continue;
                }
            }
        }
    }

    /// 任务成功，清掉数据体（也解除去重占位，允许下一次同id入队）
    pub async fn complete(&self, job: &BotJob) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::data_key(&job.id)).await?;
        Ok(())
    }

    /// 任务失败：未用完重试次数则指数退避重试，否则进failed列表留底
    pub async fn fail(&self, job: &BotJob, reason: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let attempts = job.attempts_made + 1;
        if attempts < MAX_ATTEMPTS {
            let mut retried = job.clone();
            retried.attempts_made = attempts;
            let payload = serde_json::to_string(&retried)?;
            conn.set::<_, _, ()>(Self::data_key(&job.id), payload).await?;
            let backoff_ms = RETRY_BASE_MS * 2u64.pow(attempts - 1);
            let run_at = time_util::now_millis() + backoff_ms as i64;
            conn.zadd::<_, _, _, ()>(DELAYED_KEY, &job.id, run_at).await?;
            info!(
                "job {} failed (attempt {}/{}), retry in {}ms: {}",
                job.id, attempts, MAX_ATTEMPTS, backoff_ms, reason
            );
        } else {
            let record = serde_json::json!({
                "job": job,
                "reason": reason,
                "failed_at": time_util::now_millis(),
            });
            conn.lpush::<_, _, ()>(FAILED_KEY, record.to_string()).await?;
            conn.del::<_, ()>(Self::data_key(&job.id)).await?;
            warn!("job {} exhausted retries: {}", job.id, reason);
        }
        Ok(())
    }

    /// 按id移除任务（删除流程撤销tick用）。数据体一删，
    /// pending/delayed里残留的id会在next_job时被自然丢弃。
    pub async fn remove(&self, job_id: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::data_key(job_id)).await?;
        conn.lrem::<_, _, ()>(PENDING_KEY, 0, job_id).await?;
        conn.zrem::<_, _, ()>(DELAYED_KEY, job_id).await?;
        Ok(())
    }

    /// worker主循环：没有任务时小睡一会再轮询
    pub async fn idle_pause(&self) {
        let pause = 200 + rand::thread_rng().gen_range(0..300);
        tokio::time::sleep(Duration::from_millis(pause)).await;
    }
}
