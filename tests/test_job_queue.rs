//! 任务队列的集成测试，需要可用的Redis（REDIS_HOST）。
//! 默认ignore，本地跑：cargo test --test test_job_queue -- --ignored

use std::time::Duration;

use dotenv::dotenv;
use futures::future::join_all;
use redis::Client;
use uuid::Uuid;

use rust_dca::job::queue::{BotJobKind, EnqueueOutcome, JobQueue};

fn redis_client() -> Client {
    dotenv().ok();
    let url = std::env::var("REDIS_HOST").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    Client::open(url).expect("redis client")
}

#[tokio::test]
#[ignore]
async fn concurrent_tick_enqueue_is_idempotent() {
    let queue = JobQueue::connect(&redis_client()).await.expect("connect");
    let bot_id = Uuid::new_v4().to_string();

    // 5个并发入队同一个bot的tick，只允许成功创建一次
    let futures: Vec<_> = (0..5)
        .map(|_| {
            let queue = queue.clone();
            let bot_id = bot_id.clone();
            tokio::spawn(async move {
                queue
                    .enqueue(BotJobKind::BotTick, &bot_id, 0)
                    .await
                    .expect("enqueue")
            })
        })
        .collect();
    let outcomes: Vec<EnqueueOutcome> = join_all(futures)
        .await
        .into_iter()
        .map(|r| r.expect("task"))
        .collect();

    let created = outcomes
        .iter()
        .filter(|o| matches!(o, EnqueueOutcome::Created(_)))
        .count();
    assert_eq!(created, 1, "exactly one enqueue must win");
    let expected_id = format!("tick:{}", bot_id);
    for o in &outcomes {
        assert_eq!(o.job_id(), expected_id);
    }

    queue.remove(&expected_id).await.expect("remove");
}

#[tokio::test]
#[ignore]
async fn delayed_job_is_promoted_after_delay() {
    let queue = JobQueue::connect(&redis_client()).await.expect("connect");
    let bot_id = Uuid::new_v4().to_string();
    let job_id = format!("tick:{}", bot_id);

    queue
        .enqueue(BotJobKind::BotTick, &bot_id, 300)
        .await
        .expect("enqueue");
    tokio::time::sleep(Duration::from_millis(400)).await;

    // 到期后能从队列里取到（可能夹杂别的残留任务，循环找自己的）
    let mut found = false;
    for _ in 0..20 {
        match queue.next_job().await.expect("next_job") {
            Some(job) if job.id == job_id => {
                found = true;
                queue.complete(&job).await.expect("complete");
                break;
            }
            Some(other) => {
                queue.fail(&other, "not mine, requeue").await.expect("fail");
            }
            None => break,
        }
    }
    assert!(found, "delayed job never promoted");
}

#[tokio::test]
#[ignore]
async fn completed_job_frees_id_for_reenqueue() {
    let queue = JobQueue::connect(&redis_client()).await.expect("connect");
    let bot_id = Uuid::new_v4().to_string();
    let job_id = format!("tick:{}", bot_id);

    let first = queue
        .enqueue(BotJobKind::BotTick, &bot_id, 0)
        .await
        .expect("enqueue");
    assert!(matches!(first, EnqueueOutcome::Created(_)));

    // 取到任务但还没complete：同id入队必须命中去重，
    // 所以下一跳的tick只能在complete之后排
    let mut in_flight = None;
    for _ in 0..20 {
        match queue.next_job().await.expect("next_job") {
            Some(job) if job.id == job_id => {
                in_flight = Some(job);
                break;
            }
            Some(other) => {
                queue.fail(&other, "not mine, requeue").await.expect("fail");
            }
            None => break,
        }
    }
    let job = in_flight.expect("job not delivered");
    let while_running = queue
        .enqueue(BotJobKind::BotTick, &bot_id, 0)
        .await
        .expect("enqueue");
    assert!(matches!(while_running, EnqueueOutcome::Duplicate(_)));

    // complete释放去重占位后，固定id可以重新入队成功
    queue.complete(&job).await.expect("complete");
    let after = queue
        .enqueue(BotJobKind::BotTick, &bot_id, 0)
        .await
        .expect("enqueue");
    assert!(
        matches!(after, EnqueueOutcome::Created(_)),
        "tick chain would die here: {:?}",
        after
    );
    queue.remove(&job_id).await.expect("remove");
}

#[tokio::test]
#[ignore]
async fn removed_job_is_never_delivered() {
    let queue = JobQueue::connect(&redis_client()).await.expect("connect");
    let bot_id = Uuid::new_v4().to_string();
    let job_id = format!("tick:{}", bot_id);

    queue
        .enqueue(BotJobKind::BotTick, &bot_id, 0)
        .await
        .expect("enqueue");
    queue.remove(&job_id).await.expect("remove");

    for _ in 0..20 {
        match queue.next_job().await.expect("next_job") {
            Some(job) => {
                assert_ne!(job.id, job_id, "removed job was delivered");
                queue.fail(&job, "not mine, requeue").await.expect("fail");
            }
            None => break,
        }
    }

    // 去重占位也被清掉了，同id可以重新入队
    let outcome = queue
        .enqueue(BotJobKind::BotTick, &bot_id, 0)
        .await
        .expect("enqueue");
    assert!(matches!(outcome, EnqueueOutcome::Created(_)));
    queue.remove(&job_id).await.expect("remove");
}
