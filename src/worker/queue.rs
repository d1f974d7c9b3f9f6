//! 延迟队列
//!
//! 至少一次投递：消费方处理成功后 `delete`，失败后 `release` 并给出新的延迟；
//! 投递次数记录在 [`JobEnvelope::attempts`]，由工作池在每次投递时递增。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::core::{Language, RoleId, TurnId, UserId};

pub type JobId = String;

/// 后台任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Job {
    /// 把昨日记忆总结为一条每日总结 + 一篇日记
    DailySummary {
        user_id: UserId,
        role_id: RoleId,
        language: Language,
    },
    /// 以 `turn_id` 为触发轮次提取最近一批对话的记忆
    MemoryExtraction {
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::DailySummary { .. } => "daily_summary",
            Job::MemoryExtraction { .. } => "memory_extraction",
        }
    }

    pub fn pair(&self) -> (UserId, RoleId) {
        match self {
            Job::DailySummary {
                user_id, role_id, ..
            }
            | Job::MemoryExtraction {
                user_id, role_id, ..
            } => (*user_id, *role_id),
        }
    }
}

/// 队列中的一次投递
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,
    pub job: Job,
    /// 已投递次数（含本次）
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl JobEnvelope {
    pub fn new(job: Job) -> Self {
        Self {
            id: format!("job_{}", uuid::Uuid::new_v4()),
            job,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,
}

#[async_trait]
pub trait DelayQueue: Send + Sync {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<JobId, QueueError>;

    /// 处理失败：按新的延迟重新投递（保留投递次数）
    async fn release(&self, envelope: JobEnvelope, delay: Duration) -> Result<(), QueueError>;

    /// 处理完成或放弃
    async fn delete(&self, id: &str) -> Result<(), QueueError>;
}

/// 进程内延迟队列：定时器到期后把任务推入 mpsc 通道，由工作池消费
pub struct InProcessDelayQueue {
    tx: mpsc::UnboundedSender<JobEnvelope>,
    live: Arc<Mutex<HashSet<JobId>>>,
}

impl InProcessDelayQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                live: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
        )
    }

    /// 尚未删除的任务数（等待中 + 处理中）
    pub fn live_jobs(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn schedule(&self, envelope: JobEnvelope, delay: Duration) -> Result<(), QueueError> {
        if self.tx.is_closed() {
            return Err(QueueError::Closed);
        }
        let tx = self.tx.clone();
        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let still_live = live
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(&envelope.id);
            if still_live && tx.send(envelope).is_err() {
                debug!("delay queue receiver dropped");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl DelayQueue for InProcessDelayQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> Result<JobId, QueueError> {
        let envelope = JobEnvelope::new(job);
        let id = envelope.id.clone();
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone());
        self.schedule(envelope, delay)?;
        debug!(job_id = %id, delay_secs = delay.as_secs(), "job enqueued");
        Ok(id)
    }

    async fn release(&self, envelope: JobEnvelope, delay: Duration) -> Result<(), QueueError> {
        self.schedule(envelope, delay)
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::DailySummary {
            user_id: 1,
            role_id: 2,
            language: Language::English,
        }
    }

    #[test]
    fn test_job_serde_is_tagged() {
        let json = serde_json::to_value(job()).unwrap();
        assert_eq!(json["type"], "daily_summary");
        assert_eq!(json["language"], "en");
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.pair(), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_waits_for_delay() {
        let (queue, mut rx) = InProcessDelayQueue::new();
        queue.enqueue(job(), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.attempts, 0);
        assert_eq!(queue.live_jobs(), 1);

        queue.delete(&envelope.id).await.unwrap();
        assert_eq!(queue.live_jobs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_keeps_attempts() {
        let (queue, mut rx) = InProcessDelayQueue::new();
        queue.enqueue(job(), Duration::ZERO).await.unwrap();
        let mut envelope = rx.recv().await.unwrap();
        envelope.attempts = 2;
        queue.release(envelope, Duration::from_secs(300)).await.unwrap();

        let again = rx.recv().await.unwrap();
        assert_eq!(again.attempts, 2);
    }
}
