//! 工作池：从延迟队列通道取任务，Semaphore 限制并发
//!
//! 每次投递先递增 attempts；处理成功即删除，失败时未达上限则按任务种类延迟后重新投递，
//! 达到上限则放弃并记录错误日志。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::worker::handler::JobHandler;
use crate::worker::queue::{DelayQueue, Job, JobEnvelope};

/// 失败重投策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePolicy {
    pub max_attempts: u32,
    pub summary_delay: Duration,
    pub extraction_delay: Duration,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            summary_delay: Duration::from_secs(300),
            extraction_delay: Duration::from_secs(60),
        }
    }
}

impl ReleasePolicy {
    pub fn delay_for(&self, job: &Job) -> Duration {
        match job {
            Job::DailySummary { .. } => self.summary_delay,
            Job::MemoryExtraction { .. } => self.extraction_delay,
        }
    }
}

/// 一次投递的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Completed,
    Released { attempts: u32, delay: Duration },
    Dropped { attempts: u32 },
}

pub struct WorkerPool {
    queue: Arc<dyn DelayQueue>,
    handler: Arc<dyn JobHandler>,
    permits: Arc<Semaphore>,
    policy: ReleasePolicy,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn DelayQueue>,
        handler: Arc<dyn JobHandler>,
        workers: usize,
        policy: ReleasePolicy,
    ) -> Self {
        Self {
            queue,
            handler,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            policy,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 停止取新任务；处理中的任务会继续完成
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// 处理一次投递
    pub async fn process(&self, mut envelope: JobEnvelope) -> Delivery {
        envelope.attempts += 1;
        let attempts = envelope.attempts;
        let (user_id, role_id) = envelope.job.pair();
        debug!(job_id = %envelope.id, kind = envelope.job.kind(), attempt = attempts, user_id, role_id, "processing job");

        match self.handler.handle(&envelope.job).await {
            Ok(()) => {
                if let Err(e) = self.queue.delete(&envelope.id).await {
                    warn!(job_id = %envelope.id, error = %e, "failed to delete finished job");
                }
                Delivery::Completed
            }
            Err(e) if attempts >= self.policy.max_attempts => {
                error!(
                    job_id = %envelope.id,
                    kind = envelope.job.kind(),
                    attempt = attempts,
                    user_id,
                    role_id,
                    error = %e,
                    "job failed permanently, dropping"
                );
                if let Err(e) = self.queue.delete(&envelope.id).await {
                    warn!(job_id = %envelope.id, error = %e, "failed to delete dropped job");
                }
                Delivery::Dropped { attempts }
            }
            Err(e) => {
                let delay = self.policy.delay_for(&envelope.job);
                warn!(
                    job_id = %envelope.id,
                    kind = envelope.job.kind(),
                    attempt = attempts,
                    user_id,
                    role_id,
                    delay_secs = delay.as_secs(),
                    error = %e,
                    "job failed, releasing for retry"
                );
                let job_id = envelope.id.clone();
                if let Err(e) = self.queue.release(envelope, delay).await {
                    error!(job_id = %job_id, error = %e, "failed to release job");
                }
                Delivery::Released { attempts, delay }
            }
        }
    }

    /// 启动消费循环，直到取消或通道关闭
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<JobEnvelope>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(workers = self.permits.available_permits(), "worker pool started");
            loop {
                let envelope = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let permit = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let pool = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    pool.process(envelope).await;
                });
            }
            info!("worker pool stopped");
        })
    }
}
