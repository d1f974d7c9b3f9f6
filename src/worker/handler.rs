//! 任务处理：把队列里的 [`Job`] 分派给每日总结或记忆提取

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::core::{RoleId, StoreError};
use crate::llm::LlmError;
use crate::memory::{ExtractionError, MemoryExtractor};
use crate::store::Repositories;
use crate::worker::daily::DailySummarizer;
use crate::worker::queue::{Job, QueueError};

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Role not found: {0}")]
    RoleNotFound(RoleId),
}

impl From<ExtractionError> for JobError {
    fn from(e: ExtractionError) -> Self {
        match e {
            ExtractionError::Store(e) => JobError::Store(e),
            ExtractionError::Llm(e) => JobError::Llm(e),
        }
    }
}

/// 工作池调用的处理接口；返回 Err 表示需要重试
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}

pub struct RoleChatJobs {
    repos: Repositories,
    summarizer: Arc<DailySummarizer>,
    extractor: Arc<MemoryExtractor>,
}

impl RoleChatJobs {
    pub fn new(
        repos: Repositories,
        summarizer: Arc<DailySummarizer>,
        extractor: Arc<MemoryExtractor>,
    ) -> Self {
        Self {
            repos,
            summarizer,
            extractor,
        }
    }
}

#[async_trait]
impl JobHandler for RoleChatJobs {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let (user_id, role_id) = job.pair();
        let role = self
            .repos
            .roles
            .role(role_id)
            .await?
            .ok_or(JobError::RoleNotFound(role_id))?;

        match job {
            Job::DailySummary { language, .. } => {
                let outcome = self.summarizer.run(user_id, &role, *language).await?;
                info!(
                    user_id,
                    role_id,
                    summary = outcome.summary_written,
                    diary = outcome.diary_written,
                    "daily summary job finished"
                );
            }
            Job::MemoryExtraction { turn_id, .. } => {
                let outcome = self.extractor.extract(user_id, &role, *turn_id).await?;
                info!(user_id, role_id, turn_id, ?outcome, "memory extraction job finished");
            }
        }
        Ok(())
    }
}
