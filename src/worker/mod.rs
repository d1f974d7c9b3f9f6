//! 后台任务：延迟队列、工作池、每日总结与记忆提取任务

pub mod daily;
pub mod handler;
pub mod pool;
pub mod queue;

pub use daily::{
    render_yesterday, DailyCheckCache, DailySummarizer, DailySummaryScheduler, ScheduleDecision,
    SummaryOutcome,
};
pub use handler::{JobError, JobHandler, RoleChatJobs};
pub use pool::{Delivery, ReleasePolicy, WorkerPool};
pub use queue::{DelayQueue, InProcessDelayQueue, Job, JobEnvelope, JobId, QueueError};
