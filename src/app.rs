//! 组装根：按配置创建存储、模型客户端、提示词库与各服务，并启动后台工作池

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::info;

use crate::chat::{ChatDeps, ChatService, ChatSettings, EventLog, InnerThoughtGenerator, PresumptionService};
use crate::config::AppConfig;
use crate::core::{Clock, Language, SystemClock};
use crate::llm::{ChatProvider, CompletionClient, LlmError, ModelChain, OpenRouterProvider, ProviderError, RetryPolicy, Scorer};
use crate::memory::{MemoryBook, MemoryExtractor};
use crate::prompt::{MiniJinjaRenderer, PromptAssembler, PromptError, PromptLibrary, PromptSource, TemplateKind, TemplateRenderer};
use crate::store::{create_store, Repositories};
use crate::worker::{
    DailySummarizer, DailySummaryScheduler, DelayQueue, InProcessDelayQueue, JobEnvelope,
    ReleasePolicy, RoleChatJobs, WorkerPool,
};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Prompt setup failed: {0}")]
    Prompt(#[from] PromptError),

    #[error("Provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Invalid model chain: {0}")]
    Models(#[from] LlmError),
}

/// 外部注入的部件（测试时替换为脚本化提供方与手动时钟）
pub struct AppParts {
    pub repos: Repositories,
    pub provider: Arc<dyn ChatProvider>,
    pub clock: Arc<dyn Clock>,
    pub prompts: Arc<dyn PromptSource>,
}

pub struct App {
    pub chat: Arc<ChatService>,
    pub events: EventLog,
    pub presumptions: PresumptionService,
    pub memories: MemoryBook,
    pub summarizer: Arc<DailySummarizer>,
    pub repos: Repositories,
    pub queue: Arc<InProcessDelayQueue>,
    pool: Arc<WorkerPool>,
    jobs: Mutex<Option<UnboundedReceiver<JobEnvelope>>>,
}

impl App {
    /// 生产装配：OpenRouter + 系统时钟 + 配置中的存储与提示词
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, AppError> {
        let repos = create_store(&cfg.storage).await;
        let provider = Arc::new(OpenRouterProvider::new(&cfg.llm)?);
        let prompts = Arc::new(PromptLibrary::from_config(cfg)?);
        Self::with_parts(
            cfg,
            AppParts {
                repos,
                provider,
                clock: Arc::new(SystemClock::new(cfg.app.utc_offset_hours)),
                prompts,
            },
        )
    }

    pub fn with_parts(cfg: &AppConfig, parts: AppParts) -> Result<Self, AppError> {
        let AppParts {
            repos,
            provider,
            clock,
            prompts,
        } = parts;

        let retry = RetryPolicy::new(cfg.llm.max_retries, Duration::from_millis(cfg.llm.base_delay_ms))
            .with_max_delay(Duration::from_millis(cfg.llm.max_delay_ms));
        let client = Arc::new(CompletionClient::new(provider, retry));
        let renderer: Arc<dyn TemplateRenderer> = Arc::new(MiniJinjaRenderer::new());
        let default_models = ModelChain::parse(&cfg.llm.default_models)?;
        let score_models = ModelChain::parse(&cfg.llm.score_models)?;
        let temperature = cfg.llm.temperature;

        let (queue, jobs) = InProcessDelayQueue::new();
        let queue = Arc::new(queue);

        let extractor = Arc::new(MemoryExtractor::new(
            repos.clone(),
            client.clone(),
            prompts.clone(),
            renderer.clone(),
            clock.clone(),
            default_models.clone(),
            temperature,
            cfg.memory.extraction_interval,
        ));
        let summarizer = Arc::new(DailySummarizer::new(
            repos.clone(),
            client.clone(),
            prompts.clone(),
            renderer.clone(),
            clock.clone(),
            default_models.clone(),
            temperature,
        ));
        let scheduler = Arc::new(DailySummaryScheduler::new(
            repos.memories.clone(),
            queue.clone(),
            clock.clone(),
            Duration::from_secs(cfg.summarizer.enqueue_delay_secs),
        ));

        let default_language = Language::from_tag(&cfg.app.default_language);
        let scorer = Scorer::new(
            client.clone(),
            score_models,
            prompts.template(TemplateKind::Score, default_language),
            renderer.clone(),
            cfg.llm.score_temperature,
        );
        let thoughts = InnerThoughtGenerator::new(
            repos.clone(),
            client.clone(),
            prompts.clone(),
            renderer.clone(),
            clock.clone(),
            default_models,
            temperature,
            cfg.memory.inner_thought_probability,
        );

        let chat = Arc::new(ChatService::new(ChatDeps {
            repos: repos.clone(),
            prompts,
            assembler: PromptAssembler::new(
                repos.clone(),
                renderer,
                clock.clone(),
                cfg.memory.history_window,
            ),
            client,
            scorer,
            extractor: extractor.clone(),
            scheduler,
            queue: queue.clone() as Arc<dyn DelayQueue>,
            thoughts,
            clock: clock.clone(),
            settings: ChatSettings {
                max_message_chars: cfg.app.max_message_chars,
                async_extraction: cfg.memory.async_extraction,
                extraction_delay: Duration::from_secs(cfg.memory.extraction_delay_secs),
            },
        }));

        let handler = Arc::new(RoleChatJobs::new(repos.clone(), summarizer.clone(), extractor));
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            handler,
            cfg.summarizer.workers,
            ReleasePolicy {
                max_attempts: cfg.summarizer.max_attempts,
                summary_delay: Duration::from_secs(cfg.summarizer.retry_delay_secs),
                extraction_delay: Duration::from_secs(cfg.memory.extraction_retry_secs),
            },
        ));

        Ok(Self {
            chat,
            events: EventLog::new(repos.events.clone(), repos.roles.clone(), clock.clone()),
            presumptions: PresumptionService::new(repos.presumptions.clone(), repos.roles.clone()),
            memories: MemoryBook::new(repos.memories.clone(), clock),
            summarizer,
            repos,
            queue,
            pool,
            jobs: Mutex::new(Some(jobs)),
        })
    }

    /// 启动后台工作池；只有第一次调用会返回句柄
    pub fn start_workers(&self) -> Option<JoinHandle<()>> {
        let jobs = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        info!("starting background workers");
        Some(Arc::clone(&self.pool).spawn(jobs))
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
