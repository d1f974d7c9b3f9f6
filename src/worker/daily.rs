//! 每日总结：调度检查 + 后台执行
//!
//! 调度侧（聊天请求之后）：每个 (user, role) 每天最多检查一次，今天的总结与日记都已存在、
//! 或昨天没有任何记忆时跳过，否则延迟入队。
//! 执行侧（工作池）：按 (user, role) 串行，重新检查幂等条件后分别生成总结与日记，两者互不依赖。

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::core::{Clock, DayRange, Language, PairLocks, Role, RoleId, UserId};
use crate::llm::{CompletionClient, ModelChain};
use crate::memory::{parse_memory_payload, MemoryItem, MemoryQuery, Message, NewMemory, SubCategory};
use crate::prompt::{labels, load_persona, PromptSource, TemplateKind, TemplateRenderer, TemplateVars};
use crate::store::{MemoryRepository, Repositories};
use crate::worker::handler::JobError;
use crate::worker::queue::{DelayQueue, Job, JobId};

/// 进程内「今天已检查过」标记；只用于减少重复检查，正确性不依赖它。
/// 只保留当天的标记，日期变化时整表清空
#[derive(Default)]
pub struct DailyCheckCache {
    checked: Mutex<CheckedDay>,
}

#[derive(Default)]
struct CheckedDay {
    day: Option<NaiveDate>,
    pairs: HashSet<(UserId, RoleId)>,
}

impl DailyCheckCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当天第一次检查返回 true 并打上标记
    pub fn first_check(&self, pair: (UserId, RoleId), today: NaiveDate) -> bool {
        let mut checked = self.checked.lock().unwrap_or_else(PoisonError::into_inner);
        if checked.day != Some(today) {
            checked.day = Some(today);
            checked.pairs.clear();
        }
        checked.pairs.insert(pair)
    }

    /// 当前保留的标记数
    pub fn len(&self) -> usize {
        self.checked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pairs
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 调度检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    AlreadyChecked,
    AlreadySummarized,
    NoMemoriesYesterday,
    Enqueued(JobId),
}

/// 今天的总结 / 日记是否已存在
async fn produced_today(
    memories: &dyn MemoryRepository,
    user_id: UserId,
    role_id: RoleId,
    today: DayRange,
) -> Result<(bool, bool), JobError> {
    let base = MemoryQuery::pair(user_id, role_id).within(today);
    let summary = memories
        .count_memories(&base.clone().kinds(&[SubCategory::DailySummary]))
        .await?;
    let diary = memories
        .count_memories(&base.kinds(&[SubCategory::DailyDiary]))
        .await?;
    Ok((summary > 0, diary > 0))
}

pub struct DailySummaryScheduler {
    memories: Arc<dyn MemoryRepository>,
    queue: Arc<dyn DelayQueue>,
    clock: Arc<dyn Clock>,
    cache: DailyCheckCache,
    delay: Duration,
}

impl DailySummaryScheduler {
    pub fn new(
        memories: Arc<dyn MemoryRepository>,
        queue: Arc<dyn DelayQueue>,
        clock: Arc<dyn Clock>,
        delay: Duration,
    ) -> Self {
        Self {
            memories,
            queue,
            clock,
            cache: DailyCheckCache::new(),
            delay,
        }
    }

    pub async fn check_and_schedule(
        &self,
        user_id: UserId,
        role_id: RoleId,
        language: Language,
    ) -> Result<ScheduleDecision, JobError> {
        let today = self.clock.today();
        if !self.cache.first_check((user_id, role_id), today) {
            return Ok(ScheduleDecision::AlreadyChecked);
        }

        let (summary, diary) =
            produced_today(self.memories.as_ref(), user_id, role_id, self.clock.day_range(today))
                .await?;
        if summary && diary {
            debug!(user_id, role_id, "daily summary already produced today");
            return Ok(ScheduleDecision::AlreadySummarized);
        }

        let Some(yesterday) = today.pred_opt() else {
            return Ok(ScheduleDecision::NoMemoriesYesterday);
        };
        let count = self
            .memories
            .count_memories(&MemoryQuery::pair(user_id, role_id).within(self.clock.day_range(yesterday)))
            .await?;
        if count == 0 {
            debug!(user_id, role_id, "no memories yesterday, skip daily summary");
            return Ok(ScheduleDecision::NoMemoriesYesterday);
        }

        let job_id = self
            .queue
            .enqueue(
                Job::DailySummary {
                    user_id,
                    role_id,
                    language,
                },
                self.delay,
            )
            .await?;
        info!(user_id, role_id, job_id = %job_id, "daily summary job enqueued");
        Ok(ScheduleDecision::Enqueued(job_id))
    }
}

/// 一次执行的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SummaryOutcome {
    pub summary_written: bool,
    pub diary_written: bool,
    /// 今天已经有总结与日记
    pub already_done: bool,
    /// 昨天没有记忆，未生成
    pub nothing_to_summarize: bool,
}

impl SummaryOutcome {
    pub fn generated(&self) -> bool {
        self.summary_written || self.diary_written
    }
}

/// 昨日记忆渲染为总结输入：每行「【分类】(子类)：内容」
pub fn render_yesterday(language: Language, items: &[MemoryItem]) -> String {
    let lb = labels(language);
    let mut s = format!("{}\n", lb.yesterday_header);
    for m in items {
        s.push_str(&format!(
            "{}({})：{}\n",
            lb.bracket(m.sub_category),
            m.sub_category.as_str(),
            m.content
        ));
    }
    s
}

pub struct DailySummarizer {
    repos: Repositories,
    client: Arc<CompletionClient>,
    prompts: Arc<dyn PromptSource>,
    renderer: Arc<dyn TemplateRenderer>,
    clock: Arc<dyn Clock>,
    models: ModelChain,
    temperature: f32,
    locks: PairLocks,
}

impl DailySummarizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        client: Arc<CompletionClient>,
        prompts: Arc<dyn PromptSource>,
        renderer: Arc<dyn TemplateRenderer>,
        clock: Arc<dyn Clock>,
        models: ModelChain,
        temperature: f32,
    ) -> Self {
        Self {
            repos,
            client,
            prompts,
            renderer,
            clock,
            models,
            temperature,
            locks: PairLocks::new(),
        }
    }

    /// 生成昨天的总结与日记；任一次模型调用失败时返回错误让任务重试，已生成的部分下次会被跳过
    pub async fn run(
        &self,
        user_id: UserId,
        role: &Role,
        language: Language,
    ) -> Result<SummaryOutcome, JobError> {
        let _guard = self.locks.lock((user_id, role.id)).await;

        let today = self.clock.today();
        let (has_summary, has_diary) = produced_today(
            self.repos.memories.as_ref(),
            user_id,
            role.id,
            self.clock.day_range(today),
        )
        .await?;
        if has_summary && has_diary {
            return Ok(SummaryOutcome {
                already_done: true,
                ..Default::default()
            });
        }

        let yesterday = today.pred_opt().unwrap_or(today);
        let items = self
            .repos
            .memories
            .find_memories(&MemoryQuery::pair(user_id, role.id).within(self.clock.day_range(yesterday)))
            .await?;
        if items.is_empty() {
            info!(user_id, role_id = role.id, "no memories yesterday, daily summary not generated");
            return Ok(SummaryOutcome {
                nothing_to_summarize: true,
                ..Default::default()
            });
        }

        let mut outcome = SummaryOutcome::default();
        let mut first_error = None;

        if !has_summary {
            match self.write_summary(user_id, role.id, language, yesterday, &items).await {
                Ok(written) => outcome.summary_written = written,
                Err(e) => {
                    warn!(user_id, role_id = role.id, error = %e, "daily summary call failed");
                    first_error = Some(e);
                }
            }
        }
        if !has_diary {
            match self.write_diary(user_id, role, language, &items).await {
                Ok(written) => outcome.diary_written = written,
                Err(e) => {
                    warn!(user_id, role_id = role.id, error = %e, "daily diary call failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    async fn write_summary(
        &self,
        user_id: UserId,
        role_id: RoleId,
        language: Language,
        yesterday: NaiveDate,
        items: &[MemoryItem],
    ) -> Result<bool, JobError> {
        let vars = TemplateVars::new()
            .set("date", yesterday.to_string())
            .set("memories", render_yesterday(language, items));
        let template = self.prompts.template(TemplateKind::DailySummary, language);
        let Some(prompt) = self.render(&template, &vars) else {
            return Ok(false);
        };

        let raw = self
            .client
            .complete(&[Message::system(prompt)], &self.models, self.temperature)
            .await?;

        // 不管模型标成什么子类，这里只写每日总结
        let contents: Vec<NewMemory> = match parse_memory_payload(&raw) {
            Some(payload) => payload
                .into_iter()
                .map(|p| p.content.trim().to_string())
                .filter(|c| !c.is_empty())
                .map(|c| NewMemory::new(c, SubCategory::DailySummary))
                .collect(),
            None => {
                warn!(user_id, role_id, raw = %raw, "daily summary response is not valid JSON");
                return Ok(false);
            }
        };
        if contents.is_empty() {
            warn!(user_id, role_id, raw = %raw, "daily summary response has no content");
            return Ok(false);
        }

        self.repos
            .memories
            .insert_memories(user_id, role_id, &contents, None, self.clock.now())
            .await?;
        info!(user_id, role_id, count = contents.len(), "daily summary written");
        Ok(true)
    }

    async fn write_diary(
        &self,
        user_id: UserId,
        role: &Role,
        language: Language,
        items: &[MemoryItem],
    ) -> Result<bool, JobError> {
        let persona = load_persona(&self.repos, user_id, role.id).await?;
        let memories = items
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let vars = TemplateVars::new()
            .set("memories", memories)
            .set("user_name", persona.name.as_str())
            .set("user_gender", persona.gender.as_str())
            .set("role_name", role.name.as_str())
            .set("role_gender", role.gender.as_str())
            .set("lang", diary_language(language));
        let template = self.prompts.template(TemplateKind::DailyDiary, language);
        let Some(prompt) = self.render(&template, &vars) else {
            return Ok(false);
        };

        let raw = self
            .client
            .complete(&[Message::system(prompt)], &self.models, self.temperature)
            .await?;
        let diary = raw.trim();
        if diary.is_empty() {
            warn!(user_id, role_id = role.id, "empty diary response");
            return Ok(false);
        }

        self.repos
            .memories
            .insert_memories(
                user_id,
                role.id,
                &[NewMemory::new(diary, SubCategory::DailyDiary)],
                None,
                self.clock.now(),
            )
            .await?;
        info!(user_id, role_id = role.id, "daily diary written");
        Ok(true)
    }

    fn render(&self, template: &str, vars: &TemplateVars) -> Option<String> {
        self.renderer
            .render(template, vars)
            .map_err(|e| warn!(error = %e, "daily template failed to render"))
            .ok()
    }
}

fn diary_language(language: Language) -> &'static str {
    match language {
        Language::TraditionalChinese => "Traditional Chinese",
        Language::English => "English",
    }
}
