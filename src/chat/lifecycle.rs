//! 对话轮次生命周期
//!
//! 一轮对话：校验 → （重新生成时）清除该轮产生的记忆与内心想法 → 组装提示词 → 模型回复 →
//! 独立打分 → 原子写入轮次与关系聚合 → 记忆提取与每日总结调度。
//! 模型调用全部失败时不写入任何对话记录；写入之后的步骤失败只记日志，不影响本轮结果。
//! 重新生成的清除与写入都在该 pair 的提取锁内进行，锁不跨越回复与打分调用。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chat::relationship::effective_streak;
use crate::chat::thought::InnerThoughtGenerator;
use crate::core::{
    types::page_offset, ChatError, ChatTurn, Clock, InnerThought, Page, RecordStatus,
    RelationshipAggregate, Role, RoleId, TurnId, UserId, ValidationError,
};
use crate::llm::{CompletionClient, ModelChain, Scorer};
use crate::memory::MemoryExtractor;
use crate::prompt::{PromptAssembler, PromptSource};
use crate::store::{Repositories, TurnRecord};
use crate::worker::{DailySummaryScheduler, DelayQueue, Job};

/// 聊天链路参数
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub max_message_chars: usize,
    /// 为 true 时记忆提取进入后台队列
    pub async_extraction: bool,
    pub extraction_delay: Duration,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_message_chars: 2000,
            async_extraction: false,
            extraction_delay: Duration::ZERO,
        }
    }
}

/// 一轮对话的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatReply {
    pub turn: ChatTurn,
    pub favorability: i64,
    pub continuous_days: u32,
}

/// 关系展示
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationshipView {
    pub favorability: i64,
    /// 最后一次聊天早于昨天时为 0
    pub continuous_days: u32,
    pub last_turn_at: Option<DateTime<Utc>>,
}

/// ChatService 的依赖
pub struct ChatDeps {
    pub repos: Repositories,
    pub prompts: Arc<dyn PromptSource>,
    pub assembler: PromptAssembler,
    pub client: Arc<CompletionClient>,
    pub scorer: Scorer,
    pub extractor: Arc<MemoryExtractor>,
    pub scheduler: Arc<DailySummaryScheduler>,
    pub queue: Arc<dyn DelayQueue>,
    pub thoughts: InnerThoughtGenerator,
    pub clock: Arc<dyn Clock>,
    pub settings: ChatSettings,
}

pub struct ChatService {
    repos: Repositories,
    prompts: Arc<dyn PromptSource>,
    assembler: PromptAssembler,
    client: Arc<CompletionClient>,
    scorer: Scorer,
    extractor: Arc<MemoryExtractor>,
    scheduler: Arc<DailySummaryScheduler>,
    queue: Arc<dyn DelayQueue>,
    thoughts: InnerThoughtGenerator,
    clock: Arc<dyn Clock>,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(deps: ChatDeps) -> Self {
        Self {
            repos: deps.repos,
            prompts: deps.prompts,
            assembler: deps.assembler,
            client: deps.client,
            scorer: deps.scorer,
            extractor: deps.extractor,
            scheduler: deps.scheduler,
            queue: deps.queue,
            thoughts: deps.thoughts,
            clock: deps.clock,
            settings: deps.settings,
        }
    }

    /// 发送一条新消息
    pub async fn send(
        &self,
        user_id: UserId,
        role_id: RoleId,
        mode_id: u64,
        message: &str,
    ) -> Result<ChatReply, ChatError> {
        self.run_turn(user_id, role_id, mode_id, message, None).await
    }

    /// 重新生成某轮回复：同一行原地更新，并标记为重新生成
    pub async fn regenerate(
        &self,
        user_id: UserId,
        turn_id: TurnId,
        mode_id: u64,
        message: &str,
    ) -> Result<ChatReply, ChatError> {
        let turn = self
            .repos
            .chats
            .turn(turn_id)
            .await?
            .filter(|t| t.user_id == user_id && t.status == RecordStatus::Active)
            .ok_or(ValidationError::TurnNotFound(turn_id))?;
        self.run_turn(user_id, turn.role_id, mode_id, message, Some(turn_id))
            .await
    }

    fn check_message<'m>(&self, message: &'m str) -> Result<&'m str, ValidationError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ValidationError::EmptyMessage);
        }
        if message.chars().count() > self.settings.max_message_chars {
            return Err(ValidationError::MessageTooLong {
                max: self.settings.max_message_chars,
            });
        }
        Ok(message)
    }

    /// 角色存在，且调用者是拥有者或角色已发布
    async fn chattable_role(&self, user_id: UserId, role_id: RoleId) -> Result<Role, ChatError> {
        self.repos
            .roles
            .role(role_id)
            .await?
            .filter(|r| r.is_chattable_by(user_id))
            .ok_or_else(|| ValidationError::RoleNotFound(role_id).into())
    }

    async fn owned_turn(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<ChatTurn, ChatError> {
        self.repos
            .chats
            .turn(turn_id)
            .await?
            .filter(|t| t.belongs_to(user_id, role_id) && t.status == RecordStatus::Active)
            .ok_or_else(|| ValidationError::TurnNotFound(turn_id).into())
    }

    async fn run_turn(
        &self,
        user_id: UserId,
        role_id: RoleId,
        mode_id: u64,
        message: &str,
        regenerate: Option<TurnId>,
    ) -> Result<ChatReply, ChatError> {
        let message = self.check_message(message)?;
        let mode = self
            .prompts
            .mode(mode_id)
            .ok_or(ValidationError::UnknownMode(mode_id))?;
        let role = self.chattable_role(user_id, role_id).await?;

        if let Some(turn_id) = regenerate {
            self.owned_turn(user_id, role_id, turn_id).await?;
            let _guard = self.extractor.lock_pair(user_id, role_id).await;
            self.purge_turn(user_id, role_id, turn_id).await?;
        }

        let prompt = self
            .assembler
            .assemble_before(&role, user_id, &mode, message, regenerate)
            .await?;
        let models = ModelChain::parse(&mode.models)?;
        let answer = match self
            .client
            .complete(&prompt.messages(), &models, mode.temperature)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                warn!(user_id, role_id, mode_id, error = %e, "chat completion failed");
                return Err(ChatError::ServiceUnavailable(e));
            }
        };

        let score = self.scorer.score(message, &answer).await;
        let guard = match regenerate {
            Some(turn_id) => {
                let guard = self.extractor.lock_pair(user_id, role_id).await;
                // 回复期间重复投递的旧提取任务可能又写入了一批
                self.purge_turn(user_id, role_id, turn_id).await?;
                Some(guard)
            }
            None => None,
        };
        let recorded = self
            .repos
            .chats
            .record_turn(TurnRecord {
                user_id,
                role_id,
                question: message.to_string(),
                answer,
                score: score.score,
                score_reason: score.reason,
                regenerate,
                at: self.clock.now(),
                offset: self.clock.offset(),
            })
            .await?;
        drop(guard);
        info!(
            user_id,
            role_id,
            turn_id = recorded.turn.id,
            score = recorded.turn.score,
            regenerated = regenerate.is_some(),
            first_contact = recorded.first_contact,
            "chat turn recorded"
        );

        self.after_turn(&role, user_id, recorded.turn.id).await;

        Ok(ChatReply {
            favorability: recorded.relationship.favorability,
            continuous_days: recorded.relationship.continuous_days,
            turn: recorded.turn,
        })
    }

    /// 清除某轮产生的记忆与内心想法
    async fn purge_turn(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<(), ChatError> {
        let memories = self
            .repos
            .memories
            .purge_turn_memories(user_id, role_id, turn_id)
            .await?;
        let thoughts = self
            .repos
            .thoughts
            .purge_turn_thoughts(user_id, role_id, turn_id)
            .await?;
        debug!(user_id, role_id, turn_id, memories, thoughts, "purged records of regenerated turn");
        Ok(())
    }

    /// 记忆提取与每日总结调度；错误只记录日志
    async fn after_turn(&self, role: &Role, user_id: UserId, turn_id: TurnId) {
        match self.extractor.should_extract(user_id, role.id, turn_id).await {
            Ok(true) if self.settings.async_extraction => {
                let job = Job::MemoryExtraction {
                    user_id,
                    role_id: role.id,
                    turn_id,
                };
                if let Err(e) = self.queue.enqueue(job, self.settings.extraction_delay).await {
                    warn!(user_id, role_id = role.id, turn_id, error = %e, "failed to enqueue memory extraction");
                }
            }
            Ok(true) => {
                if let Err(e) = self.extractor.extract(user_id, role, turn_id).await {
                    warn!(user_id, role_id = role.id, turn_id, error = %e, "memory extraction failed");
                }
            }
            Ok(false) => {}
            Err(e) => warn!(user_id, role_id = role.id, turn_id, error = %e, "extraction check failed"),
        }

        if let Err(e) = self
            .scheduler
            .check_and_schedule(user_id, role.id, role.language)
            .await
        {
            warn!(user_id, role_id = role.id, error = %e, "daily summary scheduling failed");
        }
    }

    /// 对话历史，最新在前
    pub async fn history(
        &self,
        user_id: UserId,
        role_id: RoleId,
        page: u64,
        per_page: u64,
    ) -> Result<Page<ChatTurn>, ChatError> {
        let total = self.repos.chats.count_turns(user_id, role_id).await?;
        let items = self
            .repos
            .chats
            .page_turns(user_id, role_id, page_offset(page, per_page), per_page)
            .await?;
        Ok(Page {
            items,
            total,
            page: page.max(1),
            per_page,
        })
    }

    pub async fn mark_read(&self, user_id: UserId, role_id: RoleId) -> Result<u64, ChatError> {
        Ok(self.repos.chats.mark_read(user_id, role_id).await?)
    }

    /// 清空与某角色的对话（连同记忆、内心想法与关系）
    pub async fn clear(&self, user_id: UserId, role_id: RoleId) -> Result<u64, ChatError> {
        let cleared = self.repos.chats.clear_pair(user_id, role_id).await?;
        info!(user_id, role_id, cleared, "conversation cleared");
        Ok(cleared)
    }

    pub async fn relationship(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<RelationshipView, ChatError> {
        let view = match self.repos.chats.relationship(user_id, role_id).await? {
            Some(agg) => relationship_view(&agg, self.clock.as_ref()),
            None => RelationshipView {
                favorability: 0,
                continuous_days: 0,
                last_turn_at: None,
            },
        };
        Ok(view)
    }

    /// 为某轮对话尝试生成内心想法
    pub async fn inner_thought(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<Option<InnerThought>, ChatError> {
        let role = self.chattable_role(user_id, role_id).await?;
        let turn = self.owned_turn(user_id, role_id, turn_id).await?;
        self.thoughts.generate(&role, &turn).await
    }

    /// 内心想法列表，最新在前
    pub async fn thoughts(
        &self,
        user_id: UserId,
        role_id: RoleId,
        page: u64,
        per_page: u64,
    ) -> Result<Page<InnerThought>, ChatError> {
        let total = self.repos.thoughts.count_thoughts(user_id, role_id).await?;
        let items = self
            .repos
            .thoughts
            .list_thoughts(user_id, role_id, page_offset(page, per_page), per_page)
            .await?;
        Ok(Page {
            items,
            total,
            page: page.max(1),
            per_page,
        })
    }
}

fn relationship_view(agg: &RelationshipAggregate, clock: &dyn Clock) -> RelationshipView {
    RelationshipView {
        favorability: agg.favorability,
        continuous_days: effective_streak(agg, clock.today(), clock.offset()),
        last_turn_at: Some(agg.last_turn_at),
    }
}
