//! 对话记忆提取
//!
//! 每满 N 轮（默认 5）用最近 N 轮对话调用一次模型，提取用户资料与重要事件，
//! 整批写入并以触发轮次 id 标记。返回内容不合规时整批丢弃，不做部分写入。
//! 同一 (user, role) 的提取与重新生成的清除、写入互斥；提取期间触发轮次被改写时结果作废。

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::{
    ChatTurn, Clock, PairGuard, PairLocks, RecordStatus, Role, RoleId, StoreError, TurnId, UserId,
};
use crate::llm::{json_body, CompletionClient, LlmError, ModelChain};
use crate::memory::item::{MemoryCategory, MemoryQuery, NewMemory, SubCategory};
use crate::memory::Message;
use crate::prompt::{load_persona, PromptSource, TemplateKind, TemplateRenderer, TemplateVars};
use crate::store::Repositories;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// 一次提取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    /// 该轮次已有提取结果（重复投递）
    AlreadyExtracted,
    /// 对话不足一批
    NotEnoughTurns,
    /// 返回内容不合规，整批丢弃
    Discarded,
    /// 提取期间触发轮次被重新生成或撤回，结果作废
    Superseded,
    Stored(usize),
}

/// 模型返回的 `{"memories": [...]}` 中的一项
#[derive(Debug, Clone, Deserialize)]
pub struct PayloadItem {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub sub_category: Option<String>,
}

#[derive(Deserialize)]
struct Payload {
    memories: Vec<PayloadItem>,
}

/// 解析记忆 JSON（容忍代码块包裹）；结构不对返回 None
pub fn parse_memory_payload(raw: &str) -> Option<Vec<PayloadItem>> {
    serde_json::from_str::<Payload>(json_body(raw))
        .ok()
        .map(|p| p.memories)
}

fn parse_category(s: &str) -> Option<MemoryCategory> {
    match s.trim() {
        "user_memory" | "user_fact" => Some(MemoryCategory::UserFact),
        "medium_memory" | "event" => Some(MemoryCategory::Event),
        _ => None,
    }
}

/// 校验对话提取结果：任何一项不合规都拒绝整批
pub fn validate_extracted(items: &[PayloadItem]) -> Result<Vec<NewMemory>, String> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let content = item.content.trim();
            if content.is_empty() {
                return Err(format!("item {i}: empty content"));
            }
            let raw_sub = item.sub_category.as_deref().unwrap_or_default();
            let sub = SubCategory::parse(raw_sub)
                .ok_or_else(|| format!("item {i}: unknown sub_category '{raw_sub}'"))?;
            if !sub.is_extractable() {
                return Err(format!("item {i}: sub_category '{raw_sub}' is reserved"));
            }
            if let Some(raw_cat) = item.category.as_deref() {
                match parse_category(raw_cat) {
                    Some(cat) if cat == sub.category() => {}
                    _ => {
                        return Err(format!(
                            "item {i}: category '{raw_cat}' does not match '{raw_sub}'"
                        ))
                    }
                }
            }
            Ok(NewMemory::new(content, sub))
        })
        .collect()
}

/// 把若干轮对话渲染为提取提示词中的对话段
pub fn render_conversation(turns: &[ChatTurn], user_name: &str, role_name: &str) -> String {
    let mut s = String::from("<conversation>\n");
    for t in turns {
        s.push_str(&format!(
            "<user> (User name: {user_name}):{} </user>\n<assistant> (Assistant name: {role_name}):{} </assistant>\n",
            t.question, t.answer
        ));
    }
    s.push_str("</conversation>");
    s
}

/// 每满 `interval` 轮触发一次
pub fn is_due(active_turns: u64, interval: u64) -> bool {
    interval > 0 && active_turns > 0 && active_turns % interval == 0
}

pub struct MemoryExtractor {
    repos: Repositories,
    client: Arc<CompletionClient>,
    prompts: Arc<dyn PromptSource>,
    renderer: Arc<dyn TemplateRenderer>,
    clock: Arc<dyn Clock>,
    models: ModelChain,
    temperature: f32,
    interval: u64,
    locks: PairLocks,
}

impl MemoryExtractor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        client: Arc<CompletionClient>,
        prompts: Arc<dyn PromptSource>,
        renderer: Arc<dyn TemplateRenderer>,
        clock: Arc<dyn Clock>,
        models: ModelChain,
        temperature: f32,
        interval: usize,
    ) -> Self {
        Self {
            repos,
            client,
            prompts,
            renderer,
            clock,
            models,
            temperature,
            interval: interval as u64,
            locks: PairLocks::new(),
        }
    }

    /// 与该 pair 的提取互斥；重新生成在清除旧记忆和写入新回复时持有
    pub async fn lock_pair(&self, user_id: UserId, role_id: RoleId) -> PairGuard<'_> {
        self.locks.lock((user_id, role_id)).await
    }

    /// 刚记录（或重新生成）的轮次是否触发提取：它在活跃轮次中的序号是 interval 的正整数倍。
    /// 新轮次的序号就是当前轮数；重新生成较早的触发轮次时同样会重新提取
    pub async fn should_extract(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<bool, StoreError> {
        let position = self
            .repos
            .chats
            .turn_position(user_id, role_id, turn_id)
            .await?;
        Ok(is_due(position, self.interval))
    }

    /// 用截至 `turn_id`（含）的最近一批对话提取记忆
    pub async fn extract(
        &self,
        user_id: UserId,
        role: &Role,
        turn_id: TurnId,
    ) -> Result<ExtractionOutcome, ExtractionError> {
        let _guard = self.lock_pair(user_id, role.id).await;

        let Some(trigger) = self
            .repos
            .chats
            .turn(turn_id)
            .await?
            .filter(|t| t.belongs_to(user_id, role.id) && t.status == RecordStatus::Active)
        else {
            debug!(user_id, role_id = role.id, turn_id, "trigger turn is gone, skip extraction");
            return Ok(ExtractionOutcome::Superseded);
        };

        let existing = self
            .repos
            .memories
            .count_memories(&MemoryQuery::pair(user_id, role.id).triggered_by(turn_id))
            .await?;
        if existing > 0 {
            debug!(user_id, role_id = role.id, turn_id, "memories already extracted for turn");
            return Ok(ExtractionOutcome::AlreadyExtracted);
        }

        let turns = self
            .repos
            .chats
            .recent_turns(user_id, role.id, self.interval, Some(turn_id))
            .await?;
        if turns.is_empty() {
            return Ok(ExtractionOutcome::NotEnoughTurns);
        }

        let persona = load_persona(&self.repos, user_id, role.id).await?;
        let vars = TemplateVars::new()
            .set("conversation", render_conversation(&turns, &persona.name, &role.name))
            .set("today", self.clock.today().to_string())
            .set("user_name", persona.name.as_str())
            .set("role_name", role.name.as_str());
        let template = self.prompts.template(TemplateKind::Extraction, role.language);
        let prompt = match self.renderer.render(&template, &vars) {
            Ok(p) => p,
            Err(e) => {
                warn!(user_id, role_id = role.id, error = %e, "extraction template failed to render");
                return Ok(ExtractionOutcome::Discarded);
            }
        };

        let raw = self
            .client
            .complete(&[Message::system(prompt)], &self.models, self.temperature)
            .await?;

        let Some(items) = parse_memory_payload(&raw) else {
            warn!(user_id, role_id = role.id, turn_id, raw = %raw, "extraction response is not valid JSON");
            return Ok(ExtractionOutcome::Discarded);
        };
        let memories = match validate_extracted(&items) {
            Ok(m) => m,
            Err(reason) => {
                warn!(user_id, role_id = role.id, turn_id, %reason, raw = %raw, "extraction batch rejected");
                return Ok(ExtractionOutcome::Discarded);
            }
        };
        if memories.is_empty() {
            return Ok(ExtractionOutcome::Stored(0));
        }

        let inserted = self
            .repos
            .memories
            .insert_turn_memories(user_id, role.id, &memories, &trigger, self.clock.now())
            .await?;
        if inserted.is_none() {
            info!(user_id, role_id = role.id, turn_id, "trigger turn changed during extraction, batch dropped");
            return Ok(ExtractionOutcome::Superseded);
        }
        info!(user_id, role_id = role.id, turn_id, count = memories.len(), "memories extracted");
        Ok(ExtractionOutcome::Stored(memories.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::llm::{RetryPolicy, ScriptedProvider};
    use crate::prompt::{MiniJinjaRenderer, PromptLibrary};
    use crate::store::TurnRecord;
    use chrono::NaiveDate;
    use std::time::Duration;

    fn item(content: &str, category: Option<&str>, sub: &str) -> PayloadItem {
        PayloadItem {
            content: content.into(),
            category: category.map(String::from),
            sub_category: Some(sub.into()),
        }
    }

    #[test]
    fn test_validate_accepts_aliases() {
        let ok = validate_extracted(&[
            item("Ken", Some("user_memory"), "nickname_of_user"),
            item("約會", Some("medium_memory"), "memory"),
        ])
        .unwrap();
        assert_eq!(ok[1].sub_category, SubCategory::Event);
    }

    #[test]
    fn test_one_bad_item_rejects_batch() {
        assert!(validate_extracted(&[
            item("Ken", Some("user_memory"), "nickname_of_user"),
            item("x", Some("user_memory"), "hair_color"),
        ])
        .is_err());
        // 大类与子类不匹配
        assert!(validate_extracted(&[item("x", Some("user_memory"), "event")]).is_err());
        // 对话提取不得写入每日总结
        assert!(validate_extracted(&[item("x", Some("medium_memory"), "daily_summary")]).is_err());
        assert!(validate_extracted(&[item("  ", None, "other")]).is_err());
    }

    #[test]
    fn test_parse_payload_tolerates_fences() {
        let raw = "```json\n{\"memories\": [{\"content\": \"a\", \"sub_category\": \"other\"}]}\n```";
        assert_eq!(parse_memory_payload(raw).unwrap().len(), 1);
        assert!(parse_memory_payload("no json here").is_none());
        assert!(parse_memory_payload("{\"items\": []}").is_none());
    }

    #[test]
    fn test_is_due() {
        assert!(!is_due(0, 5));
        assert!(!is_due(4, 5));
        assert!(is_due(5, 5));
        assert!(is_due(15, 5));
        assert!(!is_due(5, 0));
    }

    async fn setup(reply: &'static str) -> (MemoryExtractor, Repositories, Arc<ScriptedProvider>, Role) {
        setup_with(ScriptedProvider::default().with_responder(move |_| Ok(reply.to_string()))).await
    }

    async fn setup_with(
        provider: ScriptedProvider,
    ) -> (MemoryExtractor, Repositories, Arc<ScriptedProvider>, Role) {
        let repos = Repositories::in_memory();
        let clock = Arc::new(ManualClock::at_local(
            NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            10,
            8,
        ));
        let provider = Arc::new(provider);
        let client = Arc::new(CompletionClient::new(provider.clone(), RetryPolicy::default()));
        let role = Role {
            id: 0,
            owner_id: 1,
            name: "阿澈".into(),
            ..Default::default()
        };
        let role_id = repos.roles.save_role(role.clone()).await.unwrap();
        let role = Role { id: role_id, ..role };
        for i in 0..6 {
            repos
                .chats
                .record_turn(TurnRecord {
                    user_id: 1,
                    role_id,
                    question: format!("q{i}"),
                    answer: format!("a{i}"),
                    score: 0,
                    score_reason: String::new(),
                    regenerate: None,
                    at: clock.now(),
                    offset: clock.offset(),
                })
                .await
                .unwrap();
        }
        let extractor = MemoryExtractor::new(
            repos.clone(),
            client,
            Arc::new(PromptLibrary::new(vec![])),
            Arc::new(MiniJinjaRenderer::new()),
            clock,
            ModelChain::parse("m").unwrap(),
            0.7,
            5,
        );
        (extractor, repos, provider, role)
    }

    #[tokio::test]
    async fn test_extract_uses_batch_up_to_trigger_and_is_idempotent() {
        let (extractor, repos, provider, role) = setup(
            r#"{"memories": [{"content": "喜歡貓", "category": "user_memory", "sub_category": "user_likes"}]}"#,
        )
        .await;
        let fifth = repos.chats.recent_turns(1, role.id, 2, None).await.unwrap()[0].clone();

        let outcome = extractor.extract(1, &role, fifth.id).await.unwrap();
        assert_eq!(outcome, ExtractionOutcome::Stored(1));

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        let prompt = calls[0].system_prompt().to_string();
        assert!(prompt.contains("q0") && prompt.contains("q4"));
        assert!(!prompt.contains("q5"));

        let again = extractor.extract(1, &role, fifth.id).await.unwrap();
        assert_eq!(again, ExtractionOutcome::AlreadyExtracted);
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_writes_nothing() {
        let (extractor, repos, _provider, role) = setup("sorry, I can't").await;
        let latest = repos.chats.recent_turns(1, role.id, 1, None).await.unwrap()[0].id;
        let outcome = extractor.extract(1, &role, latest).await.unwrap();
        assert_eq!(outcome, ExtractionOutcome::Discarded);
        let stored = repos
            .memories
            .count_memories(&MemoryQuery::pair(1, role.id))
            .await
            .unwrap();
        assert_eq!(stored, 0);
    }

    #[tokio::test]
    async fn test_should_extract_by_turn_position() {
        let (extractor, repos, _provider, role) = setup("{}").await;
        let turns = repos.chats.recent_turns(1, role.id, 6, None).await.unwrap();
        // 第 6 轮不是 5 的倍数
        assert!(!extractor.should_extract(1, role.id, turns[5].id).await.unwrap());
        // 第 5 轮不是最新一轮，重新生成后仍要重新提取
        assert!(extractor.should_extract(1, role.id, turns[4].id).await.unwrap());
        assert!(!extractor.should_extract(1, role.id, turns[3].id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_rewritten_mid_call_drops_batch() {
        let provider = ScriptedProvider::default()
            .with_responder(|_| {
                Ok(r#"{"memories": [{"content": "喜歡貓", "sub_category": "user_likes"}]}"#.to_string())
            })
            .with_latency(|_| Some(Duration::from_secs(10)));
        let (extractor, repos, _provider, role) = setup_with(provider).await;
        let extractor = Arc::new(extractor);
        let fifth = repos.chats.recent_turns(1, role.id, 2, None).await.unwrap()[0].clone();

        let running = {
            let extractor = Arc::clone(&extractor);
            let role = role.clone();
            tokio::spawn(async move { extractor.extract(1, &role, fifth.id).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        repos
            .chats
            .record_turn(TurnRecord {
                user_id: 1,
                role_id: role.id,
                question: "q4 again".into(),
                answer: "new answer".into(),
                score: 0,
                score_reason: String::new(),
                regenerate: Some(fifth.id),
                at: fifth.updated_at,
                offset: crate::core::clock::offset_from_hours(8),
            })
            .await
            .unwrap();

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, ExtractionOutcome::Superseded);
        let stored = repos
            .memories
            .count_memories(&MemoryQuery::pair(1, role.id))
            .await
            .unwrap();
        assert_eq!(stored, 0);
    }
}
