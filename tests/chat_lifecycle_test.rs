//! 对话生命周期集成测试：脚本化模型 + 手动时钟 + 内存存储

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate};
use rolechat::app::{App, AppParts};
use rolechat::config::AppConfig;
use rolechat::core::{
    ChatError, Clock, Language, ManualClock, Role, RoleId, RoleStatus, ValidationError,
};
use rolechat::llm::{ChatRequest, ProviderError, ScriptedProvider};
use rolechat::memory::{MemoryQuery, SubCategory};
use rolechat::prompt::PromptLibrary;
use rolechat::store::Repositories;

const SUMMARY_REPLY: &str = r#"{"memories": [{"content": "昨天聊了貓", "category": "medium_memory", "sub_category": "daily_summary"}]}"#;

fn respond(req: &ChatRequest<'_>) -> Result<String, ProviderError> {
    if req.model == "score-model" {
        return Ok(r#"{"score": 2, "reason": "sweet"}"#.to_string());
    }
    let system = req.messages.first().map(|m| m.content.as_str()).unwrap_or("");
    if system.contains("萃取") {
        let likes = if system.contains("again") {
            "likes rain"
        } else {
            "likes cats"
        };
        return Ok(format!(
            r#"{{"memories": [{{"content": "{likes}", "category": "user_memory", "sub_category": "user_likes"}}, {{"content": "promised a trip", "category": "medium_memory", "sub_category": "event"}}]}}"#
        ));
    }
    if system.contains("心理學專家") {
        return Ok("其實很在意。".to_string());
    }
    if system.contains("diary") {
        return Ok("今天很開心。".to_string());
    }
    if system.contains("昨日") {
        return Ok(SUMMARY_REPLY.to_string());
    }
    let last = req.messages.last().map(|m| m.content.as_str()).unwrap_or("");
    Ok(format!("reply to {last}"))
}

fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.llm.default_models = "chat-model".to_string();
    cfg.llm.score_models = "score-model".to_string();
    cfg.llm.max_retries = 0;
    cfg.llm.base_delay_ms = 0;
    cfg.memory.inner_thought_probability = 1.0;
    cfg
}

struct Harness {
    app: App,
    provider: Arc<ScriptedProvider>,
    clock: Arc<ManualClock>,
    role_id: RoleId,
}

impl Harness {
    fn repos(&self) -> &Repositories {
        &self.app.repos
    }

    async fn role(&self) -> Role {
        self.repos().roles.role(self.role_id).await.unwrap().unwrap()
    }

    async fn count(&self, query: MemoryQuery) -> u64 {
        self.repos().memories.count_memories(&query).await.unwrap()
    }

    async fn send_many(&self, from: usize, to: usize) -> Vec<u64> {
        let mut ids = Vec::new();
        for i in from..=to {
            let reply = self
                .app
                .chat
                .send(1, self.role_id, 1, &format!("msg-{i:02}"))
                .await
                .unwrap();
            ids.push(reply.turn.id);
        }
        ids
    }
}

async fn harness_with(provider: ScriptedProvider) -> Harness {
    harness_configured(config(), provider).await
}

async fn harness_configured(cfg: AppConfig, provider: ScriptedProvider) -> Harness {
    let provider = Arc::new(provider);
    let clock = Arc::new(ManualClock::at_local(
        NaiveDate::from_ymd_opt(2025, 6, 10).unwrap(),
        10,
        8,
    ));
    let repos = Repositories::in_memory();
    let role_id = repos
        .roles
        .save_role(Role {
            owner_id: 1,
            name: "阿澈".into(),
            greeting: "你來啦".into(),
            status: RoleStatus::Published,
            ..Default::default()
        })
        .await
        .unwrap();
    let app = App::with_parts(
        &cfg,
        AppParts {
            repos,
            provider: provider.clone(),
            clock: clock.clone(),
            prompts: Arc::new(PromptLibrary::from_config(&cfg).unwrap()),
        },
    )
    .unwrap();
    Harness {
        app,
        provider,
        clock,
        role_id,
    }
}

async fn harness() -> Harness {
    harness_with(ScriptedProvider::new().with_responder(respond)).await
}

#[tokio::test]
async fn test_first_turn_uses_greeting_and_records_relationship() {
    let h = harness().await;
    let reply = h.app.chat.send(1, h.role_id, 1, "早安").await.unwrap();
    assert_eq!(reply.turn.answer, "reply to 早安");
    assert_eq!(reply.turn.score, 2);
    assert_eq!(reply.favorability, 2);
    assert_eq!(reply.continuous_days, 1);

    let chat_call = h
        .provider
        .calls()
        .into_iter()
        .find(|c| c.model == "chat-model")
        .unwrap();
    // system + 开场白 + 用户消息
    assert_eq!(chat_call.messages.len(), 3);
    assert_eq!(chat_call.messages[1].content, "你來啦");

    let role = h.role().await;
    assert_eq!(role.chat_count, 1);
    assert_eq!(role.user_count, 1);
}

#[tokio::test]
async fn test_extraction_every_fifth_turn_uses_last_five() {
    let h = harness().await;
    h.send_many(1, 15).await;

    let extraction_prompts: Vec<String> = h
        .provider
        .calls()
        .into_iter()
        .map(|c| c.system_prompt().to_string())
        .filter(|p| p.contains("萃取"))
        .collect();
    assert_eq!(extraction_prompts.len(), 3);

    let last = &extraction_prompts[2];
    for i in 11..=15 {
        assert!(last.contains(&format!("msg-{i:02}")));
    }
    assert!(!last.contains("msg-10"));

    let today = h.clock.day_range(h.clock.today());
    assert_eq!(
        h.count(MemoryQuery::pair(1, h.role_id).within(today)).await,
        6
    );
}

#[tokio::test]
async fn test_regenerate_purges_turn_records_and_keeps_identity() {
    let h = harness().await;
    let ids = h.send_many(1, 5).await;
    let fifth = ids[4];

    let by_fifth = || MemoryQuery::pair(1, h.role_id).triggered_by(fifth);
    assert_eq!(h.count(by_fifth()).await, 2);
    let thought = h.app.chat.inner_thought(1, h.role_id, fifth).await.unwrap();
    assert!(thought.is_some());
    assert_eq!(h.repos().thoughts.count_thoughts(1, h.role_id).await.unwrap(), 1);

    let reply = h.app.chat.regenerate(1, fifth, 1, "again please").await.unwrap();
    assert_eq!(reply.turn.id, fifth);
    assert!(reply.turn.is_regenerated);
    assert_eq!(reply.turn.question, "again please");
    assert_eq!(reply.favorability, 10);

    // 旧批次被清除，重新提取出新批次
    let items = h
        .repos()
        .memories
        .find_memories(&by_fifth())
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().any(|m| m.content == "likes rain"));
    assert!(items.iter().all(|m| m.content != "likes cats"));
    assert_eq!(h.repos().thoughts.count_thoughts(1, h.role_id).await.unwrap(), 0);

    let role = h.role().await;
    assert_eq!(role.chat_count, 5);

    // 只有该轮之前的对话会回放
    let regen_call = h
        .provider
        .calls()
        .into_iter()
        .filter(|c| c.model == "chat-model" && c.system_prompt().contains("請完全以角色身份"))
        .last()
        .unwrap();
    assert!(regen_call.messages.iter().all(|m| m.content != "msg-05"));
    assert_eq!(regen_call.messages.last().unwrap().content, "again please");
}

#[tokio::test(start_paused = true)]
async fn test_regenerate_during_queued_extraction_keeps_only_new_batch() {
    let mut cfg = config();
    cfg.memory.async_extraction = true;
    cfg.memory.extraction_delay_secs = 0;
    let provider = ScriptedProvider::new()
        .with_responder(respond)
        .with_latency(|req| {
            let system = req.messages.first().map(|m| m.content.as_str()).unwrap_or("");
            system.contains("萃取").then(|| Duration::from_secs(10))
        });
    let h = harness_configured(cfg, provider).await;
    let workers = h.app.start_workers().unwrap();

    let ids = h.send_many(1, 5).await;
    let fifth = ids[4];
    // 旧提取任务正在等待模型时重新生成
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.app.chat.regenerate(1, fifth, 1, "again please").await.unwrap();
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(h.app.queue.live_jobs(), 0);

    let mut contents: Vec<String> = h
        .repos()
        .memories
        .find_memories(&MemoryQuery::pair(1, h.role_id).triggered_by(fifth))
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    contents.sort();
    assert_eq!(contents, vec!["likes rain", "promised a trip"]);

    h.app.shutdown();
    workers.await.unwrap();
}

#[tokio::test]
async fn test_regenerate_earlier_trigger_turn_reextracts() {
    let h = harness().await;
    let ids = h.send_many(1, 7).await;
    let fifth = ids[4];
    assert_eq!(h.provider.calls_matching("萃取"), 1);

    h.app.chat.regenerate(1, fifth, 1, "again please").await.unwrap();
    assert_eq!(h.provider.calls_matching("萃取"), 2);

    let items = h
        .repos()
        .memories
        .find_memories(&MemoryQuery::pair(1, h.role_id).triggered_by(fifth))
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().any(|m| m.content == "likes rain"));

    // 重新生成非触发轮次不会提取
    h.app.chat.regenerate(1, ids[6], 1, "one more").await.unwrap();
    assert_eq!(h.provider.calls_matching("萃取"), 2);
}

#[tokio::test]
async fn test_regenerate_rejects_foreign_turn() {
    let h = harness().await;
    let ids = h.send_many(1, 1).await;
    let err = h.app.chat.regenerate(2, ids[0], 1, "hi").await.unwrap_err();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::TurnNotFound(_))
    ));
}

#[tokio::test]
async fn test_streak_counts_consecutive_days_and_resets_after_gap() {
    let h = harness().await;
    for _ in 0..3 {
        h.app.chat.send(1, h.role_id, 1, "hi").await.unwrap();
        h.clock.advance(ChronoDuration::days(1));
    }
    let view = h.app.chat.relationship(1, h.role_id).await.unwrap();
    assert_eq!(view.continuous_days, 3);

    h.clock.advance(ChronoDuration::days(1));
    // 最后一次聊天早于昨天，展示为 0
    assert_eq!(h.app.chat.relationship(1, h.role_id).await.unwrap().continuous_days, 0);

    let reply = h.app.chat.send(1, h.role_id, 1, "back").await.unwrap();
    assert_eq!(reply.continuous_days, 1);
    assert_eq!(reply.favorability, 8);
}

#[tokio::test]
async fn test_validation_errors_never_reach_the_model() {
    let h = harness().await;
    let err = h.app.chat.send(1, h.role_id, 1, "   ").await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::EmptyMessage)));

    let err = h
        .app
        .chat
        .send(1, h.role_id, 1, &"字".repeat(2001))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::MessageTooLong { max: 2000 })
    ));

    let err = h.app.chat.send(1, h.role_id, 99, "hi").await.unwrap_err();
    assert!(matches!(err, ChatError::Validation(ValidationError::UnknownMode(99))));

    let private = h
        .repos()
        .roles
        .save_role(Role {
            owner_id: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    let err = h.app.chat.send(2, private, 1, "hi").await.unwrap_err();
    assert!(err.is_user_visible());
    assert_eq!(err.to_string(), "角色不存在");

    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_completion_failure_leaves_no_trace() {
    let provider = ScriptedProvider::new().with_responder(|req| {
        if req.model == "chat-model" {
            Err(ProviderError::api(400, Some("invalid_request_error"), "bad request"))
        } else {
            respond(req)
        }
    });
    let h = harness_with(provider).await;

    let err = h.app.chat.send(1, h.role_id, 1, "hi").await.unwrap_err();
    assert!(matches!(err, ChatError::ServiceUnavailable(_)));
    assert_eq!(err.to_string(), "AI服务暂时不可用，请稍后再试");

    assert_eq!(h.repos().chats.count_turns(1, h.role_id).await.unwrap(), 0);
    assert!(h.repos().chats.relationship(1, h.role_id).await.unwrap().is_none());
    assert_eq!(h.provider.calls_for("score-model"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_daily_summary_runs_once_through_workers() {
    let h = harness().await;
    let workers = h.app.start_workers().unwrap();
    assert!(h.app.start_workers().is_none());

    h.send_many(1, 5).await;
    h.clock.advance(ChronoDuration::days(1));
    h.send_many(6, 6).await;
    assert_eq!(h.app.queue.live_jobs(), 1);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(h.app.queue.live_jobs(), 0);

    let today = h.clock.day_range(h.clock.today());
    let pair = || MemoryQuery::pair(1, h.role_id).within(today);
    assert_eq!(h.count(pair().kinds(&[SubCategory::DailySummary])).await, 1);
    assert_eq!(h.count(pair().kinds(&[SubCategory::DailyDiary])).await, 1);

    // 同一天再次检查与再次执行都不会产生第二份
    h.send_many(7, 7).await;
    assert_eq!(h.app.queue.live_jobs(), 0);
    let role = h.role().await;
    let again = h
        .app
        .summarizer
        .run(1, &role, Language::TraditionalChinese)
        .await
        .unwrap();
    assert!(again.already_done);
    assert_eq!(h.count(pair().kinds(&[SubCategory::DailySummary])).await, 1);

    let diaries = h.app.memories.diaries(1, h.role_id, 1, 10).await.unwrap();
    assert_eq!(diaries.items[0].content, "今天很開心。");

    h.app.shutdown();
    workers.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_async_extraction_runs_through_queue() {
    let mut cfg = config();
    cfg.memory.async_extraction = true;
    cfg.memory.extraction_delay_secs = 5;
    let h = harness_configured(cfg, ScriptedProvider::new().with_responder(respond)).await;
    let workers = h.app.start_workers().unwrap();

    h.send_many(1, 5).await;
    assert_eq!(h.app.queue.live_jobs(), 1);
    assert_eq!(h.count(MemoryQuery::pair(1, h.role_id)).await, 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.app.queue.live_jobs(), 0);
    assert_eq!(h.count(MemoryQuery::pair(1, h.role_id)).await, 2);

    h.app.shutdown();
    workers.await.unwrap();
}

#[tokio::test]
async fn test_daily_summary_without_yesterday_memories_is_noop() {
    let h = harness().await;
    let role = h.role().await;
    let outcome = h
        .app
        .summarizer
        .run(1, &role, Language::TraditionalChinese)
        .await
        .unwrap();
    assert!(outcome.nothing_to_summarize);
    assert!(!outcome.generated());
    assert!(h.provider.calls().is_empty());
}

#[tokio::test]
async fn test_event_caps_per_author() {
    let h = harness().await;
    for i in 0..8 {
        h.app.events.add(1, h.role_id, &format!("e{i}"), "c").await.unwrap();
    }
    assert!(h.app.events.add(1, h.role_id, "e9", "c").await.is_err());

    for i in 0..5 {
        h.app.events.add(2, h.role_id, &format!("p{i}"), "c").await.unwrap();
    }
    let err = h.app.events.add(2, h.role_id, "p6", "c").await.unwrap_err();
    assert!(matches!(
        err,
        ChatError::Validation(ValidationError::ContributorEventLimit(5))
    ));

    // 提示词里：作者事件 + 当前玩家自己的事件
    h.app.chat.send(2, h.role_id, 1, "hi").await.unwrap();
    let system = h.provider.calls()[0].system_prompt().to_string();
    assert!(system.contains("e7：c"));
    assert!(system.contains("p4：c"));
}

#[tokio::test]
async fn test_clear_removes_everything_for_pair() {
    let h = harness().await;
    h.send_many(1, 5).await;
    let cleared = h.app.chat.clear(1, h.role_id).await.unwrap();
    assert_eq!(cleared, 5);

    let page = h.app.chat.history(1, h.role_id, 1, 10).await.unwrap();
    assert_eq!(page.total, 0);
    assert_eq!(h.count(MemoryQuery::pair(1, h.role_id)).await, 0);
    assert!(h.repos().chats.relationship(1, h.role_id).await.unwrap().is_none());
}
