//! 提示词组装：system prompt + 最近对话窗口
//!
//! system prompt 依次由以下部分拼接：
//! 模式规则模板（渲染后）、角色信息、用户背景、当前日期、角色事件、今日记忆、最近 K 天记忆、状态栏格式。
//! 只读；可选字段缺失时渲染为空串。

use std::sync::Arc;

use tracing::warn;

use crate::core::{
    ChatMode, ChatTurn, Clock, EventEntry, Role, RoleId, StoreError, TurnId, UserId,
    UserPresumption, UserProfile,
};
use crate::memory::{replay_turns, MemoryItem, MemoryQuery, Message, SubCategory};
use crate::prompt::labels::{labels, SectionLabels};
use crate::prompt::template::{TemplateRenderer, TemplateVars};
use crate::store::Repositories;

/// 用户在该角色面前的形象：优先取人设，其次取用户资料
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserPersona {
    pub name: String,
    pub gender: String,
    pub description: String,
    pub likes: String,
    pub dislikes: String,
    pub other: String,
}

impl UserPersona {
    pub fn resolve(presumption: Option<&UserPresumption>, profile: Option<&UserProfile>) -> Self {
        match (presumption, profile) {
            (Some(p), _) => Self {
                name: p.name.clone(),
                gender: p.gender.clone(),
                description: p.description.clone(),
                likes: p.likes.clone(),
                dislikes: p.dislikes.clone(),
                other: p.other.clone(),
            },
            (None, Some(u)) => Self {
                name: u.nickname.clone(),
                gender: u.gender.clone(),
                description: u.description.clone(),
                ..Default::default()
            },
            (None, None) => Self::default(),
        }
    }
}

/// 读取人设，没有时回退到用户资料
pub async fn load_persona(
    repos: &Repositories,
    user_id: UserId,
    role_id: RoleId,
) -> Result<UserPersona, StoreError> {
    let presumption = repos.presumptions.presumption(user_id, role_id).await?;
    let profile = match presumption {
        Some(_) => None,
        None => repos.roles.user_profile(user_id).await?,
    };
    Ok(UserPersona::resolve(presumption.as_ref(), profile.as_ref()))
}

/// 组装结果
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    pub system: String,
    /// 历史消息 + 本轮用户消息
    pub history: Vec<Message>,
}

impl AssembledPrompt {
    /// 发给模型的完整消息列表
    pub fn messages(&self) -> Vec<Message> {
        let mut all = Vec::with_capacity(self.history.len() + 1);
        all.push(Message::system(self.system.clone()));
        all.extend(self.history.iter().cloned());
        all
    }
}

pub struct PromptAssembler {
    repos: Repositories,
    renderer: Arc<dyn TemplateRenderer>,
    clock: Arc<dyn Clock>,
    history_window: u64,
}

impl PromptAssembler {
    pub fn new(
        repos: Repositories,
        renderer: Arc<dyn TemplateRenderer>,
        clock: Arc<dyn Clock>,
        history_window: usize,
    ) -> Self {
        Self {
            repos,
            renderer,
            clock,
            history_window: history_window as u64,
        }
    }

    pub async fn persona(&self, user_id: UserId, role: &Role) -> Result<UserPersona, StoreError> {
        load_persona(&self.repos, user_id, role.id).await
    }

    /// 组装一轮对话的提示词
    pub async fn assemble(
        &self,
        role: &Role,
        user_id: UserId,
        mode: &ChatMode,
        message: &str,
    ) -> Result<AssembledPrompt, StoreError> {
        self.assemble_before(role, user_id, mode, message, None).await
    }

    /// 重新生成时只回放该轮之前的对话
    pub async fn assemble_before(
        &self,
        role: &Role,
        user_id: UserId,
        mode: &ChatMode,
        message: &str,
        before: Option<TurnId>,
    ) -> Result<AssembledPrompt, StoreError> {
        let persona = self.persona(user_id, role).await?;
        let events = self.visible_events(role, user_id).await?;

        let today = self.clock.today();
        let pair = MemoryQuery::pair(user_id, role.id);
        let today_items = self
            .repos
            .memories
            .find_memories(
                &pair
                    .clone()
                    .kinds(&SubCategory::TODAY_BLOCK)
                    .within(self.clock.day_range(today)),
            )
            .await?;
        let history_items = self
            .repos
            .memories
            .find_memories(
                &pair
                    .kinds(&[SubCategory::DailySummary])
                    .newest_first()
                    .limit(mode.memory_days as u64),
            )
            .await?;
        let turns = self
            .repos
            .chats
            .recent_turns(
                user_id,
                role.id,
                self.history_window,
                before.map(|id| id.saturating_sub(1)),
            )
            .await?;

        let lb = labels(role.language);
        let vars = chat_vars(role, &persona, &today.to_string());
        let rules = self.renderer.render(&mode.chat_template, &vars).unwrap_or_else(|e| {
            warn!(mode_id = mode.id, error = %e, "chat template failed to render, using it raw");
            mode.chat_template.clone()
        });

        let mut system = rules;
        system.push_str(&render_role_block(lb, role, &persona, &today.to_string()));
        system.push_str(&render_event_block(lb, &events));
        system.push_str(&render_memory_block(lb, &today_items, &history_items, mode.memory_days));
        system.push('\n');
        system.push_str(lb.status_line);
        system.push_str(&role.status_line);

        Ok(AssembledPrompt {
            system,
            history: history_messages(&turns, &role.greeting, message),
        })
    }

    /// 角色拥有者的事件 + 当前用户自己添加的事件，按 id 升序
    pub async fn visible_events(
        &self,
        role: &Role,
        viewer: UserId,
    ) -> Result<Vec<EventEntry>, StoreError> {
        let mut events = self.repos.events.list_events(role.id, role.owner_id).await?;
        if viewer != role.owner_id {
            events.extend(self.repos.events.list_events(role.id, viewer).await?);
            events.sort_by_key(|e| e.id);
        }
        Ok(events)
    }
}

/// 模式模板可用的变量
pub fn chat_vars(role: &Role, persona: &UserPersona, today: &str) -> TemplateVars {
    TemplateVars::new()
        .set("role_name", role.name.as_str())
        .set("role_gender", role.gender.as_str())
        .set("role_age", role.age.map(|a| a.to_string()).unwrap_or_default())
        .set("role_occupation", role.occupation.as_str())
        .set("role_description", role.description.as_str())
        .set("role_character", role.character.as_str())
        .set("user_name", persona.name.as_str())
        .set("user_gender", persona.gender.as_str())
        .set("user_description", persona.description.as_str())
        .set("user_likes", persona.likes.as_str())
        .set("user_dislikes", persona.dislikes.as_str())
        .set("user_other", persona.other.as_str())
        .set("today", today)
        .set("lang", role.language.tag())
}

fn render_role_block(lb: &SectionLabels, role: &Role, persona: &UserPersona, today: &str) -> String {
    let age = role.age.map(|a| a.to_string()).unwrap_or_default();
    let role_values = [
        role.name.as_str(),
        role.gender.as_str(),
        age.as_str(),
        role.occupation.as_str(),
        role.description.as_str(),
        role.character.as_str(),
    ];
    let user_values = [
        persona.gender.as_str(),
        persona.description.as_str(),
        persona.name.as_str(),
        persona.likes.as_str(),
        persona.dislikes.as_str(),
        persona.other.as_str(),
    ];

    let mut s = format!("\n{}\n", lb.role_header);
    for (label, value) in lb.role_fields.iter().zip(role_values) {
        s.push_str(&format!("#{label}：{value}\n"));
    }
    s.push_str(&format!("{}\n", lb.user_header));
    for (label, value) in lb.user_fields.iter().zip(user_values) {
        if !value.is_empty() {
            s.push_str(&format!("#{label}：{value}\n"));
        }
    }
    s.push_str(&format!("{}{today}\n", lb.date_label));
    s
}

/// 角色事件：每行「标题：内容」
pub fn render_event_block(lb: &SectionLabels, events: &[EventEntry]) -> String {
    if events.is_empty() {
        return String::new();
    }
    let mut s = format!("{}\n", lb.events_header);
    for e in events {
        s.push_str(&format!("{}：{}\n", e.title, e.content));
    }
    s
}

/// 记忆区块：今日记忆（时间正序）+ 最近 K 天总结（最新在前）
pub fn render_memory_block(
    lb: &SectionLabels,
    today: &[MemoryItem],
    history: &[MemoryItem],
    days: usize,
) -> String {
    let mut s = String::new();
    if !today.is_empty() {
        s.push_str(lb.today_header);
        s.push('\n');
        for m in today {
            s.push_str(&memory_line(lb, m));
        }
    }
    if !history.is_empty() {
        s.push_str(&lb.history_header(days));
        s.push('\n');
        for m in history {
            s.push_str(&memory_line(lb, m));
        }
    }
    s
}

fn memory_line(lb: &SectionLabels, m: &MemoryItem) -> String {
    format!(
        "#{}（{}）：{}\n",
        lb.category(m.category()),
        m.sub_category.as_str(),
        m.content
    )
}

/// 最近若干轮对话；没有历史时以开场白作为唯一一条 assistant 消息
pub fn history_messages(turns: &[ChatTurn], greeting: &str, message: &str) -> Vec<Message> {
    let mut history = replay_turns(turns);
    if history.is_empty() {
        history.push(Message::assistant(greeting));
    }
    history.push(Message::user(message));
    history
}

/// 给内心想法、日记等辅助任务使用的角色背景文本
pub fn background_text(role: &Role, persona: &UserPersona, today: &str) -> String {
    render_role_block(labels(role.language), role, persona, today)
        .trim_start()
        .to_string()
}
