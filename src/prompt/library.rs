//! 提示词库：聊天模式 + 各任务模板（按语言）
//!
//! 内置一套默认模板；可通过 `[prompts] path` 指向的 TOML 提示词包覆盖：
//!
//! ```toml
//! [[modes]]
//! id = 2
//! name = "夜聊"
//! chat_template = "你是 {{ role_name }}……"
//! models = "anthropic/claude-3.7-sonnet,openrouter/openai/gpt-4o"
//!
//! [templates.zh-Hant]
//! daily_summary = "……{{ memories }}"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::config::AppConfig;
use crate::core::{ChatMode, Language};

/// 模板种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    /// 对话记忆提取：conversation, today, user_name, role_name
    Extraction,
    /// 每日总结：date, memories
    DailySummary,
    /// 每日日记：memories, user_name, user_gender, role_name, role_gender, lang
    DailyDiary,
    /// 打分：question, answer
    Score,
    /// 内心想法：background, question, answer
    InnerThought,
}

impl TemplateKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "extraction" => Some(TemplateKind::Extraction),
            "daily_summary" => Some(TemplateKind::DailySummary),
            "daily_diary" => Some(TemplateKind::DailyDiary),
            "score" => Some(TemplateKind::Score),
            "inner_thought" => Some(TemplateKind::InnerThought),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("Failed to read prompt pack: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid prompt pack: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown template kind in prompt pack: {0}")]
    UnknownKind(String),
}

/// 模式与模板来源
pub trait PromptSource: Send + Sync {
    fn mode(&self, id: u64) -> Option<ChatMode>;
    fn template(&self, kind: TemplateKind, language: Language) -> String;
}

#[derive(Debug, Deserialize, Default)]
struct PromptPack {
    #[serde(default)]
    modes: Vec<ChatMode>,
    /// 语言标签 -> 模板种类 -> 模板
    #[serde(default)]
    templates: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct PromptLibrary {
    modes: HashMap<u64, ChatMode>,
    overrides: HashMap<(TemplateKind, Language), String>,
}

impl PromptLibrary {
    /// 仅含内置模板与给定模式
    pub fn new(modes: Vec<ChatMode>) -> Self {
        Self {
            modes: modes.into_iter().map(|m| (m.id, m)).collect(),
            overrides: HashMap::new(),
        }
    }

    /// 配置中的模式（为空时使用内置模式 1），再叠加可选提示词包
    pub fn from_config(cfg: &AppConfig) -> Result<Self, PromptError> {
        let modes = if cfg.modes.is_empty() {
            vec![default_mode(&cfg.llm.default_models, cfg.llm.temperature)]
        } else {
            cfg.modes.clone()
        };
        let mut library = Self::new(modes);
        if let Some(path) = cfg.prompts.path.as_deref() {
            library.load_pack(path)?;
        }
        Ok(library)
    }

    pub fn load_pack(&mut self, path: &Path) -> Result<(), PromptError> {
        let raw = std::fs::read_to_string(path)?;
        self.merge_pack(&raw)?;
        info!(path = %path.display(), "prompt pack loaded");
        Ok(())
    }

    pub fn merge_pack(&mut self, raw: &str) -> Result<(), PromptError> {
        let pack: PromptPack = toml::from_str(raw)?;
        for mode in pack.modes {
            self.modes.insert(mode.id, mode);
        }
        for (lang, kinds) in pack.templates {
            let language = Language::from_tag(&lang);
            for (kind, template) in kinds {
                let kind = TemplateKind::parse(&kind).ok_or(PromptError::UnknownKind(kind))?;
                self.overrides.insert((kind, language), template);
            }
        }
        Ok(())
    }

    pub fn with_template(mut self, kind: TemplateKind, language: Language, template: &str) -> Self {
        self.overrides.insert((kind, language), template.to_string());
        self
    }
}

impl PromptSource for PromptLibrary {
    fn mode(&self, id: u64) -> Option<ChatMode> {
        self.modes.get(&id).cloned()
    }

    fn template(&self, kind: TemplateKind, language: Language) -> String {
        self.overrides
            .get(&(kind, language))
            .cloned()
            .unwrap_or_else(|| builtin(kind, language).to_string())
    }
}

/// 内置模式 1
pub fn default_mode(models: &str, temperature: f32) -> ChatMode {
    ChatMode {
        id: 1,
        name: "默认".to_string(),
        chat_template: DEFAULT_CHAT_RULES.to_string(),
        models: models.to_string(),
        temperature,
        memory_days: 7,
    }
}

fn builtin(kind: TemplateKind, language: Language) -> &'static str {
    match (kind, language) {
        (TemplateKind::Extraction, Language::TraditionalChinese) => EXTRACTION_ZH,
        (TemplateKind::Extraction, Language::English) => EXTRACTION_EN,
        (TemplateKind::DailySummary, Language::TraditionalChinese) => SUMMARY_ZH,
        (TemplateKind::DailySummary, Language::English) => SUMMARY_EN,
        (TemplateKind::DailyDiary, _) => DIARY,
        (TemplateKind::Score, _) => SCORE,
        (TemplateKind::InnerThought, Language::TraditionalChinese) => INNER_THOUGHT_ZH,
        (TemplateKind::InnerThought, Language::English) => INNER_THOUGHT_EN,
    }
}

const DEFAULT_CHAT_RULES: &str = "你是「{{ role_name }}」，請完全以角色身份與用戶對話。
* 保持角色設定與說話風格，不要提及自己是AI
* 回覆簡潔自然，動作與神態寫在（）內
* 如果不確定用戶的姓名和性別，不要臆測
";

const EXTRACTION_ZH: &str = "## 目標
請分析 `user` 和 `assistant` 之間的對話，萃取「個人資料」（user_memory）與「重要事件」（medium_memory）。

## 個人資料子分類（每類只保留最重要或最新的一筆）
- nickname_of_user：assistant 對 user 的唯一稱呼
- user_likes / user_dislikes：user 喜歡 / 不喜歡的事物
- location：目前事件發生地點
- other：user 的背景、家庭關係，以及 user 與 assistant 的關係
不可萃取外貌描述。

## 重要事件（子分類 event）
只保留核心結果：關係的重大轉變、承諾、即將發生的計劃、紀念日。同主題合併為一條；純問答不算事件。

## 輸出格式
只輸出 JSON，以 `{` 開始、`}` 結束：
{\"memories\": [{\"content\": \"\", \"category\": \"user_memory|medium_memory\", \"sub_category\": \"nickname_of_user|user_likes|user_dislikes|location|other|event\"}]}

今天日期為 {{ today }}。僅使用繁體中文。

## 對話內容
{{ conversation }}";

const EXTRACTION_EN: &str = "## Goal
Analyse the conversation between `user` and `assistant` and extract two kinds of information: user profile facts (user_memory) and important events (medium_memory).

## Profile sub-categories (keep only the most important or latest entry of each)
- nickname_of_user: the single name the assistant uses for the user
- user_likes / user_dislikes: things the user likes / dislikes
- location: where the current scene takes place
- other: the user's background, family, and the relationship between user and assistant
Never extract physical appearance.

## Important events (sub-category event)
Keep only core outcomes: major relationship changes, promises, upcoming plans, anniversaries. Merge events on the same topic; plain Q&A is not an event.

## Output
Output JSON only, starting with `{` and ending with `}`:
{\"memories\": [{\"content\": \"\", \"category\": \"user_memory|medium_memory\", \"sub_category\": \"nickname_of_user|user_likes|user_dislikes|location|other|event\"}]}

Today is {{ today }}.

## Conversation
{{ conversation }}";

const SUMMARY_ZH: &str = "## 目標
請分析昨日（{{ date }}）的所有記憶內容，總結成一段 200 字以內的回顧。
- 保留最重要的用戶資料更新、事件發展與情感變化，忽略重複細節
- 以角色的第一人稱回憶，保持時間順序

## 輸出格式
只輸出 JSON：
{\"memories\": [{\"content\": \"[總結內容]\", \"category\": \"medium_memory\", \"sub_category\": \"daily_summary\"}]}

## 昨日記憶內容
{{ memories }}";

const SUMMARY_EN: &str = "## Goal
Summarise all memories from yesterday ({{ date }}) into one recap of at most 200 words.
- Keep the most important profile updates, event developments and emotional changes; skip repeated details
- Write as the character's first-person recollection, in chronological order

## Output
Output JSON only:
{\"memories\": [{\"content\": \"[summary]\", \"category\": \"medium_memory\", \"sub_category\": \"daily_summary\"}]}

## Yesterday's memories
{{ memories }}";

const DIARY: &str = "Your task is to polish the memories between `user` and `assistant` into a diary entry:
<memory>
{{ memories }}
</memory>

# Character background
`user` nickname: `{{ user_name }}`, gender: '{{ user_gender }}'
`assistant` nickname: `{{ role_name }}`, gender: '{{ role_gender }}'

Output rules:
1. Write the diary as {{ role_name }}.
2. Keep it sweet and human.
3. No title, no date.
4. Output language: `{{ lang }}`.";

const SCORE: &str = "<instructions>
You will read a snippet of a chat and score it against a goal.
Goal: gain favor and increase intimacy.
Scoring scale:
-2: completely irrelevant or contrary to the goal
-1: barely related
0: neutral
1: related to the goal
2: largely meets the goal
3: fully meets the goal and exceeds expectations (only when certain)
Reply with JSON only, for example {\"score\": 1, \"reason\": \"<reason>\"}.
</instructions>
<input>
user: {{ question }}
assistant: {{ answer }}
</input>";

const INNER_THOUGHT_ZH: &str = "你扮演一位心理學專家，根據 Assistant 的背景資訊與對話內容，判斷是否需要生成角色的內心想法。
* 只有當用戶詢問角色的情感問題，且角色的回覆可能與內心完全相反時，才返回角色的內心想法（繁體中文，2-3 句），否則返回 NULL
* 不要臆測用戶的姓名和性別，不要做任何解釋

## 背景資訊
{{ background }}

## 對話資訊
<User> {{ question }} </User>
<Assistant> {{ answer }} </Assistant>

## Assistant 此刻的內心想法是：";

const INNER_THOUGHT_EN: &str = "You are a psychology expert. Based on the assistant's background and the conversation, decide whether the character has a hidden inner thought.
* Only when the user asks about the character's feelings and the reply may be the opposite of what the character truly feels, return the inner thought (2-3 sentences); otherwise return NULL
* Do not guess the user's name or gender, and give no explanation

## Background
{{ background }}

## Conversation
<User> {{ question }} </User>
<Assistant> {{ answer }} </Assistant>

## The assistant's inner thought right now:";
