//! 领域记录：角色、用户、人设、聊天模式、对话轮次、关系聚合、事件、内心想法

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type RoleId = u64;
pub type TurnId = u64;
pub type MemoryId = u64;
pub type EventId = u64;
pub type ThoughtId = u64;

/// 角色生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleStatus {
    #[default]
    Private,
    Draft,
    Published,
    UnderReview,
}

impl RoleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleStatus::Private => "private",
            RoleStatus::Draft => "draft",
            RoleStatus::Published => "published",
            RoleStatus::UnderReview => "under_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(RoleStatus::Private),
            "draft" => Some(RoleStatus::Draft),
            "published" => Some(RoleStatus::Published),
            "under_review" => Some(RoleStatus::UnderReview),
            _ => None,
        }
    }
}

/// 提示词语言
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "zh-Hant")]
    TraditionalChinese,
    #[serde(rename = "en")]
    English,
}

impl Language {
    pub fn tag(self) -> &'static str {
        match self {
            Language::TraditionalChinese => "zh-Hant",
            Language::English => "en",
        }
    }

    /// 宽松解析：`en*` 视为英文，其余一律繁体中文
    pub fn from_tag(tag: &str) -> Self {
        if tag.trim().to_ascii_lowercase().starts_with("en") {
            Language::English
        } else {
            Language::TraditionalChinese
        }
    }
}

/// 角色（只做软删除，这里不提供删除）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Role {
    pub id: RoleId,
    pub owner_id: UserId,
    pub name: String,
    pub age: Option<u32>,
    pub gender: String,
    pub occupation: String,
    pub description: String,
    /// 性格与行为备注
    pub character: String,
    /// 开场白；没有历史对话时作为唯一一条 assistant 消息
    pub greeting: String,
    /// 每条回复末尾附加的状态栏格式
    pub status_line: String,
    pub status: RoleStatus,
    pub language: Language,
    /// 累计对话轮数（冗余计数）
    pub chat_count: u64,
    /// 聊过的用户数（冗余计数）
    pub user_count: u64,
}

impl Role {
    /// 拥有者随时可聊；其他用户只能与已发布角色聊天
    pub fn is_chattable_by(&self, user_id: UserId) -> bool {
        self.owner_id == user_id || self.status == RoleStatus::Published
    }
}

/// 用户资料（人设缺失时的回退来源）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub id: UserId,
    pub nickname: String,
    pub gender: String,
    pub description: String,
}

/// 用户对某个角色设定的自我人设，每个 (user, role) 最多一条
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPresumption {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub name: String,
    pub gender: String,
    pub occupation: String,
    pub description: String,
    pub likes: String,
    pub dislikes: String,
    pub other: String,
}

/// 聊天模式：规则模板 + 模型链 + 温度 + 历史记忆天数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMode {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub chat_template: String,
    pub models: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_memory_days")]
    pub memory_days: usize,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_memory_days() -> usize {
    7
}

/// 记录状态：对话、记忆、内心想法共用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    #[default]
    Active,
    Retracted,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Active => "active",
            RecordStatus::Retracted => "retracted",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == "retracted" {
            RecordStatus::Retracted
        } else {
            RecordStatus::Active
        }
    }
}

/// 一轮对话。重新生成时原地更新，id 不变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: TurnId,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub question: String,
    pub answer: String,
    /// 取值范围 [-2, 3]
    pub score: i64,
    pub score_reason: String,
    pub is_regenerated: bool,
    pub is_read: bool,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn belongs_to(&self, user_id: UserId, role_id: RoleId) -> bool {
        self.user_id == user_id && self.role_id == role_id
    }
}

/// (user, role) 的好感度与连续聊天天数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipAggregate {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub favorability: i64,
    pub continuous_days: u32,
    pub last_turn_at: DateTime<Utc>,
}

/// 角色背景事件（作者或玩家编写）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    pub id: EventId,
    pub role_id: RoleId,
    pub author_id: UserId,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 待写入的事件
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub role_id: RoleId,
    pub author_id: UserId,
    pub title: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// 角色在某轮回复背后的内心想法
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InnerThought {
    pub id: ThoughtId,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub turn_id: TurnId,
    pub content: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

/// 分页结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.per_page == 0 {
            0
        } else {
            self.total.div_ceil(self.per_page)
        }
    }
}

/// 页码从 1 开始，换算成偏移量
pub fn page_offset(page: u64, per_page: u64) -> u64 {
    page.max(1).saturating_sub(1).saturating_mul(per_page)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_tags() {
        assert_eq!(Language::from_tag("en-US"), Language::English);
        assert_eq!(Language::from_tag("zh-Hant"), Language::TraditionalChinese);
        assert_eq!(Language::from_tag(""), Language::TraditionalChinese);
        let json = serde_json::to_string(&Language::English).unwrap();
        assert_eq!(json, "\"en\"");
    }

    #[test]
    fn test_role_access() {
        let role = Role {
            id: 1,
            owner_id: 10,
            ..Default::default()
        };
        assert!(role.is_chattable_by(10));
        assert!(!role.is_chattable_by(11));
        let published = Role {
            status: RoleStatus::Published,
            ..role
        };
        assert!(published.is_chattable_by(11));
    }

    #[test]
    fn test_paging_math() {
        assert_eq!(page_offset(1, 20), 0);
        assert_eq!(page_offset(0, 20), 0);
        assert_eq!(page_offset(3, 20), 40);
        let page: Page<u8> = Page {
            items: vec![],
            total: 41,
            page: 1,
            per_page: 20,
        };
        assert_eq!(page.total_pages(), 3);
    }
}
