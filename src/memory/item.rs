//! 记忆条目与查询条件
//!
//! 大类由子类推导，不单独存储，因此「用户资料 + daily_summary」这种组合无法构造。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{DayRange, MemoryId, RecordStatus, RoleId, TurnId, UserId};

/// 记忆大类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    #[serde(alias = "user_memory")]
    UserFact,
    #[serde(alias = "medium_memory")]
    Event,
}

impl MemoryCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryCategory::UserFact => "user_fact",
            MemoryCategory::Event => "event",
        }
    }
}

/// 记忆子类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubCategory {
    NicknameOfUser,
    UserLikes,
    UserDislikes,
    Location,
    Other,
    #[serde(alias = "memory")]
    Event,
    DailySummary,
    DailyDiary,
}

impl SubCategory {
    /// 用户资料类子类
    pub const USER_FACTS: [SubCategory; 5] = [
        SubCategory::NicknameOfUser,
        SubCategory::UserLikes,
        SubCategory::UserDislikes,
        SubCategory::Location,
        SubCategory::Other,
    ];

    /// 进入「今日记忆」的子类：用户资料 + 普通事件
    pub const TODAY_BLOCK: [SubCategory; 6] = [
        SubCategory::NicknameOfUser,
        SubCategory::UserLikes,
        SubCategory::UserDislikes,
        SubCategory::Location,
        SubCategory::Other,
        SubCategory::Event,
    ];

    pub fn category(self) -> MemoryCategory {
        match self {
            SubCategory::NicknameOfUser
            | SubCategory::UserLikes
            | SubCategory::UserDislikes
            | SubCategory::Location
            | SubCategory::Other => MemoryCategory::UserFact,
            SubCategory::Event | SubCategory::DailySummary | SubCategory::DailyDiary => {
                MemoryCategory::Event
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubCategory::NicknameOfUser => "nickname_of_user",
            SubCategory::UserLikes => "user_likes",
            SubCategory::UserDislikes => "user_dislikes",
            SubCategory::Location => "location",
            SubCategory::Other => "other",
            SubCategory::Event => "event",
            SubCategory::DailySummary => "daily_summary",
            SubCategory::DailyDiary => "daily_diary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "nickname_of_user" => Some(SubCategory::NicknameOfUser),
            "user_likes" => Some(SubCategory::UserLikes),
            "user_dislikes" => Some(SubCategory::UserDislikes),
            "location" => Some(SubCategory::Location),
            "other" => Some(SubCategory::Other),
            "event" | "memory" => Some(SubCategory::Event),
            "daily_summary" => Some(SubCategory::DailySummary),
            "daily_diary" => Some(SubCategory::DailyDiary),
            _ => None,
        }
    }

    /// 每日总结/日记只由总结任务写入，对话提取不能产生
    pub fn is_extractable(self) -> bool {
        !matches!(self, SubCategory::DailySummary | SubCategory::DailyDiary)
    }
}

/// 一条记忆
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: MemoryId,
    pub user_id: UserId,
    pub role_id: RoleId,
    pub content: String,
    pub sub_category: SubCategory,
    pub status: RecordStatus,
    /// 产生这批记忆的对话轮次；每日总结/日记为 None
    pub triggering_turn_id: Option<TurnId>,
    pub created_at: DateTime<Utc>,
}

impl MemoryItem {
    pub fn category(&self) -> MemoryCategory {
        self.sub_category.category()
    }
}

/// 待写入的记忆
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMemory {
    pub content: String,
    pub sub_category: SubCategory,
}

impl NewMemory {
    pub fn new(content: impl Into<String>, sub_category: SubCategory) -> Self {
        Self {
            content: content.into(),
            sub_category,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    OldestFirst,
    NewestFirst,
}

/// 记忆查询条件（默认只查 active）
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryQuery {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub sub_categories: Option<Vec<SubCategory>>,
    pub created: Option<DayRange>,
    pub status: Option<RecordStatus>,
    pub triggering_turn_id: Option<TurnId>,
    pub order: Order,
    pub limit: Option<u64>,
    pub offset: u64,
}

impl MemoryQuery {
    pub fn pair(user_id: UserId, role_id: RoleId) -> Self {
        Self {
            user_id,
            role_id,
            sub_categories: None,
            created: None,
            status: Some(RecordStatus::Active),
            triggering_turn_id: None,
            order: Order::OldestFirst,
            limit: None,
            offset: 0,
        }
    }

    pub fn kinds(mut self, kinds: &[SubCategory]) -> Self {
        self.sub_categories = Some(kinds.to_vec());
        self
    }

    pub fn within(mut self, range: DayRange) -> Self {
        self.created = Some(range);
        self
    }

    pub fn triggered_by(mut self, turn_id: TurnId) -> Self {
        self.triggering_turn_id = Some(turn_id);
        self
    }

    pub fn any_status(mut self) -> Self {
        self.status = None;
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.order = Order::NewestFirst;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// 内存表过滤用（不含 order / limit / offset）
    pub fn matches(&self, item: &MemoryItem) -> bool {
        item.user_id == self.user_id
            && item.role_id == self.role_id
            && self.status.map_or(true, |s| item.status == s)
            && self
                .sub_categories
                .as_ref()
                .map_or(true, |kinds| kinds.contains(&item.sub_category))
            && self.created.map_or(true, |r| r.contains(item.created_at))
            && self
                .triggering_turn_id
                .map_or(true, |t| item.triggering_turn_id == Some(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_is_derived() {
        assert_eq!(SubCategory::UserLikes.category(), MemoryCategory::UserFact);
        assert_eq!(SubCategory::Event.category(), MemoryCategory::Event);
        assert_eq!(SubCategory::DailyDiary.category(), MemoryCategory::Event);
    }

    #[test]
    fn test_legacy_names_accepted() {
        assert_eq!(SubCategory::parse("memory"), Some(SubCategory::Event));
        let sub: SubCategory = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(sub, SubCategory::Event);
        let cat: MemoryCategory = serde_json::from_str("\"user_memory\"").unwrap();
        assert_eq!(cat, MemoryCategory::UserFact);
        assert_eq!(SubCategory::parse("hobby"), None);
    }

    #[test]
    fn test_daily_kinds_not_extractable() {
        assert!(SubCategory::Location.is_extractable());
        assert!(!SubCategory::DailySummary.is_extractable());
    }
}
