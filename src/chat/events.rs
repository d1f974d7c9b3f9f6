//! 角色背景事件
//!
//! 角色拥有者在每个角色下最多 8 条，其他玩家各自最多 5 条；两种上限互不影响。

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::core::{
    ChatError, Clock, EventEntry, NewEvent, RoleId, UserId, ValidationError,
};
use crate::store::{EventRepository, RoleRepository};

pub const AUTHOR_EVENT_LIMIT: u64 = 8;
pub const CONTRIBUTOR_EVENT_LIMIT: u64 = 5;
pub const MAX_TITLE_CHARS: usize = 20;
pub const MAX_CONTENT_CHARS: usize = 400;

/// 事件列表：作者的事件 + 当前查看者自己添加的事件
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventListing {
    pub author: Vec<EventEntry>,
    pub mine: Vec<EventEntry>,
}

pub struct EventLog {
    events: Arc<dyn EventRepository>,
    roles: Arc<dyn RoleRepository>,
    clock: Arc<dyn Clock>,
}

fn check_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { field });
    }
    if value.chars().count() > max {
        return Err(ValidationError::FieldTooLong { field, max });
    }
    Ok(())
}

impl EventLog {
    pub fn new(
        events: Arc<dyn EventRepository>,
        roles: Arc<dyn RoleRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            events,
            roles,
            clock,
        }
    }

    /// 添加事件；上限检查与插入在存储层原子完成
    pub async fn add(
        &self,
        author_id: UserId,
        role_id: RoleId,
        title: &str,
        content: &str,
    ) -> Result<EventEntry, ChatError> {
        check_text("事件标题", title, MAX_TITLE_CHARS)?;
        check_text("事件内容", content, MAX_CONTENT_CHARS)?;
        let role = self
            .roles
            .role(role_id)
            .await?
            .ok_or(ValidationError::RoleNotFound(role_id))?;

        let is_owner = role.owner_id == author_id;
        let limit = if is_owner {
            AUTHOR_EVENT_LIMIT
        } else {
            CONTRIBUTOR_EVENT_LIMIT
        };
        let event = NewEvent {
            role_id,
            author_id,
            title: title.trim().to_string(),
            content: content.trim().to_string(),
            at: self.clock.now(),
        };
        match self.events.insert_event(event, limit).await? {
            Some(entry) => {
                info!(role_id, author_id, event_id = entry.id, "role event added");
                Ok(entry)
            }
            None if is_owner => Err(ValidationError::AuthorEventLimit(limit).into()),
            None => Err(ValidationError::ContributorEventLimit(limit).into()),
        }
    }

    pub async fn list(&self, role_id: RoleId, viewer: UserId) -> Result<EventListing, ChatError> {
        let role = self
            .roles
            .role(role_id)
            .await?
            .ok_or(ValidationError::RoleNotFound(role_id))?;
        let author = self.events.list_events(role_id, role.owner_id).await?;
        let mine = if viewer == role.owner_id {
            Vec::new()
        } else {
            self.events.list_events(role_id, viewer).await?
        };
        Ok(EventListing { author, mine })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ManualClock, Role};
    use crate::store::InMemoryStore;
    use chrono::Utc;

    async fn setup() -> (EventLog, RoleId) {
        let store = Arc::new(InMemoryStore::new());
        let role_id = store
            .save_role(Role {
                owner_id: 1,
                name: "r".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now(), 8));
        (EventLog::new(store.clone(), store, clock), role_id)
    }

    #[tokio::test]
    async fn test_author_cap_is_eight() {
        let (log, role_id) = setup().await;
        for i in 0..8 {
            log.add(1, role_id, &format!("t{i}"), "c").await.unwrap();
        }
        let err = log.add(1, role_id, "t9", "c").await.unwrap_err();
        assert_eq!(err.to_string(), "作者事件最多8个");
    }

    #[tokio::test]
    async fn test_contributor_cap_independent_of_owner() {
        let (log, role_id) = setup().await;
        for _ in 0..5 {
            log.add(2, role_id, "t", "c").await.unwrap();
        }
        let err = log.add(2, role_id, "t", "c").await.unwrap_err();
        assert_eq!(err.to_string(), "玩家上线最多5个");

        // 其他玩家和作者不受影响
        log.add(3, role_id, "t", "c").await.unwrap();
        for _ in 0..8 {
            log.add(1, role_id, "t", "c").await.unwrap();
        }

        let listing = log.list(role_id, 2).await.unwrap();
        assert_eq!(listing.author.len(), 8);
        assert_eq!(listing.mine.len(), 5);
        assert!(log.list(role_id, 1).await.unwrap().mine.is_empty());
    }

    #[tokio::test]
    async fn test_cap_holds_under_concurrent_inserts() {
        let (log, role_id) = setup().await;
        let log = Arc::new(log);
        let attempts = (0..12).map(|i| {
            let log = Arc::clone(&log);
            async move {
                let title = format!("t{i}");
                log.add(2, role_id, &title, "c").await
            }
        });
        let results = futures_util::future::join_all(attempts).await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
    }

    #[tokio::test]
    async fn test_field_limits() {
        let (log, role_id) = setup().await;
        let long_title = "字".repeat(21);
        let err = log.add(1, role_id, &long_title, "c").await.unwrap_err();
        assert_eq!(err.to_string(), "事件标题最多20个字符");
        assert!(log.add(1, role_id, "t", &"x".repeat(401)).await.is_err());
        assert!(log.add(1, 999, "t", "c").await.is_err());
    }
}
