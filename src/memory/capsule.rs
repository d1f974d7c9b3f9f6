//! 记忆胶囊：用户查看、编辑、删除自己与某角色之间的记忆

use std::sync::Arc;

use crate::core::{
    types::page_offset, ChatError, Clock, MemoryId, Page, RoleId, UserId, ValidationError,
};
use crate::memory::item::{MemoryItem, MemoryQuery, SubCategory};
use crate::store::MemoryRepository;

/// 单条记忆内容上限
pub const MAX_MEMORY_CHARS: usize = 400;

pub struct MemoryBook {
    memories: Arc<dyn MemoryRepository>,
    clock: Arc<dyn Clock>,
}

impl MemoryBook {
    pub fn new(memories: Arc<dyn MemoryRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { memories, clock }
    }

    /// 按子类分页，最新在前
    pub async fn list(
        &self,
        user_id: UserId,
        role_id: RoleId,
        sub_category: SubCategory,
        page: u64,
        per_page: u64,
    ) -> Result<Page<MemoryItem>, ChatError> {
        let query = MemoryQuery::pair(user_id, role_id).kinds(&[sub_category]);
        self.page(query.newest_first(), page, per_page).await
    }

    /// 日记按时间正序
    pub async fn diaries(
        &self,
        user_id: UserId,
        role_id: RoleId,
        page: u64,
        per_page: u64,
    ) -> Result<Page<MemoryItem>, ChatError> {
        let query = MemoryQuery::pair(user_id, role_id).kinds(&[SubCategory::DailyDiary]);
        self.page(query, page, per_page).await
    }

    async fn page(
        &self,
        query: MemoryQuery,
        page: u64,
        per_page: u64,
    ) -> Result<Page<MemoryItem>, ChatError> {
        let total = self.memories.count_memories(&query).await?;
        let items = self
            .memories
            .find_memories(&query.offset(page_offset(page, per_page)).limit(per_page))
            .await?;
        Ok(Page {
            items,
            total,
            page: page.max(1),
            per_page,
        })
    }

    pub async fn edit(
        &self,
        user_id: UserId,
        id: MemoryId,
        content: &str,
    ) -> Result<(), ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::MissingField { field: "记忆内容" }.into());
        }
        if content.chars().count() > MAX_MEMORY_CHARS {
            return Err(ValidationError::FieldTooLong {
                field: "记忆内容",
                max: MAX_MEMORY_CHARS,
            }
            .into());
        }
        let updated = self
            .memories
            .update_memory_content(user_id, id, content, self.clock.now())
            .await?;
        if !updated {
            return Err(ValidationError::MemoryNotFound(id).into());
        }
        Ok(())
    }

    pub async fn delete(&self, user_id: UserId, id: MemoryId) -> Result<(), ChatError> {
        if !self.memories.delete_memory(user_id, id).await? {
            return Err(ValidationError::MemoryNotFound(id).into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ManualClock;
    use crate::memory::NewMemory;
    use crate::store::InMemoryStore;
    use chrono::{Duration, NaiveDate};

    async fn book() -> (MemoryBook, Arc<InMemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::at_local(
            NaiveDate::from_ymd_opt(2025, 4, 1).unwrap(),
            9,
            8,
        ));
        (MemoryBook::new(store.clone(), clock.clone()), store, clock)
    }

    #[tokio::test]
    async fn test_diaries_oldest_first_and_paged() {
        let (book, store, clock) = book().await;
        for day in 0..3 {
            store
                .insert_memories(
                    1,
                    2,
                    &[NewMemory::new(format!("diary {day}"), SubCategory::DailyDiary)],
                    None,
                    clock.now() + Duration::days(day),
                )
                .await
                .unwrap();
        }
        let page = book.diaries(1, 2, 1, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.total_pages(), 2);
        assert_eq!(page.items[0].content, "diary 0");

        let newest = book.list(1, 2, SubCategory::DailyDiary, 1, 1).await.unwrap();
        assert_eq!(newest.items[0].content, "diary 2");
    }

    #[tokio::test]
    async fn test_edit_and_delete_are_owner_scoped() {
        let (book, store, clock) = book().await;
        let ids = store
            .insert_memories(1, 2, &[NewMemory::new("cats", SubCategory::UserLikes)], None, clock.now())
            .await
            .unwrap();

        let err = book.edit(99, ids[0], "dogs").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(ValidationError::MemoryNotFound(_))));
        assert!(book.edit(1, ids[0], "   ").await.is_err());

        book.edit(1, ids[0], "dogs").await.unwrap();
        let page = book.list(1, 2, SubCategory::UserLikes, 1, 10).await.unwrap();
        assert_eq!(page.items[0].content, "dogs");

        assert!(book.delete(99, ids[0]).await.is_err());
        book.delete(1, ids[0]).await.unwrap();
        assert_eq!(book.list(1, 2, SubCategory::UserLikes, 1, 10).await.unwrap().total, 0);
    }
}
