//! 存储层：仓储 trait、内存实现与 SQLite 实现
//!
//! 上层只依赖 trait；[`Repositories`] 把同一个后端按关注点拆成多个句柄注入。
//! 对话轮次写入与关系聚合更新在 [`ChatRepository::record_turn`] 内作为一个原子单元完成。

pub mod memory_store;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};

use crate::config::StorageSection;
use crate::core::{
    ChatTurn, EventEntry, InnerThought, MemoryId, NewEvent, RelationshipAggregate, Role, RoleId,
    StoreError, ThoughtId, TurnId, UserId, UserPresumption, UserProfile,
};
use crate::memory::{MemoryItem, MemoryQuery, NewMemory};

pub use memory_store::InMemoryStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteStore;

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError>;

    /// id 为 0 时插入并分配 id，否则按 id 覆盖
    async fn save_role(&self, role: Role) -> Result<RoleId, StoreError>;

    async fn user_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StoreError>;

    async fn save_user_profile(&self, profile: UserProfile) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PresumptionRepository: Send + Sync {
    async fn presumption(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<Option<UserPresumption>, StoreError>;

    async fn upsert_presumption(&self, presumption: UserPresumption) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn count_events(&self, role_id: RoleId, author_id: UserId) -> Result<u64, StoreError>;

    /// 计数与插入在同一原子单元内；作者在该角色下已有 `limit` 条时返回 None
    async fn insert_event(&self, event: NewEvent, limit: u64)
        -> Result<Option<EventEntry>, StoreError>;

    /// 某作者在某角色下的事件，按 id 升序
    async fn list_events(&self, role_id: RoleId, author_id: UserId)
        -> Result<Vec<EventEntry>, StoreError>;
}

#[async_trait]
pub trait MemoryRepository: Send + Sync {
    /// 一批记忆要么全部写入，要么全部不写
    async fn insert_memories(
        &self,
        user_id: UserId,
        role_id: RoleId,
        items: &[NewMemory],
        triggering_turn_id: Option<TurnId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<MemoryId>, StoreError>;

    /// 对话提取的整批写入：该轮已有记忆，或该轮已不是 `trigger` 所示的内容（重新生成、撤回）时
    /// 不写入并返回 None；检查与写入原子完成
    async fn insert_turn_memories(
        &self,
        user_id: UserId,
        role_id: RoleId,
        items: &[NewMemory],
        trigger: &ChatTurn,
        at: DateTime<Utc>,
    ) -> Result<Option<Vec<MemoryId>>, StoreError>;

    async fn find_memories(&self, query: &MemoryQuery) -> Result<Vec<MemoryItem>, StoreError>;

    /// 忽略 limit / offset
    async fn count_memories(&self, query: &MemoryQuery) -> Result<u64, StoreError>;

    /// 删除由该轮对话产生的记忆，返回删除条数
    async fn purge_turn_memories(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError>;

    /// 仅限记忆所属用户；返回是否命中
    async fn update_memory_content(
        &self,
        user_id: UserId,
        id: MemoryId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn delete_memory(&self, user_id: UserId, id: MemoryId) -> Result<bool, StoreError>;
}

/// 待记录的一轮对话
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub question: String,
    pub answer: String,
    pub score: i64,
    pub score_reason: String,
    /// Some 时原地更新该轮，否则新增
    pub regenerate: Option<TurnId>,
    pub at: DateTime<Utc>,
    /// 连续天数按该偏移划分自然日
    pub offset: FixedOffset,
}

#[derive(Debug, Clone)]
pub struct RecordedTurn {
    pub turn: ChatTurn,
    pub relationship: RelationshipAggregate,
    /// 本次写入是否新建了关系行（即该用户第一次与角色聊天）
    pub first_contact: bool,
}

#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn turn(&self, id: TurnId) -> Result<Option<ChatTurn>, StoreError>;

    /// 最近 limit 条 active 轮次（按时间正序）；up_to 给定时只取 id 不大于它的轮次
    async fn recent_turns(
        &self,
        user_id: UserId,
        role_id: RoleId,
        limit: u64,
        up_to: Option<TurnId>,
    ) -> Result<Vec<ChatTurn>, StoreError>;

    async fn count_turns(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError>;

    /// 该轮在 active 轮次中的序号（从 1 开始，即 id 不大于它的 active 轮数）
    async fn turn_position(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError>;

    /// 分页（最新在前）
    async fn page_turns(
        &self,
        user_id: UserId,
        role_id: RoleId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ChatTurn>, StoreError>;

    /// 写入/更新轮次 + 更新关系聚合 + 角色计数，原子完成
    async fn record_turn(&self, record: TurnRecord) -> Result<RecordedTurn, StoreError>;

    async fn relationship(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<Option<RelationshipAggregate>, StoreError>;

    async fn mark_read(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError>;

    /// 撤回该 (user, role) 的全部轮次、记忆与内心想法，并删除关系行；返回撤回的轮次数
    async fn clear_pair(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait ThoughtRepository: Send + Sync {
    async fn insert_thought(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<ThoughtId, StoreError>;

    async fn purge_turn_thoughts(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError>;

    /// 最新在前
    async fn list_thoughts(
        &self,
        user_id: UserId,
        role_id: RoleId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<InnerThought>, StoreError>;

    async fn count_thoughts(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError>;
}

/// 同一后端的各仓储句柄
#[derive(Clone)]
pub struct Repositories {
    pub roles: Arc<dyn RoleRepository>,
    pub presumptions: Arc<dyn PresumptionRepository>,
    pub events: Arc<dyn EventRepository>,
    pub memories: Arc<dyn MemoryRepository>,
    pub chats: Arc<dyn ChatRepository>,
    pub thoughts: Arc<dyn ThoughtRepository>,
}

impl Repositories {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: RoleRepository
            + PresumptionRepository
            + EventRepository
            + MemoryRepository
            + ChatRepository
            + ThoughtRepository
            + 'static,
    {
        Self {
            roles: store.clone(),
            presumptions: store.clone(),
            events: store.clone(),
            memories: store.clone(),
            chats: store.clone(),
            thoughts: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::from_store(Arc::new(InMemoryStore::new()))
    }
}

/// 根据配置创建存储：sqlite 初始化失败时回退到内存存储
pub async fn create_store(settings: &StorageSection) -> Repositories {
    match settings.backend.as_str() {
        #[cfg(feature = "async-sqlite")]
        "sqlite" => match SqliteStore::open(&settings.sqlite_path).await {
            Ok(store) => {
                tracing::info!(path = %settings.sqlite_path.display(), "Using SQLite store");
                return Repositories::from_store(Arc::new(store));
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        },
        #[cfg(not(feature = "async-sqlite"))]
        "sqlite" => {
            tracing::warn!("SQLite backend requested but the async-sqlite feature is disabled");
        }
        "memory" => {}
        other => {
            tracing::warn!("Unknown storage backend '{}', using memory", other);
        }
    }
    tracing::info!("Using in-memory store");
    Repositories::in_memory()
}
