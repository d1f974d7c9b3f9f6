//! SQLite 存储（sqlx 异步）
//!
//! 时间戳以毫秒整数保存；状态以 'active' / 'retracted' 文本保存。
//! 多步写入（对话轮次 + 关系聚合 + 角色计数、记忆批量写入、清空会话）都在一个事务内完成。

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};

use crate::chat::relationship::apply_turn;
use crate::core::{
    ChatTurn, EventEntry, InnerThought, Language, MemoryId, NewEvent, RecordStatus,
    RelationshipAggregate, Role, RoleId, RoleStatus, StoreError, ThoughtId, TurnId, UserId,
    UserPresumption, UserProfile,
};
use crate::memory::{MemoryItem, MemoryQuery, NewMemory, Order, SubCategory};
use crate::store::{
    ChatRepository, EventRepository, MemoryRepository, PresumptionRepository, RecordedTurn,
    RoleRepository, ThoughtRepository, TurnRecord,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS roles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        owner_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        age INTEGER,
        gender TEXT NOT NULL DEFAULT '',
        occupation TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        character TEXT NOT NULL DEFAULT '',
        greeting TEXT NOT NULL DEFAULT '',
        status_line TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL DEFAULT 'private',
        language TEXT NOT NULL DEFAULT 'zh-Hant',
        chat_count INTEGER NOT NULL DEFAULT 0,
        user_count INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY,
        nickname TEXT NOT NULL DEFAULT '',
        gender TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS presumptions (
        user_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        gender TEXT NOT NULL DEFAULT '',
        occupation TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        likes TEXT NOT NULL DEFAULT '',
        dislikes TEXT NOT NULL DEFAULT '',
        other TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (user_id, role_id)
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        role_id INTEGER NOT NULL,
        author_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_role_author ON events(role_id, author_id)",
    "CREATE TABLE IF NOT EXISTS memories (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        sub_category TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        turn_id INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_memories_pair ON memories(user_id, role_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_memories_turn ON memories(turn_id)",
    "CREATE TABLE IF NOT EXISTS turns (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        question TEXT NOT NULL,
        answer TEXT NOT NULL,
        score INTEGER NOT NULL DEFAULT 0,
        score_reason TEXT NOT NULL DEFAULT '',
        is_regenerated INTEGER NOT NULL DEFAULT 0,
        is_read INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'active',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_turns_pair ON turns(user_id, role_id, id)",
    "CREATE TABLE IF NOT EXISTS relationships (
        user_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        favorability INTEGER NOT NULL DEFAULT 0,
        continuous_days INTEGER NOT NULL DEFAULT 0,
        last_turn_at INTEGER NOT NULL,
        PRIMARY KEY (user_id, role_id)
    )",
    "CREATE TABLE IF NOT EXISTS thoughts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL,
        role_id INTEGER NOT NULL,
        turn_id INTEGER NOT NULL,
        content TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_thoughts_pair ON thoughts(user_id, role_id, id)",
];

const TURN_COLUMNS: &str = "id, user_id, role_id, question, answer, score, score_reason, \
                            is_regenerated, is_read, status, created_at, updated_at";

fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn sql_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn get_id(row: &SqliteRow, col: &str) -> u64 {
    row.get::<i64, _>(col).max(0) as u64
}

fn row_to_role(row: &SqliteRow) -> Role {
    Role {
        id: get_id(row, "id"),
        owner_id: get_id(row, "owner_id"),
        name: row.get("name"),
        age: row
            .get::<Option<i64>, _>("age")
            .and_then(|a| u32::try_from(a).ok()),
        gender: row.get("gender"),
        occupation: row.get("occupation"),
        description: row.get("description"),
        character: row.get("character"),
        greeting: row.get("greeting"),
        status_line: row.get("status_line"),
        status: RoleStatus::parse(row.get::<String, _>("status").as_str()).unwrap_or_default(),
        language: Language::from_tag(row.get::<String, _>("language").as_str()),
        chat_count: get_id(row, "chat_count"),
        user_count: get_id(row, "user_count"),
    }
}

fn row_to_turn(row: &SqliteRow) -> ChatTurn {
    ChatTurn {
        id: get_id(row, "id"),
        user_id: get_id(row, "user_id"),
        role_id: get_id(row, "role_id"),
        question: row.get("question"),
        answer: row.get("answer"),
        score: row.get("score"),
        score_reason: row.get("score_reason"),
        is_regenerated: row.get::<i64, _>("is_regenerated") != 0,
        is_read: row.get::<i64, _>("is_read") != 0,
        status: RecordStatus::parse(row.get::<String, _>("status").as_str()),
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    }
}

fn row_to_event(row: &SqliteRow) -> EventEntry {
    EventEntry {
        id: get_id(row, "id"),
        role_id: get_id(row, "role_id"),
        author_id: get_id(row, "author_id"),
        title: row.get("title"),
        content: row.get("content"),
        created_at: from_ts(row.get("created_at")),
        updated_at: from_ts(row.get("updated_at")),
    }
}

/// 子类无法识别的行（手工改库等）直接跳过
fn row_to_memory(row: &SqliteRow) -> Option<MemoryItem> {
    let sub_category = SubCategory::parse(row.get::<String, _>("sub_category").as_str())?;
    Some(MemoryItem {
        id: get_id(row, "id"),
        user_id: get_id(row, "user_id"),
        role_id: get_id(row, "role_id"),
        content: row.get("content"),
        sub_category,
        status: RecordStatus::parse(row.get::<String, _>("status").as_str()),
        triggering_turn_id: row.get::<Option<i64>, _>("turn_id").map(|t| t.max(0) as u64),
        created_at: from_ts(row.get("created_at")),
    })
}

fn row_to_relationship(row: &SqliteRow) -> RelationshipAggregate {
    RelationshipAggregate {
        user_id: get_id(row, "user_id"),
        role_id: get_id(row, "role_id"),
        favorability: row.get("favorability"),
        continuous_days: u32::try_from(row.get::<i64, _>("continuous_days")).unwrap_or(0),
        last_turn_at: from_ts(row.get("last_turn_at")),
    }
}

fn row_to_thought(row: &SqliteRow) -> InnerThought {
    InnerThought {
        id: get_id(row, "id"),
        user_id: get_id(row, "user_id"),
        role_id: get_id(row, "role_id"),
        turn_id: get_id(row, "turn_id"),
        content: row.get("content"),
        status: RecordStatus::parse(row.get::<String, _>("status").as_str()),
        created_at: from_ts(row.get("created_at")),
    }
}

/// 把查询条件拼到 WHERE 子句（调用方已写好 `... WHERE 1 = 1`）
fn push_memory_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &MemoryQuery) {
    qb.push(" AND user_id = ").push_bind(sql_id(query.user_id));
    qb.push(" AND role_id = ").push_bind(sql_id(query.role_id));
    if let Some(status) = query.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(kinds) = &query.sub_categories {
        if kinds.is_empty() {
            qb.push(" AND 1 = 0");
        } else {
            qb.push(" AND sub_category IN (");
            let mut sep = qb.separated(", ");
            for kind in kinds {
                sep.push_bind(kind.as_str());
            }
            sep.push_unseparated(")");
        }
    }
    if let Some(range) = query.created {
        qb.push(" AND created_at >= ").push_bind(ts(range.start));
        qb.push(" AND created_at < ").push_bind(ts(range.end));
    }
    if let Some(turn_id) = query.triggering_turn_id {
        qb.push(" AND turn_id = ").push_bind(sql_id(turn_id));
    }
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（必要时创建）数据库文件
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 进程内数据库；只能有一个连接，否则每个连接各自一份库
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RoleRepository for SqliteStore {
    async fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError> {
        let row = sqlx::query("SELECT * FROM roles WHERE id = ?")
            .bind(sql_id(id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_role))
    }

    async fn save_role(&self, role: Role) -> Result<RoleId, StoreError> {
        let id = if role.id == 0 { None } else { Some(sql_id(role.id)) };
        let result = sqlx::query(
            "INSERT INTO roles (id, owner_id, name, age, gender, occupation, description, character,
                                greeting, status_line, status, language, chat_count, user_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id, name = excluded.name, age = excluded.age,
                gender = excluded.gender, occupation = excluded.occupation,
                description = excluded.description, character = excluded.character,
                greeting = excluded.greeting, status_line = excluded.status_line,
                status = excluded.status, language = excluded.language",
        )
        .bind(id)
        .bind(sql_id(role.owner_id))
        .bind(&role.name)
        .bind(role.age.map(i64::from))
        .bind(&role.gender)
        .bind(&role.occupation)
        .bind(&role.description)
        .bind(&role.character)
        .bind(&role.greeting)
        .bind(&role.status_line)
        .bind(role.status.as_str())
        .bind(role.language.tag())
        .bind(sql_id(role.chat_count))
        .bind(sql_id(role.user_count))
        .execute(&self.pool)
        .await?;
        Ok(if role.id == 0 {
            result.last_insert_rowid().max(0) as u64
        } else {
            role.id
        })
    }

    async fn user_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query("SELECT id, nickname, gender, description FROM users WHERE id = ?")
            .bind(sql_id(user_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserProfile {
            id: get_id(&r, "id"),
            nickname: r.get("nickname"),
            gender: r.get("gender"),
            description: r.get("description"),
        }))
    }

    async fn save_user_profile(&self, profile: UserProfile) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR REPLACE INTO users (id, nickname, gender, description) VALUES (?, ?, ?, ?)",
        )
        .bind(sql_id(profile.id))
        .bind(&profile.nickname)
        .bind(&profile.gender)
        .bind(&profile.description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PresumptionRepository for SqliteStore {
    async fn presumption(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<Option<UserPresumption>, StoreError> {
        let row = sqlx::query("SELECT * FROM presumptions WHERE user_id = ? AND role_id = ?")
            .bind(sql_id(user_id))
            .bind(sql_id(role_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserPresumption {
            user_id: get_id(&r, "user_id"),
            role_id: get_id(&r, "role_id"),
            name: r.get("name"),
            gender: r.get("gender"),
            occupation: r.get("occupation"),
            description: r.get("description"),
            likes: r.get("likes"),
            dislikes: r.get("dislikes"),
            other: r.get("other"),
        }))
    }

    async fn upsert_presumption(&self, p: UserPresumption) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO presumptions
                (user_id, role_id, name, gender, occupation, description, likes, dislikes, other)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, role_id) DO UPDATE SET
                name = excluded.name, gender = excluded.gender, occupation = excluded.occupation,
                description = excluded.description, likes = excluded.likes,
                dislikes = excluded.dislikes, other = excluded.other",
        )
        .bind(sql_id(p.user_id))
        .bind(sql_id(p.role_id))
        .bind(&p.name)
        .bind(&p.gender)
        .bind(&p.occupation)
        .bind(&p.description)
        .bind(&p.likes)
        .bind(&p.dislikes)
        .bind(&p.other)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EventRepository for SqliteStore {
    async fn count_events(&self, role_id: RoleId, author_id: UserId) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE role_id = ? AND author_id = ?")
                .bind(sql_id(role_id))
                .bind(sql_id(author_id))
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn insert_event(
        &self,
        event: NewEvent,
        limit: u64,
    ) -> Result<Option<EventEntry>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE role_id = ? AND author_id = ?")
                .bind(sql_id(event.role_id))
                .bind(sql_id(event.author_id))
                .fetch_one(&mut *tx)
                .await?;
        if count.max(0) as u64 >= limit {
            return Ok(None);
        }
        let result = sqlx::query(
            "INSERT INTO events (role_id, author_id, title, content, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(sql_id(event.role_id))
        .bind(sql_id(event.author_id))
        .bind(&event.title)
        .bind(&event.content)
        .bind(ts(event.at))
        .bind(ts(event.at))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Some(EventEntry {
            id: result.last_insert_rowid().max(0) as u64,
            role_id: event.role_id,
            author_id: event.author_id,
            title: event.title,
            content: event.content,
            created_at: event.at,
            updated_at: event.at,
        }))
    }

    async fn list_events(
        &self,
        role_id: RoleId,
        author_id: UserId,
    ) -> Result<Vec<EventEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE role_id = ? AND author_id = ? ORDER BY id ASC",
        )
        .bind(sql_id(role_id))
        .bind(sql_id(author_id))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_event).collect())
    }
}

#[async_trait]
impl MemoryRepository for SqliteStore {
    async fn insert_memories(
        &self,
        user_id: UserId,
        role_id: RoleId,
        items: &[NewMemory],
        triggering_turn_id: Option<TurnId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<MemoryId>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let result = sqlx::query(
                "INSERT INTO memories
                    (user_id, role_id, content, sub_category, status, turn_id, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 'active', ?, ?, ?)",
            )
            .bind(sql_id(user_id))
            .bind(sql_id(role_id))
            .bind(&item.content)
            .bind(item.sub_category.as_str())
            .bind(triggering_turn_id.map(sql_id))
            .bind(ts(at))
            .bind(ts(at))
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid().max(0) as u64);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn insert_turn_memories(
        &self,
        user_id: UserId,
        role_id: RoleId,
        items: &[NewMemory],
        trigger: &ChatTurn,
        at: DateTime<Utc>,
    ) -> Result<Option<Vec<MemoryId>>, StoreError> {
        let Some((first, rest)) = items.split_first() else {
            return Ok(Some(Vec::new()));
        };
        let mut tx = self.pool.begin().await?;
        // 检查与第一行写入在同一条语句里完成，拿到写锁后其余行随后写入
        let guarded = sqlx::query(
            "INSERT INTO memories
                (user_id, role_id, content, sub_category, status, turn_id, created_at, updated_at)
             SELECT ?, ?, ?, ?, 'active', ?, ?, ?
             WHERE EXISTS (
                 SELECT 1 FROM turns
                 WHERE id = ? AND user_id = ? AND role_id = ? AND status = 'active'
                   AND updated_at = ? AND question = ? AND answer = ?)
               AND NOT EXISTS (
                 SELECT 1 FROM memories WHERE user_id = ? AND role_id = ? AND turn_id = ?)",
        )
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .bind(&first.content)
        .bind(first.sub_category.as_str())
        .bind(sql_id(trigger.id))
        .bind(ts(at))
        .bind(ts(at))
        .bind(sql_id(trigger.id))
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .bind(ts(trigger.updated_at))
        .bind(&trigger.question)
        .bind(&trigger.answer)
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .bind(sql_id(trigger.id))
        .execute(&mut *tx)
        .await?;
        if guarded.rows_affected() == 0 {
            return Ok(None);
        }

        let mut ids = vec![guarded.last_insert_rowid().max(0) as u64];
        for item in rest {
            let result = sqlx::query(
                "INSERT INTO memories
                    (user_id, role_id, content, sub_category, status, turn_id, created_at, updated_at)
                 VALUES (?, ?, ?, ?, 'active', ?, ?, ?)",
            )
            .bind(sql_id(user_id))
            .bind(sql_id(role_id))
            .bind(&item.content)
            .bind(item.sub_category.as_str())
            .bind(sql_id(trigger.id))
            .bind(ts(at))
            .bind(ts(at))
            .execute(&mut *tx)
            .await?;
            ids.push(result.last_insert_rowid().max(0) as u64);
        }
        tx.commit().await?;
        Ok(Some(ids))
    }

    async fn find_memories(&self, query: &MemoryQuery) -> Result<Vec<MemoryItem>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM memories WHERE 1 = 1");
        push_memory_filters(&mut qb, query);
        qb.push(match query.order {
            Order::OldestFirst => " ORDER BY created_at ASC, id ASC",
            Order::NewestFirst => " ORDER BY created_at DESC, id DESC",
        });
        // SQLite 要求有 OFFSET 时必须有 LIMIT，-1 表示不限
        qb.push(" LIMIT ")
            .push_bind(query.limit.map_or(-1, sql_id));
        qb.push(" OFFSET ").push_bind(sql_id(query.offset));

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().filter_map(row_to_memory).collect())
    }

    async fn count_memories(&self, query: &MemoryQuery) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM memories WHERE 1 = 1");
        push_memory_filters(&mut qb, query);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_turn_memories(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM memories WHERE user_id = ? AND role_id = ? AND turn_id = ?")
                .bind(sql_id(user_id))
                .bind(sql_id(role_id))
                .bind(sql_id(turn_id))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn update_memory_content(
        &self,
        user_id: UserId,
        id: MemoryId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE memories SET content = ?, updated_at = ?
             WHERE id = ? AND user_id = ? AND status = 'active'",
        )
        .bind(content)
        .bind(ts(at))
        .bind(sql_id(id))
        .bind(sql_id(user_id))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_memory(&self, user_id: UserId, id: MemoryId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM memories WHERE id = ? AND user_id = ?")
            .bind(sql_id(id))
            .bind(sql_id(user_id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ChatRepository for SqliteStore {
    async fn turn(&self, id: TurnId) -> Result<Option<ChatTurn>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?"))
            .bind(sql_id(id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_turn))
    }

    async fn recent_turns(
        &self,
        user_id: UserId,
        role_id: RoleId,
        limit: u64,
        up_to: Option<TurnId>,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TURN_COLUMNS} FROM turns
             WHERE user_id = ? AND role_id = ? AND status = 'active' AND id <= ?
             ORDER BY id DESC LIMIT ?"
        ))
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .bind(up_to.map_or(i64::MAX, sql_id))
        .bind(sql_id(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().rev().map(row_to_turn).collect())
    }

    async fn count_turns(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM turns WHERE user_id = ? AND role_id = ? AND status = 'active'",
        )
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn turn_position(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM turns
             WHERE user_id = ? AND role_id = ? AND status = 'active' AND id <= ?",
        )
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .bind(sql_id(turn_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn page_turns(
        &self,
        user_id: UserId,
        role_id: RoleId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TURN_COLUMNS} FROM turns
             WHERE user_id = ? AND role_id = ? AND status = 'active'
             ORDER BY id DESC LIMIT ? OFFSET ?"
        ))
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .bind(sql_id(limit))
        .bind(sql_id(offset))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_turn).collect())
    }

    async fn record_turn(&self, record: TurnRecord) -> Result<RecordedTurn, StoreError> {
        let mut tx = self.pool.begin().await?;

        let (turn_id, score_delta) = match record.regenerate {
            Some(id) => {
                let old_score: Option<i64> = sqlx::query_scalar(
                    "SELECT score FROM turns
                     WHERE id = ? AND user_id = ? AND role_id = ? AND status = 'active'",
                )
                .bind(sql_id(id))
                .bind(sql_id(record.user_id))
                .bind(sql_id(record.role_id))
                .fetch_optional(&mut *tx)
                .await?;
                let old_score = old_score.ok_or_else(|| StoreError::NotFound(format!("turn {id}")))?;

                sqlx::query(
                    "UPDATE turns SET question = ?, answer = ?, score = ?, score_reason = ?,
                        is_regenerated = 1, is_read = 0, updated_at = ?
                     WHERE id = ?",
                )
                .bind(&record.question)
                .bind(&record.answer)
                .bind(record.score)
                .bind(&record.score_reason)
                .bind(ts(record.at))
                .bind(sql_id(id))
                .execute(&mut *tx)
                .await?;
                (id, record.score - old_score)
            }
            None => {
                let result = sqlx::query(
                    "INSERT INTO turns (user_id, role_id, question, answer, score, score_reason,
                        is_regenerated, is_read, status, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, 0, 0, 'active', ?, ?)",
                )
                .bind(sql_id(record.user_id))
                .bind(sql_id(record.role_id))
                .bind(&record.question)
                .bind(&record.answer)
                .bind(record.score)
                .bind(&record.score_reason)
                .bind(ts(record.at))
                .bind(ts(record.at))
                .execute(&mut *tx)
                .await?;
                (result.last_insert_rowid().max(0) as u64, record.score)
            }
        };

        let previous = sqlx::query("SELECT * FROM relationships WHERE user_id = ? AND role_id = ?")
            .bind(sql_id(record.user_id))
            .bind(sql_id(record.role_id))
            .fetch_optional(&mut *tx)
            .await?
            .as_ref()
            .map(row_to_relationship);
        let first_contact = previous.is_none();
        let relationship = apply_turn(
            previous.as_ref(),
            record.user_id,
            record.role_id,
            score_delta,
            record.at,
            record.offset,
        );

        sqlx::query(
            "INSERT INTO relationships (user_id, role_id, favorability, continuous_days, last_turn_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(user_id, role_id) DO UPDATE SET
                favorability = excluded.favorability,
                continuous_days = excluded.continuous_days,
                last_turn_at = excluded.last_turn_at",
        )
        .bind(sql_id(relationship.user_id))
        .bind(sql_id(relationship.role_id))
        .bind(relationship.favorability)
        .bind(i64::from(relationship.continuous_days))
        .bind(ts(relationship.last_turn_at))
        .execute(&mut *tx)
        .await?;

        if record.regenerate.is_none() {
            sqlx::query("UPDATE roles SET chat_count = chat_count + 1 WHERE id = ?")
                .bind(sql_id(record.role_id))
                .execute(&mut *tx)
                .await?;
        }
        if first_contact {
            sqlx::query("UPDATE roles SET user_count = user_count + 1 WHERE id = ?")
                .bind(sql_id(record.role_id))
                .execute(&mut *tx)
                .await?;
        }

        let row = sqlx::query(&format!("SELECT {TURN_COLUMNS} FROM turns WHERE id = ?"))
            .bind(sql_id(turn_id))
            .fetch_one(&mut *tx)
            .await?;
        let turn = row_to_turn(&row);

        tx.commit().await?;

        Ok(RecordedTurn {
            turn,
            relationship,
            first_contact,
        })
    }

    async fn relationship(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<Option<RelationshipAggregate>, StoreError> {
        let row = sqlx::query("SELECT * FROM relationships WHERE user_id = ? AND role_id = ?")
            .bind(sql_id(user_id))
            .bind(sql_id(role_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_relationship))
    }

    async fn mark_read(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE turns SET is_read = 1 WHERE user_id = ? AND role_id = ? AND is_read = 0",
        )
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn clear_pair(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError> {
        let (user, role) = (sql_id(user_id), sql_id(role_id));
        let mut tx = self.pool.begin().await?;
        let turns = sqlx::query(
            "UPDATE turns SET status = 'retracted'
             WHERE user_id = ? AND role_id = ? AND status = 'active'",
        )
        .bind(user)
        .bind(role)
        .execute(&mut *tx)
        .await?;
        for table in ["memories", "thoughts"] {
            sqlx::query(&format!(
                "UPDATE {table} SET status = 'retracted' WHERE user_id = ? AND role_id = ?"
            ))
            .bind(user)
            .bind(role)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DELETE FROM relationships WHERE user_id = ? AND role_id = ?")
            .bind(user)
            .bind(role)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(turns.rows_affected())
    }
}

#[async_trait]
impl ThoughtRepository for SqliteStore {
    async fn insert_thought(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<ThoughtId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO thoughts (user_id, role_id, turn_id, content, status, created_at)
             VALUES (?, ?, ?, ?, 'active', ?)",
        )
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .bind(sql_id(turn_id))
        .bind(content)
        .bind(ts(at))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid().max(0) as u64)
    }

    async fn purge_turn_thoughts(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError> {
        let result =
            sqlx::query("DELETE FROM thoughts WHERE user_id = ? AND role_id = ? AND turn_id = ?")
                .bind(sql_id(user_id))
                .bind(sql_id(role_id))
                .bind(sql_id(turn_id))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn list_thoughts(
        &self,
        user_id: UserId,
        role_id: RoleId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<InnerThought>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM thoughts WHERE user_id = ? AND role_id = ? AND status = 'active'
             ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .bind(sql_id(limit))
        .bind(sql_id(offset))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_thought).collect())
    }

    async fn count_thoughts(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM thoughts WHERE user_id = ? AND role_id = ? AND status = 'active'",
        )
        .bind(sql_id(user_id))
        .bind(sql_id(role_id))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}
