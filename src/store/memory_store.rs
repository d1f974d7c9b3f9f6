//! 内存存储：所有表放在一把 RwLock 后，写操作天然原子
//!
//! 用于测试与无持久化部署；重启后数据丢失。

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::chat::relationship::apply_turn;
use crate::core::{
    ChatTurn, EventEntry, InnerThought, MemoryId, NewEvent, RecordStatus, RelationshipAggregate,
    Role, RoleId, StoreError, ThoughtId, TurnId, UserId, UserPresumption, UserProfile,
};
use crate::memory::{MemoryItem, MemoryQuery, NewMemory, Order};
use crate::store::{
    ChatRepository, EventRepository, MemoryRepository, PresumptionRepository, RecordedTurn,
    RoleRepository, ThoughtRepository, TurnRecord,
};

#[derive(Default)]
struct Tables {
    next_id: u64,
    roles: BTreeMap<RoleId, Role>,
    users: HashMap<UserId, UserProfile>,
    presumptions: HashMap<(UserId, RoleId), UserPresumption>,
    events: BTreeMap<u64, EventEntry>,
    memories: BTreeMap<MemoryId, MemoryItem>,
    turns: BTreeMap<TurnId, ChatTurn>,
    relationships: HashMap<(UserId, RoleId), RelationshipAggregate>,
    thoughts: BTreeMap<ThoughtId, InnerThought>,
}

impl Tables {
    /// 所有表共用一个自增序列，id 单调递增
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn window<T>(items: impl Iterator<Item = T>, offset: u64, limit: Option<u64>) -> Vec<T> {
    let skipped = items.skip(usize::try_from(offset).unwrap_or(usize::MAX));
    match limit {
        Some(l) => skipped.take(usize::try_from(l).unwrap_or(usize::MAX)).collect(),
        None => skipped.collect(),
    }
}

#[async_trait]
impl RoleRepository for InMemoryStore {
    async fn role(&self, id: RoleId) -> Result<Option<Role>, StoreError> {
        Ok(self.tables.read().await.roles.get(&id).cloned())
    }

    async fn save_role(&self, mut role: Role) -> Result<RoleId, StoreError> {
        let mut t = self.tables.write().await;
        if role.id == 0 {
            role.id = t.allocate_id();
        }
        let id = role.id;
        t.roles.insert(id, role);
        Ok(id)
    }

    async fn user_profile(&self, user_id: UserId) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.tables.read().await.users.get(&user_id).cloned())
    }

    async fn save_user_profile(&self, profile: UserProfile) -> Result<(), StoreError> {
        self.tables.write().await.users.insert(profile.id, profile);
        Ok(())
    }
}

#[async_trait]
impl PresumptionRepository for InMemoryStore {
    async fn presumption(
        &self,
        user_id: UserId,
        role_id: RoleId,
    ) -> Result<Option<UserPresumption>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .presumptions
            .get(&(user_id, role_id))
            .cloned())
    }

    async fn upsert_presumption(&self, presumption: UserPresumption) -> Result<(), StoreError> {
        self.tables
            .write()
            .await
            .presumptions
            .insert((presumption.user_id, presumption.role_id), presumption);
        Ok(())
    }
}

#[async_trait]
impl EventRepository for InMemoryStore {
    async fn count_events(&self, role_id: RoleId, author_id: UserId) -> Result<u64, StoreError> {
        let t = self.tables.read().await;
        Ok(t.events
            .values()
            .filter(|e| e.role_id == role_id && e.author_id == author_id)
            .count() as u64)
    }

    async fn insert_event(
        &self,
        event: NewEvent,
        limit: u64,
    ) -> Result<Option<EventEntry>, StoreError> {
        let mut t = self.tables.write().await;
        let existing = t
            .events
            .values()
            .filter(|e| e.role_id == event.role_id && e.author_id == event.author_id)
            .count() as u64;
        if existing >= limit {
            return Ok(None);
        }
        let entry = EventEntry {
            id: t.allocate_id(),
            role_id: event.role_id,
            author_id: event.author_id,
            title: event.title,
            content: event.content,
            created_at: event.at,
            updated_at: event.at,
        };
        t.events.insert(entry.id, entry.clone());
        Ok(Some(entry))
    }

    async fn list_events(
        &self,
        role_id: RoleId,
        author_id: UserId,
    ) -> Result<Vec<EventEntry>, StoreError> {
        let t = self.tables.read().await;
        Ok(t.events
            .values()
            .filter(|e| e.role_id == role_id && e.author_id == author_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MemoryRepository for InMemoryStore {
    async fn insert_memories(
        &self,
        user_id: UserId,
        role_id: RoleId,
        items: &[NewMemory],
        triggering_turn_id: Option<TurnId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<MemoryId>, StoreError> {
        let mut t = self.tables.write().await;
        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = t.allocate_id();
            t.memories.insert(
                id,
                MemoryItem {
                    id,
                    user_id,
                    role_id,
                    content: item.content.clone(),
                    sub_category: item.sub_category,
                    status: RecordStatus::Active,
                    triggering_turn_id,
                    created_at: at,
                },
            );
            ids.push(id);
        }
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
        let mut t = self.tables.write().await;
        let unchanged = t.turns.get(&trigger.id).is_some_and(|c| {
            c.belongs_to(user_id, role_id)
                && c.status == RecordStatus::Active
                && c.updated_at == trigger.updated_at
                && c.question == trigger.question
                && c.answer == trigger.answer
        });
        let extracted = t.memories.values().any(|m| {
            m.user_id == user_id
                && m.role_id == role_id
                && m.triggering_turn_id == Some(trigger.id)
        });
        if !unchanged || extracted {
            return Ok(None);
        }

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let id = t.allocate_id();
            t.memories.insert(
                id,
                MemoryItem {
                    id,
                    user_id,
                    role_id,
                    content: item.content.clone(),
                    sub_category: item.sub_category,
                    status: RecordStatus::Active,
                    triggering_turn_id: Some(trigger.id),
                    created_at: at,
                },
            );
            ids.push(id);
        }
        Ok(Some(ids))
    }

    async fn find_memories(&self, query: &MemoryQuery) -> Result<Vec<MemoryItem>, StoreError> {
        let t = self.tables.read().await;
        let mut matched: Vec<MemoryItem> = t
            .memories
            .values()
            .filter(|m| query.matches(m))
            .cloned()
            .collect();
        matched.sort_by_key(|m| (m.created_at, m.id));
        if query.order == Order::NewestFirst {
            matched.reverse();
        }
        Ok(window(matched.into_iter(), query.offset, query.limit))
    }

    async fn count_memories(&self, query: &MemoryQuery) -> Result<u64, StoreError> {
        let t = self.tables.read().await;
        Ok(t.memories.values().filter(|m| query.matches(m)).count() as u64)
    }

    async fn purge_turn_memories(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables.write().await;
        let before = t.memories.len();
        t.memories.retain(|_, m| {
            !(m.user_id == user_id && m.role_id == role_id && m.triggering_turn_id == Some(turn_id))
        });
        Ok((before - t.memories.len()) as u64)
    }

    async fn update_memory_content(
        &self,
        user_id: UserId,
        id: MemoryId,
        content: &str,
        _at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        match t.memories.get_mut(&id) {
            Some(m) if m.user_id == user_id && m.status == RecordStatus::Active => {
                m.content = content.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_memory(&self, user_id: UserId, id: MemoryId) -> Result<bool, StoreError> {
        let mut t = self.tables.write().await;
        let owned = t.memories.get(&id).is_some_and(|m| m.user_id == user_id);
        if owned {
            t.memories.remove(&id);
        }
        Ok(owned)
    }
}

#[async_trait]
impl ChatRepository for InMemoryStore {
    async fn turn(&self, id: TurnId) -> Result<Option<ChatTurn>, StoreError> {
        Ok(self.tables.read().await.turns.get(&id).cloned())
    }

    async fn recent_turns(
        &self,
        user_id: UserId,
        role_id: RoleId,
        limit: u64,
        up_to: Option<TurnId>,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let t = self.tables.read().await;
        let newest: Vec<ChatTurn> = window(
            t.turns
                .values()
                .rev()
                .filter(|c| {
                    c.belongs_to(user_id, role_id)
                        && c.status == RecordStatus::Active
                        && up_to.map_or(true, |max| c.id <= max)
                })
                .cloned(),
            0,
            Some(limit),
        );
        Ok(newest.into_iter().rev().collect())
    }

    async fn count_turns(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError> {
        let t = self.tables.read().await;
        Ok(t.turns
            .values()
            .filter(|c| c.belongs_to(user_id, role_id) && c.status == RecordStatus::Active)
            .count() as u64)
    }

    async fn turn_position(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError> {
        let t = self.tables.read().await;
        Ok(t.turns
            .range(..=turn_id)
            .filter(|(_, c)| c.belongs_to(user_id, role_id) && c.status == RecordStatus::Active)
            .count() as u64)
    }

    async fn page_turns(
        &self,
        user_id: UserId,
        role_id: RoleId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<ChatTurn>, StoreError> {
        let t = self.tables.read().await;
        Ok(window(
            t.turns
                .values()
                .rev()
                .filter(|c| c.belongs_to(user_id, role_id) && c.status == RecordStatus::Active)
                .cloned(),
            offset,
            Some(limit),
        ))
    }

    async fn record_turn(&self, record: TurnRecord) -> Result<RecordedTurn, StoreError> {
        let mut t = self.tables.write().await;
        let pair = (record.user_id, record.role_id);

        let (turn, score_delta) = match record.regenerate {
            Some(id) => {
                let existing = t
                    .turns
                    .get_mut(&id)
                    .filter(|c| {
                        c.belongs_to(record.user_id, record.role_id)
                            && c.status == RecordStatus::Active
                    })
                    .ok_or_else(|| StoreError::NotFound(format!("turn {id}")))?;
                let delta = record.score - existing.score;
                existing.question = record.question;
                existing.answer = record.answer;
                existing.score = record.score;
                existing.score_reason = record.score_reason;
                existing.is_regenerated = true;
                existing.is_read = false;
                existing.updated_at = record.at;
                (existing.clone(), delta)
            }
            None => {
                let turn = ChatTurn {
                    id: t.allocate_id(),
                    user_id: record.user_id,
                    role_id: record.role_id,
                    question: record.question,
                    answer: record.answer,
                    score: record.score,
                    score_reason: record.score_reason,
                    is_regenerated: false,
                    is_read: false,
                    status: RecordStatus::Active,
                    created_at: record.at,
                    updated_at: record.at,
                };
                t.turns.insert(turn.id, turn.clone());
                (turn, record.score)
            }
        };

        let previous = t.relationships.get(&pair).cloned();
        let first_contact = previous.is_none();
        let relationship = apply_turn(
            previous.as_ref(),
            record.user_id,
            record.role_id,
            score_delta,
            record.at,
            record.offset,
        );
        t.relationships.insert(pair, relationship.clone());

        if let Some(role) = t.roles.get_mut(&record.role_id) {
            if record.regenerate.is_none() {
                role.chat_count += 1;
            }
            if first_contact {
                role.user_count += 1;
            }
        }

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
        Ok(self
            .tables
            .read()
            .await
            .relationships
            .get(&(user_id, role_id))
            .cloned())
    }

    async fn mark_read(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError> {
        let mut t = self.tables.write().await;
        let mut changed = 0;
        for turn in t.turns.values_mut() {
            if turn.belongs_to(user_id, role_id) && !turn.is_read {
                turn.is_read = true;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn clear_pair(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError> {
        let mut t = self.tables.write().await;
        let mut retracted = 0;
        for turn in t.turns.values_mut() {
            if turn.belongs_to(user_id, role_id) && turn.status == RecordStatus::Active {
                turn.status = RecordStatus::Retracted;
                retracted += 1;
            }
        }
        for m in t.memories.values_mut() {
            if m.user_id == user_id && m.role_id == role_id {
                m.status = RecordStatus::Retracted;
            }
        }
        for th in t.thoughts.values_mut() {
            if th.user_id == user_id && th.role_id == role_id {
                th.status = RecordStatus::Retracted;
            }
        }
        t.relationships.remove(&(user_id, role_id));
        Ok(retracted)
    }
}

#[async_trait]
impl ThoughtRepository for InMemoryStore {
    async fn insert_thought(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<ThoughtId, StoreError> {
        let mut t = self.tables.write().await;
        let id = t.allocate_id();
        t.thoughts.insert(
            id,
            InnerThought {
                id,
                user_id,
                role_id,
                turn_id,
                content: content.to_string(),
                status: RecordStatus::Active,
                created_at: at,
            },
        );
        Ok(id)
    }

    async fn purge_turn_thoughts(
        &self,
        user_id: UserId,
        role_id: RoleId,
        turn_id: TurnId,
    ) -> Result<u64, StoreError> {
        let mut t = self.tables.write().await;
        let before = t.thoughts.len();
        t.thoughts.retain(|_, th| {
            !(th.user_id == user_id && th.role_id == role_id && th.turn_id == turn_id)
        });
        Ok((before - t.thoughts.len()) as u64)
    }

    async fn list_thoughts(
        &self,
        user_id: UserId,
        role_id: RoleId,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<InnerThought>, StoreError> {
        let t = self.tables.read().await;
        Ok(window(
            t.thoughts
                .values()
                .rev()
                .filter(|th| {
                    th.user_id == user_id
                        && th.role_id == role_id
                        && th.status == RecordStatus::Active
                })
                .cloned(),
            offset,
            Some(limit),
        ))
    }

    async fn count_thoughts(&self, user_id: UserId, role_id: RoleId) -> Result<u64, StoreError> {
        let t = self.tables.read().await;
        Ok(t.thoughts
            .values()
            .filter(|th| {
                th.user_id == user_id && th.role_id == role_id && th.status == RecordStatus::Active
            })
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::offset_from_hours;
    use crate::memory::SubCategory;
    use chrono::Duration;

    fn record(question: &str, score: i64, at: DateTime<Utc>, regenerate: Option<TurnId>) -> TurnRecord {
        TurnRecord {
            user_id: 1,
            role_id: 2,
            question: question.to_string(),
            answer: format!("re: {question}"),
            score,
            score_reason: String::new(),
            regenerate,
            at,
            offset: offset_from_hours(8),
        }
    }

    #[tokio::test]
    async fn test_record_turn_updates_counters() {
        let store = InMemoryStore::new();
        let role_id = store
            .save_role(Role { owner_id: 9, name: "Aki".into(), ..Default::default() })
            .await
            .unwrap();
        let now = Utc::now();
        let mut first = record("a", 2, now, None);
        first.role_id = role_id;
        let recorded = store.record_turn(first).await.unwrap();
        assert!(recorded.first_contact);
        assert_eq!(recorded.relationship.favorability, 2);

        let mut second = record("b", 1, now, None);
        second.role_id = role_id;
        let recorded = store.record_turn(second).await.unwrap();
        assert!(!recorded.first_contact);

        let role = store.role(role_id).await.unwrap().unwrap();
        assert_eq!(role.chat_count, 2);
        assert_eq!(role.user_count, 1);
    }

    #[tokio::test]
    async fn test_regenerate_updates_in_place() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let original = store.record_turn(record("q", 3, now, None)).await.unwrap();
        let id = original.turn.id;

        let again = store
            .record_turn(record("q", -1, now + Duration::minutes(1), Some(id)))
            .await
            .unwrap();
        assert_eq!(again.turn.id, id);
        assert!(again.turn.is_regenerated);
        assert_eq!(again.relationship.favorability, -1);
        assert_eq!(store.count_turns(1, 2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_regenerate_unknown_turn_fails() {
        let store = InMemoryStore::new();
        let err = store
            .record_turn(record("q", 0, Utc::now(), Some(42)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.relationship(1, 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_turns_window_and_bound() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut ids = vec![];
        for i in 0..7 {
            let r = store.record_turn(record(&i.to_string(), 0, now, None)).await.unwrap();
            ids.push(r.turn.id);
        }
        let last5 = store.recent_turns(1, 2, 5, None).await.unwrap();
        assert_eq!(last5.iter().map(|t| t.id).collect::<Vec<_>>(), ids[2..7].to_vec());
        let bounded = store.recent_turns(1, 2, 5, Some(ids[4])).await.unwrap();
        assert_eq!(bounded.last().unwrap().id, ids[4]);
        assert_eq!(bounded.len(), 5);
    }

    #[tokio::test]
    async fn test_purge_only_touches_batch() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let batch = [NewMemory::new("likes tea", SubCategory::UserLikes)];
        store.insert_memories(1, 2, &batch, Some(10), now).await.unwrap();
        store.insert_memories(1, 2, &batch, Some(11), now).await.unwrap();
        assert_eq!(store.purge_turn_memories(1, 2, 10).await.unwrap(), 1);
        let left = store.find_memories(&MemoryQuery::pair(1, 2)).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].triggering_turn_id, Some(11));
    }

    #[tokio::test]
    async fn test_turn_memories_need_unchanged_unextracted_turn() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let snapshot = store.record_turn(record("q", 1, now, None)).await.unwrap().turn;
        let batch = [NewMemory::new("likes tea", SubCategory::UserLikes)];

        let first = store.insert_turn_memories(1, 2, &batch, &snapshot, now).await.unwrap();
        assert_eq!(first.map(|ids| ids.len()), Some(1));
        // 同一轮第二批被拒绝
        assert!(store
            .insert_turn_memories(1, 2, &batch, &snapshot, now)
            .await
            .unwrap()
            .is_none());

        // 重新生成后，旧快照提取出的批次被拒绝（时间戳相同也能识别）
        store.purge_turn_memories(1, 2, snapshot.id).await.unwrap();
        let mut regen = record("q2", 0, now, Some(snapshot.id));
        regen.answer = "another answer".into();
        let fresh = store.record_turn(regen).await.unwrap().turn;
        assert!(store
            .insert_turn_memories(1, 2, &batch, &snapshot, now)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .insert_turn_memories(1, 2, &batch, &fresh, now)
            .await
            .unwrap()
            .is_some());
        assert_eq!(store.count_memories(&MemoryQuery::pair(1, 2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_turn_position_counts_active_turns_up_to_id() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut ids = vec![];
        for i in 0..3 {
            let r = store.record_turn(record(&i.to_string(), 0, now, None)).await.unwrap();
            ids.push(r.turn.id);
        }
        // 其他 pair 的轮次不计入
        let mut other = record("x", 0, now, None);
        other.user_id = 7;
        store.record_turn(other).await.unwrap();

        assert_eq!(store.turn_position(1, 2, ids[0]).await.unwrap(), 1);
        assert_eq!(store.turn_position(1, 2, ids[2]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_event_cap_is_atomic() {
        let store = InMemoryStore::new();
        let ev = || NewEvent {
            role_id: 2,
            author_id: 5,
            title: "t".into(),
            content: "c".into(),
            at: Utc::now(),
        };
        assert!(store.insert_event(ev(), 1).await.unwrap().is_some());
        assert!(store.insert_event(ev(), 1).await.unwrap().is_none());
        assert_eq!(store.count_events(2, 5).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_pair_retracts_everything() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let r = store.record_turn(record("q", 1, now, None)).await.unwrap();
        store
            .insert_memories(1, 2, &[NewMemory::new("x", SubCategory::Event)], Some(r.turn.id), now)
            .await
            .unwrap();
        store.insert_thought(1, 2, r.turn.id, "hmm", now).await.unwrap();

        assert_eq!(store.clear_pair(1, 2).await.unwrap(), 1);
        assert_eq!(store.count_turns(1, 2).await.unwrap(), 0);
        assert_eq!(store.count_memories(&MemoryQuery::pair(1, 2)).await.unwrap(), 0);
        assert_eq!(store.count_thoughts(1, 2).await.unwrap(), 0);
        assert!(store.relationship(1, 2).await.unwrap().is_none());
    }
}
