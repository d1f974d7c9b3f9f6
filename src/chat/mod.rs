//! 聊天：轮次生命周期、关系聚合、背景事件、用户人设、内心想法

pub mod events;
pub mod lifecycle;
pub mod presumption;
pub mod relationship;
pub mod thought;

pub use events::{EventListing, EventLog, AUTHOR_EVENT_LIMIT, CONTRIBUTOR_EVENT_LIMIT};
pub use lifecycle::{ChatDeps, ChatReply, ChatService, ChatSettings, RelationshipView};
pub use presumption::{validate_presumption, PresumptionService};
pub use relationship::{apply_turn, effective_streak, next_streak};
pub use thought::{is_null_reply, InnerThoughtGenerator};
