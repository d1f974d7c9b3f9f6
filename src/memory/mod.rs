//! 记忆层：发给模型的消息、记忆条目与查询、对话记忆提取、记忆胶囊

pub mod capsule;
pub mod conversation;
pub mod extraction;
pub mod item;

pub use capsule::MemoryBook;
pub use conversation::{replay_turns, Message, MessageRole};
pub use extraction::{
    parse_memory_payload, validate_extracted, ExtractionError, ExtractionOutcome,
    MemoryExtractor, PayloadItem,
};
pub use item::{MemoryCategory, MemoryItem, MemoryQuery, NewMemory, Order, SubCategory};
