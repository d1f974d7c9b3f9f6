//! 核心：错误类型、时钟、按 pair 的锁、领域记录

pub mod clock;
pub mod error;
pub mod locks;
pub mod types;

pub use clock::{Clock, DayRange, ManualClock, SystemClock};
pub use error::{ChatError, StoreError, ValidationError};
pub use locks::{PairGuard, PairLocks};
pub use types::{
    ChatMode, ChatTurn, EventEntry, EventId, InnerThought, Language, MemoryId, NewEvent, Page,
    RecordStatus, RelationshipAggregate, Role, RoleId, RoleStatus, ThoughtId, TurnId,
    UserId, UserPresumption, UserProfile,
};
