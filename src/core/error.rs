//! 聊天链路错误类型
//!
//! 只有 [`ChatError::Validation`] 与 [`ChatError::ServiceUnavailable`] 会展示给用户；
//! 存储错误记录日志后以通用提示返回。

use thiserror::Error;

use crate::llm::LlmError;

/// 存储层错误（内存表 / SQLite）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

#[cfg(feature = "async-sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row".to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// 输入校验错误：描述性文案，直接返回给用户，不会触达模型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("角色ID和消息内容不能为空")]
    EmptyMessage,

    #[error("消息内容最多{max}个字符")]
    MessageTooLong { max: usize },

    #[error("模式ID不存在")]
    UnknownMode(u64),

    #[error("角色不存在")]
    RoleNotFound(u64),

    #[error("对话记录不存在")]
    TurnNotFound(u64),

    #[error("{field}不能为空")]
    MissingField { field: &'static str },

    #[error("{field}最多{max}个字符")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("作者事件最多{0}个")]
    AuthorEventLimit(u64),

    #[error("玩家上线最多{0}个")]
    ContributorEventLimit(u64),

    #[error("记忆不存在")]
    MemoryNotFound(u64),
}

/// 聊天服务对外错误
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// 所有模型均失败；对用户只显示通用文案，具体原因在日志中
    #[error("AI服务暂时不可用，请稍后再试")]
    ServiceUnavailable(#[source] LlmError),

    #[error("服务内部错误")]
    Store(#[from] StoreError),
}

impl ChatError {
    /// 是否可把 Display 文案直接展示给用户
    pub fn is_user_visible(&self) -> bool {
        matches!(self, ChatError::Validation(_) | ChatError::ServiceUnavailable(_))
    }
}

impl From<LlmError> for ChatError {
    fn from(e: LlmError) -> Self {
        ChatError::ServiceUnavailable(e)
    }
}
