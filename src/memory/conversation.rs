//! 发给模型的消息（role + content），与 OpenAI 兼容接口一致

use serde::{Deserialize, Serialize};

use crate::core::ChatTurn;

/// 消息角色
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// 单条消息
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// 把若干轮对话展开为交替的 user / assistant 消息（按时间正序）
pub fn replay_turns(turns: &[ChatTurn]) -> Vec<Message> {
    turns
        .iter()
        .flat_map(|t| [Message::user(&t.question), Message::assistant(&t.answer)])
        .collect()
}
