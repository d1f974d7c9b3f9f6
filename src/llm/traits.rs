//! 模型提供方抽象
//!
//! 提供方只负责一次请求（单模型、单次尝试）；模型链回退与重试在 [`crate::llm::CompletionClient`] 中完成。

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::retry;
use crate::memory::Message;

/// 单次请求：模型 id + 消息 + 温度
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub temperature: f32,
}

/// 提供方返回的错误，保留 HTTP 状态码与错误类型以便判断是否可重试
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("API error (status {status:?}, type {kind:?}): {message}")]
    Api {
        status: Option<u16>,
        kind: Option<String>,
        message: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn api(status: u16, kind: Option<&str>, message: impl Into<String>) -> Self {
        ProviderError::Api {
            status: Some(status),
            kind: kind.map(String::from),
            message: message.into(),
        }
    }

    /// 状态码在可重试集合内、错误类型在可重试集合内，或传输错误文案匹配网络故障
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Api { status, kind, message } => {
                status.is_some_and(retry::is_retryable_status)
                    || kind.as_deref().is_some_and(retry::is_retryable_kind)
                    || (status.is_none() && retry::is_network_failure(message))
            }
            ProviderError::Transport(message) => retry::is_network_failure(message),
            ProviderError::InvalidResponse(_) => false,
        }
    }
}

/// 模型提供方：一次请求、一个模型
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::api(429, None, "slow down").is_retryable());
        assert!(ProviderError::api(599, None, "odd 5xx").is_retryable());
        assert!(ProviderError::api(400, Some("Rate_Limit_Error"), "x").is_retryable());
        assert!(!ProviderError::api(401, Some("invalid_api_key"), "bad key").is_retryable());
        assert!(ProviderError::Transport("Connection reset by peer".into()).is_retryable());
        assert!(!ProviderError::Transport("builder error".into()).is_retryable());
        assert!(!ProviderError::InvalidResponse("no choices".into()).is_retryable());
    }
}
