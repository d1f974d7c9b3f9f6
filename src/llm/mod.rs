//! LLM 层：提供方抽象（OpenRouter / Mock）、重试策略、模型链补全客户端、打分

pub mod client;
pub mod mock;
pub mod openrouter;
pub mod retry;
pub mod scoring;
pub mod traits;

pub use client::{json_body, CompletionClient, LlmError, ModelChain, ModelFailure};
pub use mock::{RecordedCall, ScriptedProvider};
pub use openrouter::OpenRouterProvider;
pub use retry::RetryPolicy;
pub use scoring::{parse_score, Scorer, TurnScore};
pub use traits::{ChatProvider, ChatRequest, ProviderError};
