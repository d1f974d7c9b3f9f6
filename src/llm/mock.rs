//! 脚本化提供方（用于测试，无需 API）
//!
//! 每个模型可预设一串返回值，按顺序消费；脚本用完后交给兜底应答函数。所有请求都会被记录。
//! 可选的延迟函数让某些请求在应答前先等待一段时间，用于构造调用进行中的并发场景。

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::traits::{ChatProvider, ChatRequest, ProviderError};
use crate::memory::Message;

type Responder = Box<dyn Fn(&ChatRequest<'_>) -> Result<String, ProviderError> + Send + Sync>;
type Latency = Box<dyn Fn(&ChatRequest<'_>) -> Option<Duration> + Send + Sync>;

/// 被记录的一次请求
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
}

impl RecordedCall {
    pub fn system_prompt(&self) -> &str {
        self.messages
            .first()
            .filter(|m| m.role == crate::memory::MessageRole::System)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<Result<String, ProviderError>>>>,
    responder: Option<Responder>,
    latency: Option<Latency>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为某个模型预设依次返回的结果
    pub fn on_model(self, model: &str, results: Vec<Result<String, ProviderError>>) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(model.to_string())
            .or_default()
            .extend(results);
        self
    }

    /// 脚本用完后的兜底应答
    pub fn with_responder<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChatRequest<'_>) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// 返回 Some 的请求先等待对应时长再应答
    pub fn with_latency<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChatRequest<'_>) -> Option<Duration> + Send + Sync + 'static,
    {
        self.latency = Some(Box::new(f));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn calls_for(&self, model: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.model == model)
            .count()
    }

    /// 系统提示词包含 needle 的请求数
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|c| c.system_prompt().contains(needle))
            .count()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<String, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                model: request.model.to_string(),
                messages: request.messages.to_vec(),
                temperature: request.temperature,
            });

        if let Some(delay) = self.latency.as_ref().and_then(|f| f(&request)) {
            tokio::time::sleep(delay).await;
        }

        let scripted = self
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(request.model)
            .and_then(VecDeque::pop_front);
        if let Some(result) = scripted {
            return result;
        }

        match &self.responder {
            Some(f) => f(&request),
            None => Err(ProviderError::InvalidResponse(format!(
                "no scripted response for model {}",
                request.model
            ))),
        }
    }
}
