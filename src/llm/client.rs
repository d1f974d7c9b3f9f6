//! 容错补全客户端
//!
//! 按模型链依次尝试：当前模型的重试用尽（或遇到不可重试错误）后才切换下一个模型；
//! 全部失败时返回携带每个模型错误摘要的 [`LlmError::Exhausted`]。

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::llm::retry::RetryPolicy;
use crate::llm::traits::{ChatProvider, ChatRequest, ProviderError};
use crate::memory::Message;

/// 有序的模型回退链（配置里是逗号分隔字符串）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChain(Vec<String>);

impl ModelChain {
    pub fn parse(raw: &str) -> Result<Self, LlmError> {
        let models: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(String::from)
            .collect();
        if models.is_empty() {
            return Err(LlmError::EmptyChain);
        }
        Ok(Self(models))
    }

    pub fn models(&self) -> &[String] {
        &self.0
    }
}

impl FromStr for ModelChain {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ModelChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

/// 某个模型最终失败的记录
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFailure {
    pub model: String,
    pub attempts: u32,
    pub error: ProviderError,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("No model configured")]
    EmptyChain,

    #[error("All models failed: {}", summarize(.failures))]
    Exhausted { failures: Vec<ModelFailure> },
}

fn summarize(failures: &[ModelFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("[{}] after {} attempt(s): {}", f.model, f.attempts, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 补全客户端：持有提供方与默认重试策略
pub struct CompletionClient {
    provider: Arc<dyn ChatProvider>,
    retry: RetryPolicy,
}

impl CompletionClient {
    pub fn new(provider: Arc<dyn ChatProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// 使用默认重试策略
    pub async fn complete(
        &self,
        messages: &[Message],
        models: &ModelChain,
        temperature: f32,
    ) -> Result<String, LlmError> {
        self.complete_with(messages, models, temperature, &self.retry)
            .await
    }

    pub async fn complete_with(
        &self,
        messages: &[Message],
        models: &ModelChain,
        temperature: f32,
        policy: &RetryPolicy,
    ) -> Result<String, LlmError> {
        let mut failures = Vec::with_capacity(models.models().len());

        for model in models.models() {
            let mut attempt: u32 = 0;
            loop {
                let request = ChatRequest {
                    model,
                    messages,
                    temperature,
                };
                match self.provider.chat(request).await {
                    Ok(text) => {
                        debug!(model = %model, attempt = attempt + 1, "completion succeeded");
                        return Ok(text);
                    }
                    Err(e) => {
                        attempt += 1;
                        if e.is_retryable() && attempt <= policy.max_retries {
                            let delay = policy.next_delay(attempt);
                            warn!(
                                model = %model,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                "retryable provider error, backing off"
                            );
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        warn!(model = %model, attempt, error = %e, "model failed, advancing chain");
                        failures.push(ModelFailure {
                            model: model.clone(),
                            attempts: attempt,
                            error: e,
                        });
                        break;
                    }
                }
            }
        }

        let err = LlmError::Exhausted { failures };
        error!(chain = %models, error = %err, "all models exhausted");
        Err(err)
    }
}

/// 取出模型回复中的 JSON 主体：去掉 ``` 代码块包裹，或截取首个 `{` 到最后一个 `}`
pub fn json_body(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.strip_prefix("json").unwrap_or(rest);
        let rest = rest.strip_suffix("```").unwrap_or(rest);
        return rest.trim();
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::ScriptedProvider;
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn test_chain_parsing() {
        let chain = ModelChain::parse(" a/x , ,b/y,").unwrap();
        assert_eq!(chain.models(), ["a/x".to_string(), "b/y".to_string()]);
        assert_eq!(chain.to_string(), "a/x,b/y");
        assert_eq!(ModelChain::parse(" , "), Err(LlmError::EmptyChain));
    }

    #[tokio::test]
    async fn test_non_retryable_advances_immediately() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .on_model("A", vec![Err(ProviderError::api(400, Some("invalid_request_error"), "bad"))])
                .on_model("B", vec![Ok("from B".to_string())]),
        );
        let client = CompletionClient::new(provider.clone(), fast_policy(2));
        let chain = ModelChain::parse("A,B").unwrap();

        let text = client.complete(&[Message::user("hi")], &chain, 0.7).await.unwrap();
        assert_eq!(text, "from B");
        assert_eq!(provider.calls_for("A"), 1);
        assert_eq!(provider.calls_for("B"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_before_advancing() {
        let busy = || -> Result<String, ProviderError> { Err(ProviderError::api(503, None, "overloaded")) };
        let provider = Arc::new(
            ScriptedProvider::new()
                .on_model("A", vec![busy(), busy(), busy()])
                .on_model("B", vec![Ok("ok".to_string())]),
        );
        let client = CompletionClient::new(provider.clone(), RetryPolicy::new(2, Duration::from_millis(1500)));
        let chain = ModelChain::parse("A,B").unwrap();

        let text = client.complete(&[Message::user("hi")], &chain, 0.7).await.unwrap();
        assert_eq!(text, "ok");
        // 首次 + 2 次重试
        assert_eq!(provider.calls_for("A"), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_names_every_model() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .on_model("A", vec![Err(ProviderError::api(401, None, "no key"))])
                .on_model("B", vec![Err(ProviderError::InvalidResponse("empty choices".into()))]),
        );
        let client = CompletionClient::new(provider, fast_policy(2));
        let chain = ModelChain::parse("A,B").unwrap();

        let err = client.complete(&[Message::user("hi")], &chain, 0.7).await.unwrap_err();
        let LlmError::Exhausted { failures } = &err else {
            panic!("expected exhaustion, got {err:?}");
        };
        assert_eq!(failures.len(), 2);
        let text = err.to_string();
        assert!(text.contains("[A]") && text.contains("[B]"), "{text}");
    }

    #[test]
    fn test_json_body_extraction() {
        assert_eq!(json_body("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(json_body("Sure: {\"a\":1} done"), "{\"a\":1}");
        assert_eq!(json_body("not valid json"), "not valid json");
    }
}
