//! OpenRouter（OpenAI 兼容）提供方
//!
//! 直接用 reqwest 调用 `/chat/completions`，保留 HTTP 状态码与 error.type，供重试判定使用。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

use crate::config::LlmSection;
use crate::llm::traits::{ChatProvider, ChatRequest, ProviderError};
use crate::memory::Message;

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl ApiErrorBody {
    fn into_error(self, http_status: Option<u16>) -> ProviderError {
        // 200 响应体内的 error.code 往往是真实的上游状态码
        let status = http_status.or_else(|| {
            self.code
                .as_ref()
                .and_then(|c| c.as_u64())
                .and_then(|c| u16::try_from(c).ok())
        });
        let kind = self.kind.or_else(|| {
            self.code
                .as_ref()
                .and_then(|c| c.as_str())
                .map(String::from)
        });
        ProviderError::Api {
            status,
            kind,
            message: self.message,
        }
    }
}

/// OpenRouter 客户端：持有 reqwest::Client、base_url 与鉴权信息
pub struct OpenRouterProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenRouterProvider {
    pub fn new(settings: &LlmSection) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        if let Some(referer) = settings.referer.as_deref() {
            if let Ok(v) = HeaderValue::from_str(referer) {
                headers.insert("HTTP-Referer", v);
            }
        }
        if let Some(title) = settings.title.as_deref() {
            if let Ok(v) = HeaderValue::from_str(title) {
                headers.insert("X-Title", v);
            }
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .default_headers(headers)
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.resolve_api_key().unwrap_or_default(),
        })
    }
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Transport(format!("request timed out: {e}"))
    } else if e.is_connect() {
        ProviderError::Transport(format!("could not connect: {e}"))
    } else if e.is_decode() {
        ProviderError::InvalidResponse(e.to_string())
    } else {
        ProviderError::Transport(e.to_string())
    }
}

#[async_trait]
impl ChatProvider for OpenRouterProvider {
    async fn chat(&self, request: ChatRequest<'_>) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = CompletionBody {
            model: request.model,
            messages: request.messages,
            temperature: request.temperature,
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(match serde_json::from_str::<ErrorEnvelope>(&text) {
                Ok(envelope) => envelope.error.into_error(Some(status.as_u16())),
                Err(_) => ProviderError::api(status.as_u16(), None, text),
            });
        }

        let parsed: CompletionResponse = serde_json::from_str(&text)
            .map_err(|e| ProviderError::InvalidResponse(format!("{e}: {text}")))?;
        if let Some(err) = parsed.error {
            return Err(err.into_error(None));
        }

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ProviderError::InvalidResponse("empty completion".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_in_success_response() {
        let parsed: CompletionResponse = serde_json::from_str(
            r#"{"error": {"message": "Provider returned error", "code": 502}}"#,
        )
        .unwrap();
        let err = parsed.error.unwrap().into_error(None);
        assert!(err.is_retryable());
        assert!(matches!(err, ProviderError::Api { status: Some(502), .. }));
    }

    #[test]
    fn test_error_kind_from_string_code() {
        let envelope: ErrorEnvelope = serde_json::from_str(
            r#"{"error": {"message": "quota", "code": "resource_exhausted"}}"#,
        )
        .unwrap();
        let err = envelope.error.into_error(Some(400));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_request_body_shape() {
        let msgs = [Message::system("s"), Message::user("u")];
        let body = CompletionBody {
            model: "openai/gpt-4o",
            messages: &msgs,
            temperature: 0.7,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["model"], "openai/gpt-4o");
    }

    #[test]
    fn test_provider_builds_from_defaults() {
        let provider = OpenRouterProvider::new(&LlmSection::default()).unwrap();
        assert_eq!(provider.base_url, "https://openrouter.ai/api/v1");
    }
}
