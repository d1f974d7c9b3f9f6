//! 对话打分（尽力而为）
//!
//! 第二次独立调用模型，评估角色回复是否有助于赢得好感；任何解析或调用失败都得到 0 分、空理由。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::llm::client::{json_body, CompletionClient, ModelChain};
use crate::memory::Message;
use crate::prompt::{TemplateRenderer, TemplateVars};

pub const MIN_SCORE: i64 = -2;
pub const MAX_SCORE: i64 = 3;

/// 打分结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnScore {
    pub score: i64,
    pub reason: String,
}

#[derive(Deserialize)]
struct RawScore {
    score: Value,
    #[serde(default)]
    reason: Option<String>,
}

/// 解析 `{"score": .., "reason": ..}`；格式不对返回 None，超出范围的分数截断到 [-2, 3]
pub fn parse_score(raw: &str) -> Option<TurnScore> {
    let parsed: RawScore = serde_json::from_str(json_body(raw)).ok()?;
    let score = match &parsed.score {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    let clamped = score.clamp(MIN_SCORE, MAX_SCORE);
    if clamped != score {
        warn!(score, "score out of range, clamped");
    }
    Some(TurnScore {
        score: clamped,
        reason: parsed.reason.unwrap_or_default(),
    })
}

/// 打分器
pub struct Scorer {
    client: Arc<CompletionClient>,
    models: ModelChain,
    template: String,
    renderer: Arc<dyn TemplateRenderer>,
    temperature: f32,
}

impl Scorer {
    pub fn new(
        client: Arc<CompletionClient>,
        models: ModelChain,
        template: String,
        renderer: Arc<dyn TemplateRenderer>,
        temperature: f32,
    ) -> Self {
        Self {
            client,
            models,
            template,
            renderer,
            temperature,
        }
    }

    pub async fn score(&self, question: &str, answer: &str) -> TurnScore {
        let vars = TemplateVars::new()
            .set("question", question)
            .set("answer", answer);
        let prompt = match self.renderer.render(&self.template, &vars) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "score template failed to render");
                return TurnScore::default();
            }
        };
        let messages = [
            Message::system(prompt),
            Message::user(format!("User: {question}\nAI: {answer}")),
        ];

        let raw = match self
            .client
            .complete(&messages, &self.models, self.temperature)
            .await
        {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "scoring call failed, defaulting to 0");
                return TurnScore::default();
            }
        };

        parse_score(&raw).unwrap_or_else(|| {
            warn!(raw = %raw, "unparseable score response, defaulting to 0");
            TurnScore::default()
        })
    }
}
