//! 内心想法：按概率询问模型角色是否有与回复相反的真实想法

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::core::{ChatError, ChatTurn, Clock, InnerThought, RecordStatus, Role};
use crate::llm::{CompletionClient, ModelChain};
use crate::memory::Message;
use crate::prompt::{background_text, load_persona, PromptSource, TemplateKind, TemplateRenderer, TemplateVars};
use crate::store::Repositories;

/// 模型回答「没有内心想法」时的回复
pub fn is_null_reply(raw: &str) -> bool {
    let trimmed = raw.trim().trim_matches(|c| c == '"' || c == '\'' || c == '`').trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null")
}

pub struct InnerThoughtGenerator {
    repos: Repositories,
    client: Arc<CompletionClient>,
    prompts: Arc<dyn PromptSource>,
    renderer: Arc<dyn TemplateRenderer>,
    clock: Arc<dyn Clock>,
    models: ModelChain,
    temperature: f32,
    probability: f64,
}

impl InnerThoughtGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repos: Repositories,
        client: Arc<CompletionClient>,
        prompts: Arc<dyn PromptSource>,
        renderer: Arc<dyn TemplateRenderer>,
        clock: Arc<dyn Clock>,
        models: ModelChain,
        temperature: f32,
        probability: f64,
    ) -> Self {
        Self {
            repos,
            client,
            prompts,
            renderer,
            clock,
            models,
            temperature,
            probability: probability.clamp(0.0, 1.0),
        }
    }

    /// 这次是否询问模型
    fn roll(&self) -> bool {
        rand::thread_rng().gen_bool(self.probability)
    }

    /// 为某轮对话尝试生成内心想法；未抽中或模型返回 NULL 时为 None
    pub async fn generate(
        &self,
        role: &Role,
        turn: &ChatTurn,
    ) -> Result<Option<InnerThought>, ChatError> {
        if !self.roll() {
            debug!(user_id = turn.user_id, role_id = role.id, turn_id = turn.id, "inner thought skipped by probability");
            return Ok(None);
        }

        let persona = load_persona(&self.repos, turn.user_id, role.id).await?;
        let today = self.clock.today().to_string();
        let vars = TemplateVars::new()
            .set("background", background_text(role, &persona, &today))
            .set("question", turn.question.as_str())
            .set("answer", turn.answer.as_str());
        let template = self.prompts.template(TemplateKind::InnerThought, role.language);
        let prompt = match self.renderer.render(&template, &vars) {
            Ok(p) => p,
            Err(e) => {
                warn!(role_id = role.id, error = %e, "inner thought template failed to render");
                return Ok(None);
            }
        };

        let raw = self
            .client
            .complete(&[Message::system(prompt)], &self.models, self.temperature)
            .await?;
        if is_null_reply(&raw) {
            debug!(user_id = turn.user_id, role_id = role.id, turn_id = turn.id, "no inner thought for turn");
            return Ok(None);
        }

        let content = raw.trim().to_string();
        let at = self.clock.now();
        let id = self
            .repos
            .thoughts
            .insert_thought(turn.user_id, role.id, turn.id, &content, at)
            .await?;
        info!(user_id = turn.user_id, role_id = role.id, turn_id = turn.id, thought_id = id, "inner thought stored");
        Ok(Some(InnerThought {
            id,
            user_id: turn.user_id,
            role_id: role.id,
            turn_id: turn.id,
            content,
            status: RecordStatus::Active,
            created_at: at,
        }))
    }
}
