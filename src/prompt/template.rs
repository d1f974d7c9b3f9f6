//! 模板渲染：`render(template, variables) -> String`
//!
//! 默认实现基于 minijinja（`{{ var }}` 语法），未定义变量渲染为空串。

use std::collections::BTreeMap;

use minijinja::Environment;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Template error: {0}")]
pub struct TemplateError(pub String);

/// 渲染变量（全部按字符串传入）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TemplateVars(BTreeMap<String, String>);

impl TemplateVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

/// 可插拔的模板渲染器
pub trait TemplateRenderer: Send + Sync {
    fn render(&self, template: &str, vars: &TemplateVars) -> Result<String, TemplateError>;
}

pub struct MiniJinjaRenderer {
    env: Environment<'static>,
}

impl MiniJinjaRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        Self { env }
    }
}

impl Default for MiniJinjaRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer for MiniJinjaRenderer {
    fn render(&self, template: &str, vars: &TemplateVars) -> Result<String, TemplateError> {
        self.env
            .render_str(template, vars)
            .map_err(|e| TemplateError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_variables_render_empty() {
        let r = MiniJinjaRenderer::new();
        let vars = TemplateVars::new().set("name", "Aki");
        let out = r.render("Hi {{ name }}, age {{ age }}.", &vars).unwrap();
        assert_eq!(out, "Hi Aki, age .");
    }

    #[test]
    fn test_no_html_escaping() {
        let r = MiniJinjaRenderer::new();
        let vars = TemplateVars::new().set("x", "<b>&</b>");
        assert_eq!(r.render("{{ x }}", &vars).unwrap(), "<b>&</b>");
    }

    #[test]
    fn test_syntax_error_is_reported() {
        let r = MiniJinjaRenderer::new();
        assert!(r.render("{{ broken", &TemplateVars::new()).is_err());
    }
}
