//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ROLECHAT__*` 覆盖（双下划线表示嵌套，如 `ROLECHAT__LLM__MAX_RETRIES=3`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::ChatMode;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub memory: MemorySection,
    pub summarizer: SummarizerSection,
    pub storage: StorageSection,
    pub prompts: PromptsSection,
    /// 聊天模式；为空时使用内置模式 1
    pub modes: Vec<ChatMode>,
}

/// [app] 段：时区、消息长度上限、默认语言
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 计算「今天/昨天」所用的 UTC 偏移（小时）
    pub utc_offset_hours: i32,
    /// 单条用户消息最大字符数
    pub max_message_chars: usize,
    pub default_language: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            utc_offset_hours: 8,
            max_message_chars: 2000,
            default_language: "zh-Hant".to_string(),
        }
    }
}

/// [llm] 段：OpenRouter 端点、模型链与重试参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    /// 未设置时读取环境变量 OPENROUTER_API_KEY
    pub api_key: Option<String>,
    /// OpenRouter 要求的 HTTP-Referer 头
    pub referer: Option<String>,
    /// OpenRouter 要求的 X-Title 头
    pub title: Option<String>,
    pub request_timeout_secs: u64,
    /// 记忆提取、每日总结、日记、内心想法使用的模型链（逗号分隔）
    pub default_models: String,
    /// 打分使用的模型链
    pub score_models: String,
    pub temperature: f32,
    /// 打分调用的温度
    pub score_temperature: f32,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            referer: None,
            title: None,
            request_timeout_secs: 30,
            default_models:
                "anthropic/claude-3.7-sonnet,openrouter/openai/gpt-4o-mini,openrouter/openai/gpt-4o"
                    .to_string(),
            score_models: "deepseek/deepseek-chat-v3-0324".to_string(),
            temperature: 0.7,
            score_temperature: 0.7,
            max_retries: 5,
            base_delay_ms: 1500,
            max_delay_ms: 45_000,
        }
    }
}

impl LlmSection {
    /// 配置中的 api_key，缺省时回退到 OPENROUTER_API_KEY
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
    }
}

/// [memory] 段：记忆提取节奏、历史窗口、内心想法概率
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// 每 N 轮对话触发一次记忆提取
    pub extraction_interval: usize,
    /// 拼入上下文的最近对话轮数，同时也是记忆提取的取样轮数
    pub history_window: usize,
    /// 为 true 时记忆提取放入后台队列执行
    pub async_extraction: bool,
    pub extraction_delay_secs: u64,
    /// 后台提取失败后的重投延迟
    pub extraction_retry_secs: u64,
    pub inner_thought_probability: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            extraction_interval: 5,
            history_window: 5,
            async_extraction: false,
            extraction_delay_secs: 0,
            extraction_retry_secs: 60,
            inner_thought_probability: 0.3,
        }
    }
}

/// [summarizer] 段：每日总结任务的延迟、重试与并发
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummarizerSection {
    pub enqueue_delay_secs: u64,
    pub retry_delay_secs: u64,
    pub max_attempts: u32,
    pub workers: usize,
}

impl Default for SummarizerSection {
    fn default() -> Self {
        Self {
            enqueue_delay_secs: 60,
            retry_delay_secs: 300,
            max_attempts: 3,
            workers: 4,
        }
    }
}

/// [storage] 段：memory / sqlite
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub backend: String,
    pub sqlite_path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: PathBuf::from("data/rolechat.db"),
        }
    }
}

/// [prompts] 段：可选的提示词包路径（覆盖内置模板）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PromptsSection {
    pub path: Option<PathBuf>,
}

/// 从 config 目录加载配置，环境变量 ROLECHAT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ROLECHAT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ROLECHAT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.utc_offset_hours, 8);
        assert_eq!(cfg.llm.max_retries, 5);
        assert_eq!(cfg.llm.max_delay_ms, 45_000);
        assert_eq!(cfg.memory.extraction_interval, 5);
        assert_eq!(cfg.memory.history_window, 5);
        assert_eq!(cfg.summarizer.max_attempts, 3);
        assert_eq!(cfg.summarizer.retry_delay_secs, 300);
        assert_eq!(cfg.storage.backend, "memory");
    }

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let raw = r#"
            [llm]
            max_retries = 2

            [[modes]]
            id = 7
            name = "night"
            chat_template = "hi {{ role_name }}"
            models = "a,b"
            temperature = 0.5
            memory_days = 3
        "#;
        let cfg: AppConfig = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(cfg.llm.max_retries, 2);
        assert_eq!(cfg.llm.base_delay_ms, 1500);
        assert_eq!(cfg.llm.score_temperature, 0.7);
        assert_eq!(cfg.modes.len(), 1);
        assert_eq!(cfg.modes[0].memory_days, 3);
    }
}
