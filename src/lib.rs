//! rolechat - 角色陪伴聊天核心
//!
//! 模块划分：
//! - **app**: 组装根，按配置装配各服务并启动后台工作池
//! - **chat**: 对话轮次生命周期、好感度与连续天数、背景事件、用户人设、内心想法
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、时钟、领域记录
//! - **llm**: 模型提供方抽象（OpenRouter / Mock）、重试、模型链补全、打分
//! - **memory**: 记忆条目、记忆提取、记忆胶囊
//! - **prompt**: 模板渲染、提示词库、提示词组装
//! - **store**: 仓储接口与内存 / SQLite 实现
//! - **worker**: 延迟队列、工作池、每日总结

pub mod app;
pub mod chat;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod prompt;
pub mod store;
pub mod worker;

pub use app::{App, AppError, AppParts};
