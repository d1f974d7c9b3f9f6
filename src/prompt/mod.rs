//! 提示词：模板渲染、提示词库、各语言标签、对话提示词组装

pub mod assembler;
pub mod labels;
pub mod library;
pub mod template;

pub use assembler::{
    background_text, history_messages, load_persona, render_event_block, render_memory_block, AssembledPrompt,
    PromptAssembler, UserPersona,
};
pub use labels::{labels, SectionLabels};
pub use library::{default_mode, PromptError, PromptLibrary, PromptSource, TemplateKind};
pub use template::{MiniJinjaRenderer, TemplateError, TemplateRenderer, TemplateVars};
