//! LLM-backed reasoning collaborator
//!
//! Speaks the OpenAI chat-completions API with function tools, which is
//! also what DeepSeek and most self-hosted gateways expose.

pub mod openai;
pub mod tool_calling;

pub use openai::OpenAiCollaborator;
