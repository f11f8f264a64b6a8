pub mod claude;
pub mod handler;
pub mod prompt;

pub use claude::{ClaudeClient, LanguageModel};
pub use handler::ModelHandler;

/// Handler reference used in `[[workers]]` entries backed by Claude.
pub const CLAUDE_HANDLER: &str = "claude";
