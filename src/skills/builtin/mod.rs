pub mod claude;

pub use claude::{ClaudeExecSkill, ClaudePlanSkill, ClaudeTeamsSkill};
