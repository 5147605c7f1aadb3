pub mod builtin;
pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::gateway::Gateway;

/// Runtime context passed to skill execution.
///
/// Every skill reaches the external command through the shared gateway,
/// so policy checks and concurrency slots apply to all of them.
pub struct SkillContext {
    pub gateway: Arc<Gateway>,
    /// Directory for log files of long-running tasks.
    pub log_dir: PathBuf,
}

/// A tool a host can invoke by name.
///
/// The registry calls `execute()` with the host-supplied JSON parameters.
#[async_trait]
pub trait Skill: Send + Sync {
    /// Unique identifier, lowercase alphanumeric + underscores (e.g. "claude_plan").
    fn name(&self) -> &str;

    /// Human-readable description shown to the host so it knows
    /// when to invoke this skill.
    fn description(&self) -> &str;

    /// JSON Schema describing the parameters this skill accepts.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Declared capabilities, e.g. "filesystem:workdir:write".
    fn capabilities(&self) -> Vec<String> {
        vec![]
    }

    /// Execute the skill and return the text handed back to the host.
    async fn execute(
        &self,
        params: serde_json::Value,
        context: &SkillContext,
    ) -> anyhow::Result<String>;
}

pub use registry::SkillRegistry;
