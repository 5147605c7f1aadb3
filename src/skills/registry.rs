/// Skills registry.
///
/// Holds the registered skills, exposes their tool definitions to the host
/// and dispatches invocations by name. Failures are rendered as
/// `Error: <message>` text rather than propagated, so the host always gets
/// something it can show.
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{Skill, SkillContext};

#[derive(Default)]
pub struct SkillRegistry {
    skills: Vec<Box<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a skill. A skill with the same name is replaced.
    pub fn register(&mut self, skill: Box<dyn Skill>) {
        if let Some(pos) = self.skills.iter().position(|s| s.name() == skill.name()) {
            warn!("Replacing already registered skill {}", skill.name());
            self.skills[pos] = skill;
        } else {
            self.skills.push(skill);
        }
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&dyn Skill> {
        self.skills
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.skills.iter().map(|s| s.name()).collect()
    }

    /// Tool definitions in registration order: `[{name, description, input_schema}]`.
    pub fn tool_definitions(&self) -> Value {
        Value::Array(
            self.skills
                .iter()
                .map(|s| {
                    json!({
                        "name": s.name(),
                        "description": s.description(),
                        "input_schema": s.parameters_schema(),
                    })
                })
                .collect(),
        )
    }

    /// Invokes `name` and renders the result as text.
    pub async fn invoke(&self, name: &str, params: Value, context: &SkillContext) -> String {
        let Some(skill) = self.get(name) else {
            warn!("Unknown skill requested: {name}");
            return error_text(&format!(
                "unknown tool '{name}' (available: {})",
                self.names().join(", ")
            ));
        };

        info!("Invoking skill {name}");
        match skill.execute(params, context).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Skill {name} failed: {e}");
                error_text(&e.to_string())
            }
        }
    }
}

/// Host-facing error text.
pub fn error_text(message: &str) -> String {
    format!("Error: {message}")
}

/// True if `text` was produced by [`error_text`].
pub fn is_error_text(text: &str) -> bool {
    text.starts_with("Error: ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::gateway::Gateway;
    use crate::runner::BinaryLocator;

    struct EchoSkill(&'static str);

    #[async_trait]
    impl Skill for EchoSkill {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Echoes the message parameter"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"message": {"type": "string"}}})
        }

        async fn execute(&self, params: Value, _context: &SkillContext) -> anyhow::Result<String> {
            params["message"]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("message is required"))
        }
    }

    fn context() -> SkillContext {
        SkillContext {
            gateway: Arc::new(Gateway::new(BinaryLocator::with_override("true"))),
            log_dir: std::env::temp_dir(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SkillRegistry::new();
        assert!(registry.is_empty());
        registry.register(Box::new(EchoSkill("echo")));
        registry.register(Box::new(EchoSkill("other")));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["echo", "other"]);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_register_same_name_replaces() {
        let mut registry = SkillRegistry::new();
        registry.register(Box::new(EchoSkill("echo")));
        registry.register(Box::new(EchoSkill("echo")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_tool_definitions() {
        let mut registry = SkillRegistry::new();
        registry.register(Box::new(EchoSkill("echo")));
        let defs = registry.tool_definitions();
        assert_eq!(defs[0]["name"], "echo");
        assert_eq!(defs[0]["description"], "Echoes the message parameter");
        assert_eq!(defs[0]["input_schema"]["type"], "object");
    }

    #[tokio::test]
    async fn test_invoke_success_and_error() {
        let mut registry = SkillRegistry::new();
        registry.register(Box::new(EchoSkill("echo")));
        let ctx = context();

        let ok = registry.invoke("echo", json!({"message": "hi"}), &ctx).await;
        assert_eq!(ok, "hi");

        let err = registry.invoke("echo", json!({}), &ctx).await;
        assert_eq!(err, "Error: message is required");
        assert!(is_error_text(&err));
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let mut registry = SkillRegistry::new();
        registry.register(Box::new(EchoSkill("echo")));
        let text = registry.invoke("nope", json!({}), &context()).await;
        assert!(is_error_text(&text));
        assert!(text.contains("unknown tool 'nope'"));
        assert!(text.contains("echo"));
    }

    #[test]
    fn test_error_text_prefix() {
        assert_eq!(error_text("bad thing"), "Error: bad thing");
        assert!(!is_error_text("fine"));
    }
}
