//! Builtin skills: run Claude Code in plan, exec (full) or teams mode.
//!
//! All three go through [`Gateway::execute`](crate::gateway::Gateway::execute),
//! so the requested mode, working directory and timeout are checked against
//! the security policy before anything is spawned. They differ only in the
//! argument list, the default timeout and a few extras.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::gateway::ExecutionRequest;
use crate::runner::ExecutionOutcome;
use crate::skills::{Skill, SkillContext};

/// Env var switching the CLI into multi-agent teams mode.
pub const TEAMS_ENV_VAR: &str = "CLAUDE_CODE_EXPERIMENTAL_AGENT_TEAMS";

const PLAN_TIMEOUT_SECS: u64 = 300;
const EXEC_TIMEOUT_SECS: u64 = 300;
const TEAMS_TIMEOUT_SECS: u64 = 600;

/// Parameters shared by every Claude Code skill.
struct TaskParams {
    task: String,
    workdir: Option<String>,
    timeout: Option<f64>,
}

impl TaskParams {
    fn parse(params: &Value) -> anyhow::Result<Self> {
        let task = params["task"]
            .as_str()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("task is required"))?
            .to_string();
        let workdir = params["workdir"].as_str().map(str::to_string);
        let timeout = params["timeout"].as_f64();
        Ok(Self {
            task,
            workdir,
            timeout,
        })
    }
}

fn task_schema(task: &str, timeout: &str) -> Value {
    json!({
        "type": "object",
        "properties": {
            "task": {
                "type": "string",
                "description": task
            },
            "workdir": {
                "type": "string",
                "description": "Working directory for Claude Code (defaults to the gateway's cwd). \
                                Must be inside an allowed path."
            },
            "timeout": {
                "type": "number",
                "description": timeout
            }
        },
        "required": ["task"]
    })
}

/// Turns an outcome into host text; task failures become errors with the
/// child's stderr (or stdout) as context.
fn render(mode: &str, outcome: &ExecutionOutcome) -> anyhow::Result<String> {
    let log_note = outcome
        .log_file
        .as_ref()
        .map(|p| format!("\n\n[Full log: {}]", p.display()))
        .unwrap_or_default();

    if outcome.timed_out {
        let partial = outcome.stdout.trim();
        return Err(anyhow!(
            "Claude Code {mode} timed out after {}s and was terminated{}{log_note}",
            outcome.duration_ms / 1000,
            if partial.is_empty() {
                String::new()
            } else {
                format!(". Partial output:\n{partial}")
            }
        ));
    }

    if !outcome.success() {
        let detail = [outcome.stderr.trim(), outcome.stdout.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("Claude Code exited with non-zero code");
        let code = outcome
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        return Err(anyhow!(
            "Claude Code {mode} failed (exit {code}): {detail}{log_note}"
        ));
    }

    let text = outcome.stdout.trim();
    let text = if text.is_empty() { "(no output)" } else { text };
    Ok(format!("{text}{log_note}"))
}

/// Builds `<log_dir>/<mode>-<timestamp>-<id>.log`.
fn log_path(context: &SkillContext, mode: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let id = uuid::Uuid::new_v4().simple().to_string();
    context
        .log_dir
        .join(format!("{mode}-{stamp}-{}.log", &id[..8]))
}

// ── claude_plan ──────────────────────────────────────────

/// Read-only analysis and planning.
pub struct ClaudePlanSkill;

#[async_trait]
impl Skill for ClaudePlanSkill {
    fn name(&self) -> &str {
        "claude_plan"
    }

    fn description(&self) -> &str {
        "Run Claude Code in plan (read-only) mode. Claude Code can read/search code, fetch web pages, \
         and analyze the codebase, but cannot create, edit, or delete files. \
         Use this for architecture analysis, code review, and implementation planning."
    }

    fn parameters_schema(&self) -> Value {
        task_schema(
            "The analysis or planning task to send to Claude Code in plan (read-only) mode.",
            "Timeout in seconds (default 300, max enforced by security policy).",
        )
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:workdir:read".to_string(), "process:claude".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let p = TaskParams::parse(&params)?;
        let mut request = ExecutionRequest::new(vec![
            "--permission-mode".to_string(),
            "plan".to_string(),
            "--print".to_string(),
            p.task,
        ]);
        request.workdir = p.workdir;
        request.mode = Some("plan".to_string());
        request.timeout_secs = p.timeout;
        request.default_timeout_secs = PLAN_TIMEOUT_SECS;

        let outcome = context.gateway.execute(request).await?;
        render("plan", &outcome)
    }
}

// ── claude_exec ──────────────────────────────────────────

/// Full-permission execution, confined to allowed working directories.
pub struct ClaudeExecSkill;

#[async_trait]
impl Skill for ClaudeExecSkill {
    fn name(&self) -> &str {
        "claude_exec"
    }

    fn description(&self) -> &str {
        "Run Claude Code to execute a coding task. Claude Code can read, edit, create files, and run \
         shell commands. Use this for implementing features, fixing bugs, refactoring code, and other \
         development tasks. Operates in full-permission mode within whitelisted directories only."
    }

    fn parameters_schema(&self) -> Value {
        task_schema(
            "The task to send to Claude Code for execution.",
            "Timeout in seconds (default 300, max enforced by security policy).",
        )
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["filesystem:workdir:write".to_string(), "process:claude".to_string()]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let p = TaskParams::parse(&params)?;
        // Non-interactive runs need bypassPermissions to write; the workdir
        // allowlist is what confines them.
        let mut request = ExecutionRequest::new(vec![
            "--print".to_string(),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
            p.task,
        ]);
        request.workdir = p.workdir;
        request.mode = Some("full".to_string());
        request.timeout_secs = p.timeout;
        request.default_timeout_secs = EXEC_TIMEOUT_SECS;

        let outcome = context.gateway.execute(request).await?;
        render("exec", &outcome)
    }
}

// ── claude_teams ─────────────────────────────────────────

/// Multi-agent teams mode. Output is mirrored to a log file so progress
/// can be followed while the task runs.
pub struct ClaudeTeamsSkill;

#[async_trait]
impl Skill for ClaudeTeamsSkill {
    fn name(&self) -> &str {
        "claude_teams"
    }

    fn description(&self) -> &str {
        "Run Claude Code in multi-agent teams mode. Multiple Claude Code agents collaborate in parallel \
         with built-in file locking and coordination. Best for complex tasks that benefit from \
         parallel development within the same project (e.g. frontend + backend + tests simultaneously)."
    }

    fn parameters_schema(&self) -> Value {
        task_schema(
            "The task for Claude Code multi-agent teams. Describe the parallel work streams \
             (e.g. 'Frontend team: build login page. Backend team: implement auth API.').",
            "Timeout in seconds (default 600, since teams tasks tend to be longer).",
        )
    }

    fn capabilities(&self) -> Vec<String> {
        vec![
            "filesystem:workdir:write".to_string(),
            "filesystem:log_dir:write".to_string(),
            "process:claude".to_string(),
        ]
    }

    async fn execute(&self, params: Value, context: &SkillContext) -> anyhow::Result<String> {
        let p = TaskParams::parse(&params)?;
        let log_file = log_path(context, "teams");
        debug!("Mirroring teams output to {}", log_file.display());

        let mut request = ExecutionRequest::new(vec!["--print".to_string(), p.task]);
        request.workdir = p.workdir;
        request.mode = Some("teams".to_string());
        request.timeout_secs = p.timeout;
        request.default_timeout_secs = TEAMS_TIMEOUT_SECS;
        request.env = HashMap::from([(TEAMS_ENV_VAR.to_string(), "1".to_string())]);
        request.log_file = Some(log_file);

        let outcome = context.gateway.execute(request).await?;
        render("teams", &outcome)
    }
}
