use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use code_gate::config::Config;
use code_gate::skills::builtin::{ClaudeExecSkill, ClaudePlanSkill, ClaudeTeamsSkill};
use code_gate::skills::registry::is_error_text;
use code_gate::skills::{SkillContext, SkillRegistry};
use code_gate::{BinaryLocator, Gateway};

const DEFAULT_CONFIG_PATH: &str = "config/gate.toml";

fn print_help() {
    println!(
        "\
code-gate v{}

Runs Claude Code inside an operator-defined security envelope.

USAGE:
    code-gate [OPTIONS] <TOOL> <TASK>...
    code-gate [OPTIONS] --list

ARGUMENTS:
    TOOL    One of: claude_plan, claude_exec, claude_teams
    TASK    Task text sent to Claude Code (remaining arguments are joined)

OPTIONS:
    -c, --config <PATH>     TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
    -w, --workdir <DIR>     Working directory (must be inside policy.allowed_paths)
    -t, --timeout <SECS>    Requested timeout in seconds (capped by policy)
        --list              Print the tool definitions as JSON and exit
    -h, --help              Print this help message and exit
    -V, --version           Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                   Log level filter for tracing
                               (e.g. debug, code_gate=debug,warn)
    CLAUDE_BIN                 Explicit path to the claude executable
                               (runner.binary in the config wins)
    CLAUDE_CODE_OAUTH_TOKEN    Usually referenced by policy.credential_token;
                               passed to claude, never logged

EXAMPLES:
    code-gate claude_plan \"review src/\"
    code-gate -w ~/projects/app claude_exec \"fix the failing test\"
    RUST_LOG=debug code-gate --list",
        env!("CARGO_PKG_VERSION"),
    );
}

/// What the command line asked for.
#[derive(Debug, PartialEq)]
enum CliCommand {
    Help,
    Version,
    List { config: String },
    Invoke(Invocation),
}

#[derive(Debug, PartialEq)]
struct Invocation {
    config: String,
    tool: String,
    task: String,
    workdir: Option<String>,
    timeout: Option<f64>,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliCommand> {
    let mut config = DEFAULT_CONFIG_PATH.to_string();
    let mut workdir = None;
    let mut timeout = None;
    let mut list = false;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliCommand::Help),
            "--version" | "-V" => return Ok(CliCommand::Version),
            "--list" => list = true,
            "--config" | "-c" => {
                config = args.next().ok_or_else(|| anyhow!("{arg} needs a path"))?;
            }
            "--workdir" | "-w" => {
                workdir = Some(args.next().ok_or_else(|| anyhow!("{arg} needs a directory"))?);
            }
            "--timeout" | "-t" => {
                let value = args.next().ok_or_else(|| anyhow!("{arg} needs a number of seconds"))?;
                timeout = Some(
                    value
                        .parse::<f64>()
                        .map_err(|_| anyhow!("invalid timeout '{value}'"))?,
                );
            }
            _ => positional.push(arg),
        }
    }

    if list {
        return Ok(CliCommand::List { config });
    }

    let mut positional = positional.into_iter();
    let tool = positional
        .next()
        .ok_or_else(|| anyhow!("missing TOOL (see --help)"))?;
    let task = positional.collect::<Vec<_>>().join(" ");

    Ok(CliCommand::Invoke(Invocation {
        config,
        tool,
        task,
        workdir,
        timeout,
    }))
}

fn build_registry() -> SkillRegistry {
    let mut skills = SkillRegistry::new();
    skills.register(Box::new(ClaudePlanSkill));
    skills.register(Box::new(ClaudeExecSkill));
    skills.register(Box::new(ClaudeTeamsSkill));
    skills
}

fn build_context(config_path: &str) -> Result<SkillContext> {
    info!("Loading configuration from {config_path}");
    let config = Config::load(config_path)
        .map_err(|e| anyhow!("cannot load configuration {config_path}: {e}"))?;

    let locator = BinaryLocator::from_env(config.runner.binary.as_deref());
    let gateway = Gateway::with_policy(locator, config.policy_update());

    let policy = gateway.policy();
    if policy.allowed_paths.is_empty() {
        warn!("No allowed paths configured: every explicit workdir will be rejected");
    } else {
        info!(
            "Allowed paths: {}",
            policy
                .allowed_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    Ok(SkillContext {
        gateway: Arc::new(gateway),
        log_dir: config.runner.log_dir,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let command = parse_args(std::env::args().skip(1))?;

    // Initialize logging (RUST_LOG=debug for debug mode). stdout carries the result.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("code_gate=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let invocation = match command {
        CliCommand::Help => {
            print_help();
            return Ok(());
        }
        CliCommand::Version => {
            println!("code-gate v{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        CliCommand::List { config } => {
            // Validates the configuration even though only definitions are printed
            build_context(&config)?;
            println!("{}", serde_json::to_string_pretty(&build_registry().tool_definitions())?);
            return Ok(());
        }
        CliCommand::Invoke(invocation) => invocation,
    };

    let context = build_context(&invocation.config)?;
    let skills = build_registry();
    info!("Skills: {} registered", skills.len());

    let mut params = json!({ "task": invocation.task });
    if let Some(workdir) = invocation.workdir {
        params["workdir"] = json!(workdir);
    }
    if let Some(timeout) = invocation.timeout {
        params["timeout"] = json!(timeout);
    }

    // Dropping the invocation on Ctrl-C kills the child and frees its slot
    let text = tokio::select! {
        text = skills.invoke(&invocation.tool, params, &context) => text,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting");
            return Ok(());
        }
    };

    println!("{text}");
    if is_error_text(&text) {
        std::process::exit(1);
    }
    Ok(())
}
