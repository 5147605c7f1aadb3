use serde::Deserialize;
use std::path::PathBuf;

use crate::policy::PolicyUpdate;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub policy: PolicyUpdate,
    #[serde(default)]
    pub runner: RunnerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Explicit claude executable. Takes precedence over CLAUDE_BIN.
    #[serde(default)]
    pub binary: Option<String>,
    /// Where tools that mirror their output write log files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            binary: None,
            log_dir: default_log_dir(),
        }
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./data/logs")
}

fn expand_env(content: &str) -> anyhow::Result<String> {
    let mut expanded = String::with_capacity(content.len());
    for line in content.lines() {
        if line.trim_start().starts_with('#') {
            expanded.push_str(line);
        } else {
            expanded.push_str(&shellexpand::env(line)?);
        }
        expanded.push('\n');
    }
    Ok(expanded)
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses TOML after expanding environment variables like ${CLAUDE_CODE_OAUTH_TOKEN}.
    /// Comment lines are left as written.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = expand_env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }

    /// The `[policy]` table as a partial policy for the policy store.
    pub fn policy_update(&self) -> PolicyUpdate {
        self.policy.clone()
    }
}
