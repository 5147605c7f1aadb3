/// Locates the `claude` executable.
///
/// First match wins:
/// 1. explicit override (config `runner.binary`, then `CLAUDE_BIN`)
/// 2. `~/.local/bin/claude` (regular file or symlink)
/// 3. latest entry of `~/.local/share/claude/versions`
/// 4. bare `claude`, resolved through `PATH` at spawn time
///
/// Resolution never fails. A missing binary surfaces as a spawn error.
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::sandbox;

/// Environment variable naming an explicit executable.
pub const BINARY_ENV_VAR: &str = "CLAUDE_BIN";

/// Name looked up through `PATH` when nothing else matches.
pub const DEFAULT_BINARY: &str = "claude";

const HOME_SYMLINK: &str = ".local/bin/claude";
const VERSIONS_DIR: &str = ".local/share/claude/versions";

#[derive(Debug, Clone, Default)]
pub struct BinaryLocator {
    override_bin: Option<String>,
    home: Option<PathBuf>,
}

impl BinaryLocator {
    /// Builds a locator from the configured override, `CLAUDE_BIN` and `$HOME`.
    pub fn from_env(configured: Option<&str>) -> Self {
        let override_bin = configured
            .map(str::to_string)
            .filter(|b| !b.trim().is_empty())
            .or_else(|| std::env::var(BINARY_ENV_VAR).ok());
        Self {
            override_bin,
            home: dirs::home_dir(),
        }
    }

    /// A locator that always returns `binary`.
    pub fn with_override(binary: impl Into<String>) -> Self {
        Self {
            override_bin: Some(binary.into()),
            home: None,
        }
    }

    /// A locator searching under `home` with no override.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        Self {
            override_bin: None,
            home: Some(home.into()),
        }
    }

    pub fn resolve(&self) -> String {
        if let Some(bin) = self.override_bin.as_deref().map(str::trim) {
            if !bin.is_empty() {
                let bin = sandbox::expand_home(bin).to_string_lossy().into_owned();
                debug!("Using claude binary override: {bin}");
                return bin;
            }
        }

        if let Some(home) = &self.home {
            let symlink = home.join(HOME_SYMLINK);
            if is_file_or_symlink(&symlink) {
                debug!("Using claude binary at {}", symlink.display());
                return symlink.to_string_lossy().into_owned();
            }

            if let Some(latest) = latest_version(&home.join(VERSIONS_DIR)) {
                debug!("Using latest installed claude version at {}", latest.display());
                return latest.to_string_lossy().into_owned();
            }
        }

        debug!("Falling back to '{DEFAULT_BINARY}' on PATH");
        DEFAULT_BINARY.to_string()
    }
}

fn is_file_or_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_file() || meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Lexicographically greatest entry name. Version names are compared as plain strings.
fn latest_version(dir: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .max()
        .map(|name| dir.join(name))
}
