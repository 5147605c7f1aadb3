//! Working-directory sandbox.
//!
//! Every working directory requested by a caller is checked against the
//! policy allowlist before the external command is spawned:
//!
//! 1. `~` is expanded to the operator's home directory
//! 2. relative paths are made absolute against the gateway's own cwd
//! 3. `.` and `..` are resolved lexically (symbolic links are NOT followed)
//! 4. the result must equal an allowlist entry or lie below one
//!
//! The same normalization is applied to allowlist entries when a policy is
//! set, so both sides of the comparison are always in the same form.

use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::policy::SecurityPolicy;

/// Expands a leading `~` to the home directory. Anything else is returned as is.
pub fn expand_home(raw: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

/// Makes `path` absolute against `base` and resolves `.`/`..` lexically.
///
/// Repeated and trailing separators disappear through `Path::components`.
/// `..` never climbs above the root.
pub fn normalize(path: &Path, base: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

/// Expands `~` and normalizes against the process working directory.
pub fn resolve(raw: &str) -> Result<PathBuf, GatewayError> {
    let expanded = expand_home(raw);
    if expanded.is_absolute() {
        return Ok(normalize(&expanded, Path::new("/")));
    }
    let cwd = std::env::current_dir().map_err(GatewayError::CurrentDir)?;
    Ok(normalize(&expanded, &cwd))
}

/// True if `path` is `root` itself or lies below it.
///
/// Comparison is per path component, so `/x/y2` is not inside `/x/y`.
pub fn is_within(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Checks a requested working directory against the policy allowlist.
///
/// Returns `Ok(None)` when no directory was requested: the runner then uses
/// the gateway's own working directory. An empty allowlist denies every
/// requested directory.
pub fn validate_workdir(
    policy: &SecurityPolicy,
    candidate: Option<&str>,
) -> Result<Option<PathBuf>, GatewayError> {
    let Some(raw) = candidate.filter(|c| !c.trim().is_empty()) else {
        return Ok(None);
    };

    if policy.allowed_paths.is_empty() {
        warn!("Rejected workdir {raw}: no allowlist configured");
        return Err(GatewayError::NoAllowlist {
            requested: raw.to_string(),
        });
    }

    let resolved = resolve(raw)?;
    if policy
        .allowed_paths
        .iter()
        .any(|allowed| is_within(&resolved, allowed))
    {
        debug!("Workdir {raw} resolved to {}", resolved.display());
        return Ok(Some(resolved));
    }

    warn!(
        "Rejected workdir {raw} (resolved to {}): outside allowlist",
        resolved.display()
    );
    Err(GatewayError::OutsideAllowlist {
        resolved,
        allowed: policy.allowed_paths.clone(),
    })
}
