//! Security policy: the operator-configured envelope around every execution.
//!
//! Exactly one policy is active at a time. It is replaced wholesale by
//! [`PolicyStore::set`] and read as an immutable `Arc` snapshot, so a
//! concurrent reader sees either the old policy or the new one, never a mix.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::sandbox;

/// Default cap on any requested execution duration.
pub const DEFAULT_MAX_TIMEOUT_SECS: u64 = 600;

/// Default number of external processes allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Mode blocked unless the operator explicitly unblocks it.
pub const DEFAULT_BLOCKED_MODE: &str = "full";

/// The active security envelope.
#[derive(Debug)]
pub struct SecurityPolicy {
    /// Absolute, normalized directories. Empty denies every requested workdir.
    pub allowed_paths: Vec<PathBuf>,
    pub max_timeout_secs: u64,
    pub max_concurrent: usize,
    pub blocked_modes: BTreeSet<String>,
    /// Injected into the child environment. Redacted from `Debug`.
    pub credential_token: Option<SecretString>,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            max_timeout_secs: DEFAULT_MAX_TIMEOUT_SECS,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            blocked_modes: BTreeSet::from([DEFAULT_BLOCKED_MODE.to_string()]),
            credential_token: None,
        }
    }
}

impl SecurityPolicy {
    /// Builds a policy from compiled-in defaults overlaid with `update`.
    ///
    /// The previous active policy plays no part: omitted fields revert to
    /// their defaults. Out-of-range values are coerced, never rejected.
    pub fn from_update(update: PolicyUpdate) -> Self {
        let mut policy = Self::default();

        if let Some(paths) = update.allowed_paths {
            policy.allowed_paths = paths
                .iter()
                .filter(|p| !p.trim().is_empty())
                .filter_map(|p| match sandbox::resolve(p) {
                    Ok(resolved) => Some(resolved),
                    Err(e) => {
                        warn!("Dropping allowed path {p}: {e}");
                        None
                    }
                })
                .collect();
        }

        match update.max_timeout_secs {
            Some(0) => warn!("max_timeout_secs must be positive, using {DEFAULT_MAX_TIMEOUT_SECS}"),
            Some(secs) => policy.max_timeout_secs = secs,
            None => {}
        }

        match update.max_concurrent {
            Some(0) => warn!("max_concurrent must be positive, using {DEFAULT_MAX_CONCURRENT}"),
            Some(max) => policy.max_concurrent = max,
            None => {}
        }

        if let Some(modes) = update.blocked_modes {
            policy.blocked_modes = modes
                .into_iter()
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .collect();
        }

        policy.credential_token = update
            .credential_token
            .filter(|t| !t.trim().is_empty())
            .map(SecretString::from);

        policy
    }

    /// Rejects `mode` when the operator has blocked it. No mode is always allowed.
    pub fn validate_mode(&self, mode: Option<&str>) -> Result<(), GatewayError> {
        match mode {
            Some(mode) if self.blocked_modes.contains(mode) => {
                warn!("Rejected blocked permission mode '{mode}'");
                Err(GatewayError::ModeBlocked {
                    mode: mode.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Turns a requested duration into one the runner can always use.
    ///
    /// Falls back to `default_secs` when nothing (or NaN) is requested, then
    /// bounds the result to `[1, max_timeout_secs]` seconds.
    pub fn clamp_timeout(&self, requested_secs: Option<f64>, default_secs: u64) -> Duration {
        let secs = requested_secs
            .filter(|s| !s.is_nan())
            .unwrap_or(default_secs as f64)
            .clamp(1.0, self.max_timeout_secs.max(1) as f64);
        Duration::from_millis((secs * 1000.0).round() as u64)
    }
}

/// Partial policy as supplied by the configuration loader.
#[derive(Deserialize, Clone, Default)]
pub struct PolicyUpdate {
    pub allowed_paths: Option<Vec<String>>,
    pub max_timeout_secs: Option<u64>,
    pub max_concurrent: Option<usize>,
    pub blocked_modes: Option<Vec<String>>,
    /// Supports ${ENV_VAR} substitution
    pub credential_token: Option<String>,
}

impl std::fmt::Debug for PolicyUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyUpdate")
            .field("allowed_paths", &self.allowed_paths)
            .field("max_timeout_secs", &self.max_timeout_secs)
            .field("max_concurrent", &self.max_concurrent)
            .field("blocked_modes", &self.blocked_modes)
            .field(
                "credential_token",
                &self.credential_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Holder of the single active policy.
pub struct PolicyStore {
    active: RwLock<Arc<SecurityPolicy>>,
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyStore {
    /// Starts with the compiled-in defaults (deny every workdir).
    pub fn new() -> Self {
        Self {
            active: RwLock::new(Arc::new(SecurityPolicy::default())),
        }
    }

    /// Replaces the active policy with defaults overlaid by `update`.
    ///
    /// Normalization happens before the swap.
    pub fn set(&self, update: PolicyUpdate) {
        let policy = Arc::new(SecurityPolicy::from_update(update));
        info!(
            "Security policy: {} allowed path(s), timeout cap {}s, {} concurrent, blocked modes [{}], credential {}",
            policy.allowed_paths.len(),
            policy.max_timeout_secs,
            policy.max_concurrent,
            policy.blocked_modes.iter().cloned().collect::<Vec<_>>().join(", "),
            if policy.credential_token.is_some() { "set" } else { "unset" },
        );
        // A panic while holding the lock cannot leave a half-written Arc behind.
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        *active = policy;
    }

    /// Returns a snapshot of the active policy.
    pub fn get(&self) -> Arc<SecurityPolicy> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
