use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::GatewayError;
use crate::policy::{PolicyStore, PolicyUpdate, SecurityPolicy};
use crate::runner::{BinaryLocator, ConcurrencyGuard, ExecutionOutcome, ProcessRunner, RunSpec};
use crate::sandbox;

pub use crate::runner::DEFAULT_RUN_TIMEOUT_SECS;

/// One caller request, before any policy check.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub args: Vec<String>,
    pub workdir: Option<String>,
    pub mode: Option<String>,
    pub timeout_secs: Option<f64>,
    /// Used when `timeout_secs` is absent, still bounded by the policy cap.
    pub default_timeout_secs: u64,
    pub env: HashMap<String, String>,
    pub log_file: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(args: Vec<String>) -> Self {
        Self {
            args,
            workdir: None,
            mode: None,
            timeout_secs: None,
            default_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            env: HashMap::new(),
            log_file: None,
        }
    }
}

/// Process-wide gateway state: the active policy and the running-process slots.
///
/// Shared as `Arc<Gateway>` by every caller in the process.
pub struct Gateway {
    policy: PolicyStore,
    runner: ProcessRunner,
}

impl Gateway {
    /// Starts with the default policy, which denies every working directory.
    pub fn new(locator: BinaryLocator) -> Self {
        Self {
            policy: PolicyStore::new(),
            runner: ProcessRunner::new(locator, ConcurrencyGuard::new()),
        }
    }

    pub fn with_policy(locator: BinaryLocator, update: PolicyUpdate) -> Self {
        let gateway = Self::new(locator);
        gateway.set_policy(update);
        gateway
    }

    pub fn set_policy(&self, update: PolicyUpdate) {
        self.policy.set(update);
    }

    pub fn policy(&self) -> Arc<SecurityPolicy> {
        self.policy.get()
    }

    pub fn validate_workdir(&self, workdir: Option<&str>) -> Result<Option<PathBuf>, GatewayError> {
        sandbox::validate_workdir(&self.policy(), workdir)
    }

    pub fn validate_mode(&self, mode: Option<&str>) -> Result<(), GatewayError> {
        self.policy().validate_mode(mode)
    }

    pub fn clamp_timeout(&self, requested_secs: Option<f64>, default_secs: u64) -> Duration {
        self.policy().clamp_timeout(requested_secs, default_secs)
    }

    /// Number of external processes running right now.
    pub fn running(&self) -> usize {
        self.runner.slots().running()
    }

    /// Runs an already validated [`RunSpec`] under the current policy's slot limit
    /// and credential. Its timeout is still bounded by the policy cap.
    pub async fn run(&self, mut spec: RunSpec) -> Result<ExecutionOutcome, GatewayError> {
        let policy = self.policy();
        spec.timeout = policy.clamp_timeout(Some(spec.timeout.as_secs_f64()), DEFAULT_RUN_TIMEOUT_SECS);
        self.runner.run(spec, &policy).await
    }

    /// Validates mode, workdir and timeout against one policy snapshot, then runs.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, GatewayError> {
        let policy = self.policy();

        policy.validate_mode(request.mode.as_deref())?;
        let cwd = sandbox::validate_workdir(&policy, request.workdir.as_deref())?;
        let timeout = policy.clamp_timeout(request.timeout_secs, request.default_timeout_secs);

        info!(
            "Executing in mode {} ({} running of {})",
            request.mode.as_deref().unwrap_or("default"),
            self.running(),
            policy.max_concurrent
        );

        let spec = RunSpec {
            args: request.args,
            cwd,
            env: request.env,
            timeout,
            log_file: request.log_file,
        };
        self.runner.run(spec, &policy).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_gateway(update: PolicyUpdate) -> Arc<Gateway> {
        Arc::new(Gateway::with_policy(BinaryLocator::with_override("sh"), update))
    }

    fn sh_request(script: &str) -> ExecutionRequest {
        ExecutionRequest::new(vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_scenario_workdir_accepted() {
        let gateway = sh_gateway(PolicyUpdate {
            allowed_paths: Some(vec!["/tmp/sandbox".to_string()]),
            max_concurrent: Some(1),
            ..Default::default()
        });
        assert_eq!(
            gateway.validate_workdir(Some("/tmp/sandbox/app")).unwrap(),
            Some(PathBuf::from("/tmp/sandbox/app"))
        );
    }

    #[test]
    fn test_scenario_traversal_rejected() {
        let gateway = sh_gateway(PolicyUpdate {
            allowed_paths: Some(vec!["/tmp/sandbox".to_string()]),
            max_concurrent: Some(1),
            ..Default::default()
        });
        let err = gateway.validate_workdir(Some("/tmp/sandbox/../etc")).unwrap_err();
        assert!(err.to_string().contains("not under any allowed path"));
    }

    #[tokio::test]
    async fn test_scenario_concurrency_cap() {
        let gateway = sh_gateway(PolicyUpdate {
            max_concurrent: Some(2),
            ..Default::default()
        });

        let slow = |gateway: Arc<Gateway>| {
            tokio::spawn(async move { gateway.execute(sh_request("sleep 1; echo slow")).await })
        };
        let first = slow(gateway.clone());
        let second = slow(gateway.clone());

        // Wait until both hold their slots
        for _ in 0..100 {
            if gateway.running() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(gateway.running(), 2);

        let err = gateway.execute(sh_request("echo third")).await.unwrap_err();
        assert!(err.to_string().contains("concurrency limit reached"));
        assert!(err.is_retriable());

        let first = first.await.unwrap().unwrap();
        assert_eq!(first.stdout, "slow\n");

        let fourth = gateway.execute(sh_request("echo fourth")).await.unwrap();
        assert_eq!(fourth.stdout, "fourth\n");

        let second = second.await.unwrap().unwrap();
        assert!(second.success());
        assert_eq!(gateway.running(), 0);
    }

    #[tokio::test]
    async fn test_scenario_timeout_clamped_and_killed() {
        let gateway = sh_gateway(PolicyUpdate {
            max_timeout_secs: Some(5),
            ..Default::default()
        });
        assert_eq!(gateway.clamp_timeout(Some(9999.0), 300), Duration::from_secs(5));

        let mut request = sh_request("echo started; sleep 10");
        request.timeout_secs = Some(9999.0);
        let started = std::time::Instant::now();
        let outcome = gateway.execute(request).await.unwrap();

        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.stdout, "started\n");
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_with_default_spec_completes() {
        let gateway = sh_gateway(PolicyUpdate::default());
        let outcome = gateway
            .run(RunSpec {
                args: vec!["-c".to_string(), "sleep 0.2; echo hi".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.stdout, "hi\n");
    }

    #[tokio::test]
    async fn test_run_timeout_bounded_by_policy_cap() {
        let gateway = sh_gateway(PolicyUpdate {
            max_timeout_secs: Some(1),
            ..Default::default()
        });
        let started = std::time::Instant::now();
        let outcome = gateway
            .run(RunSpec {
                args: vec!["-c".to_string(), "sleep 10".to_string()],
                timeout: Duration::from_secs(3600),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_blocked_mode_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ran");
        let gateway = sh_gateway(PolicyUpdate::default());

        let mut request = sh_request(&format!("touch {}", marker.display()));
        request.mode = Some("full".to_string());
        let err = gateway.execute(request).await.unwrap_err();

        assert!(err.is_policy_rejection());
        assert!(!marker.exists());
        assert_eq!(gateway.running(), 0);
    }

    #[tokio::test]
    async fn test_workdir_required_to_be_allowlisted() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = sh_gateway(PolicyUpdate::default());

        let mut request = sh_request("pwd");
        request.workdir = Some(dir.path().to_string_lossy().into_owned());
        let err = gateway.execute(request).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAllowlist { .. }));
    }

    #[tokio::test]
    async fn test_execute_in_allowed_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir(root.join("app")).unwrap();
        let gateway = sh_gateway(PolicyUpdate {
            allowed_paths: Some(vec![root.to_string_lossy().into_owned()]),
            blocked_modes: Some(vec![]),
            ..Default::default()
        });

        let mut request = sh_request("pwd -P");
        request.workdir = Some(format!("{}/app/", root.display()));
        request.mode = Some("full".to_string());
        let outcome = gateway.execute(request).await.unwrap();
        assert_eq!(outcome.stdout.trim(), root.join("app").to_str().unwrap());
    }

    #[tokio::test]
    async fn test_policy_replacement_applies_to_next_run() {
        let gateway = sh_gateway(PolicyUpdate {
            max_concurrent: Some(1),
            ..Default::default()
        });
        let held = gateway.runner.slots().try_acquire(1).unwrap();
        assert!(gateway.execute(sh_request("true")).await.is_err());

        gateway.set_policy(PolicyUpdate {
            max_concurrent: Some(2),
            ..Default::default()
        });
        let outcome = gateway.execute(sh_request("echo ok")).await.unwrap();
        assert_eq!(outcome.stdout, "ok\n");
        drop(held);
    }

    #[tokio::test]
    async fn test_many_parallel_requests_respect_cap() {
        let gateway = sh_gateway(PolicyUpdate {
            max_concurrent: Some(3),
            ..Default::default()
        });
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let gateway = gateway.clone();
                tokio::spawn(async move { gateway.execute(sh_request("sleep 1")).await })
            })
            .collect();
        let results = futures::future::join_all(tasks).await;
        let succeeded = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| r.is_ok())
            .count();
        assert_eq!(succeeded, 3);
        assert_eq!(gateway.running(), 0);
    }
}
