//! Built-in collaborator implementations.
//!
//! - [`SimulatedRuntime`] answers every call with synthetic output, for dry
//!   runs and tests.
//! - [`CommandRuntime`] runs an external program per task (live mode).
//! - [`CommandValidator`] and [`NonEmptyValidator`] judge task output.
//! - [`WorkerRemediation`] routes remediation calls to a dedicated worker.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as ProcessCommand;

use super::worker::{
    OutputValidator, RemediationRuntime, StopSignal, ValidationVerdict, WorkerDescriptor,
    WorkerRequest, WorkerResponse, WorkerRuntime,
};
use crate::core::{Config, EngineError, EngineResult};

/// Environment variable carrying the worker id to live commands.
pub const WORKER_ID_ENV: &str = "AGENTRUN_WORKER_ID";

/// Environment variable carrying the task id to live commands.
pub const TASK_ID_ENV: &str = "AGENTRUN_TASK_ID";

/// Environment variable carrying the requirement id to live commands.
pub const REQUIREMENT_ID_ENV: &str = "AGENTRUN_REQUIREMENT_ID";

/// Runtime that succeeds with synthetic output.
#[derive(Debug, Clone, Default)]
pub struct SimulatedRuntime {
    latency: Duration,
    consumption: u64,
}

impl SimulatedRuntime {
    /// Create a runtime that answers immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long before answering.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Report this consumption for every call.
    #[must_use]
    pub fn with_consumption(mut self, units: u64) -> Self {
        self.consumption = units;
        self
    }
}

#[async_trait]
impl WorkerRuntime for SimulatedRuntime {
    async fn execute(&self, request: WorkerRequest) -> WorkerResponse {
        if !self.latency.is_zero() {
            let mut stop = request.stop.clone();
            tokio::select! {
                () = tokio::time::sleep(self.latency) => {}
                () = stop.stopped() => return WorkerResponse::failure("stopped before completion"),
            }
        }
        let headline = request.input.lines().next().unwrap_or_default().trim();
        WorkerResponse::success(format!(
            "[{}] completed {}: {}",
            request.worker_id, request.task_id, headline
        ))
        .with_consumption(self.consumption)
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

/// Captured result of one child process.
#[derive(Debug)]
struct ProcessOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

async fn run_process(
    program: &str,
    args: &[String],
    env: &[(&str, &str)],
    input: &str,
    stop: &mut StopSignal,
) -> std::io::Result<Option<ProcessOutput>> {
    let mut cmd = ProcessCommand::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take();
    let bytes = input.as_bytes().to_vec();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            // A child that never reads its input is not an error
            let _ = stdin.write_all(&bytes).await;
        }
    };

    let run = async {
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    tokio::select! {
        output = run => {
            let output = output?;
            Ok(Some(ProcessOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }))
        }
        () = stop.stopped() => Ok(None),
    }
}

/// Runs an external program for every task.
///
/// The rendered task input goes to stdin. Exit status 0 is success with
/// stdout as output; 126/127 (not executable, not found) are fatal; any
/// other status is a retryable failure with stderr as diagnostics.
#[derive(Debug, Clone)]
pub struct CommandRuntime {
    program: String,
    args: Vec<String>,
    overrides: HashMap<String, String>,
}

impl CommandRuntime {
    /// Create a runtime running `program` with `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args, overrides: HashMap::new() }
    }

    /// Use each worker's own `command` where it declares one.
    #[must_use]
    pub fn with_worker_commands(mut self, workers: &[WorkerDescriptor]) -> Self {
        for worker in workers {
            if let Some(command) = &worker.command {
                self.overrides.insert(worker.id.clone(), command.clone());
            }
        }
        self
    }

    /// Build from the `[runtime]` section and worker roster.
    pub fn from_config(config: &Config) -> EngineResult<Self> {
        let program = config
            .runtime
            .command
            .clone()
            .ok_or_else(|| EngineError::Config("live mode requires runtime.command".into()))?;
        Ok(Self::new(program, config.runtime.args.clone()).with_worker_commands(&config.worker_roster()))
    }

    fn program_for(&self, worker_id: &str) -> &str {
        self.overrides.get(worker_id).map_or(self.program.as_str(), String::as_str)
    }
}

#[async_trait]
impl WorkerRuntime for CommandRuntime {
    async fn execute(&self, request: WorkerRequest) -> WorkerResponse {
        let program = self.program_for(&request.worker_id);
        let env = [
            (WORKER_ID_ENV, request.worker_id.as_str()),
            (TASK_ID_ENV, request.task_id.as_str()),
            (REQUIREMENT_ID_ENV, request.requirement_id.as_str()),
        ];
        let mut stop = request.stop.clone();

        tracing::debug!(task = %request.task_id, program = %program, "Spawning worker process");
        match run_process(program, &self.args, &env, &request.input, &mut stop).await {
            Ok(Some(out)) => match out.code {
                Some(0) => {
                    let consumption = out.stdout.len() as u64;
                    WorkerResponse { diagnostics: out.stderr, ..WorkerResponse::success(out.stdout) }
                        .with_consumption(consumption)
                }
                Some(code @ (126 | 127)) => {
                    WorkerResponse::fatal(format!("{program} exited with status {code}: {}", out.stderr.trim()))
                }
                code => {
                    let detail = if out.stderr.trim().is_empty() { out.stdout } else { out.stderr };
                    let status = code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}"));
                    WorkerResponse::failure(format!("{program} exited with {status}: {}", detail.trim()))
                }
            },
            Ok(None) => WorkerResponse::failure("stopped before completion"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                WorkerResponse::fatal(format!("{program} not found"))
            }
            Err(e) => WorkerResponse::fatal(format!("failed to run {program}: {e}")),
        }
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Passes output that is not blank.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonEmptyValidator;

#[async_trait]
impl OutputValidator for NonEmptyValidator {
    async fn validate(&self, _request: &WorkerRequest, output: &str) -> ValidationVerdict {
        if output.trim().is_empty() {
            ValidationVerdict::fail("worker produced no output")
        } else {
            ValidationVerdict::pass()
        }
    }
}

/// Runs a validation program with the task output on stdin.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    program: String,
    args: Vec<String>,
}

impl CommandValidator {
    /// Create a validator.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self { program: program.into(), args }
    }

    /// Build from `runtime.validation_command`, if set.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .runtime
            .validation_command
            .as_ref()
            .map(|program| Self::new(program.clone(), config.runtime.validation_args.clone()))
    }
}

#[async_trait]
impl OutputValidator for CommandValidator {
    async fn validate(&self, request: &WorkerRequest, output: &str) -> ValidationVerdict {
        let env = [
            (WORKER_ID_ENV, request.worker_id.as_str()),
            (TASK_ID_ENV, request.task_id.as_str()),
            (REQUIREMENT_ID_ENV, request.requirement_id.as_str()),
        ];
        let mut stop = request.stop.clone();
        match run_process(&self.program, &self.args, &env, output, &mut stop).await {
            Ok(Some(out)) if out.code == Some(0) => {
                ValidationVerdict { passed: true, notes: out.stdout.trim().to_string() }
            }
            Ok(Some(out)) => {
                let notes = if out.stderr.trim().is_empty() { out.stdout } else { out.stderr };
                ValidationVerdict::fail(notes.trim())
            }
            Ok(None) => ValidationVerdict::fail("validation interrupted"),
            Err(e) => ValidationVerdict::fail(format!("failed to run {}: {e}", self.program)),
        }
    }
}

/// Sends remediation requests to a dedicated worker on a runtime.
#[derive(Clone)]
pub struct WorkerRemediation {
    runtime: Arc<dyn WorkerRuntime>,
    worker_id: String,
}

impl std::fmt::Debug for WorkerRemediation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRemediation")
            .field("runtime", &self.runtime.name())
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl WorkerRemediation {
    /// Route remediation to `worker_id` on `runtime`.
    pub fn new(runtime: Arc<dyn WorkerRuntime>, worker_id: impl Into<String>) -> Self {
        Self { runtime, worker_id: worker_id.into() }
    }
}

#[async_trait]
impl RemediationRuntime for WorkerRemediation {
    async fn remediate(&self, request: WorkerRequest) -> WorkerResponse {
        let input = format!(
            "Task {} on worker {} keeps failing. Diagnose the failure and describe a fix.\n\n{}",
            request.task_id, request.worker_id, request.input
        );
        self.runtime
            .execute(WorkerRequest { worker_id: self.worker_id.clone(), input, ..request })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::watch;

    fn request(input: &str) -> WorkerRequest {
        WorkerRequest {
            task_id: "TASK-001".into(),
            requirement_id: "REQ-001".into(),
            worker_id: "backend".into(),
            input: input.into(),
            timeout: Duration::from_secs(5),
            attempt: 1,
            stop: StopSignal::never(),
        }
    }

    #[tokio::test]
    async fn test_simulated_runtime_output() {
        let runtime = SimulatedRuntime::new().with_consumption(40);
        let response = runtime.execute(request("Build the API\nmore detail")).await;
        assert!(response.success);
        assert_eq!(response.output, "[backend] completed TASK-001: Build the API");
        assert_eq!(response.consumption, 40);
    }

    #[tokio::test]
    async fn test_simulated_runtime_honors_stop() {
        let (tx, rx) = watch::channel(false);
        let runtime = SimulatedRuntime::new().with_latency(Duration::from_secs(30));
        let mut req = request("x");
        req.stop = StopSignal::new(rx);

        let handle = tokio::spawn(async move { runtime.execute(req).await });
        tx.send_replace(true);
        let response = handle.await.unwrap();
        assert!(!response.success);
    }

    #[tokio::test]
    async fn test_non_empty_validator() {
        let req = request("x");
        assert!(NonEmptyValidator.validate(&req, "done").await.passed);
        assert!(!NonEmptyValidator.validate(&req, "  \n").await.passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runtime_success_and_failure() {
        let runtime = CommandRuntime::new("sh", vec!["-c".into(), "cat; echo \" by $AGENTRUN_WORKER_ID\"".into()]);
        let response = runtime.execute(request("hello")).await;
        assert!(response.success, "{response:?}");
        assert_eq!(response.output.trim(), "hello by backend");
        assert_eq!(response.consumption, response.output.len() as u64);

        let failing = CommandRuntime::new("sh", vec!["-c".into(), "echo broken >&2; exit 3".into()]);
        let response = failing.execute(request("x")).await;
        assert!(!response.success);
        assert!(!response.fatal);
        assert!(response.diagnostics.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_runtime_missing_program_is_fatal() {
        let runtime = CommandRuntime::new("agentrun-definitely-missing-program", Vec::new());
        let response = runtime.execute(request("x")).await;
        assert!(response.fatal);
        assert!(matches!(response.into_outcome(), crate::workflow::TaskOutcome::FatalError { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_command_override() {
        let workers = vec![WorkerDescriptor::new("backend", ["api"]).with_command("true")];
        let runtime = CommandRuntime::new("false", Vec::new()).with_worker_commands(&workers);
        assert!(runtime.execute(request("x")).await.success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_validator() {
        let validator = CommandValidator::new("sh", vec!["-c".into(), "grep -q ok".into()]);
        assert!(validator.validate(&request("x"), "all ok").await.passed);
        assert!(!validator.validate(&request("x"), "nope").await.passed);
    }

    #[tokio::test]
    async fn test_remediation_uses_dedicated_worker() {
        let remediation = WorkerRemediation::new(Arc::new(SimulatedRuntime::new()), "remediator");
        let response = remediation.remediate(request("Build the API")).await;
        assert!(response.output.starts_with("[remediator] completed TASK-001: Task TASK-001"));
    }

    #[test]
    fn test_from_config_requires_command() {
        let config = Config::default();
        assert!(CommandRuntime::from_config(&config).is_err());
        assert!(CommandValidator::from_config(&config).is_none());
    }
}
