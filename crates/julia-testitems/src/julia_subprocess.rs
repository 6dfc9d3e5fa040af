// julia_subprocess.rs - Julia subprocess interface for running test items
//
// Each test item run starts a fresh Julia process in the test runner
// environment. The run request is passed as a single JSON argument to
// runtestitem.jl, which prints the result as JSON on stdout.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::{TestItemsConfig, RUNNER_SCRIPT};
use crate::protocol::{RunTestitemRequest, TestRunResult};
use crate::resource::ResourceKey;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to serialize run request: {0}")]
    Request(#[source] serde_json::Error),
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for test process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("test process timed out after {0:?}")]
    Timeout(Duration),
    #[error("test process failed with status {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },
    #[error("malformed test process output ({source}): {stdout:?}")]
    MalformedOutput {
        #[source]
        source: serde_json::Error,
        stdout: String,
    },
    #[error("test run aborted: {0}")]
    Aborted(String),
}

/// Executes a single test item out of process
#[async_trait]
pub trait TestExecutor: Send + Sync {
    async fn run(&self, request: &RunTestitemRequest) -> Result<TestRunResult, RunnerError>;
}

impl std::fmt::Debug for dyn TestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TestExecutor")
    }
}

/// Runs test items with `julia <testrunner>/runtestitem.jl <request json>`
#[derive(Debug, Clone)]
pub struct JuliaSubprocess {
    /// Path to Julia executable
    julia_path: PathBuf,
    /// Julia environment that provides runtestitem.jl
    testrunner_dir: PathBuf,
    timeout: Option<Duration>,
}

impl JuliaSubprocess {
    pub fn new(julia_path: PathBuf, testrunner_dir: PathBuf) -> Self {
        Self {
            julia_path,
            testrunner_dir,
            timeout: None,
        }
    }

    pub fn from_config(config: &TestItemsConfig) -> Self {
        Self::new(
            config.julia_executable.clone(),
            config.resolve_testrunner_dir(),
        )
        .with_timeout(config.run_timeout)
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn julia_path(&self) -> &Path {
        &self.julia_path
    }

    /// Command line arguments following the executable
    pub fn command_args(&self, params_json: &str) -> Vec<OsString> {
        let mut project = OsString::from("--project=");
        project.push(&self.testrunner_dir);
        vec![
            OsString::from("--startup-file=no"),
            OsString::from("--history-file=no"),
            project,
            self.testrunner_dir.join(RUNNER_SCRIPT).into_os_string(),
            OsString::from(params_json),
        ]
    }

    fn working_dir(request: &RunTestitemRequest) -> Option<PathBuf> {
        let key = ResourceKey::from_uri(&request.uri);
        key.parent_dir()
            .filter(|dir| dir.is_dir())
            .map(Path::to_path_buf)
    }
}

#[async_trait]
impl TestExecutor for JuliaSubprocess {
    async fn run(&self, request: &RunTestitemRequest) -> Result<TestRunResult, RunnerError> {
        let start = std::time::Instant::now();
        let params_json = serde_json::to_string(request).map_err(RunnerError::Request)?;

        let mut cmd = Command::new(&self.julia_path);
        cmd.args(self.command_args(&params_json));
        if let Some(wd) = Self::working_dir(request) {
            cmd.current_dir(wd);
        }
        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW
            cmd.creation_flags(0x0800_0000);
        }
        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            executable: self.julia_path.display().to_string(),
            source,
        })?;
        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| RunnerError::Timeout(timeout))?,
            None => child.wait_with_output().await,
        }
        .map_err(RunnerError::Wait)?;

        log::trace!(
            "Test item '{}' process finished in {:?} with {}",
            request.name,
            start.elapsed(),
            output.status
        );

        if !output.status.success() {
            return Err(RunnerError::Failed {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        parse_run_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse the stdout of runtestitem.jl.
///
/// The whole output is expected to be the result object. Julia packages
/// sometimes print to stdout while loading, so the last non-empty line is
/// tried as a fallback.
pub fn parse_run_output(stdout: &str) -> Result<TestRunResult, RunnerError> {
    match serde_json::from_str(stdout.trim()) {
        Ok(result) => Ok(result),
        Err(err) => stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line.trim()).ok())
            .ok_or_else(|| RunnerError::MalformedOutput {
                source: err,
                stdout: stdout.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TestItemStatus;
    use tower_lsp::lsp_types::Url;

    fn request() -> RunTestitemRequest {
        RunTestitemRequest {
            uri: Url::parse("file:///nonexistent/pkg/test/runtests.jl").unwrap(),
            name: "adds".to_string(),
            package_name: "Pkg".to_string(),
            use_default_usings: true,
            line: 2,
            column: 4,
            code: "@test 1 + 1 == 2".to_string(),
            project_path: "/nonexistent/pkg".to_string(),
            package_path: "/nonexistent/pkg".to_string(),
        }
    }

    #[test]
    fn test_command_args() {
        let runner = JuliaSubprocess::new(PathBuf::from("julia"), PathBuf::from("/data/testrunner"));
        let args = runner.command_args(r#"{"name":"adds"}"#);
        assert_eq!(
            args,
            vec![
                OsString::from("--startup-file=no"),
                OsString::from("--history-file=no"),
                OsString::from("--project=/data/testrunner"),
                PathBuf::from("/data/testrunner")
                    .join("runtestitem.jl")
                    .into_os_string(),
                OsString::from(r#"{"name":"adds"}"#),
            ]
        );
    }

    #[test]
    fn test_from_config() {
        let config = TestItemsConfig {
            julia_executable: PathBuf::from("/opt/julia/bin/julia"),
            testrunner_dir: Some(PathBuf::from("/data/testrunner")),
            run_timeout: Some(Duration::from_secs(3)),
            ..TestItemsConfig::default()
        };
        let runner = JuliaSubprocess::from_config(&config);
        assert_eq!(runner.julia_path(), Path::new("/opt/julia/bin/julia"));
        assert_eq!(runner.timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_working_dir_requires_existing_directory() {
        assert_eq!(JuliaSubprocess::working_dir(&request()), None);

        let dir = tempfile::tempdir().unwrap();
        let mut req = request();
        req.uri = Url::from_file_path(dir.path().join("runtests.jl")).unwrap();
        assert_eq!(
            JuliaSubprocess::working_dir(&req),
            Some(dir.path().to_path_buf())
        );
    }

    #[test]
    fn test_parse_run_output() {
        let result = parse_run_output("{\"status\":\"passed\",\"message\":null,\"duration\":42.0}\n").unwrap();
        assert_eq!(result.status, TestItemStatus::Passed);
        assert_eq!(result.duration, Some(42.0));
        assert!(result.message.is_none());
    }

    #[test]
    fn test_parse_run_output_after_noise() {
        let stdout = "Precompiling project...\n{\"status\":\"errored\",\"message\":[{\"message\":\"boom\",\"location\":null}]}\n\n";
        let result = parse_run_output(stdout).unwrap();
        assert_eq!(result.status, TestItemStatus::Errored);
        assert_eq!(result.message.unwrap()[0].message, "boom");
    }

    #[test]
    fn test_parse_run_output_malformed() {
        for stdout in ["", "   \n", "not json", "{\"status\":\"exploded\"}"] {
            let err = parse_run_output(stdout).unwrap_err();
            assert!(
                matches!(err, RunnerError::MalformedOutput { .. }),
                "unexpected error for {stdout:?}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = JuliaSubprocess::new(
            PathBuf::from("/nonexistent/bin/julia-xyz"),
            PathBuf::from("/nonexistent/testrunner"),
        );
        let err = runner.run(&request()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
        assert!(err.to_string().contains("julia-xyz"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit() {
        let runner = JuliaSubprocess::new(PathBuf::from("false"), PathBuf::from("/nonexistent"));
        let err = runner.run(&request()).await.unwrap_err();
        assert!(matches!(err, RunnerError::Failed { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_output_is_malformed() {
        let runner = JuliaSubprocess::new(PathBuf::from("true"), PathBuf::from("/nonexistent"));
        let err = runner.run(&request()).await.unwrap_err();
        assert!(matches!(err, RunnerError::MalformedOutput { .. }), "{err}");
    }
}
