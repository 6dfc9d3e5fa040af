//
// config.rs
//
// Configuration for test item execution
//

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Name of the runner script inside the test runner environment
pub const RUNNER_SCRIPT: &str = "runtestitem.jl";

/// Test item execution configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TestItemsConfig {
    /// Julia executable used to run test items
    pub julia_executable: PathBuf,
    /// Julia environment containing runtestitem.jl; `None` uses the data directory default
    pub testrunner_dir: Option<PathBuf>,
    /// Upper bound for a single test item run; `None` waits indefinitely
    pub run_timeout: Option<Duration>,
    /// Delay before drawing into a view that is still loading
    pub focus_delay: Duration,
}

impl Default for TestItemsConfig {
    fn default() -> Self {
        Self {
            julia_executable: PathBuf::from("julia"),
            testrunner_dir: None,
            run_timeout: None,
            focus_delay: Duration::from_millis(50),
        }
    }
}

impl TestItemsConfig {
    /// Test runner environment, falling back to `<data dir>/LSP-julia/testrunner`
    pub fn resolve_testrunner_dir(&self) -> PathBuf {
        self.testrunner_dir
            .clone()
            .or_else(default_testrunner_dir)
            .unwrap_or_else(|| PathBuf::from("testrunner"))
    }

    /// Check if settings relevant to running processes changed
    pub fn runner_settings_changed(&self, other: &Self) -> bool {
        self.julia_executable != other.julia_executable
            || self.testrunner_dir != other.testrunner_dir
            || self.run_timeout != other.run_timeout
    }
}

#[cfg(unix)]
fn default_testrunner_dir() -> Option<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("LSP-julia").ok()?;
    Some(dirs.get_data_home().join("testrunner"))
}

#[cfg(not(unix))]
fn default_testrunner_dir() -> Option<PathBuf> {
    let app_data = std::env::var_os("APPDATA")?;
    Some(PathBuf::from(app_data).join("LSP-julia").join("testrunner"))
}

fn valid_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() || value.contains('\0') {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

/// Apply editor settings on top of `base`.
///
/// Reads `julia_executable_path` and the `testitems` section
/// (`testrunnerDir`, `runTimeoutMs`, `focusDelayMs`). Absent or invalid
/// values keep the value from `base`.
pub fn parse_testitems_config(settings: &serde_json::Value, base: TestItemsConfig) -> TestItemsConfig {
    let mut config = base;

    if let Some(path) = settings
        .get("julia_executable_path")
        .and_then(|v| v.as_str())
        .and_then(valid_path)
    {
        config.julia_executable = path;
    }

    if let Some(testitems) = settings.get("testitems") {
        if let Some(dir) = testitems
            .get("testrunnerDir")
            .and_then(|v| v.as_str())
            .and_then(valid_path)
        {
            config.testrunner_dir = Some(dir);
        }
        match testitems.get("runTimeoutMs") {
            Some(serde_json::Value::Null) => config.run_timeout = None,
            Some(v) => {
                if let Some(ms) = v.as_u64() {
                    config.run_timeout = (ms > 0).then(|| Duration::from_millis(ms));
                }
            }
            None => {}
        }
        if let Some(ms) = testitems.get("focusDelayMs").and_then(|v| v.as_u64()) {
            config.focus_delay = Duration::from_millis(ms);
        }
    }

    log::info!("Test item configuration loaded from settings:");
    log::info!("  julia_executable: {:?}", config.julia_executable);
    log::info!("  testrunner_dir: {:?}", config.testrunner_dir);
    log::info!("  run_timeout: {:?}", config.run_timeout);
    log::info!("  focus_delay: {:?}", config.focus_delay);

    config
}

/// Read a JSON settings file and apply it on top of `base`.
pub fn load_settings_file(path: &Path, base: TestItemsConfig) -> Result<TestItemsConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    let settings: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Invalid JSON in settings file {}", path.display()))?;
    Ok(parse_testitems_config(&settings, base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = TestItemsConfig::default();
        assert_eq!(config.julia_executable, PathBuf::from("julia"));
        assert_eq!(config.testrunner_dir, None);
        assert_eq!(config.run_timeout, None);
        assert_eq!(config.focus_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_parse_full_settings() {
        let settings = json!({
            "julia_executable_path": "/opt/julia/bin/julia",
            "testitems": {
                "testrunnerDir": "/data/testrunner",
                "runTimeoutMs": 60000,
                "focusDelayMs": 10
            }
        });
        let config = parse_testitems_config(&settings, TestItemsConfig::default());
        assert_eq!(config.julia_executable, PathBuf::from("/opt/julia/bin/julia"));
        assert_eq!(config.testrunner_dir, Some(PathBuf::from("/data/testrunner")));
        assert_eq!(config.run_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.focus_delay, Duration::from_millis(10));
        assert_eq!(
            config.resolve_testrunner_dir(),
            PathBuf::from("/data/testrunner")
        );
    }

    #[test]
    fn test_invalid_values_keep_base() {
        let settings = json!({
            "julia_executable_path": "",
            "testitems": {
                "testrunnerDir": "bad\u{0}path",
                "runTimeoutMs": "soon",
                "focusDelayMs": -1
            }
        });
        let config = parse_testitems_config(&settings, TestItemsConfig::default());
        assert_eq!(config, TestItemsConfig::default());
    }

    #[test]
    fn test_zero_or_null_timeout_disables_it() {
        let base = TestItemsConfig {
            run_timeout: Some(Duration::from_secs(5)),
            ..TestItemsConfig::default()
        };
        let config = parse_testitems_config(&json!({"testitems": {"runTimeoutMs": 0}}), base.clone());
        assert_eq!(config.run_timeout, None);
        let config = parse_testitems_config(&json!({"testitems": {"runTimeoutMs": null}}), base);
        assert_eq!(config.run_timeout, None);
    }

    #[test]
    fn test_runner_settings_changed() {
        let a = TestItemsConfig::default();
        let mut b = a.clone();
        b.focus_delay = Duration::from_millis(5);
        assert!(!a.runner_settings_changed(&b));
        b.julia_executable = PathBuf::from("julia-1.10");
        assert!(a.runner_settings_changed(&b));
    }

    #[test]
    fn test_load_settings_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"julia_executable_path": "/usr/local/bin/julia"}}"#).unwrap();
        let config = load_settings_file(file.path(), TestItemsConfig::default()).unwrap();
        assert_eq!(config.julia_executable, PathBuf::from("/usr/local/bin/julia"));
    }

    #[test]
    fn test_load_settings_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.json");
        let err = load_settings_file(&missing, TestItemsConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Failed to read settings file"));

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        let err = load_settings_file(&bad, TestItemsConfig::default()).unwrap_err();
        assert!(err.to_string().contains("Invalid JSON"));
    }
}
