//! Layering of defaults, configuration files and environment overrides.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use switchyard_config::{
    CONFIG_PATH_ENV, Config, ConfigError, DEFAULT_DISPATCH_LOOP_LIMIT, DEFAULT_LOG_FILTER,
    DISPATCH_LOOP_LIMIT_ENV, LOG_FILTER_ENV, LOG_FORMAT_ENV, LogFormat, MAX_POLL_INTERVAL_ENV,
};

const LAYERED_VARIABLES: &[&str] = &[
    CONFIG_PATH_ENV,
    LOG_FILTER_ENV,
    LOG_FORMAT_ENV,
    DISPATCH_LOOP_LIMIT_ENV,
    MAX_POLL_INTERVAL_ENV,
];

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Serialises environment mutation and restores every touched variable.
struct Environment {
    saved: Vec<(&'static str, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl Environment {
    fn isolated() -> Self {
        let guard = ENV_MUTEX
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut environment = Self {
            saved: Vec::new(),
            _guard: guard,
        };
        for key in LAYERED_VARIABLES {
            environment.remember(key);
            // Environment mutation is unsafe on edition 2024; the mutex keeps
            // these tests from racing one another.
            unsafe { std::env::remove_var(key) };
        }
        environment
    }

    fn remember(&mut self, key: &'static str) {
        if self.saved.iter().all(|(saved, _)| *saved != key) {
            self.saved.push((key, std::env::var_os(key)));
        }
    }

    fn set(&mut self, key: &'static str, value: impl AsRef<OsStr>) {
        self.remember(key);
        unsafe { std::env::set_var(key, value) };
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        while let Some((key, value)) = self.saved.pop() {
            match value {
                Some(previous) => unsafe { std::env::set_var(key, previous) },
                None => unsafe { std::env::remove_var(key) },
            }
        }
    }
}

struct Workspace {
    environment: Environment,
    dir: TempDir,
}

impl Workspace {
    fn write_config(&mut self, contents: &str) {
        let path = self.dir.path().join("switchyard.toml");
        fs::write(&path, contents).expect("write configuration file");
        self.environment.set(CONFIG_PATH_ENV, path.as_os_str());
    }
}

#[fixture]
fn workspace() -> Workspace {
    Workspace {
        environment: Environment::isolated(),
        dir: TempDir::new().expect("create temporary directory"),
    }
}

#[rstest]
fn defaults_apply_without_any_layer(#[from(workspace)] _workspace: Workspace) {
    let config = Config::from_env().expect("defaults should load");
    assert_eq!(config, Config::default());
}

#[rstest]
fn file_values_replace_defaults(mut workspace: Workspace) {
    workspace.write_config("dispatch_loop_limit = 3\nlog_format = \"compact\"\n");

    let config = Config::from_env().expect("file should load");
    assert_eq!(config.dispatcher().dispatch_loop_limit(), 3);
    assert_eq!(config.log_format(), LogFormat::Compact);
    assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
}

#[rstest]
fn environment_overrides_the_file(mut workspace: Workspace) {
    workspace.write_config("dispatch_loop_limit = 3\nlog_filter = \"warn\"\n");
    workspace.environment.set(DISPATCH_LOOP_LIMIT_ENV, "7");

    let config = Config::from_env().expect("layers should merge");
    assert_eq!(config.dispatcher().dispatch_loop_limit(), 7);
    assert_eq!(config.log_filter(), "warn");
}

#[rstest]
fn zero_poll_interval_from_the_environment_is_clamped(mut workspace: Workspace) {
    workspace.environment.set(MAX_POLL_INTERVAL_ENV, "0");

    let config = Config::from_env().expect("environment should load");
    assert!(!config.dispatcher().max_poll_interval().is_zero());
    assert_eq!(
        config.dispatcher().dispatch_loop_limit(),
        DEFAULT_DISPATCH_LOOP_LIMIT
    );
}

#[rstest]
#[case(LOG_FORMAT_ENV, "yaml")]
#[case(DISPATCH_LOOP_LIMIT_ENV, "-1")]
fn malformed_overrides_fail_fast(
    mut workspace: Workspace,
    #[case] variable: &'static str,
    #[case] value: &'static str,
) {
    workspace.environment.set(variable, value);

    let error = Config::from_env().expect_err("override should be rejected");
    assert!(matches!(error, ConfigError::Load { .. }));
    assert!(error.to_string().starts_with("failed to load configuration"));
}

#[rstest]
fn malformed_files_are_reported(mut workspace: Workspace) {
    workspace.write_config("dispatch_loop_limit = = 3\n");

    let error = Config::from_env().expect_err("file should be rejected");
    assert!(matches!(error, ConfigError::Load { .. }));
}
