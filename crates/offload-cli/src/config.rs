//! Benchmark configuration: TOML file, `OFFLOAD_BENCH_*` environment
//! overrides, then command-line flags.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// File picked up from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "offload-bench.toml";

/// Prefix of recognised environment variables.
pub const ENV_PREFIX: &str = "OFFLOAD_BENCH_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid environment variable {key}: {value:?}")]
    Env { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Device runtime a run executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process simulated device.
    #[default]
    Sim,
    /// Native OpenCL (requires the `opencl` feature).
    Opencl,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sim => write!(f, "sim"),
            Self::Opencl => write!(f, "opencl"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sim" => Ok(Self::Sim),
            "opencl" => Ok(Self::Opencl),
            other => Err(format!("unknown backend '{other}'. Expected one of: sim, opencl")),
        }
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'. Expected one of: pretty, compact, json")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "warn".into(), format: LogFormat::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Matrix dimension.
    pub size: usize,
    /// Measured iterations per run.
    pub iterations: usize,
    /// Unreported runs before the measured one.
    pub warmup: usize,
    pub backend: Backend,
    /// Exact device name to select. First available device when unset.
    pub device: Option<String>,
    /// Artificial per-command latency on the simulated device.
    pub latency_ms: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            size: 64,
            iterations: 500,
            warmup: 0,
            backend: Backend::default(),
            device: None,
            latency_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub run: RunConfig,
    pub logging: LoggingConfig,
}

impl BenchConfig {
    /// Read a TOML file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        toml::from_str(&text).map_err(|source| ConfigError::Toml { path: path.to_owned(), source })
    }

    /// Load from `explicit`, or from [`DEFAULT_CONFIG_FILE`] in `dir` if it
    /// exists, or fall back to defaults. An explicit path must exist.
    pub fn discover(explicit: Option<&Path>, dir: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            info!(path = %path.display(), "loading configuration");
            return Self::from_file(path);
        }
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.is_file() {
            info!(path = %candidate.display(), "loading configuration");
            Self::from_file(&candidate)
        } else {
            debug!("no configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Reject values no run can use.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.size == 0 {
            return Err(ConfigError::Validation("size must be greater than zero".into()));
        }
        if self.run.iterations == 0 {
            return Err(ConfigError::Validation("iterations must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Applies `OFFLOAD_BENCH_*` variables onto a configuration.
///
/// Recognised variables:
/// - `OFFLOAD_BENCH_SIZE`
/// - `OFFLOAD_BENCH_ITERATIONS`
/// - `OFFLOAD_BENCH_WARMUP`
/// - `OFFLOAD_BENCH_BACKEND` (`sim` / `opencl`)
/// - `OFFLOAD_BENCH_DEVICE`
/// - `OFFLOAD_BENCH_LATENCY_MS`
/// - `OFFLOAD_BENCH_LOG_LEVEL`
/// - `OFFLOAD_BENCH_LOG_FORMAT` (`pretty` / `compact` / `json`)
#[derive(Debug, Clone)]
pub struct EnvParser {
    prefix: String,
}

impl Default for EnvParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvParser {
    pub fn new() -> Self {
        Self::with_prefix(ENV_PREFIX)
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Apply the process environment.
    pub fn apply_env(&self, config: &mut BenchConfig) -> Result<(), ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().filter(|(k, _)| k.starts_with(&self.prefix)).collect();
        self.apply_from_map(config, &vars)
    }

    /// Apply variables from an explicit map (testable without touching the
    /// real environment).
    pub fn apply_from_map(&self, config: &mut BenchConfig, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        if let Some(v) = self.get(vars, "SIZE") {
            config.run.size = self.parse("SIZE", v)?;
        }
        if let Some(v) = self.get(vars, "ITERATIONS") {
            config.run.iterations = self.parse("ITERATIONS", v)?;
        }
        if let Some(v) = self.get(vars, "WARMUP") {
            config.run.warmup = self.parse("WARMUP", v)?;
        }
        if let Some(v) = self.get(vars, "BACKEND") {
            config.run.backend = self.parse("BACKEND", v)?;
        }
        if let Some(v) = self.get(vars, "DEVICE") {
            config.run.device = (!v.is_empty()).then(|| v.clone());
        }
        if let Some(v) = self.get(vars, "LATENCY_MS") {
            config.run.latency_ms = self.parse("LATENCY_MS", v)?;
        }
        if let Some(v) = self.get(vars, "LOG_LEVEL") {
            config.logging.level = v.to_lowercase();
        }
        if let Some(v) = self.get(vars, "LOG_FORMAT") {
            config.logging.format = self.parse("LOG_FORMAT", v)?;
        }
        Ok(())
    }

    fn get<'a>(&self, vars: &'a HashMap<String, String>, name: &str) -> Option<&'a String> {
        vars.get(&format!("{}{name}", self.prefix))
    }

    fn parse<T: FromStr>(&self, name: &str, value: &str) -> Result<T, ConfigError> {
        value.trim().parse().map_err(|_| ConfigError::Env {
            key: format!("{}{name}", self.prefix),
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = BenchConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.run.backend, Backend::Sim);
        assert_eq!(cfg.run.iterations, 500);
    }

    #[test]
    fn validation_rejects_zero_size_and_iterations() {
        let mut cfg = BenchConfig::default();
        cfg.run.size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
        let mut cfg = BenchConfig::default();
        cfg.run.iterations = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[run]\nsize = 16\nbackend = \"sim\"\n\n[logging]\nformat = \"json\"").unwrap();
        let cfg = BenchConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.run.size, 16);
        assert_eq!(cfg.run.iterations, 500);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.logging.level, "warn");
    }

    #[test]
    fn malformed_toml_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[run]\nsize = \"many\"").unwrap();
        let err = BenchConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn discover_uses_working_directory_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_FILE), "[run]\niterations = 7\n").unwrap();
        let cfg = BenchConfig::discover(None, dir.path()).unwrap();
        assert_eq!(cfg.run.iterations, 7);
    }

    #[test]
    fn discover_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(BenchConfig::discover(None, dir.path()).unwrap(), BenchConfig::default());
    }

    #[test]
    fn discover_requires_explicit_file_to_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = BenchConfig::discover(Some(&missing), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn env_map_overrides_fields() {
        let mut cfg = BenchConfig::default();
        EnvParser::new()
            .apply_from_map(
                &mut cfg,
                &vars(&[
                    ("OFFLOAD_BENCH_SIZE", "32"),
                    ("OFFLOAD_BENCH_ITERATIONS", " 9 "),
                    ("OFFLOAD_BENCH_BACKEND", "OpenCL"),
                    ("OFFLOAD_BENCH_DEVICE", "GeForce GT 650M"),
                    ("OFFLOAD_BENCH_LOG_LEVEL", "DEBUG"),
                    ("OFFLOAD_BENCH_LOG_FORMAT", "compact"),
                    ("UNRELATED", "1"),
                ]),
            )
            .unwrap();
        assert_eq!(cfg.run.size, 32);
        assert_eq!(cfg.run.iterations, 9);
        assert_eq!(cfg.run.backend, Backend::Opencl);
        assert_eq!(cfg.run.device.as_deref(), Some("GeForce GT 650M"));
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, LogFormat::Compact);
    }

    #[test]
    fn env_map_rejects_garbage() {
        let mut cfg = BenchConfig::default();
        let err = EnvParser::new()
            .apply_from_map(&mut cfg, &vars(&[("OFFLOAD_BENCH_SIZE", "large")]))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid environment variable OFFLOAD_BENCH_SIZE: \"large\"");
    }

    #[test]
    fn custom_prefix() {
        let mut cfg = BenchConfig::default();
        EnvParser::with_prefix("X_").apply_from_map(&mut cfg, &vars(&[("X_WARMUP", "3")])).unwrap();
        assert_eq!(cfg.run.warmup, 3);
    }

    #[test]
    #[serial]
    fn process_environment_is_applied() {
        temp_env::with_vars(
            [("OFFLOAD_BENCH_ITERATIONS", Some("11")), ("OFFLOAD_BENCH_LATENCY_MS", Some("2"))],
            || {
                let mut cfg = BenchConfig::default();
                EnvParser::new().apply_env(&mut cfg).unwrap();
                assert_eq!(cfg.run.iterations, 11);
                assert_eq!(cfg.run.latency_ms, 2);
            },
        );
    }

    #[test]
    #[serial]
    fn empty_device_variable_clears_selection() {
        temp_env::with_var("OFFLOAD_BENCH_DEVICE", Some(""), || {
            let mut cfg = BenchConfig::default();
            cfg.run.device = Some("from-file".into());
            EnvParser::new().apply_env(&mut cfg).unwrap();
            assert!(cfg.run.device.is_none());
        });
    }
}
