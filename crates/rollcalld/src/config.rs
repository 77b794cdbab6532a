use anyhow::{Context, Result};
use rollcall_core::DEFAULT_MATCH_THRESHOLD;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Daemon configuration.
///
/// Values come from an optional TOML file named by `ROLLCALL_CONFIG`, then
/// `ROLLCALL_*` environment variables override them.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Enrollment root: one directory per identity.
    pub enroll_dir: PathBuf,
    /// Path to the SQLite attendance ledger.
    pub ledger_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// External embedding extractor, as a whitespace-separated command line.
    pub embedder_command: Option<String>,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

/// Optional on-disk configuration; every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    enroll_dir: Option<PathBuf>,
    ledger_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    embedder_command: Option<String>,
    system_bus: Option<bool>,
}

impl FileConfig {
    fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }
}

impl Config {
    /// Load configuration from the config file (if any) and the process environment.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => FileConfig::read(Path::new(&path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = env("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let enroll_dir = env("ROLLCALL_ENROLL_DIR")
            .map(PathBuf::from)
            .or(file.enroll_dir)
            .unwrap_or_else(|| data_dir.join("database"));

        let ledger_path = env("ROLLCALL_LEDGER_PATH")
            .map(PathBuf::from)
            .or(file.ledger_path)
            .unwrap_or_else(|| data_dir.join("attendance.db"));

        let match_threshold = env("ROLLCALL_MATCH_THRESHOLD")
            .and_then(|v| v.parse().ok())
            .or(file.match_threshold)
            .filter(|t: &f32| t.is_finite() && *t > 0.0)
            .unwrap_or(DEFAULT_MATCH_THRESHOLD);

        Self {
            enroll_dir,
            ledger_path,
            match_threshold,
            embedder_command: env("ROLLCALL_EMBEDDER_COMMAND")
                .or(file.embedder_command)
                .filter(|c| !c.trim().is_empty()),
            system_bus: env("ROLLCALL_SYSTEM_BUS")
                .map(|v| v != "0")
                .or(file.system_bus)
                .unwrap_or(false),
        }
    }
}
