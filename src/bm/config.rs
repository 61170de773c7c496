use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Resolved supervisor configuration. Built from defaults, overlaid with the
/// optional YAML config file (grouped sections, strict schema).
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interpreter used to launch the worker entry point.
    pub interpreter: String,
    /// Worker entry point script. Its file name is also the text pattern used
    /// to recognize worker processes in the OS process table.
    pub entry: PathBuf,
    /// Working directory for launched workers.
    pub working_directory: PathBuf,

    /// Root directory for per-instance log directories.
    pub logs_root: PathBuf,
    /// Log files retained per instance after rotation.
    pub retain: usize,

    /// Accounts file enumerated by the instance registry (id -> metadata).
    pub accounts_file: PathBuf,
    /// Bound on how long a registry enumeration may take.
    pub registry_timeout_ms: u64,

    /// Post-launch verification window.
    pub verify_ms: u64,
    /// Grace window after SIGTERM before escalating to SIGKILL.
    pub grace_ms: u64,
    /// Settle window after SIGKILL before declaring a stop failed.
    pub kill_settle_ms: u64,

    /// Processes shown per column in the status resource snapshot.
    pub snapshot_top: usize,
}

// -------- YAML file schema (grouped only; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkerConfigFile {
    #[serde(default = "default_interpreter")]
    interpreter: String,
    #[serde(default = "default_entry")]
    entry: PathBuf,
    #[serde(default)]
    working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogsConfigFile {
    #[serde(default = "default_logs_root")]
    root: PathBuf,
    #[serde(default = "default_retain")]
    retain: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegistryConfigFile {
    #[serde(default = "default_accounts_file")]
    accounts_file: PathBuf,
    #[serde(default = "default_registry_timeout_ms")]
    timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TimingConfigFile {
    #[serde(default = "default_verify_ms")]
    verify_ms: u64,
    #[serde(default = "default_grace_ms")]
    grace_ms: u64,
    #[serde(default = "default_kill_settle_ms")]
    kill_settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct StatusConfigFile {
    #[serde(default = "default_snapshot_top")]
    snapshot_top: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorConfigFile {
    #[serde(default)]
    worker: Option<WorkerConfigFile>,
    #[serde(default)]
    logs: Option<LogsConfigFile>,
    #[serde(default)]
    registry: Option<RegistryConfigFile>,
    #[serde(default)]
    timing: Option<TimingConfigFile>,
    #[serde(default)]
    status: Option<StatusConfigFile>,
}

fn default_interpreter() -> String {
    "python3".to_string()
}
fn default_entry() -> PathBuf {
    "bot.py".into()
}
fn default_logs_root() -> PathBuf {
    "logs".into()
}
fn default_retain() -> usize {
    10
}
fn default_accounts_file() -> PathBuf {
    "accounts.yaml".into()
}
fn default_registry_timeout_ms() -> u64 {
    2_000
}
fn default_verify_ms() -> u64 {
    5_000
}
fn default_grace_ms() -> u64 {
    2_000
}
fn default_kill_settle_ms() -> u64 {
    1_000
}
fn default_snapshot_top() -> usize {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            entry: default_entry(),
            working_directory: ".".into(),
            logs_root: default_logs_root(),
            retain: default_retain(),
            accounts_file: default_accounts_file(),
            registry_timeout_ms: default_registry_timeout_ms(),
            verify_ms: default_verify_ms(),
            grace_ms: default_grace_ms(),
            kill_settle_ms: default_kill_settle_ms(),
            snapshot_top: default_snapshot_top(),
        }
    }
}

impl SupervisorConfig {
    /// File name (no directory) of the worker entry point, as it appears in a
    /// worker's command line. This is the process-matching pattern.
    pub fn entry_name(&self) -> String {
        self.entry
            .file_name()
            .map(|os| os.to_string_lossy().to_string())
            .unwrap_or_else(|| self.entry.display().to_string())
    }
}

/// Load the supervisor config. A missing file is not an error: every section
/// has usable defaults, so the supervisor stays operable with no config at
/// all. A present-but-broken file is a hard error (misconfiguration should
/// not silently degrade to defaults).
pub fn load_config(config_path: &Path) -> anyhow::Result<SupervisorConfig> {
    let mut cfg = SupervisorConfig::default();

    let raw = match std::fs::read_to_string(config_path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cfg),
        Err(e) => {
            anyhow::bail!("failed to read config {}: {e}", config_path.display())
        }
    };
    let file_cfg: SupervisorConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    if let Some(w) = file_cfg.worker {
        anyhow::ensure!(
            !w.interpreter.trim().is_empty(),
            "worker.interpreter must not be empty"
        );
        cfg.interpreter = w.interpreter.trim().to_string();
        cfg.entry = w.entry;
        if let Some(wd) = w.working_directory {
            cfg.working_directory = wd;
        }
    }
    if let Some(l) = file_cfg.logs {
        anyhow::ensure!(l.retain >= 1, "logs.retain must be >= 1");
        cfg.logs_root = l.root;
        cfg.retain = l.retain;
    }
    if let Some(r) = file_cfg.registry {
        cfg.accounts_file = r.accounts_file;
        cfg.registry_timeout_ms = r.timeout_ms;
    }
    if let Some(t) = file_cfg.timing {
        cfg.verify_ms = t.verify_ms;
        cfg.grace_ms = t.grace_ms;
        cfg.kill_settle_ms = t.kill_settle_ms;
    }
    if let Some(s) = file_cfg.status {
        anyhow::ensure!(s.snapshot_top >= 1, "status.snapshot_top must be >= 1");
        cfg.snapshot_top = s.snapshot_top;
    }

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    if cfg.entry.is_relative() {
        cfg.entry = base.join(&cfg.entry);
    }
    if cfg.working_directory.is_relative() {
        cfg.working_directory = base.join(&cfg.working_directory);
    }
    if cfg.logs_root.is_relative() {
        cfg.logs_root = base.join(&cfg.logs_root);
    }
    if cfg.accounts_file.is_relative() {
        cfg.accounts_file = base.join(&cfg.accounts_file);
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(&dir.path().join("nope.yaml")).unwrap();
        assert_eq!(cfg.interpreter, "python3");
        assert_eq!(cfg.retain, 10);
        assert_eq!(cfg.verify_ms, 5_000);
        assert_eq!(cfg.grace_ms, 2_000);
    }

    #[test]
    fn grouped_sections_overlay_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botmaster.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "worker:\n  interpreter: python3\n  entry: runner.py\nlogs:\n  retain: 3\ntiming:\n  grace_ms: 500"
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.entry_name(), "runner.py");
        assert_eq!(cfg.retain, 3);
        assert_eq!(cfg.grace_ms, 500);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.verify_ms, 5_000);
        // Relative paths resolve against the config file directory.
        assert_eq!(cfg.entry, dir.path().join("runner.py"));
        assert_eq!(cfg.logs_root, dir.path().join("logs"));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botmaster.yaml");
        std::fs::write(&path, "worker:\n  interpretter: python3\n").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn zero_retain_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botmaster.yaml");
        std::fs::write(&path, "logs:\n  retain: 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
