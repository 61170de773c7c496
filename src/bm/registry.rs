use crate::bm::config::SupervisorConfig;
use crate::bm::event;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

/// Accounts that must remain operable even with the accounts file gone.
/// "default" is what a worker assumes when launched with no argument; the
/// rest are long-standing deployments.
pub const FALLBACK_INSTANCES: &[&str] = &["default", "okxMain", "account1", "account2"];

/// Anything able to enumerate known instance ids. The supervisor only ever
/// consumes the ids; associated metadata (API keys etc.) stays with the
/// source.
pub trait InstanceSource: Send + 'static {
    fn enumerate(&self) -> anyhow::Result<Vec<String>>;
}

/// The standard source: a YAML mapping of account id -> arbitrary metadata.
/// Only the top-level keys are read.
pub struct AccountsFile {
    path: PathBuf,
}

impl AccountsFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl InstanceSource for AccountsFile {
    fn enumerate(&self) -> anyhow::Result<Vec<String>> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| anyhow::anyhow!("failed to read accounts file {}: {e}", self.path.display()))?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse accounts file {}: {e}", self.path.display()))?;
        let mapping = match doc {
            serde_yaml::Value::Mapping(m) => m,
            serde_yaml::Value::Null => return Ok(vec![]),
            _ => anyhow::bail!(
                "accounts file {} must be a mapping of account id -> metadata",
                self.path.display()
            ),
        };
        let mut ids = vec![];
        for key in mapping.keys() {
            match key {
                serde_yaml::Value::String(s) => ids.push(s.clone()),
                other => anyhow::bail!("accounts file {}: non-string account id {other:?}", self.path.display()),
            }
        }
        Ok(ids)
    }
}

/// Enumerate known instances from the configured accounts file, falling back
/// to the static list when the source errors out, hangs past the bound, or
/// comes back empty. Never fails: a broken config dependency must not make
/// the supervisor inoperable.
pub fn list_instances(cfg: &SupervisorConfig) -> Vec<String> {
    let source = AccountsFile::new(cfg.accounts_file.clone());
    list_from_source(source, Duration::from_millis(cfg.registry_timeout_ms))
}

pub fn list_from_source<S: InstanceSource>(source: S, timeout: Duration) -> Vec<String> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(source.enumerate());
    });

    let fallback = || FALLBACK_INSTANCES.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    match rx.recv_timeout(timeout) {
        Ok(Ok(ids)) if !ids.is_empty() => ids,
        Ok(Ok(_)) => {
            event::emit("registry", None, "outcome=empty_enumeration fallback=static");
            fallback()
        }
        Ok(Err(e)) => {
            event::emit("registry", None, format!("outcome=config_unavailable fallback=static err={e}"));
            fallback()
        }
        Err(_) => {
            event::emit(
                "registry",
                None,
                format!("outcome=enumeration_timeout timeout_ms={} fallback=static", timeout.as_millis()),
            );
            fallback()
        }
    }
}

/// Map a user-supplied launch target onto an instance id. A bare number is a
/// 1-based shortcut into the registry listing; anything else is taken
/// verbatim (ids are not validated, dynamically-added instances included).
pub fn resolve_target(instances: &[String], token: &str) -> String {
    if let Ok(k) = token.parse::<usize>() {
        if k >= 1 && k <= instances.len() {
            return instances[k - 1].clone();
        }
    }
    token.to_string()
}
