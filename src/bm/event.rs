use chrono::Local;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

static EVENT_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static EVENT_LOG_LOCK: Mutex<()> = Mutex::new(());

/// Route supervisor events into `{logs_root}/botmaster.log` in addition to
/// stderr. Called once, early, by the CLI after config load.
pub fn set_event_log_root(logs_root: &Path) {
    let _ = EVENT_LOG_PATH.set(logs_root.join("botmaster.log"));
}

/// Emit one supervisor event line: stderr always, the supervisor log file
/// best-effort. Events record what the supervisor did; operator-facing
/// summaries go to stdout separately.
pub fn emit(component: &str, instance: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match instance {
        Some(id) => format!("{ts} [{component}] instance={id} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");

    if let Some(path) = EVENT_LOG_PATH.get() {
        // Serialize appends within this process; concurrent invocations rely
        // on O_APPEND line writes staying intact.
        let _guard = EVENT_LOG_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(f, "{line}");
        }
    }
}
