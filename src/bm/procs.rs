use crate::bm::config::SupervisorConfig;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

/// One process in the system-wide resource snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcSample {
    pub pid: i32,
    pub name: String,
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Top-N processes by memory and by CPU, system-wide. Informational only;
/// not scoped to instances.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceSnapshot {
    pub top_memory: Vec<ProcSample>,
    pub top_cpu: Vec<ProcSample>,
}

/// True when `argv` is a worker invocation for `id`: some token's file name
/// equals the entry name, and a later token equals the instance id. Whole
/// tokens only, so "acc1" never matches an "acc10" worker.
pub fn argv_matches_instance(argv: &[String], entry_name: &str, id: &str) -> bool {
    let Some(entry_at) = argv.iter().position(|t| token_basename(t) == entry_name) else {
        return false;
    };
    argv.iter().skip(entry_at + 1).any(|t| t == id)
}

/// True when `argv` looks like any worker invocation (entry name present),
/// regardless of instance. Used by broadcast stop.
pub fn argv_matches_worker(argv: &[String], entry_name: &str) -> bool {
    argv.iter().any(|t| token_basename(t) == entry_name)
}

fn token_basename(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

fn scan_process_table() -> System {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::everything());
    sys
}

fn collect_matching<F: Fn(&[String]) -> bool>(pred: F) -> Vec<i32> {
    let own_pid = std::process::id() as i32;
    let sys = scan_process_table();
    let mut pids: Vec<i32> = sys
        .processes()
        .iter()
        .filter_map(|(pid, proc_)| {
            let pid = pid.as_u32() as i32;
            // Self-exclusion: the supervisor's own command line mentions the
            // same entry/id tokens and must never count as a worker.
            if pid == own_pid {
                return None;
            }
            let argv: Vec<String> = proc_
                .cmd()
                .iter()
                .map(|os| os.to_string_lossy().to_string())
                .collect();
            if pred(&argv) { Some(pid) } else { None }
        })
        .collect();
    pids.sort_unstable();
    pids
}

/// Live PIDs currently running the worker for `id`. Possibly empty, possibly
/// more than one (AmbiguousMatch). Always a fresh process-table scan.
pub fn find_instance_pids(cfg: &SupervisorConfig, id: &str) -> Vec<i32> {
    let entry_name = cfg.entry_name();
    collect_matching(|argv| argv_matches_instance(argv, &entry_name, id))
}

/// Live PIDs of every worker process, any instance. For the pattern-wide
/// broadcast stop.
pub fn find_worker_pids(cfg: &SupervisorConfig) -> Vec<i32> {
    let entry_name = cfg.entry_name();
    collect_matching(|argv| argv_matches_worker(argv, &entry_name))
}

/// Liveness probe via signal 0. EPERM means the process exists but belongs
/// to someone else, which still counts as alive. A zombie still answers
/// signal 0 but has already exited (the supervisor never reaps its detached
/// children), so zombies are filtered out via /proc.
pub fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn is_zombie(pid: i32) -> bool {
    // /proc/<pid>/stat is "pid (comm) STATE ..."; comm may itself contain
    // spaces or parentheses, so the state field follows the last ')'.
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    match stat.rsplit_once(')') {
        Some((_, rest)) => rest.trim_start().starts_with('Z'),
        None => false,
    }
}

/// System-wide resource snapshot. CPU percentages need a delta between two
/// refreshes, so this blocks for the minimum sysinfo sampling interval.
pub fn resource_snapshot(top_n: usize) -> ResourceSnapshot {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::everything());
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::everything());

    let mut samples: Vec<ProcSample> = sys
        .processes()
        .iter()
        .map(|(pid, proc_)| ProcSample {
            pid: pid.as_u32() as i32,
            name: proc_.name().to_string_lossy().to_string(),
            memory_bytes: proc_.memory(),
            cpu_percent: proc_.cpu_usage(),
        })
        .collect();

    samples.sort_by(|a, b| b.memory_bytes.cmp(&a.memory_bytes).then(a.pid.cmp(&b.pid)));
    let top_memory: Vec<ProcSample> = samples.iter().take(top_n).cloned().collect();

    samples.sort_by(|a, b| {
        b.cpu_percent
            .partial_cmp(&a.cpu_percent)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.pid.cmp(&b.pid))
    });
    let top_cpu: Vec<ProcSample> = samples.into_iter().take(top_n).collect();

    ResourceSnapshot { top_memory, top_cpu }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn matches_interpreter_entry_id() {
        assert!(argv_matches_instance(
            &argv(&["python3", "/opt/bots/bot.py", "okxMain"]),
            "bot.py",
            "okxMain"
        ));
    }

    #[test]
    fn entry_may_be_relative_or_absolute() {
        assert!(argv_matches_instance(&argv(&["python3", "bot.py", "default"]), "bot.py", "default"));
        assert!(argv_matches_instance(
            &argv(&["/usr/bin/python3", "./bot.py", "default"]),
            "bot.py",
            "default"
        ));
    }

    #[test]
    fn prefix_collision_does_not_match() {
        // acc1 must not claim the acc10 worker.
        let acc10 = argv(&["python3", "bot.py", "acc10"]);
        assert!(!argv_matches_instance(&acc10, "bot.py", "acc1"));
        assert!(argv_matches_instance(&acc10, "bot.py", "acc10"));
    }

    #[test]
    fn id_before_entry_does_not_match() {
        assert!(!argv_matches_instance(&argv(&["okxMain", "bot.py"]), "bot.py", "okxMain"));
    }

    #[test]
    fn unrelated_commands_do_not_match() {
        assert!(!argv_matches_instance(&argv(&["grep", "bot.py", "okxMain"]), "runner.py", "okxMain"));
        assert!(!argv_matches_worker(&argv(&["sleep", "60"]), "bot.py"));
    }

    #[test]
    fn generic_worker_match_ignores_instance() {
        assert!(argv_matches_worker(&argv(&["python3", "/opt/bots/bot.py", "acc7"]), "bot.py"));
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
    }

    #[test]
    fn exited_but_unreaped_child_is_not_alive() {
        let child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .stdout(std::process::Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        // Dropping the handle without waiting leaves the child as a zombie in
        // our process table until this process exits; liveness must still
        // report it as gone.
        drop(child);
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(!pid_alive(pid));
    }

    #[test]
    fn snapshot_is_bounded() {
        let snap = resource_snapshot(3);
        assert!(snap.top_memory.len() <= 3);
        assert!(snap.top_cpu.len() <= 3);
    }
}
