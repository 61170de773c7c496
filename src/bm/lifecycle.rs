use crate::bm::build_info;
use crate::bm::config::SupervisorConfig;
use crate::bm::event;
use crate::bm::logs::{self, LogSummary};
use crate::bm::procs::{self, ResourceSnapshot};
use chrono::Local;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::Write as _;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const FAILURE_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum StartOutcome {
    Running { pid: i32, log: PathBuf },
    /// Verification window elapsed with no live matching process. Carries the
    /// tail of the just-created log for diagnosis. Never retried here.
    FailedStart { log: PathBuf, tail: Vec<String> },
}

#[derive(Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Informational, not an error.
    NotRunning,
    /// Exited within the grace window after SIGTERM.
    Stopped { pids: Vec<i32> },
    /// Needed SIGKILL after the grace window expired.
    Killed { pids: Vec<i32> },
}

#[derive(Debug, serde::Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub running: bool,
    pub pids: Vec<i32>,
    /// Most recent log, whether or not the instance is live (post-mortem aid).
    pub log: Option<LogSummary>,
}

#[derive(Debug, serde::Serialize)]
pub struct StatusReport {
    pub instances: Vec<InstanceStatus>,
    pub snapshot: ResourceSnapshot,
}

fn send_signal(pid: i32, sig: Signal) -> anyhow::Result<()> {
    match kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        // Already gone: the goal state, not a failure.
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => anyhow::bail!("failed to send {sig} to pid {pid}: {e}"),
    }
}

/// Poll until every pid in `pids` is gone or `window` elapses. Returns the
/// pids still alive afterwards.
fn wait_for_exit(pids: &[i32], window: Duration) -> Vec<i32> {
    let deadline = Instant::now() + window;
    loop {
        let alive: Vec<i32> = pids.iter().copied().filter(|p| procs::pid_alive(*p)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// SIGTERM then, past the grace window, SIGKILL. Shared by stop and by the
/// pre-emptive guard in start.
fn terminate_pids(cfg: &SupervisorConfig, id: &str, pids: &[i32]) -> anyhow::Result<StopOutcome> {
    for pid in pids {
        send_signal(*pid, Signal::SIGTERM)?;
    }
    event::emit("stop", Some(id), format!("attempt=sigterm pids={pids:?}"));

    let grace_t0 = Instant::now();
    let leftover = wait_for_exit(pids, Duration::from_millis(cfg.grace_ms));
    if leftover.is_empty() {
        event::emit(
            "stop",
            Some(id),
            format!("outcome=graceful_exit elapsed_ms={}", grace_t0.elapsed().as_millis()),
        );
        return Ok(StopOutcome::Stopped { pids: pids.to_vec() });
    }

    event::emit(
        "stop",
        Some(id),
        format!("outcome=grace_expired decision=sigkill remaining_pids={leftover:?}"),
    );
    for pid in &leftover {
        send_signal(*pid, Signal::SIGKILL)?;
    }
    let still = wait_for_exit(&leftover, Duration::from_millis(cfg.kill_settle_ms));
    if !still.is_empty() {
        event::emit("stop", Some(id), format!("outcome=sigkill_failed remaining_pids={still:?}"));
        anyhow::bail!("{id}: pids {still:?} still alive after SIGKILL");
    }
    event::emit("stop", Some(id), "outcome=killed");
    Ok(StopOutcome::Killed { pids: pids.to_vec() })
}

/// Start (or restart) the worker for `id`.
///
/// Step order is load-bearing: any prior worker for the same id is terminated
/// first (single-writer-per-instance, unconditional even for a healthy run),
/// then the fresh log is created and rotation runs, then the detached launch,
/// then the verification wait. Reordering would let the new process write to
/// a pruned log or race the old one for the exchange account.
pub fn start(cfg: &SupervisorConfig, id: &str) -> anyhow::Result<StartOutcome> {
    let existing = procs::find_instance_pids(cfg, id);
    if !existing.is_empty() {
        event::emit("start", Some(id), format!("attempt=preempt prior_pids={existing:?}"));
        terminate_pids(cfg, id, &existing)?;
    }

    // DirectoryCreateFailure is fatal for this start; nothing gets launched.
    let log_path = logs::start_new_log(cfg, id)?;
    write_log_header(cfg, id, &log_path)?;

    let log_file = std::fs::OpenOptions::new()
        .append(true)
        .open(&log_path)
        .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", log_path.display()))?;
    let log_file_err = log_file
        .try_clone()
        .map_err(|e| anyhow::anyhow!("failed to clone log handle for {}: {e}", log_path.display()))?;

    let mut cmd = Command::new(&cfg.interpreter);
    cmd.arg(&cfg.entry)
        .arg(id)
        .current_dir(&cfg.working_directory)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_err))
        // Own process group: the worker must outlive this invocation and
        // never receive the operator's terminal signals.
        .process_group(0);

    let child = cmd.spawn().map_err(|e| {
        anyhow::anyhow!(
            "failed to launch worker: {} {} {id}: {e}",
            cfg.interpreter,
            cfg.entry.display()
        )
    })?;
    let pid = child.id() as i32;
    // Disown: a short-lived supervisor invocation never reaps the worker.
    drop(child);
    event::emit(
        "start",
        Some(id),
        format!("outcome=launched pid={pid} log={}", log_path.display()),
    );

    std::thread::sleep(Duration::from_millis(cfg.verify_ms));

    // The pid must be alive AND still match the worker pattern: a recycled
    // pid belonging to an unrelated process must not pass verification.
    let verified = procs::pid_alive(pid) && procs::find_instance_pids(cfg, id).contains(&pid);
    if verified {
        event::emit("start", Some(id), format!("outcome=running pid={pid}"));
        Ok(StartOutcome::Running { pid, log: log_path })
    } else {
        let tail = logs::tail_lines(&log_path, FAILURE_TAIL_LINES)?;
        event::emit(
            "start",
            Some(id),
            format!("outcome=failed_start verify_ms={} pid={pid}", cfg.verify_ms),
        );
        Ok(StartOutcome::FailedStart { log: log_path, tail })
    }
}

fn write_log_header(cfg: &SupervisorConfig, id: &str, log_path: &Path) -> anyhow::Result<()> {
    let mut f = std::fs::OpenOptions::new()
        .append(true)
        .open(log_path)
        .map_err(|e| anyhow::anyhow!("failed to open log file {}: {e}", log_path.display()))?;
    writeln!(f, "==== {} ====", build_info::banner())?;
    writeln!(
        f,
        "==== instance={id} command={} {} {id} started_at={} ====",
        cfg.interpreter,
        cfg.entry.display(),
        Local::now().format("%Y-%m-%d_%H:%M:%S")
    )?;
    Ok(())
}

/// Stop the worker(s) for one instance: SIGTERM, bounded grace, SIGKILL
/// escalation. More than one matching pid means the single-writer invariant
/// was violated; all of them are acted on so no duplicate is orphaned.
pub fn stop(cfg: &SupervisorConfig, id: &str) -> anyhow::Result<StopOutcome> {
    let pids = procs::find_instance_pids(cfg, id);
    if pids.is_empty() {
        event::emit("stop", Some(id), "outcome=not_running");
        return Ok(StopOutcome::NotRunning);
    }
    if pids.len() > 1 {
        event::emit("stop", Some(id), format!("outcome=ambiguous_match pids={pids:?}"));
    }
    terminate_pids(cfg, id, &pids)
}

/// Broadcast SIGTERM to every process matching the generic worker pattern,
/// regardless of instance. Best-effort by design: no per-target confirmation,
/// no escalation. Returns only the pids whose delivery succeeded; failures
/// are logged and excluded so the caller's summary never overcounts.
pub fn stop_all(cfg: &SupervisorConfig) -> anyhow::Result<Vec<i32>> {
    let pids = procs::find_worker_pids(cfg);
    if pids.is_empty() {
        event::emit("stop", None, "outcome=not_running scope=all");
        return Ok(vec![]);
    }
    let mut signalled = Vec::with_capacity(pids.len());
    for pid in &pids {
        match send_signal(*pid, Signal::SIGTERM) {
            Ok(()) => signalled.push(*pid),
            Err(e) => {
                event::emit("stop", None, format!("attempt=sigterm pid={pid} outcome=failed err={e}"));
            }
        }
    }
    event::emit(
        "stop",
        None,
        format!("outcome=broadcast_sigterm signalled={signalled:?} matched={}", pids.len()),
    );
    Ok(signalled)
}

/// Observed state of one instance. Read-only; a missing log directory is a
/// normal "never ran here" answer, not an error.
pub fn instance_status(cfg: &SupervisorConfig, id: &str) -> anyhow::Result<InstanceStatus> {
    let pids = procs::find_instance_pids(cfg, id);
    let log = match logs::latest_log(cfg, id)? {
        Some(path) => match logs::summarize(&path) {
            Ok(s) => Some(s),
            Err(e) => {
                // A log deleted mid-scan should not take down the whole report.
                event::emit("status", Some(id), format!("outcome=log_summary_failed err={e}"));
                None
            }
        },
        None => None,
    };
    Ok(InstanceStatus {
        id: id.to_string(),
        running: !pids.is_empty(),
        pids,
        log,
    })
}

/// Full report over `ids` plus the system-wide resource snapshot. Performs no
/// mutation; safe as a monitoring heartbeat.
pub fn status(cfg: &SupervisorConfig, ids: &[String]) -> anyhow::Result<StatusReport> {
    let mut instances = vec![];
    for id in ids {
        instances.push(instance_status(cfg, id)?);
    }
    Ok(StatusReport {
        instances,
        snapshot: procs::resource_snapshot(cfg.snapshot_top),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    // Each test gets its own worker entry file name so the text-matching
    // locator can never see another test's processes.
    fn worker_cfg(tmp: &Path, tag: &str, script: &str) -> SupervisorConfig {
        let entry = tmp.join(format!("worker_{tag}_{}.sh", std::process::id()));
        std::fs::write(&entry, script).unwrap();
        SupervisorConfig {
            interpreter: "/bin/sh".to_string(),
            entry,
            working_directory: tmp.to_path_buf(),
            logs_root: tmp.join("logs"),
            retain: 5,
            verify_ms: 300,
            grace_ms: 1_000,
            kill_settle_ms: 1_000,
            ..SupervisorConfig::default()
        }
    }

    fn assert_running(outcome: &StartOutcome) -> i32 {
        match outcome {
            StartOutcome::Running { pid, .. } => *pid,
            StartOutcome::FailedStart { tail, .. } => {
                panic!("expected RUNNING, got FAILED_START, tail: {tail:?}")
            }
        }
    }

    #[test]
    fn start_status_stop_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = worker_cfg(tmp.path(), "roundtrip", "sleep 60\n");
        let id = "default";

        let pid = assert_running(&start(&cfg, id).unwrap());
        assert!(procs::pid_alive(pid));

        let st = instance_status(&cfg, id).unwrap();
        assert!(st.running);
        assert_eq!(st.pids, vec![pid]);
        let log = st.log.expect("fresh log should be reported");
        assert!(log.name.starts_with("default_"));

        match stop(&cfg, id).unwrap() {
            StopOutcome::Stopped { pids } | StopOutcome::Killed { pids } => {
                assert_eq!(pids, vec![pid]);
            }
            StopOutcome::NotRunning => panic!("was running"),
        }
        assert!(procs::find_instance_pids(&cfg, id).is_empty());

        // Second stop is the benign informational case.
        assert_eq!(stop(&cfg, id).unwrap(), StopOutcome::NotRunning);
    }

    #[test]
    fn double_start_leaves_exactly_one_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = worker_cfg(tmp.path(), "double", "sleep 60\n");
        let id = "okxMain";

        let first = assert_running(&start(&cfg, id).unwrap());
        let second = assert_running(&start(&cfg, id).unwrap());
        assert_ne!(first, second);

        let pids = procs::find_instance_pids(&cfg, id);
        assert_eq!(pids, vec![second], "old worker must have been pre-empted");

        stop(&cfg, id).unwrap();
    }

    #[test]
    fn sigterm_ignoring_worker_is_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = worker_cfg(tmp.path(), "stubborn", "trap '' TERM\nwhile :; do sleep 1; done\n");
        let id = "account1";

        let pid = assert_running(&start(&cfg, id).unwrap());
        match stop(&cfg, id).unwrap() {
            StopOutcome::Killed { pids } => assert_eq!(pids, vec![pid]),
            other => panic!("expected SIGKILL escalation, got {other:?}"),
        }
        assert!(procs::find_instance_pids(&cfg, id).is_empty());
    }

    #[test]
    fn crashing_worker_reports_failed_start_with_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = worker_cfg(tmp.path(), "crash", "echo boom: bad credentials\nexit 3\n");

        match start(&cfg, "account2").unwrap() {
            StartOutcome::FailedStart { tail, log } => {
                assert!(log.exists());
                assert!(tail.iter().any(|l| l.contains("boom: bad credentials")), "tail: {tail:?}");
            }
            StartOutcome::Running { pid, .. } => panic!("worker {pid} should have exited"),
        }
    }

    #[test]
    fn stop_all_broadcasts_to_every_instance() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = worker_cfg(tmp.path(), "broadcast", "sleep 60\n");

        let a = assert_running(&start(&cfg, "acc1").unwrap());
        let b = assert_running(&start(&cfg, "acc2").unwrap());

        let mut signalled = stop_all(&cfg).unwrap();
        signalled.sort_unstable();
        let mut expected = vec![a, b];
        expected.sort_unstable();
        assert_eq!(signalled, expected);

        // Best-effort broadcast, but a sleeping sh exits on SIGTERM promptly.
        let leftover = wait_for_exit(&expected, Duration::from_millis(2_000));
        assert!(leftover.is_empty(), "still alive: {leftover:?}");
    }

    #[test]
    fn locator_does_not_cross_prefix_colliding_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = worker_cfg(tmp.path(), "prefix", "sleep 60\n");

        let p1 = assert_running(&start(&cfg, "acc1").unwrap());
        let p10 = assert_running(&start(&cfg, "acc10").unwrap());

        assert_eq!(procs::find_instance_pids(&cfg, "acc1"), vec![p1]);
        assert_eq!(procs::find_instance_pids(&cfg, "acc10"), vec![p10]);

        stop(&cfg, "acc1").unwrap();
        stop(&cfg, "acc10").unwrap();
    }

    #[test]
    fn status_with_nothing_running_covers_all_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = worker_cfg(tmp.path(), "idle", "sleep 60\n");
        let ids: Vec<String> = ["default", "okxMain", "account1"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let report = status(&cfg, &ids).unwrap();
        assert_eq!(report.instances.len(), 3);
        for st in &report.instances {
            assert!(!st.running);
            assert!(st.pids.is_empty());
            assert!(st.log.is_none(), "no log dir was ever created");
        }
    }

    #[test]
    fn status_reports_last_log_after_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = worker_cfg(tmp.path(), "postmortem", "echo shutting down\nexit 0\n");

        // Worker exits immediately: FAILED_START, but the log stays behind.
        let _ = start(&cfg, "default").unwrap();
        let st = instance_status(&cfg, "default").unwrap();
        assert!(!st.running);
        let log = st.log.expect("post-mortem log must be reported");
        assert!(log.last_line.unwrap().contains("shutting down"));
    }
}
