use crate::bm::config::SupervisorConfig;
use chrono::{DateTime, Local};
use std::io::{Read as _, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Per-instance log directory: `{logs_root}/{id}`.
pub fn log_dir(cfg: &SupervisorConfig, id: &str) -> PathBuf {
    cfg.logs_root.join(id)
}

fn log_file_name(id: &str, now: DateTime<Local>) -> String {
    format!("{id}_{}.log", now.format("%Y%m%d_%H%M%S"))
}

/// Create the instance log directory and a fresh timestamped log file, then
/// prune that instance's logs down to `retain`. The new file is the newest
/// and is never pruned. Returns the new log path.
///
/// On a same-second restart the timestamped name collides; the file is opened
/// in append mode so the earlier run's output is kept, not truncated.
pub fn start_new_log(cfg: &SupervisorConfig, id: &str) -> anyhow::Result<PathBuf> {
    let dir = log_dir(cfg, id);
    std::fs::create_dir_all(&dir)
        .map_err(|e| anyhow::anyhow!("failed to create log directory {}: {e}", dir.display()))?;

    let path = dir.join(log_file_name(id, Local::now()));
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| anyhow::anyhow!("failed to create log file {}: {e}", path.display()))?;

    prune_instance_logs(&dir, id, cfg.retain)?;
    Ok(path)
}

/// All log files for `id` in its directory, newest first. Ordered by mtime
/// descending; exact mtime ties fall back to filename descending, which is
/// consistent because filenames embed second-resolution timestamps.
pub fn list_instance_logs(dir: &Path, id: &str) -> anyhow::Result<Vec<PathBuf>> {
    let prefix = format!("{id}_");
    let rd = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => anyhow::bail!("failed to read log directory {}: {e}", dir.display()),
    };

    let mut entries: Vec<(std::time::SystemTime, String, PathBuf)> = vec![];
    for entry in rd {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&prefix) || !name.ends_with(".log") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::UNIX_EPOCH);
        entries.push((modified, name, entry.path()));
    }
    entries.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
    Ok(entries.into_iter().map(|(_, _, p)| p).collect())
}

fn prune_instance_logs(dir: &Path, id: &str, retain: usize) -> anyhow::Result<()> {
    let logs = list_instance_logs(dir, id)?;
    for old in logs.iter().skip(retain) {
        if let Err(e) = std::fs::remove_file(old) {
            // Pruning is housekeeping; one stuck file must not block a start.
            crate::bm::event::emit(
                "logs",
                Some(id),
                format!("attempt=prune outcome=failed path={} err={e}", old.display()),
            );
        }
    }
    Ok(())
}

/// The most recently written log for `id`, or None (including when the
/// instance has never run and its directory does not exist).
pub fn latest_log(cfg: &SupervisorConfig, id: &str) -> anyhow::Result<Option<PathBuf>> {
    Ok(list_instance_logs(&log_dir(cfg, id), id)?.into_iter().next())
}

/// Last `n` lines of `path`, reading backwards in chunks. A missing or empty
/// file yields an empty vec rather than an error.
pub fn tail_lines(path: &Path, n: usize) -> anyhow::Result<Vec<String>> {
    if n == 0 {
        return Ok(vec![]);
    }
    let mut f = match std::fs::OpenOptions::new().read(true).open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => anyhow::bail!("failed to open {}: {e}", path.display()),
    };
    let len = f.metadata()?.len();
    if len == 0 {
        return Ok(vec![]);
    }

    // Read from the end in chunks until we have enough newlines.
    let mut pos = len;
    let mut newline_count: usize = 0;
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    while pos > 0 && newline_count <= n {
        let read_size = std::cmp::min(8192u64, pos) as usize;
        pos -= read_size as u64;
        f.seek(SeekFrom::Start(pos))?;
        let mut buf = vec![0u8; read_size];
        f.read_exact(&mut buf)?;
        newline_count += buf.iter().filter(|&&b| b == b'\n').count();
        chunks.push(buf);
        if chunks.len() > 512 {
            // Safety cap (~4MB) to avoid unbounded memory on huge line counts.
            break;
        }
    }
    chunks.reverse();
    let data = chunks.concat();
    let s = String::from_utf8_lossy(&data);
    let mut lines: Vec<&str> = s.split_terminator('\n').collect();
    if lines.len() > n {
        lines = lines[lines.len() - n..].to_vec();
    }
    Ok(lines.into_iter().map(|l| l.to_string()).collect())
}

fn count_lines(path: &Path) -> anyhow::Result<u64> {
    let mut f = std::fs::OpenOptions::new().read(true).open(path)?;
    let mut buf = [0u8; 65536];
    let mut count: u64 = 0;
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        count += buf[..n].iter().filter(|&&b| b == b'\n').count() as u64;
    }
    Ok(count)
}

/// What status reports about one log file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogSummary {
    pub name: String,
    pub size_bytes: u64,
    pub line_count: u64,
    pub last_line: Option<String>,
    /// Local mtime, `%Y-%m-%d_%H:%M:%S`.
    pub modified: String,
}

pub fn summarize(path: &Path) -> anyhow::Result<LogSummary> {
    let meta = std::fs::metadata(path)
        .map_err(|e| anyhow::anyhow!("failed to stat {}: {e}", path.display()))?;
    let modified: DateTime<Local> = meta.modified()?.into();
    let last_line = tail_lines(path, 1)?.pop();
    Ok(LogSummary {
        name: path
            .file_name()
            .map(|os| os.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string()),
        size_bytes: meta.len(),
        line_count: count_lines(path)?,
        last_line,
        modified: modified.format("%Y-%m-%d_%H:%M:%S").to_string(),
    })
}
