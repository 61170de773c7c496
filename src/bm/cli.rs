use crate::bm::{config, event, lifecycle, logs, registry, report};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "botmaster", version, about = "stateless supervisor for per-account trading bot workers")]
pub struct Args {
    /// Path to supervisor config YAML (defaults apply when the file is absent)
    #[arg(short = 'c', long = "config", default_value = "botmaster.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Launch an instance: by name, by numeric shortcut from `list`, or the
    /// default instance when no name is given
    Start { name: Option<String> },
    /// Stop one instance (graceful, then SIGKILL), or `all` for a best-effort
    /// broadcast to every worker
    Stop { name: String },
    /// Liveness, latest-log summary and a system resource snapshot for every
    /// known instance (or just one)
    Status {
        name: Option<String>,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// List known instances with their numeric shortcuts
    List,
    /// Show the tail of an instance's most recent log
    Logs {
        name: String,
        /// Number of lines to show
        #[arg(short = 'n', default_value_t = 50)]
        n: usize,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::load_config(&args.config)?;
    event::set_event_log_root(&cfg.logs_root);

    match args.cmd {
        Cmd::Start { name } => {
            let instances = registry::list_instances(&cfg);
            let id = match name {
                Some(token) => registry::resolve_target(&instances, &token),
                None => "default".to_string(),
            };
            match lifecycle::start(&cfg, &id)? {
                lifecycle::StartOutcome::Running { pid, log } => {
                    println!("✅ {id}: RUNNING pid={pid} log={}", log.display());
                    Ok(())
                }
                lifecycle::StartOutcome::FailedStart { log, tail } => {
                    println!("❌ {id}: FAILED_START (no live process after verification window)");
                    println!("   log: {}", log.display());
                    for line in &tail {
                        println!("   | {line}");
                    }
                    anyhow::bail!("start verification failed for {id}")
                }
            }
        }
        Cmd::Stop { name } => {
            if name == "all" {
                let pids = lifecycle::stop_all(&cfg)?;
                if pids.is_empty() {
                    println!("ℹ️ no worker processes running");
                } else {
                    println!("✅ SIGTERM delivered to {} worker process(es): {pids:?}", pids.len());
                }
                return Ok(());
            }
            let instances = registry::list_instances(&cfg);
            let id = registry::resolve_target(&instances, &name);
            match lifecycle::stop(&cfg, &id)? {
                lifecycle::StopOutcome::NotRunning => {
                    println!("ℹ️ {id}: not running");
                }
                lifecycle::StopOutcome::Stopped { pids } => {
                    warn_if_ambiguous(&id, &pids);
                    println!("✅ {id}: stopped (pids {pids:?})");
                }
                lifecycle::StopOutcome::Killed { pids } => {
                    warn_if_ambiguous(&id, &pids);
                    println!("⚠️ {id}: did not exit in the grace window, removed with SIGKILL (pids {pids:?})");
                }
            }
            Ok(())
        }
        Cmd::Status { name, format } => {
            let instances = registry::list_instances(&cfg);
            let ids: Vec<String> = match name {
                Some(token) => vec![registry::resolve_target(&instances, &token)],
                None => instances,
            };
            let rep = lifecycle::status(&cfg, &ids)?;
            match format {
                OutputFormat::Text => print!("{}", report::render_text(&rep)),
                OutputFormat::Json => println!("{}", report::render_json(&rep)?),
            }
            Ok(())
        }
        Cmd::List => {
            let instances = registry::list_instances(&cfg);
            for (i, id) in instances.iter().enumerate() {
                println!("{}) {id}", i + 1);
            }
            Ok(())
        }
        Cmd::Logs { name, n } => {
            let instances = registry::list_instances(&cfg);
            let id = registry::resolve_target(&instances, &name);
            match logs::latest_log(&cfg, &id)? {
                None => {
                    println!("ℹ️ {id}: no logs");
                    Ok(())
                }
                Some(path) => {
                    println!("ℹ️ {id}: {}", path.display());
                    for line in logs::tail_lines(&path, n)? {
                        println!("{line}");
                    }
                    Ok(())
                }
            }
        }
    }
}

fn warn_if_ambiguous(id: &str, pids: &[i32]) {
    if pids.len() > 1 {
        println!(
            "⚠️ {id}: {} matching processes found (single-writer invariant violated); all were stopped",
            pids.len()
        );
    }
}
