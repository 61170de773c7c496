use crate::bm::lifecycle::StatusReport;
use crate::bm::procs::ProcSample;

const LAST_LINE_MAX: usize = 60;

pub fn render_text(report: &StatusReport) -> String {
    let headers = vec!["instance", "state", "pid", "last_log", "size", "lines", "modified", "last_line"];

    #[derive(Clone)]
    struct Row {
        cols: Vec<String>,
    }

    // Widths are in characters, not bytes: truncation appends '…' and log
    // lines can carry arbitrary multibyte text.
    fn display_width(s: &str) -> usize {
        s.chars().count()
    }

    fn pad(s: &str, width: usize) -> String {
        let len = display_width(s);
        if len >= width {
            return s.to_string();
        }
        let mut out = String::from(s);
        out.push_str(&" ".repeat(width - len));
        out
    }

    fn border(widths: &[usize]) -> String {
        let mut out = String::new();
        out.push('+');
        for w in widths {
            // 1 leading + 1 trailing padding space per cell.
            out.push_str(&"-".repeat(*w + 2));
            out.push('+');
        }
        out
    }

    fn row_line(cols: &[String], widths: &[usize]) -> String {
        let mut out = String::new();
        out.push('|');
        for (i, w) in widths.iter().enumerate() {
            let v = cols.get(i).map(|s| s.as_str()).unwrap_or("");
            out.push(' ');
            out.push_str(&pad(v, *w));
            out.push(' ');
            out.push('|');
        }
        out
    }

    // Each instance can occupy multiple physical rows (one per PID); keep
    // them grouped so the border is drawn once per instance.
    let mut groups: Vec<Vec<Row>> = vec![];
    for st in &report.instances {
        let state = if st.running { "RUNNING" } else { "STOPPED" };
        let (log_name, size, lines, modified, last_line) = match &st.log {
            Some(l) => (
                l.name.clone(),
                human_size(l.size_bytes),
                l.line_count.to_string(),
                l.modified.clone(),
                l.last_line.as_deref().map(truncate_line).unwrap_or_else(|| "-".to_string()),
            ),
            None => ("-".into(), "-".into(), "-".into(), "-".into(), "-".into()),
        };

        if st.pids.is_empty() {
            groups.push(vec![Row {
                cols: vec![
                    st.id.clone(),
                    state.to_string(),
                    "-".to_string(),
                    log_name,
                    size,
                    lines,
                    modified,
                    last_line,
                ],
            }]);
            continue;
        }

        let mut g: Vec<Row> = vec![Row {
            cols: vec![
                st.id.clone(),
                state.to_string(),
                st.pids[0].to_string(),
                log_name,
                size,
                lines,
                modified,
                last_line,
            ],
        }];
        // Remaining PIDs (AmbiguousMatch): other columns left blank so the
        // pid column stays aligned under its header.
        for pid in st.pids.iter().skip(1) {
            g.push(Row {
                cols: vec![
                    String::new(),
                    String::new(),
                    pid.to_string(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                    String::new(),
                ],
            });
        }
        groups.push(g);
    }

    // Compute widths from headers + all rows (no fixed spacing).
    let mut widths: Vec<usize> = headers.iter().map(|h| display_width(h)).collect();
    for g in &groups {
        for r in g {
            for (i, c) in r.cols.iter().enumerate() {
                widths[i] = widths[i].max(display_width(c));
            }
        }
    }

    let mut out = String::new();
    let top = border(&widths);
    out.push_str(&top);
    out.push('\n');
    out.push_str(&row_line(
        &headers.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        &widths,
    ));
    out.push('\n');
    out.push_str(&top);
    out.push('\n');
    for g in &groups {
        for r in g {
            out.push_str(&row_line(&r.cols, &widths));
            out.push('\n');
        }
        out.push_str(&top);
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&render_snapshot(report));
    out
}

fn render_snapshot(report: &StatusReport) -> String {
    fn sample_line(s: &ProcSample) -> String {
        format!(
            "  pid={:<8} mem={:<10} cpu={:>5.1}%  {}",
            s.pid,
            human_size(s.memory_bytes),
            s.cpu_percent,
            s.name
        )
    }
    let mut out = String::new();
    out.push_str("top processes by memory:\n");
    for s in &report.snapshot.top_memory {
        out.push_str(&sample_line(s));
        out.push('\n');
    }
    out.push_str("top processes by cpu:\n");
    for s in &report.snapshot.top_cpu {
        out.push_str(&sample_line(s));
        out.push('\n');
    }
    out
}

pub fn render_json(report: &StatusReport) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}

fn truncate_line(s: &str) -> String {
    let trimmed = s.trim_end();
    if trimmed.chars().count() <= LAST_LINE_MAX {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(LAST_LINE_MAX - 1).collect();
    format!("{cut}…")
}

pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut v = bytes as f64;
    let mut unit = 0usize;
    while v >= 1024.0 && unit + 1 < UNITS.len() {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{v:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bm::lifecycle::{InstanceStatus, StatusReport};
    use crate::bm::logs::LogSummary;
    use crate::bm::procs::ResourceSnapshot;

    fn report_fixture() -> StatusReport {
        StatusReport {
            instances: vec![
                InstanceStatus {
                    id: "okxMain".to_string(),
                    running: true,
                    pids: vec![4242],
                    log: Some(LogSummary {
                        name: "okxMain_20240601_120000.log".to_string(),
                        size_bytes: 2048,
                        line_count: 17,
                        last_line: Some("SIGNAL: hold | Confidence: 0.55".to_string()),
                        modified: "2024-06-01_12:00:00".to_string(),
                    }),
                },
                InstanceStatus {
                    id: "account1".to_string(),
                    running: false,
                    pids: vec![],
                    log: None,
                },
            ],
            snapshot: ResourceSnapshot {
                top_memory: vec![],
                top_cpu: vec![],
            },
        }
    }

    #[test]
    fn text_report_contains_instances_and_states() {
        let out = render_text(&report_fixture());
        assert!(out.contains("okxMain"));
        assert!(out.contains("RUNNING"));
        assert!(out.contains("4242"));
        assert!(out.contains("account1"));
        assert!(out.contains("STOPPED"));
        assert!(out.starts_with('+'));
    }

    #[test]
    fn ambiguous_match_renders_one_row_per_pid() {
        let mut report = report_fixture();
        report.instances[0].pids = vec![4242, 4243];
        let out = render_text(&report);
        assert!(out.contains("4242"));
        assert!(out.contains("4243"));
    }

    #[test]
    fn json_report_round_trips() {
        let out = render_json(&report_fixture()).unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["instances"][0]["id"], "okxMain");
        assert_eq!(v["instances"][0]["running"], true);
        assert_eq!(v["instances"][1]["running"], false);
    }

    #[test]
    fn human_sizes() {
        assert_eq!(human_size(512), "512B");
        assert_eq!(human_size(2048), "2.0KiB");
        assert_eq!(human_size(5 * 1024 * 1024), "5.0MiB");
    }

    #[test]
    fn multibyte_cells_keep_columns_aligned() {
        let mut report = report_fixture();
        // A truncated multibyte line ends in '…'; every table row must still
        // line up when measured in characters.
        report.instances[0].log.as_mut().unwrap().last_line =
            Some(format!("сигнал: удержание позиции {}", "x".repeat(80)));
        let out = render_text(&report);
        let table: Vec<&str> = out.lines().take_while(|l| !l.is_empty()).collect();
        assert!(table.len() >= 4);
        let width = table[0].chars().count();
        for line in &table {
            assert_eq!(line.chars().count(), width, "misaligned row: {line}");
        }
    }

    #[test]
    fn long_last_lines_are_truncated() {
        let long = "x".repeat(200);
        let t = truncate_line(&long);
        assert!(t.chars().count() <= LAST_LINE_MAX);
        assert!(t.ends_with('…'));
    }
}
