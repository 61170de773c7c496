pub fn build_host() -> &'static str {
    option_env!("BOTMASTER_BUILD_HOST").unwrap_or("unknown")
}

pub fn build_time_raw() -> &'static str {
    option_env!("BOTMASTER_BUILD_TIME").unwrap_or("unknown")
}

/// Human-readable build timestamp. build.rs emits `epoch:<secs>`; anything
/// else (including a build without the env var) is shown as-is.
pub fn build_time_pretty() -> String {
    format_build_time(build_time_raw())
}

fn format_build_time(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix("epoch:")
        .and_then(|s| s.trim().parse::<i64>().ok())
        .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// First header line of every freshly created instance log, so a post-mortem
/// always shows which supervisor build launched the worker.
pub fn banner() -> String {
    format!(
        "botmaster {} built {} on {}",
        env!("CARGO_PKG_VERSION"),
        build_time_pretty(),
        build_host()
    )
}
