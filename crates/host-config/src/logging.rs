//! Structured logging bootstrap: the `-d <bitmap|csv>` trace-group selector
//! maps onto `tracing` target strings, and `--log-level` gates their
//! severity independently of which groups are selected. Both are combined
//! into one `EnvFilter` directive string and handed to
//! `observability::init_with_config`, called exactly once from `main`.

use crate::error::ConfigError;

/// The eleven trace groups in the bit order the `-d` selector uses.
pub const TRACE_GROUPS: &[&str] = &[
    "video", "audio", "system", "event", "transfer", "debug", "missing", "alloc", "crypto",
    "vdetail", "btransfer",
];

/// Parse a `-d` selector: either a numeric bitmap (`0x5`, `5`) or a
/// comma-separated list of group names.
pub fn parse_trace_groups(selector: &str) -> Result<Vec<&'static str>, ConfigError> {
    let selector = selector.trim();

    if let Some(value) = parse_bitmap(selector) {
        return Ok(TRACE_GROUPS
            .iter()
            .enumerate()
            .filter(|(bit, _)| value & (1u64 << bit) != 0)
            .map(|(_, name)| *name)
            .collect());
    }

    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|name| {
            TRACE_GROUPS
                .iter()
                .find(|&&g| g == name)
                .copied()
                .ok_or_else(|| ConfigError::InvalidTraceGroup(name.to_string()))
        })
        .collect()
}

fn parse_bitmap(selector: &str) -> Option<u64> {
    if let Some(hex) = selector.strip_prefix("0x").or_else(|| selector.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    if selector.chars().all(|c| c.is_ascii_digit()) && !selector.is_empty() {
        return selector.parse().ok();
    }
    None
}

fn target_for(group: &str) -> String {
    format!("trace::{group}")
}

/// Build the `EnvFilter` directive string combining the ambient severity
/// gate with the selected trace groups, e.g. `"info,trace::video=trace"`.
pub fn build_filter_directive(log_level: &str, groups: &[&str]) -> String {
    let mut directive = log_level.to_string();
    for group in groups {
        directive.push(',');
        directive.push_str(&target_for(group));
        directive.push_str("=trace");
    }
    directive
}

/// Initialize the process-wide logging facade. Called exactly once from
/// each binary's `main`, with `log_path` threaded in from
/// `Config::paths().logs_dir()` rather than read from the environment here.
pub fn init_logging(
    service_name: &str,
    log_level: &str,
    groups: &[&str],
    log_path: std::path::PathBuf,
) {
    let directive = build_filter_directive(log_level, groups);

    observability::init_with_config(observability::LogConfig {
        service_name: service_name.into(),
        default_level: directive,
        log_path: Some(log_path),
        also_stderr: true,
        ..Default::default()
    });
}

/// Parse a `--log-level` value. Validated once at the CLI boundary before
/// [`init_logging`] is called; an invalid value is a hard startup error
/// rather than a silent fallback.
pub fn parse_level(level: &str) -> Result<tracing::Level, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(tracing::Level::TRACE),
        "debug" => Ok(tracing::Level::DEBUG),
        "info" => Ok(tracing::Level::INFO),
        "warn" | "warning" => Ok(tracing::Level::WARN),
        "error" => Ok(tracing::Level::ERROR),
        other => Err(ConfigError::InvalidLogLevel(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_selector_selects_correct_groups() {
        // bits 0 (video) and 3 (event) set
        let groups = parse_trace_groups("0x9").unwrap();
        assert_eq!(groups, vec!["video", "event"]);
    }

    #[test]
    fn decimal_bitmap_selector_also_works() {
        let groups = parse_trace_groups("9").unwrap();
        assert_eq!(groups, vec!["video", "event"]);
    }

    #[test]
    fn csv_selector_selects_named_groups() {
        let groups = parse_trace_groups("audio,crypto").unwrap();
        assert_eq!(groups, vec!["audio", "crypto"]);
    }

    #[test]
    fn csv_selector_rejects_unknown_group() {
        assert!(parse_trace_groups("nonsense").is_err());
    }

    #[test]
    fn filter_directive_combines_level_and_groups() {
        let directive = build_filter_directive("warn", &["video", "event"]);
        assert_eq!(directive, "warn,trace::video=trace,trace::event=trace");
    }

    #[test]
    fn filter_directive_with_no_groups_is_just_the_level() {
        assert_eq!(build_filter_directive("info", &[]), "info");
    }

    #[test]
    fn parse_level_rejects_unknown() {
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn parse_level_all_known_variants() {
        assert_eq!(parse_level("trace").unwrap(), tracing::Level::TRACE);
        assert_eq!(parse_level("WARNING").unwrap(), tracing::Level::WARN);
    }
}
