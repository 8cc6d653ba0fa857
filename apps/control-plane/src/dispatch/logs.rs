use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::types::InvocationMetrics;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TailLog {
    pub lines: Vec<String>,
    pub metrics: InvocationMetrics,
}

/// Parses a base64 tail log returned by a direct invocation.
///
/// `START` and `END` markers are dropped. The `REPORT` line supplies duration and
/// peak memory. Application lines are kept only when `collect` is set, with the
/// timestamp, request id and level preamble removed. Collected logs end with a
/// one-line execution summary.
pub fn parse_tail_log(encoded: &str, collect: bool) -> TailLog {
    let decoded = STANDARD
        .decode(encoded.trim())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();

    let mut tail = TailLog::default();
    for line in decoded.lines() {
        if line.starts_with("START") || line.starts_with("END") {
            continue;
        }
        if line.starts_with("REPORT") {
            tail.metrics.duration_ms = report_field(line, "Duration:").and_then(|v| v.parse().ok());
            tail.metrics.max_memory_mb =
                report_field(line, "Max Memory Used:").and_then(|v| v.parse().ok());
            continue;
        }
        if collect && !line.trim().is_empty() {
            tail.lines.push(strip_preamble(line).to_string());
        }
    }

    if collect {
        let duration = tail
            .metrics
            .duration_ms
            .map_or_else(|| "N/A".to_string(), |value| value.to_string());
        let memory = tail
            .metrics
            .max_memory_mb
            .map_or_else(|| "N/A".to_string(), |value| value.to_string());
        tail.lines.push(format!(
            "Last execution took {duration} ms and used {memory} MB of memory."
        ));
    }
    tail
}

/// Leading numeric token after `label`, e.g. `12.34` from `Duration: 12.34 ms`.
fn report_field<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let rest = line.split_once(label)?.1.trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

/// `<timestamp>\t<request id>\t<LEVEL>\t<message>` becomes `<message>`.
fn strip_preamble(line: &str) -> &str {
    let mut fields = line.splitn(3, '\t');
    let (Some(timestamp), Some(request_id), Some(rest)) = (fields.next(), fields.next(), fields.next())
    else {
        return line;
    };
    if timestamp.is_empty() || request_id.is_empty() || timestamp.contains(' ') {
        return line;
    }
    let rest = rest.trim_start_matches('\t');
    let rest = ["INFO", "ERROR", "WARN", "DEBUG"]
        .iter()
        .find_map(|level| rest.strip_prefix(level).and_then(|tail| tail.strip_prefix('\t')))
        .unwrap_or(rest);
    let message = rest.trim_start_matches('\t');
    if message.is_empty() { line } else { message }
}
