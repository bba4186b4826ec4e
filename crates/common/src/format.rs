//! Human-readable formatting helpers shared by the dispatch layer and the
//! worker daemon (durations, token counts, log truncation).

use std::time::Duration;

/// Formats a duration compactly: "45ms", "1.5s", "2m 30s", "1h 15m".
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        return format!("{}ms", d.as_millis());
    }
    if d < Duration::from_secs(60) {
        return format!("{:.1}s", d.as_secs_f64());
    }
    let minutes = d.as_secs() / 60;
    let seconds = d.as_secs() % 60;
    if minutes < 60 {
        if seconds > 0 {
            return format!("{}m {}s", minutes, seconds);
        }
        return format!("{}m", minutes);
    }
    let hours = minutes / 60;
    let minutes = minutes % 60;
    if minutes > 0 {
        return format!("{}h {}m", hours, minutes);
    }
    format!("{}h", hours)
}

/// Formats a number with comma separators: 1234567 -> "1,234,567".
pub fn format_number(n: u64) -> String {
    let digits = n.to_string();
    if digits.len() <= 3 {
        return digits;
    }
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Appends the execution-metrics footer to a response. Token count is left
/// out when nothing was metered.
pub fn append_metrics(text: &str, elapsed: Duration, tokens_used: u64) -> String {
    if tokens_used > 0 {
        format!(
            "{}\n\n---\n⏱️ Time: {} | 🎯 Tokens: {}",
            text,
            format_duration(elapsed),
            format_number(tokens_used)
        )
    } else {
        format!("{}\n\n---\n⏱️ Time: {}", text, format_duration(elapsed))
    }
}

/// Keeps the tail of a long log, restarting at a newline when one is close to
/// the cut so no line is split mid-way.
pub fn truncate_log_tail(log: &str, max_len: usize) -> String {
    if log.len() <= max_len {
        return log.to_string();
    }
    let mut start = log.len() - max_len;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    let mut tail = &log[start..];
    if let Some(idx) = tail.find('\n') {
        if idx > 0 && idx < 100 {
            tail = &tail[idx + 1..];
        }
    }
    format!("...(truncated)\n{}", tail)
}

/// Returns the last `n` lines of a multi-line string.
pub fn last_n_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() <= n {
        return text.to_string();
    }
    lines[lines.len() - n..].join("\n")
}
