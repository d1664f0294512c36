use std::env;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{NaiveDateTime, TimeZone, Utc};

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    env_optional(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_usize(name: &str, default: usize) -> usize {
    env_optional(name)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_i64(name: &str, default: i64) -> i64 {
    env_optional(name)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn jitter_ratio() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Compare two secrets without early exit so timing doesn't leak the
/// position of the first mismatching byte.
pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let mut diff = (a.len() ^ b.len()) as u8;
    let longest = a.len().max(b.len());
    for i in 0..longest {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

/// Truncate to at most `max` characters, appending an ellipsis when content
/// was dropped. Char-based so multibyte input never splits.
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('\u{2026}');
    out
}

/// Lowercase slug of a task description: alphanumeric runs joined by
/// hyphens, capped at 40 chars, never empty.
pub(crate) fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug
    }
}

/// Six hex chars from a fresh UUID. Keeps minted branch names unique.
pub(crate) fn hex_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..6].to_string()
}

/// Pull http(s) URLs out of free text. Trailing punctuation that commonly
/// rides along in chat messages is stripped.
pub(crate) fn extract_urls(text: &str) -> Vec<String> {
    let mut urls = Vec::new();
    for token in text.split_whitespace() {
        let start = match token.find("http://").or_else(|| token.find("https://")) {
            Some(pos) => pos,
            None => continue,
        };
        let candidate =
            token[start..].trim_end_matches(['.', ',', ';', ':', ')', ']', '>', '"', '\'']);
        if candidate.len() > "https://x".len() && url::Url::parse(candidate).is_ok() {
            urls.push(candidate.to_string());
        }
    }
    urls
}

/// Parse an ISO-ish datetime into epoch milliseconds. Accepts RFC 3339 with
/// offset, or naive `YYYY-MM-DDTHH:MM[:SS]` which is taken as UTC.
pub(crate) fn parse_iso_datetime_ms(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp_millis());
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_millis());
        }
    }
    None
}

/// Render epoch milliseconds as RFC 3339 UTC.
pub(crate) fn format_ms_iso(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| format!("@{ms}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "secrex"));
        assert!(!constant_time_eq("secret", "secret2"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel\u{2026}");
        assert_eq!(truncate_chars("héllo", 2), "hé\u{2026}");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add logging"), "add-logging");
        assert_eq!(slugify("Fix  CI / release pipeline!"), "fix-ci-release-pipeline");
        assert_eq!(slugify("!!!"), "task");
        assert!(slugify("a very long task description that keeps going forever").len() <= 40);
    }

    #[test]
    fn test_hex_suffix_len() {
        let s = hex_suffix();
        assert_eq!(s.len(), 6);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_extract_urls() {
        let urls = extract_urls("see https://example.com/a, and (http://foo.dev/b).");
        assert_eq!(urls, vec!["https://example.com/a", "http://foo.dev/b"]);
        assert!(extract_urls("no links here").is_empty());
    }

    #[test]
    fn test_parse_iso_datetime_ms() {
        assert_eq!(parse_iso_datetime_ms("1970-01-01T00:01:00Z"), Some(60_000));
        assert_eq!(parse_iso_datetime_ms("1970-01-01T00:01"), Some(60_000));
        assert!(parse_iso_datetime_ms("not a date").is_none());
    }
}
