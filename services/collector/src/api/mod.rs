//! Platform discovery API clients.
//!
//! Both clients are stateless and fail in place: a page fetch error ends
//! pagination with whatever was collected, and a chat-coordinate miss
//! returns None so the channel is simply skipped for that cycle.

pub mod chzzk;
pub mod soop;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde_json::Value;

/// Browser-like agent both platforms expect; requests without one are
/// served a degraded payload.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                              (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Sleep between index pages.
pub const PAGE_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Per-request timeout; the orchestrator wraps whole polls in its own
/// 60-second deadline on top of this.
pub const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// Read a field that platforms serve as either a JSON string or number.
pub(crate) fn flexible_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read an integer served as a number or a (possibly comma-grouped) string.
pub(crate) fn flexible_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

/// Parse a platform-local `YYYY-MM-DD HH:MM:SS` timestamp (KST) to UTC.
pub(crate) fn parse_kst(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%d %H:%M:%S").ok()?;
    let kst = FixedOffset::east_opt(9 * 3600)?;
    Some(
        naive
            .and_local_timezone(kst)
            .single()?
            .with_timezone(&Utc),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn flexible_fields_accept_strings_and_numbers() {
        assert_eq!(flexible_string(&json!("abc")), Some("abc".to_owned()));
        assert_eq!(flexible_string(&json!(123)), Some("123".to_owned()));
        assert_eq!(flexible_string(&json!("")), None);
        assert_eq!(flexible_i64(&json!(77)), Some(77));
        assert_eq!(flexible_i64(&json!("1,234")), Some(1234));
        assert_eq!(flexible_i64(&json!("n/a")), None);
    }

    #[test]
    fn kst_timestamps_shift_to_utc() {
        let parsed = parse_kst("2026-03-01 09:00:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2026-03-01T00:00:00+00:00");
        assert!(parse_kst("not a date").is_none());
    }
}
