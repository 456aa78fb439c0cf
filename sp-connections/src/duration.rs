//! `idle_timeout`/`max_duration` are stored as free-form text (e.g. `"60s"`,
//! `"15m"`, `"2h"`) — §3 deliberately leaves the column opaque to the Store so
//! only this crate needs to agree with whoever writes the value on a format.

use chrono::Duration;

pub fn parse(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (digits, suffix) = s.split_at(s.len().checked_sub(1)?);
    let n: i64 = digits.parse().ok()?;
    match suffix {
        "s" => Some(Duration::seconds(n)),
        "m" => Some(Duration::minutes(n)),
        "h" => Some(Duration::hours(n)),
        "d" => Some(Duration::days(n)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_suffix() {
        assert_eq!(parse("60s"), Some(Duration::seconds(60)));
        assert_eq!(parse("15m"), Some(Duration::minutes(15)));
        assert_eq!(parse("2h"), Some(Duration::hours(2)));
        assert_eq!(parse("1d"), Some(Duration::days(1)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse("").is_none());
        assert!(parse("abc").is_none());
        assert!(parse("10x").is_none());
    }
}
