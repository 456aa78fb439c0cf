//! Exponential backoff with jitter (§4.4 Retry policy):
//! `backoff(n) = min(base * 2^(n-1), cap) * uniform(0.5, 1.5)`.

use chrono::Duration as ChronoDuration;
use rand::Rng;

pub fn compute(attempts: u32, base_seconds: u64, cap_seconds: u64) -> ChronoDuration {
    let exp = attempts.saturating_sub(1).min(32);
    let unjittered = (base_seconds.saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX).max(1)))
        .min(cap_seconds);
    let jitter: f64 = rand::rng().random_range(0.5..=1.5);
    let millis = (unjittered as f64 * 1000.0 * jitter) as i64;
    ChronoDuration::milliseconds(millis.max(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_jitter_bounds_of_unjittered_value() {
        for attempts in 1..10 {
            let d = compute(attempts, 2, 60);
            let exp = attempts.saturating_sub(1).min(32);
            let unjittered = (2u64.saturating_mul(1u64 << exp)).min(60) as f64;
            let secs = d.num_milliseconds() as f64 / 1000.0;
            assert!(secs >= unjittered * 0.5 - 0.01, "attempts={attempts} secs={secs} unjittered={unjittered}");
            assert!(secs <= unjittered * 1.5 + 0.01, "attempts={attempts} secs={secs} unjittered={unjittered}");
        }
    }

    #[test]
    fn respects_cap() {
        let d = compute(20, 2, 60);
        let secs = d.num_milliseconds() as f64 / 1000.0;
        assert!(secs <= 90.0, "secs={secs}");
    }
}
