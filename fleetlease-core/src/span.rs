//! Config-derived time spans, clamped so date arithmetic cannot overflow.

use chrono::TimeDelta;

/// Longest window any setting may describe: one hundred years.
pub const MAX_SPAN_SECS: u64 = 100 * 365 * 86_400;

pub fn secs(value: u64) -> TimeDelta {
    let bounded = i64::try_from(value.min(MAX_SPAN_SECS)).unwrap_or(0);
    TimeDelta::try_seconds(bounded).unwrap_or(TimeDelta::zero())
}

/// Negative values count as zero.
pub fn signed_secs(value: i64) -> TimeDelta {
    secs(u64::try_from(value).unwrap_or(0))
}

pub fn days(value: i64) -> TimeDelta {
    secs(u64::try_from(value).unwrap_or(0).saturating_mul(86_400))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    #[test]
    fn absurd_values_are_clamped() {
        let now = Utc::now();
        let widest = secs(u64::MAX);
        assert_eq!(widest.num_seconds(), MAX_SPAN_SECS as i64);
        assert!(now.checked_sub_signed(widest).is_some());
        assert!(now.checked_add_signed(days(i64::MAX)).is_some());
        assert_eq!(signed_secs(-5), TimeDelta::zero());
        assert_eq!(signed_secs(90).num_seconds(), 90);
    }
}
