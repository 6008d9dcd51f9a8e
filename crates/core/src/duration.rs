//! `std::time::Duration` 到 `chrono::Duration` 的换算

use std::time::Duration;

/// 换算结果的上限（约 100 年），与任意合理时间点相加都不会溢出
const MAX_DAYS: i64 = 36_500;

/// 超出上限的时长按上限处理
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    let max = chrono::Duration::days(MAX_DAYS);
    chrono::Duration::from_std(duration).map_or(max, |converted| converted.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converts_exactly_below_cap() {
        assert_eq!(to_chrono(Duration::from_millis(30_000)), chrono::Duration::seconds(30));
        assert_eq!(to_chrono(Duration::ZERO), chrono::Duration::zero());
    }

    #[test]
    fn test_saturates_at_cap() {
        let cap = chrono::Duration::days(MAX_DAYS);
        assert_eq!(to_chrono(Duration::MAX), cap);
        assert_eq!(to_chrono(Duration::from_secs(u64::MAX / 2)), cap);
        assert!(chrono::Utc::now().checked_add_signed(to_chrono(Duration::MAX)).is_some());
    }
}
