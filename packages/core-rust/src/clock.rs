//! Wall-clock helpers shared by envelopes and trace records.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Returns the current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    millis_of(SystemTime::now())
}

/// Converts a `SystemTime` to milliseconds since Unix epoch.
///
/// Times before the epoch clamp to 0.
#[must_use]
pub fn millis_of(time: SystemTime) -> u64 {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis();
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Converts an elapsed duration to milliseconds with 3 decimal places,
/// rounding half to even.
#[must_use]
pub fn round_millis(elapsed: Duration) -> f64 {
    let micros = elapsed.as_secs_f64() * 1_000_000.0;
    // Round at the nanosecond boundary first so float noise cannot pick the wrong side.
    let micros = (micros * 1000.0).round() / 1000.0;
    micros.round_ties_even() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn millis_of_epoch_is_zero() {
        assert_eq!(millis_of(UNIX_EPOCH), 0);
        assert_eq!(millis_of(UNIX_EPOCH + Duration::from_millis(1500)), 1500);
    }

    #[test]
    fn round_keeps_three_decimals() {
        assert!((round_millis(Duration::from_nanos(1_234_567)) - 1.235).abs() < 1e-9);
        assert!((round_millis(Duration::from_millis(20)) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn round_half_goes_to_even() {
        // 0.0125 ms -> 0.012, 0.0135 ms -> 0.014
        assert!((round_millis(Duration::from_nanos(12_500)) - 0.012).abs() < 1e-9);
        assert!((round_millis(Duration::from_nanos(13_500)) - 0.014).abs() < 1e-9);
    }
}
