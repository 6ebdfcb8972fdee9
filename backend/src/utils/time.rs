use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;

/// Hour of day (0-23) of `instant` in the configured timezone.
pub fn local_hour(instant: DateTime<Utc>, tz: &Tz) -> u32 {
    instant.with_timezone(tz).hour()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn local_hour_applies_offset() {
        let instant = Utc.with_ymd_and_hms(2026, 1, 15, 1, 30, 0).unwrap();
        assert_eq!(local_hour(instant, &chrono_tz::UTC), 1);
        assert_eq!(local_hour(instant, &chrono_tz::Africa::Lagos), 2);
        assert_eq!(local_hour(instant, &chrono_tz::Asia::Tokyo), 10);
    }
}
