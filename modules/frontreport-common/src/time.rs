use chrono::{DateTime, Utc};

/// `2006-01-02T15:04:05.999Z` rendered with a fixed three-digit fraction,
/// matching the `@timestamp` format every report and index document uses.
pub fn format_report_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// `2006.01.02` UTC, used as the date segment of an index name.
pub fn format_index_date(at: DateTime<Utc>) -> String {
    at.format("%Y.%m.%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_report_timestamp_with_fixed_millis() {
        let at = Utc.with_ymd_and_hms(2026, 7, 28, 9, 5, 3).unwrap();
        assert_eq!(format_report_timestamp(at), "2026-07-28T09:05:03.000Z");
    }

    #[test]
    fn formats_index_date() {
        let at = Utc.with_ymd_and_hms(2026, 7, 28, 23, 59, 59).unwrap();
        assert_eq!(format_index_date(at), "2026.07.28");
    }
}
