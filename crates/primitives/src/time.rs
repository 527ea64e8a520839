//! UTC `YYYY-MM-DDTHH:MM:SSZ` timestamps as written in wallet dumps.

const SECS_PER_DAY: i64 = 86_400;

pub fn format_iso8601(unix_seconds: i64) -> String {
    let days = unix_seconds.div_euclid(SECS_PER_DAY);
    let secs_of_day = unix_seconds.rem_euclid(SECS_PER_DAY);
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        secs_of_day / 3600,
        (secs_of_day % 3600) / 60,
        secs_of_day % 60
    )
}

/// Parses a dump timestamp. Anything unparseable yields 0, the "unknown birth
/// time" value, so a damaged field widens the rescan instead of failing it.
pub fn parse_iso8601(input: &str) -> i64 {
    parse_iso8601_strict(input).unwrap_or(0)
}

pub fn parse_iso8601_strict(input: &str) -> Option<i64> {
    let bytes = input.trim().as_bytes();
    if bytes.len() != 20
        || bytes[4] != b'-'
        || bytes[7] != b'-'
        || bytes[10] != b'T'
        || bytes[13] != b':'
        || bytes[16] != b':'
        || bytes[19] != b'Z'
    {
        return None;
    }
    let field = |range: std::ops::Range<usize>| -> Option<i64> {
        let text = std::str::from_utf8(&bytes[range]).ok()?;
        if !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        text.parse().ok()
    };
    let year = field(0..4)?;
    let month = field(5..7)?;
    let day = field(8..10)?;
    let hour = field(11..13)?;
    let minute = field(14..16)?;
    let second = field(17..19)?;
    if !(1..=12).contains(&month)
        || day < 1
        || day > days_in_month(year, month)
        || hour > 23
        || minute > 59
        || second > 60
    {
        return None;
    }
    let days = days_from_civil(year, month as u32, day as u32);
    Some(days * SECS_PER_DAY + hour * 3600 + minute * 60 + second)
}

fn days_in_month(year: i64, month: i64) -> i64 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        _ if (year % 4 == 0 && year % 100 != 0) || year % 400 == 0 => 29,
        _ => 28,
    }
}

// Howard Hinnant's civil calendar conversions (public domain).
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u32;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe as i64 + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = if year >= 0 { year } else { year - 399 } / 400;
    let yoe = (year - era * 400) as u32;
    let mp = if month > 2 { month - 3 } else { month + 9 };
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe as i64 - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_and_known_instant() {
        assert_eq!(format_iso8601(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_iso8601(1_231_006_505), "2009-01-03T18:15:05Z");
    }

    #[test]
    fn parse_inverts_format() {
        for ts in [0i64, 1, 951_782_400, 1_231_006_505, 1_700_000_000, 4_102_444_799] {
            assert_eq!(parse_iso8601(&format_iso8601(ts)), ts);
        }
    }

    #[test]
    fn malformed_times_parse_as_zero() {
        assert_eq!(parse_iso8601("0"), 0);
        assert_eq!(parse_iso8601("2019-02-30T00:00:00Z"), 0);
        assert_eq!(parse_iso8601("2019-01-01 00:00:00"), 0);
        assert_eq!(parse_iso8601_strict("20x9-01-01T00:00:00Z"), None);
    }
}
