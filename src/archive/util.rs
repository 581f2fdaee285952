use chrono::{DateTime, SecondsFormat, Utc};

/// Current wall-clock time as the ledger and artifacts record it.
///
/// This is the single timestamp format used for `*_utc` columns and fields;
/// do not format timestamps differently elsewhere.
pub fn now_utc() -> String {
    format_utc(Utc::now())
}

pub fn format_utc(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Truncate `input` to at most `max_chars` Unicode characters, stripping
/// control characters and appending `…` when truncated.
pub fn truncate_with_ellipsis(input: &str, max_chars: usize) -> String {
    let clean: String = input.chars().filter(|c| !c.is_control()).collect();
    if clean.chars().count() > max_chars {
        let mut s: String = clean.chars().take(max_chars).collect();
        s.push('…');
        s
    } else {
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn format_utc_uses_micros_and_z_suffix() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 5).single().expect("valid time");
        assert_eq!(format_utc(at), "2026-03-01T12:00:05.000000Z");
    }

    #[test]
    fn truncate_strips_controls_and_marks_cut() {
        assert_eq!(truncate_with_ellipsis("ab\ncdef", 3), "abc…");
        assert_eq!(truncate_with_ellipsis("abc", 3), "abc");
    }
}
