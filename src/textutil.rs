//! Text and timestamp utilities shared across stages.
//!
//! Cleaning (stage 2) and correction (stage 4) both live here so their
//! behavior is testable without a warehouse. Cleaning strips noise without
//! touching meaningful content; correction repairs encoding damage.

use chrono::{DateTime, SecondsFormat, Utc};
use unicode_normalization::UnicodeNormalization;

/// Strip control characters (keeping `\n` and `\t`), normalize line
/// endings, and collapse runs of spaces and tabs. Meaningful content is
/// never altered; word counts are stable under cleaning.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev_blank = false;

    for c in text.replace("\r\n", "\n").chars() {
        if c.is_control() && c != '\n' && c != '\t' {
            continue;
        }
        let blank = c == ' ' || c == '\t';
        if blank && prev_blank {
            continue;
        }
        prev_blank = blank;
        out.push(if blank { ' ' } else { c });
    }

    out.trim_end().to_string()
}

/// Whitespace-delimited word count.
pub fn word_count(text: &str) -> i64 {
    text.split_whitespace().count() as i64
}

pub fn char_count(text: &str) -> i64 {
    text.chars().count() as i64
}

/// Truncate to at most `max_chars` characters. Returns the (possibly
/// shortened) text and whether truncation occurred; untruncated input is
/// returned unchanged.
pub fn truncate_text(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    (text.chars().take(max_chars).collect(), true)
}

/// Parse any RFC 3339 / ISO-8601 timestamp, normalizing to UTC.
pub fn deserialize_datetime(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Render a UTC timestamp in the canonical `Z`-suffixed form. Inverse of
/// [`deserialize_datetime`] for already-canonical strings.
pub fn serialize_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Current time as a fixed-width canonical string. Microsecond precision
/// keeps lexicographic and chronological order in agreement, which the
/// event store relies on.
pub fn now_utc() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

// Known UTF-8-read-as-Latin-1 marker sequences. Each is effectively
// impossible in legitimate prose, so replacement is safe.
const MOJIBAKE_TABLE: &[(&str, &str)] = &[
    ("\u{00e2}\u{20ac}\u{2122}", "'"),
    ("\u{00e2}\u{20ac}\u{0153}", "\""),
    ("\u{00e2}\u{20ac}\u{009d}", "\""),
    ("\u{00e2}\u{20ac}\u{201c}", "\u{2014}"),
    ("\u{00e2}\u{20ac}\u{2018}", "'"),
    ("\u{00e2}\u{20ac}\u{00a6}", "\u{2026}"),
    ("\u{00c3}\u{00a9}", "\u{00e9}"),
    ("\u{00c3}\u{00a8}", "\u{00e8}"),
    ("\u{00c3}\u{00a0}", "\u{00e0}"),
    ("\u{00c3}\u{00bc}", "\u{00fc}"),
    ("\u{00c3}\u{00b6}", "\u{00f6}"),
    ("\u{00c3}\u{00a4}", "\u{00e4}"),
    ("\u{00c2}\u{00a0}", " "),
];

/// Stage 4 repair: NFC normalization, confident mojibake fixes, and
/// doubled escape sequences (`\\n` as two characters) restored to real
/// newlines. Whitespace token boundaries are preserved so downstream word
/// counts keep their meaning.
pub fn repair_text(text: &str) -> String {
    let mut repaired: String = text.nfc().collect();

    for (broken, fixed) in MOJIBAKE_TABLE {
        if repaired.contains(broken) {
            repaired = repaired.replace(broken, fixed);
        }
    }

    // A literal backslash-n in a text body is an escape that leaked from
    // serialization; only repair when the body carries no real newlines,
    // which is the confident case.
    if !repaired.contains('\n') && repaired.contains("\\n") {
        repaired = repaired.replace("\\r\\n", "\n").replace("\\n", "\n");
    }

    repaired
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_strips_control_chars() {
        assert_eq!(clean_text("a\u{0000}b\u{0007}c"), "abc");
        assert_eq!(clean_text("keep\nnewline\tand tab"), "keep\nnewline and tab");
    }

    #[test]
    fn clean_collapses_space_runs() {
        assert_eq!(clean_text("a   b\t\tc"), "a b c");
        assert_eq!(word_count("a   b\t\tc"), word_count(&clean_text("a   b\t\tc")));
    }

    #[test]
    fn clean_normalizes_line_endings() {
        assert_eq!(clean_text("a\r\nb"), "a\nb");
    }

    #[test]
    fn clean_preserves_word_count() {
        let raw = "  hello \u{0001}  world\r\nfoo\tbar  ";
        assert_eq!(word_count(raw), word_count(&clean_text(raw)));
    }

    #[test]
    fn truncate_contract() {
        let (t, truncated) = truncate_text("hello", 10);
        assert_eq!(t, "hello");
        assert!(!truncated);

        let (t, truncated) = truncate_text("hello world", 5);
        assert_eq!(t, "hello");
        assert!(truncated);
        assert!(t.chars().count() <= 5);
    }

    #[test]
    fn truncate_is_char_safe() {
        let (t, truncated) = truncate_text("ééééé", 3);
        assert_eq!(t.chars().count(), 3);
        assert!(truncated);
    }

    #[test]
    fn datetime_roundtrip() {
        for s in ["2024-01-01T00:00:00Z", "2024-06-15T12:34:56.789Z"] {
            let dt = deserialize_datetime(s).unwrap();
            assert_eq!(serialize_datetime(&dt), s);
        }
    }

    #[test]
    fn datetime_normalizes_offsets_to_utc() {
        let dt = deserialize_datetime("2024-01-01T02:00:00+02:00").unwrap();
        assert_eq!(serialize_datetime(&dt), "2024-01-01T00:00:00Z");
    }

    #[test]
    fn repair_fixes_known_mojibake() {
        assert_eq!(repair_text("donâ€™t"), "don't");
        assert_eq!(repair_text("cafÃ©"), "café");
    }

    #[test]
    fn repair_restores_leaked_escapes() {
        assert_eq!(repair_text("line one\\nline two"), "line one\nline two");
        // Real newlines present: the backslash-n is content, leave it.
        assert_eq!(repair_text("a\\n\nb"), "a\\n\nb");
    }

    #[test]
    fn repair_applies_nfc() {
        // e + combining acute accent normalizes to the precomposed form.
        assert_eq!(repair_text("e\u{0301}"), "\u{00e9}");
    }
}
