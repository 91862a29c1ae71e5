//! Rule-based sentence segmentation.
//!
//! Splits message text into sentence segments on terminator punctuation
//! (`.`, `!`, `?`) and hard line breaks, with guards for abbreviations,
//! decimal numbers, and ellipses. Segmentation partitions the input at
//! whitespace boundaries, so the word counts of the segments always sum
//! to the word count of the whole message.

use crate::textutil::word_count;

/// One detected sentence. Offsets are character positions into the
/// original text, spanning the trimmed segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Sentence {
    pub index: i64,
    pub text: String,
    pub start_char: i64,
    pub end_char: i64,
    pub word_count: i64,
}

// Tokens that end with a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "vs", "etc", "e.g", "i.e", "eg", "ie",
    "no", "vol", "inc", "ltd", "co", "fig", "approx",
];

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?')
}

fn is_abbreviation(chars: &[char], terminator_pos: usize) -> bool {
    // Collect the token immediately before the period.
    let mut start = terminator_pos;
    while start > 0 && !chars[start - 1].is_whitespace() {
        start -= 1;
    }
    let token: String = chars[start..terminator_pos].iter().collect::<String>().to_lowercase();
    if token.is_empty() {
        return false;
    }
    // Single-letter initials ("J. Smith") and known abbreviations.
    if token.chars().count() == 1 && token.chars().next().is_some_and(|c| c.is_alphabetic()) {
        return true;
    }
    ABBREVIATIONS.contains(&token.trim_end_matches('.'))
}

/// Segment `text` into sentences. Empty or whitespace-only input yields
/// no sentences.
pub fn segment(text: &str) -> Vec<Sentence> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut sentences = Vec::new();
    let mut seg_start = 0usize;

    let push_segment = |sentences: &mut Vec<Sentence>, start: usize, end: usize| {
        if start >= end {
            return;
        }
        // Trim whitespace off both edges, tracking offsets.
        let mut s = start;
        let mut e = end;
        while s < e && chars[s].is_whitespace() {
            s += 1;
        }
        while e > s && chars[e - 1].is_whitespace() {
            e -= 1;
        }
        if s == e {
            return;
        }
        let body: String = chars[s..e].iter().collect();
        let wc = word_count(&body);
        let index = sentences.len() as i64;
        sentences.push(Sentence {
            index,
            text: body,
            start_char: s as i64,
            end_char: e as i64,
            word_count: wc,
        });
    };

    let mut i = 0usize;
    while i < n {
        let c = chars[i];

        if c == '\n' {
            push_segment(&mut sentences, seg_start, i);
            seg_start = i + 1;
            i += 1;
            continue;
        }

        if is_terminator(c) {
            // Decimal number: digit on both sides of a period.
            if c == '.'
                && i > 0
                && i + 1 < n
                && chars[i - 1].is_ascii_digit()
                && chars[i + 1].is_ascii_digit()
            {
                i += 1;
                continue;
            }

            if c == '.' && is_abbreviation(&chars, i) {
                i += 1;
                continue;
            }

            // Swallow terminator runs ("..." / "?!") as one boundary.
            let mut end = i + 1;
            while end < n && (is_terminator(chars[end]) || chars[end] == '"' || chars[end] == '\'')
            {
                end += 1;
            }

            // Only split when followed by whitespace (or end of text);
            // mid-token punctuation like "example.com" stays together.
            if end >= n || chars[end].is_whitespace() {
                push_segment(&mut sentences, seg_start, end);
                seg_start = end;
                i = end;
                continue;
            }
            i = end;
            continue;
        }

        i += 1;
    }

    push_segment(&mut sentences, seg_start, n);
    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_basic_sentences() {
        let s = segment("Hello world. How are you? Fine!");
        assert_eq!(s.len(), 3);
        assert_eq!(s[0].text, "Hello world.");
        assert_eq!(s[1].text, "How are you?");
        assert_eq!(s[2].text, "Fine!");
        assert_eq!(s[0].index, 0);
        assert_eq!(s[2].index, 2);
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(segment("").is_empty());
        assert!(segment("   \n  ").is_empty());
    }

    #[test]
    fn abbreviations_do_not_split() {
        let s = segment("Dr. Smith met Mr. Jones. They talked.");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].text, "Dr. Smith met Mr. Jones.");
    }

    #[test]
    fn decimals_do_not_split() {
        let s = segment("Pi is 3.14 roughly. Yes.");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].text, "Pi is 3.14 roughly.");
    }

    #[test]
    fn ellipsis_is_one_boundary() {
        let s = segment("Wait... what? Ok.");
        assert_eq!(s.len(), 3);
        assert_eq!(s[0].text, "Wait...");
    }

    #[test]
    fn urls_stay_together() {
        let s = segment("See example.com for details. Thanks.");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].text, "See example.com for details.");
    }

    #[test]
    fn newlines_split_segments() {
        let s = segment("first line\nsecond line");
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn offsets_span_trimmed_segments() {
        let text = "One two. Three.";
        let s = segment(text);
        let chars: Vec<char> = text.chars().collect();
        for sent in &s {
            let span: String =
                chars[sent.start_char as usize..sent.end_char as usize].iter().collect();
            assert_eq!(span, sent.text);
        }
    }

    #[test]
    fn word_counts_sum_to_message_word_count() {
        let samples = [
            "Hello world. How are you today? I am fine!",
            "Dr. Smith said 3.14 is close. Mr. Jones agreed... mostly!",
            "single",
            "Multi\nline\ntext here. With sentences.",
            "Trailing space sentence.  Next one. ",
        ];
        for text in samples {
            let total = word_count(text);
            let sum: i64 = segment(text).iter().map(|s| s.word_count).sum();
            assert_eq!(sum, total, "word count mismatch for {:?}", text);
        }
    }
}
