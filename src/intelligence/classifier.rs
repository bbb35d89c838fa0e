use crate::models::MarketCategory;

/// Markets that settle over weeks or months. Checked first and override fast matches.
const SLOW_PHRASES: &[&str] = &[
    "world cup",
    "win the 2",
    "prime minister",
    "largest company",
    "fdv above",
    "win the most medals",
    "most medals",
    "next president",
    "next prime",
    "price of bitcoin be above",
    "price of ethereum be above",
    "tweets from",
];

const MONTHS: &[&str] = &[
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

/// Classify a market by how quickly it is expected to settle, from its title.
///
/// - **Slow**: elections, season-long championships, dated price targets.
/// - **CryptoFast**: "Up or Down" windows and titles pinned to a clock time.
/// - **SportsFast**: head-to-head matches, series, sets, totals.
/// - **Unknown**: everything else.
pub fn classify_market(title: &str) -> MarketCategory {
    let lower = title.to_lowercase();
    if lower.is_empty() {
        return MarketCategory::Unknown;
    }

    if is_slow(&lower) {
        return MarketCategory::Slow;
    }
    if is_crypto_fast(&lower) {
        return MarketCategory::CryptoFast;
    }
    if is_sports_fast(&lower) {
        return MarketCategory::SportsFast;
    }
    MarketCategory::Unknown
}

fn is_slow(lower: &str) -> bool {
    SLOW_PHRASES.iter().any(|p| lower.contains(p)) || has_by_month_deadline(lower)
}

fn is_crypto_fast(lower: &str) -> bool {
    lower.contains("up or down") || has_clock_time(lower)
}

fn is_sports_fast(lower: &str) -> bool {
    if has_word(lower, "vs") || has_word(lower, "o/u") {
        return true;
    }
    if ["bo1", "bo2", "bo3"].iter().any(|w| has_word(lower, w)) {
        return true;
    }
    if has_set_number(lower) || has_win_on_date(lower) {
        return true;
    }
    // "Match ... Winner"
    match find_word(lower, "match") {
        Some(pos) => has_word(&lower[pos..], "winner"),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Pattern helpers
// ---------------------------------------------------------------------------

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Byte offset of the first occurrence of `word` bounded by non-word characters.
fn find_word(haystack: &str, word: &str) -> Option<usize> {
    let bytes = haystack.as_bytes();
    let mut from = 0;
    while let Some(rel) = haystack[from..].find(word) {
        let start = from + rel;
        let end = start + word.len();
        let before_ok = start == 0 || !is_word_byte(bytes[start - 1]);
        let after_ok = end >= bytes.len() || !is_word_byte(bytes[end]);
        if before_ok && after_ok {
            return Some(start);
        }
        from = start + 1;
        while from < haystack.len() && !haystack.is_char_boundary(from) {
            from += 1;
        }
    }
    None
}

fn has_word(haystack: &str, word: &str) -> bool {
    find_word(haystack, word).is_some()
}

/// "8:30am", "12:00 pm" is not matched, the suffix must follow directly.
fn has_clock_time(lower: &str) -> bool {
    let b = lower.as_bytes();
    for i in 1..b.len() {
        if b[i] != b':' || !b[i - 1].is_ascii_digit() {
            continue;
        }
        let mins_ok = i + 2 < b.len() && b[i + 1].is_ascii_digit() && b[i + 2].is_ascii_digit();
        if !mins_ok {
            continue;
        }
        if i + 4 < b.len() && (b[i + 3] == b'a' || b[i + 3] == b'p') && b[i + 4] == b'm' {
            return true;
        }
    }
    false
}

/// "by March 31", "by June 30, 2026".
fn has_by_month_deadline(lower: &str) -> bool {
    let mut rest = lower;
    while let Some(pos) = rest.find("by ") {
        let after = &rest[pos + 3..];
        for month in MONTHS {
            if let Some(tail) = after.strip_prefix(month) {
                if let Some(day) = tail.strip_prefix(' ') {
                    if day.as_bytes().first().is_some_and(|c| c.is_ascii_digit()) {
                        return true;
                    }
                }
            }
        }
        rest = &rest[pos + 3..];
    }
    false
}

/// "Set 2 Winner".
fn has_set_number(lower: &str) -> bool {
    let mut from = 0;
    while let Some(rel) = lower[from..].find("set ") {
        let start = from + rel;
        let b = lower.as_bytes();
        let before_ok = start == 0 || !is_word_byte(b[start - 1]);
        let digit = start + 4;
        let digit_ok = digit < b.len() && b[digit].is_ascii_digit();
        let after_ok = digit + 1 >= b.len() || !is_word_byte(b[digit + 1]);
        if before_ok && digit_ok && after_ok {
            return true;
        }
        from = start + 4;
    }
    false
}

/// "win on 2026-02-06".
fn has_win_on_date(lower: &str) -> bool {
    let mut rest = lower;
    while let Some(pos) = rest.find("win on ") {
        let date = rest[pos + 7..].as_bytes();
        let shape_ok = date.len() >= 10
            && date[..4].iter().all(u8::is_ascii_digit)
            && date[4] == b'-'
            && date[5..7].iter().all(u8::is_ascii_digit)
            && date[7] == b'-'
            && date[8..10].iter().all(u8::is_ascii_digit);
        if shape_ok {
            return true;
        }
        rest = &rest[pos + 7..];
    }
    false
}
