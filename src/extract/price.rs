//! Price and mileage text parsing.

use std::sync::LazyLock;

use regex::Regex;

static PRICE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(k)?\b").unwrap());

/// Largest amount accepted as a price or mileage. Anything above is a
/// misparse (concatenated digits, lot numbers).
pub const MAX_AMOUNT: u64 = 1_000_000_000_000;

static MILEAGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)\s*(k)?\s*(?:miles|mi)\b").unwrap());

/// Parse an amount such as `$45,000`, `USD $1,234.56` or `45k`.
///
/// Returns whole dollars, rounded.
pub fn parse_price(text: &str) -> Option<u64> {
    parse_amount(&PRICE_PATTERN, text)
}

/// Parse a mileage such as `12,500 miles` or `31k mi`.
pub fn parse_mileage(text: &str) -> Option<u64> {
    parse_amount(&MILEAGE_PATTERN, text)
}

fn parse_amount(pattern: &Regex, text: &str) -> Option<u64> {
    let caps = pattern.captures(text)?;
    let number: f64 = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let value = if caps.get(2).is_some() {
        number * 1000.0
    } else {
        number
    };
    bounded_amount(value)
}

/// Round a raw number to whole units, rejecting negative, non-finite and
/// out-of-range values.
pub fn bounded_amount(value: f64) -> Option<u64> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let rounded = value.round();
    (rounded <= MAX_AMOUNT as f64).then_some(rounded as u64)
}
