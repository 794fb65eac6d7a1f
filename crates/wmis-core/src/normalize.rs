//! Total conversions from extractor-provided price and quantity values to
//! typed numbers. Malformed input falls back to a default instead of failing.

use crate::trade_contracts::LooseNumber;
use std::borrow::Cow;

pub const DEFAULT_PRICE: f64 = 0.0;
pub const DEFAULT_QUANTITY: u32 = 1;

const THOUSAND: f64 = 1_000.0;
const TEN_THOUSAND: f64 = 10_000.0;

/// Checked in this order; the first word present in the text wins.
const NUMERAL_WORDS: [(char, u32); 6] = [
    ('一', 1),
    ('两', 2),
    ('二', 2),
    ('三', 3),
    ('四', 4),
    ('五', 5),
];

pub fn normalize_price(raw: &LooseNumber) -> f64 {
    let value = match raw {
        LooseNumber::Integer(value) => *value as f64,
        LooseNumber::Float(value) => *value,
        LooseNumber::Text(text) => parse_price_text(text),
    };
    non_negative_price(value)
}

pub fn normalize_price_text(text: &str) -> f64 {
    non_negative_price(parse_price_text(text))
}

pub fn normalize_quantity(raw: &LooseNumber) -> u32 {
    match raw {
        LooseNumber::Integer(value) => positive_quantity(*value),
        LooseNumber::Float(value) if value.is_finite() => positive_quantity(value.trunc() as i64),
        LooseNumber::Float(_) => DEFAULT_QUANTITY,
        LooseNumber::Text(text) => normalize_quantity_text(text),
    }
}

pub fn normalize_quantity_text(text: &str) -> u32 {
    let text = fold_fullwidth_digits(text);
    let text = text.as_ref();
    if let Some(digits) = first_digit_run(text) {
        return digits
            .parse::<i64>()
            .map(positive_quantity)
            .unwrap_or(DEFAULT_QUANTITY);
    }

    NUMERAL_WORDS
        .iter()
        .find(|(word, _)| text.contains(*word))
        .map_or(DEFAULT_QUANTITY, |(_, value)| *value)
}

// `k` and `w` are mutually exclusive and take priority over the plain path.
fn parse_price_text(text: &str) -> f64 {
    let lowered = fold_fullwidth_digits(text).trim().to_lowercase();

    if lowered.contains('k') {
        return parse_scaled(&lowered, 'k', THOUSAND);
    }
    if lowered.contains('w') {
        return parse_scaled(&lowered, 'w', TEN_THOUSAND);
    }

    let cleaned = lowered
        .chars()
        .filter(|ch| *ch != ',' && !ch.is_whitespace())
        .collect::<String>();
    cleaned.parse::<f64>().unwrap_or(DEFAULT_PRICE)
}

fn parse_scaled(lowered: &str, unit: char, multiplier: f64) -> f64 {
    let cleaned = lowered
        .chars()
        .filter(|ch| *ch != unit && !ch.is_whitespace())
        .collect::<String>();
    cleaned
        .parse::<f64>()
        .map(|value| value * multiplier)
        .unwrap_or(DEFAULT_PRICE)
}

fn non_negative_price(value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        DEFAULT_PRICE
    }
}

fn positive_quantity(value: i64) -> u32 {
    if value < 1 {
        return DEFAULT_QUANTITY;
    }
    u32::try_from(value).unwrap_or(DEFAULT_QUANTITY)
}

/// Input methods commonly emit `０`-`９` (U+FF10..U+FF19) for digits.
fn fold_fullwidth_digits(text: &str) -> Cow<'_, str> {
    if !text.chars().any(is_fullwidth_digit) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.chars()
            .map(|ch| {
                if is_fullwidth_digit(ch) {
                    char::from_u32(u32::from(ch) - 0xFF10 + u32::from('0')).unwrap_or(ch)
                } else {
                    ch
                }
            })
            .collect(),
    )
}

fn is_fullwidth_digit(ch: char) -> bool {
    ('\u{FF10}'..='\u{FF19}').contains(&ch)
}

fn first_digit_run(text: &str) -> Option<&str> {
    let start = text.find(|ch: char| ch.is_ascii_digit())?;
    let rest = &text[start..];
    let end = rest
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}
