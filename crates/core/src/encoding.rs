//! Order-preserving string encoding for integers
//!
//! Index keys are compared as byte strings, so numbers embedded in them must
//! be encoded such that lexicographic order equals numeric order. Natural
//! numbers are written as their decimal digits prefixed by a recursive length
//! header:
//!
//! ```text
//! 0      -> "0"
//! 5      -> "=5"
//! 12     -> "==212"        ('=' + encode(2) + "12")
//! 1234567890123 -> "===213" + "1234567890123"
//! ```
//!
//! Each `=` means "a length follows". A longer number always carries at least
//! as many markers as a shorter one, and `=` sorts after every digit, so more
//! digits sort later.
//!
//! Negative numbers encode their absolute value and then complement every
//! character (`=` becomes `-`, digit `d` becomes `9 - d`). `-` sorts before
//! `0`, so every negative value sorts before zero and larger magnitudes sort
//! earlier. The descending encoding of `n` is the encoding of `-n`.

use crate::error::{Error, Result};

/// Marks that a length header follows.
pub const LENGTH_MARKER: char = '=';

/// Complement of [`LENGTH_MARKER`] used for negative values.
pub const NEGATIVE_MARKER: char = '-';

/// Encode a natural number in ascending order.
pub fn encode_natural(n: u64) -> String {
    encode_digits(&n.to_string())
}

/// Encode a signed integer; negatives sort before zero.
pub fn encode_signed(n: i64) -> String {
    let encoded = encode_digits(&n.unsigned_abs().to_string());
    if n < 0 {
        complement(&encoded)
    } else {
        encoded
    }
}

/// Encode a natural number so that larger values sort first.
///
/// Equal to `encode_signed(-n)`; zero encodes as `"0"`.
pub fn encode_descending(n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    complement(&encode_natural(n))
}

/// Encode an arbitrary-width signed decimal string (e.g. a `U256` balance).
///
/// Leading zeros are ignored and `-0` is zero.
///
/// # Errors
///
/// Returns [`Error::Encoding`] if the input is not an optional `-` followed by
/// at least one ASCII digit.
pub fn encode_decimal(decimal: &str) -> Result<String> {
    let (negative, digits) = canonical_decimal(decimal)?;
    let encoded = encode_digits(&digits);
    Ok(if negative { complement(&encoded) } else { encoded })
}

/// Encode an arbitrary-width decimal so that larger values sort first.
pub fn encode_descending_decimal(decimal: &str) -> Result<String> {
    let (negative, digits) = canonical_decimal(decimal)?;
    let encoded = encode_digits(&digits);
    Ok(if negative || digits == "0" {
        encoded
    } else {
        complement(&encoded)
    })
}

/// Decode any encoding produced by this module back to a decimal string.
///
/// # Errors
///
/// Returns [`Error::Encoding`] on malformed or non-canonical input.
pub fn decode_decimal(encoded: &str) -> Result<String> {
    let negative = encoded.starts_with(NEGATIVE_MARKER);
    let ascending = if negative {
        uncomplement(encoded)?
    } else {
        encoded.to_string()
    };

    let (digits, used) = parse_prefix(ascending.as_bytes())?;
    if used != ascending.len() {
        return Err(Error::Encoding(format!(
            "trailing characters after encoded number in {:?}",
            encoded
        )));
    }
    if negative {
        if digits == "0" {
            return Err(Error::Encoding("negative zero".to_string()));
        }
        Ok(format!("-{}", digits))
    } else {
        Ok(digits)
    }
}

/// Decode an ascending natural-number encoding.
pub fn decode_natural(encoded: &str) -> Result<u64> {
    let decimal = decode_decimal(encoded)?;
    decimal
        .parse::<u64>()
        .map_err(|e| Error::Encoding(format!("{:?} is not a u64: {}", decimal, e)))
}

fn encode_digits(digits: &str) -> String {
    if digits == "0" {
        return "0".to_string();
    }

    let mut out = String::with_capacity(digits.len() + 4);
    out.push(LENGTH_MARKER);
    if digits.len() > 1 {
        out.push_str(&encode_digits(&digits.len().to_string()));
    }
    out.push_str(digits);
    out
}

fn complement(encoded: &str) -> String {
    encoded
        .chars()
        .map(|c| match c {
            LENGTH_MARKER => NEGATIVE_MARKER,
            d => char::from(b'9' - (d as u8 - b'0')),
        })
        .collect()
}

fn uncomplement(encoded: &str) -> Result<String> {
    encoded
        .chars()
        .map(|c| match c {
            NEGATIVE_MARKER => Ok(LENGTH_MARKER),
            d if d.is_ascii_digit() => Ok(char::from(b'9' - (d as u8 - b'0'))),
            other => Err(Error::Encoding(format!("unknown character {:?}", other))),
        })
        .collect()
}

fn canonical_decimal(decimal: &str) -> Result<(bool, String)> {
    let (negative, digits) = match decimal.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, decimal),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Encoding(format!(
            "{:?} is not a decimal integer",
            decimal
        )));
    }
    let trimmed = digits.trim_start_matches('0');
    if trimmed.is_empty() {
        return Ok((false, "0".to_string()));
    }
    Ok((negative, trimmed.to_string()))
}

/// Parse one encoded natural number from the front of `input`.
///
/// Returns the decimal digits and the number of bytes consumed.
fn parse_prefix(input: &[u8]) -> Result<(String, usize)> {
    let malformed = || Error::Encoding(format!("malformed encoding {:?}", String::from_utf8_lossy(input)));

    match input.first() {
        Some(b'0') => Ok(("0".to_string(), 1)),
        Some(b'=') => match input.get(1) {
            Some(d @ b'1'..=b'9') => Ok((char::from(*d).to_string(), 2)),
            Some(b'=') => {
                let (len_digits, used) = parse_prefix(&input[1..])?;
                let len: usize = len_digits.parse().map_err(|_| malformed())?;
                if len < 2 {
                    return Err(malformed());
                }
                let start = 1 + used;
                let digits = input.get(start..start + len).ok_or_else(malformed)?;
                if digits[0] == b'0' || !digits.iter().all(u8::is_ascii_digit) {
                    return Err(malformed());
                }
                let digits = String::from_utf8(digits.to_vec()).map_err(|_| malformed())?;
                Ok((digits, start + len))
            }
            _ => Err(malformed()),
        },
        _ => Err(malformed()),
    }
}
