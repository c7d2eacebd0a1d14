//! Human-readable size parsing.

use crate::error::{ImageError, Result};

const KIB: u64 = 1024;

/// Parse a memory size such as `512m`, `1.5g`, `64MiB` or `1024` into bytes.
///
/// Multipliers are binary (k = 1024). An optional `i` and/or `b` may follow
/// the unit letter, and a single space may separate number and unit.
pub fn parse_ram_bytes(input: &str) -> Result<u64> {
    let s = input.trim();
    let invalid = || ImageError::InvalidArgument(format!("invalid size: {:?}", input));

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    if num.is_empty() || num.starts_with('.') || num.ends_with('.') {
        return Err(invalid());
    }
    let value: f64 = num.parse().map_err(|_| invalid())?;

    let suffix = suffix.strip_prefix(' ').unwrap_or(suffix).to_ascii_lowercase();
    let mut chars = suffix.chars();
    let mult = match chars.next() {
        None => 1,
        Some('b') => {
            return if chars.next().is_none() {
                Ok(value as u64)
            } else {
                Err(invalid())
            };
        }
        Some('k') => KIB,
        Some('m') => KIB.pow(2),
        Some('g') => KIB.pow(3),
        Some('t') => KIB.pow(4),
        Some('p') => KIB.pow(5),
        Some(_) => return Err(invalid()),
    };

    let rest: String = chars.collect();
    if !matches!(rest.as_str(), "" | "b" | "i" | "ib") {
        return Err(invalid());
    }

    Ok((value * mult as f64) as u64)
}

/// Parse an optional size field where an empty string means "unset".
pub fn parse_optional_ram_bytes(input: &str) -> Result<Option<u64>> {
    if input.trim().is_empty() {
        Ok(None)
    } else {
        parse_ram_bytes(input).map(Some)
    }
}
