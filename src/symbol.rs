// ===============================
// src/symbol.rs
// ===============================
//
// OCC-style contract symbol:
//   <ROOT><YYMMDD><C|P><STRIKE*1000, 8 digit>
//   contoh: AAPL240119C00190000 -> AAPL, 2024-01-19, Call, 190.000
//
// Decode gagal -> None. Caller wajib skip record tersebut, bukan error fatal.
//

use chrono::{Datelike, NaiveDate};

use crate::domain::{DecodedContract, OptionKind};

const SUFFIX_LEN: usize = 6 + 1 + 8;
const STRIKE_SCALE: f64 = 1000.0;
const MAX_SCALED_STRIKE: f64 = 99_999_999.0;

fn all_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn decode(symbol: &str) -> Option<DecodedContract> {
    // slicing per byte aman hanya untuk ASCII
    if !symbol.is_ascii() || symbol.len() <= SUFFIX_LEN {
        return None;
    }
    let (root, suffix) = symbol.split_at(symbol.len() - SUFFIX_LEN);
    if !root.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }

    let (date_part, rest) = suffix.split_at(6);
    let (kind_part, strike_part) = rest.split_at(1);
    if !all_digits(date_part) || !all_digits(strike_part) {
        return None;
    }
    let kind = kind_part.chars().next().and_then(OptionKind::from_code)?;

    let yy: i32 = date_part[0..2].parse().ok()?;
    let mm: u32 = date_part[2..4].parse().ok()?;
    let dd: u32 = date_part[4..6].parse().ok()?;
    let expiry = NaiveDate::from_ymd_opt(2000 + yy, mm, dd)?;

    let scaled: u64 = strike_part.parse().ok()?;

    Some(DecodedContract {
        underlying: root.to_string(),
        expiry,
        kind,
        strike: scaled as f64 / STRIKE_SCALE,
    })
}

/// Inverse of [`decode`]. `None` when the inputs cannot be represented
/// (year outside 2000..=2099, negative or oversized strike, bad root).
pub fn encode(ticker: &str, kind: OptionKind, strike: f64, expiry: NaiveDate) -> Option<String> {
    let root = ticker.trim().to_ascii_uppercase();
    if root.is_empty() || !root.bytes().all(|b| b.is_ascii_uppercase()) {
        return None;
    }
    if !(2000..=2099).contains(&expiry.year()) {
        return None;
    }
    let scaled = (strike * STRIKE_SCALE).round();
    if !scaled.is_finite() || scaled < 0.0 || scaled > MAX_SCALED_STRIKE {
        return None;
    }

    Some(format!(
        "{}{:02}{:02}{:02}{}{:08}",
        root,
        expiry.year() % 100,
        expiry.month(),
        expiry.day(),
        kind.code(),
        scaled as u64
    ))
}
