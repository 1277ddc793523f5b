// ===============================
// src/volatility.rs (30-day IV dari term structure)
// ===============================
//
// Ide:
//   1) decode semua kontrak, buang IV <= 0 / symbol rusak, group per expiry
//   2) buang bucket DTE < 5 (pin risk, IV tidak reliabel)
//   3) per bucket: ambil call & put dengan strike terdekat ke spot, rata-rata IV
//   4) titik (DTE, IV) sorted naik; |DTE-30| <= 1 -> pakai langsung,
//      selain itu interpolasi linear antara tetangga bawah & atas 30,
//      satu sisi saja -> clamp (flat, tanpa ekstrapolasi slope)
//

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::domain::{days_to_expiry, OptionKind, RawContract, TermStructurePoint};
use crate::symbol;

pub const TARGET_DTE: i64 = 30;
const MIN_BUCKET_DTE: i64 = 5;
const EXACT_MATCH_DAYS: i64 = 1;

#[derive(Default)]
struct Bucket {
    // (strike, iv)
    calls: Vec<(f64, f64)>,
    puts: Vec<(f64, f64)>,
}

fn closest_iv(side: &[(f64, f64)], spot: f64) -> Option<f64> {
    side.iter()
        .min_by(|a, b| (a.0 - spot).abs().total_cmp(&(b.0 - spot).abs()))
        .map(|&(_, iv)| iv)
}

/// One at-the-money point per usable expiry, ascending by DTE.
pub fn term_structure(contracts: &[RawContract], spot: f64, today: NaiveDate) -> Vec<TermStructurePoint> {
    let mut buckets: BTreeMap<NaiveDate, Bucket> = BTreeMap::new();
    for rc in contracts {
        if !(rc.iv > 0.0) {
            continue;
        }
        let Some(d) = symbol::decode(&rc.symbol) else { continue };
        let b = buckets.entry(d.expiry).or_default();
        match d.kind {
            OptionKind::Call => b.calls.push((d.strike, rc.iv)),
            OptionKind::Put => b.puts.push((d.strike, rc.iv)),
        }
    }

    // BTreeMap by expiry -> points already ascending by DTE
    buckets
        .into_iter()
        .filter_map(|(expiry, b)| {
            let dte = days_to_expiry(expiry, today);
            if dte < MIN_BUCKET_DTE {
                return None;
            }
            let ivs: Vec<f64> = [closest_iv(&b.calls, spot), closest_iv(&b.puts, spot)]
                .into_iter()
                .flatten()
                .collect();
            if ivs.is_empty() {
                return None;
            }
            Some(TermStructurePoint { dte, iv: ivs.iter().sum::<f64>() / ivs.len() as f64 })
        })
        .collect()
}

/// Interpolated 30-day implied volatility, `None` when no expiry qualifies.
pub fn estimate_30day_iv(contracts: &[RawContract], spot: f64, today: NaiveDate) -> Option<f64> {
    iv_at_target(&term_structure(contracts, spot, today))
}

fn iv_at_target(points: &[TermStructurePoint]) -> Option<f64> {
    if let Some(p) = points.iter().find(|p| (p.dte - TARGET_DTE).abs() <= EXACT_MATCH_DAYS) {
        return Some(p.iv);
    }
    let below = points.iter().rev().find(|p| p.dte < TARGET_DTE);
    let above = points.iter().find(|p| p.dte > TARGET_DTE);

    match (below, above) {
        (Some(b), Some(a)) => {
            let w = (TARGET_DTE - b.dte) as f64 / (a.dte - b.dte) as f64;
            Some(b.iv + (a.iv - b.iv) * w)
        }
        (Some(p), None) | (None, Some(p)) => Some(p.iv),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{contract, today};
    use OptionKind::{Call, Put};

    fn approx(a: f64, b: f64) -> bool { (a - b).abs() < 1e-9 }

    #[test]
    fn interpolates_between_neighbours() {
        let chain = vec![
            contract("XYZ", Call, 100.0, 20, 1.0, 1.1, 0.30),
            contract("XYZ", Put, 100.0, 20, 1.0, 1.1, 0.30),
            contract("XYZ", Call, 100.0, 40, 1.0, 1.1, 0.40),
            contract("XYZ", Put, 100.0, 40, 1.0, 1.1, 0.40),
        ];
        let iv = estimate_30day_iv(&chain, 100.0, today()).unwrap();
        assert!(approx(iv, 0.35), "{iv}");
    }

    #[test]
    fn single_side_clamps_flat() {
        let chain = vec![
            contract("XYZ", Call, 100.0, 10, 1.0, 1.1, 0.25),
            contract("XYZ", Put, 100.0, 10, 1.0, 1.1, 0.25),
        ];
        assert!(approx(estimate_30day_iv(&chain, 100.0, today()).unwrap(), 0.25));

        let far = vec![
            contract("XYZ", Call, 100.0, 60, 1.0, 1.1, 0.50),
            contract("XYZ", Call, 100.0, 90, 1.0, 1.1, 0.70),
        ];
        assert!(approx(estimate_30day_iv(&far, 100.0, today()).unwrap(), 0.50));
    }

    #[test]
    fn near_thirty_uses_point_directly() {
        let chain = vec![
            contract("XYZ", Call, 100.0, 10, 1.0, 1.1, 0.20),
            contract("XYZ", Call, 100.0, 29, 1.0, 1.1, 0.33),
            contract("XYZ", Call, 100.0, 60, 1.0, 1.1, 0.60),
        ];
        assert!(approx(estimate_30day_iv(&chain, 100.0, today()).unwrap(), 0.33));
    }

    #[test]
    fn no_positive_iv_gives_none() {
        let chain = vec![
            contract("XYZ", Call, 100.0, 30, 1.0, 1.1, 0.0),
            contract("XYZ", Put, 100.0, 30, 1.0, 1.1, -0.1),
        ];
        assert!(estimate_30day_iv(&chain, 100.0, today()).is_none());
        assert!(estimate_30day_iv(&[], 100.0, today()).is_none());
    }

    #[test]
    fn short_dated_buckets_are_dropped() {
        let chain = vec![
            contract("XYZ", Call, 100.0, 4, 1.0, 1.1, 0.90),
            contract("XYZ", Call, 100.0, 45, 1.0, 1.1, 0.40),
        ];
        let pts = term_structure(&chain, 100.0, today());
        assert_eq!(pts, vec![TermStructurePoint { dte: 45, iv: 0.40 }]);
    }

    #[test]
    fn picks_strike_closest_to_spot_and_averages_sides() {
        let chain = vec![
            contract("XYZ", Call, 95.0, 30, 1.0, 1.1, 0.50),
            contract("XYZ", Call, 104.0, 30, 1.0, 1.1, 0.30),
            contract("XYZ", Put, 110.0, 30, 1.0, 1.1, 0.36),
            contract("XYZ", Put, 90.0, 30, 1.0, 1.1, 0.60),
            RawContract { symbol: "garbage".into(), ..contract("XYZ", Put, 105.0, 30, 1.0, 1.1, 0.99) },
        ];
        let pts = term_structure(&chain, 105.0, today());
        assert_eq!(pts.len(), 1);
        assert!(approx(pts[0].iv, 0.33));
    }
}
