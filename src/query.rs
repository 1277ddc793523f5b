// ===============================
// src/query.rs (filter + sort + cap chain)
// ===============================
//
// Urutan filter: kind -> jendela DTE -> OTM-only (skip bila spot tidak ada)
//                -> mid > 0.
// Sort: DTE naik, lalu jarak strike ke spot (atau strike naik bila spot tidak ada).
// Cap: min(max_results, 50).
//

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::cache::ChainCache;
use crate::domain::{days_to_expiry, FilteredContract, OptionKind, RawContract};
use crate::symbol;
use crate::upstream::UpstreamError;

pub const HARD_CAP: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindFilter { Calls, Puts, #[default] Both }
impl KindFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "calls" | "call" | "c" => Some(KindFilter::Calls),
            "puts" | "put" | "p" => Some(KindFilter::Puts),
            "both" | "all" | "" => Some(KindFilter::Both),
            _ => None,
        }
    }
    fn accepts(&self, kind: OptionKind) -> bool {
        match self {
            KindFilter::Calls => kind == OptionKind::Call,
            KindFilter::Puts => kind == OptionKind::Put,
            KindFilter::Both => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainFilter {
    pub kind: KindFilter,
    pub min_dte: i64,
    pub max_dte: i64,
    pub otm_only: bool,
    pub max_results: usize,
    pub underlying_price: Option<f64>,
}

impl Default for ChainFilter {
    fn default() -> Self {
        Self { kind: KindFilter::Both, min_dte: 20, max_dte: 90, otm_only: true, max_results: 25, underlying_price: None }
    }
}

impl ChainFilter {
    pub fn effective_cap(&self) -> usize { self.max_results.min(HARD_CAP) }
}

fn is_otm(kind: OptionKind, strike: f64, spot: f64) -> bool {
    match kind {
        OptionKind::Call => strike > spot,
        OptionKind::Put => strike < spot,
    }
}

/// Pure part of the query: decode, filter, sort and cap `contracts`.
pub fn apply_filter(contracts: &[RawContract], filter: &ChainFilter, today: NaiveDate) -> Vec<FilteredContract> {
    let spot = filter.underlying_price.filter(|p| *p > 0.0);

    let mut out: Vec<FilteredContract> = contracts
        .iter()
        .filter_map(|rc| {
            let d = symbol::decode(&rc.symbol)?;
            if !filter.kind.accepts(d.kind) {
                return None;
            }
            let dte = days_to_expiry(d.expiry, today);
            if dte < filter.min_dte || dte > filter.max_dte {
                return None;
            }
            if let (true, Some(s)) = (filter.otm_only, spot) {
                if !is_otm(d.kind, d.strike, s) {
                    return None;
                }
            }
            let mid = rc.mid();
            if !(mid > 0.0) {
                return None;
            }
            Some(FilteredContract {
                symbol: rc.symbol.clone(),
                kind: d.kind,
                strike: d.strike,
                expiry: d.expiry,
                dte,
                bid: rc.bid,
                ask: rc.ask,
                mid,
                iv: rc.iv,
                delta: rc.delta,
                volume: rc.volume,
                open_interest: rc.open_interest,
            })
        })
        .collect();

    out.sort_by(|a, b| {
        a.dte.cmp(&b.dte).then_with(|| match spot {
            Some(s) => (a.strike - s).abs().total_cmp(&(b.strike - s).abs()),
            None => a.strike.total_cmp(&b.strike),
        })
    });
    out.truncate(filter.effective_cap());
    out
}

pub struct ChainQuery {
    cache: Arc<ChainCache>,
}

impl ChainQuery {
    pub fn new(cache: Arc<ChainCache>) -> Self { Self { cache } }

    pub fn cache(&self) -> &Arc<ChainCache> { &self.cache }

    pub async fn query(&self, ticker: &str, filter: &ChainFilter) -> Result<Vec<FilteredContract>, UpstreamError> {
        let chain = self.cache.get_chain(ticker).await?;
        Ok(apply_filter(&chain, filter, self.cache.clock().today()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{contract, today, FakeChainSource, FixedClock};
    use OptionKind::{Call, Put};

    #[tokio::test]
    async fn otm_filter_keeps_strikes_above_spot_for_calls() {
        let src = Arc::new(FakeChainSource::new(vec![
            contract("XYZ", Call, 100.0, 30, 6.0, 6.4, 0.3),
            contract("XYZ", Call, 110.0, 30, 2.0, 2.4, 0.3),
            contract("XYZ", Call, 120.0, 30, 0.5, 0.7, 0.3),
        ]));
        let cache = Arc::new(ChainCache::new(src, Arc::new(FixedClock::new()), 300));
        let engine = ChainQuery::new(cache);

        let filter = ChainFilter { underlying_price: Some(105.0), ..ChainFilter::default() };
        let rows = engine.query("XYZ", &filter).await.unwrap();
        let strikes: Vec<f64> = rows.iter().map(|r| r.strike).collect();
        assert_eq!(strikes, vec![110.0, 120.0]);
    }

    #[test]
    fn otm_puts_are_below_spot() {
        let chain = vec![
            contract("XYZ", Put, 100.0, 30, 1.0, 1.2, 0.3),
            contract("XYZ", Put, 110.0, 30, 5.0, 5.2, 0.3),
        ];
        let filter = ChainFilter { underlying_price: Some(105.0), ..ChainFilter::default() };
        let rows = apply_filter(&chain, &filter, today());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].strike, 100.0);
    }

    #[test]
    fn otm_skipped_without_spot() {
        let chain = vec![
            contract("XYZ", Call, 120.0, 30, 1.0, 1.2, 0.3),
            contract("XYZ", Call, 100.0, 30, 5.0, 5.2, 0.3),
        ];
        let rows = apply_filter(&chain, &ChainFilter::default(), today());
        let strikes: Vec<f64> = rows.iter().map(|r| r.strike).collect();
        assert_eq!(strikes, vec![100.0, 120.0]);
    }

    #[test]
    fn dte_window_kind_and_zero_mid() {
        let chain = vec![
            contract("XYZ", Call, 110.0, 19, 1.0, 1.2, 0.3),
            contract("XYZ", Call, 110.0, 20, 1.0, 1.2, 0.3),
            contract("XYZ", Call, 110.0, 90, 1.0, 1.2, 0.3),
            contract("XYZ", Call, 110.0, 91, 1.0, 1.2, 0.3),
            contract("XYZ", Call, 115.0, 45, 0.0, 0.0, 0.3),
            contract("XYZ", Put, 90.0, 45, 1.0, 1.2, 0.3),
        ];
        let filter = ChainFilter { kind: KindFilter::Calls, underlying_price: Some(100.0), ..ChainFilter::default() };
        let rows = apply_filter(&chain, &filter, today());
        let dtes: Vec<i64> = rows.iter().map(|r| r.dte).collect();
        assert_eq!(dtes, vec![20, 90]);
        assert!(rows.iter().all(|r| r.kind == Call && r.mid > 0.0));
    }

    #[test]
    fn sorted_by_dte_then_distance_and_capped() {
        let mut chain = Vec::new();
        for dte in [60, 25, 40] {
            for k in 0..30 {
                chain.push(contract("XYZ", Call, 101.0 + k as f64, dte, 1.0, 1.2, 0.3));
            }
        }
        let filter = ChainFilter { max_results: 500, underlying_price: Some(100.0), ..ChainFilter::default() };
        let rows = apply_filter(&chain, &filter, today());
        assert_eq!(rows.len(), HARD_CAP);
        assert!(rows.windows(2).all(|w| w[0].dte <= w[1].dte));
        assert_eq!(rows[0].dte, 25);
        assert_eq!(rows[0].strike, 101.0);
        assert_eq!(rows[1].strike, 102.0);

        let filter = ChainFilter { max_results: 7, ..filter };
        assert_eq!(apply_filter(&chain, &filter, today()).len(), 7);
    }

    #[test]
    fn undecodable_rows_are_skipped() {
        let mut bad = contract("XYZ", Call, 110.0, 30, 1.0, 1.2, 0.3);
        bad.symbol = "XYZ-BAD".into();
        let rows = apply_filter(&[bad], &ChainFilter::default(), today());
        assert!(rows.is_empty());
    }
}
