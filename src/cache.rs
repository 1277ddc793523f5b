// ===============================
// src/cache.rs (chain cache per underlying, TTL)
// ===============================
//
// - Entry diganti utuh setiap refetch (tanpa merge), tidak pernah dihapus.
// - Entry kadaluarsa TIDAK dipakai sebagai fallback: refetch gagal -> error ke caller.
// - Dua request bersamaan untuk ticker expired yang sama boleh sama-sama fetch;
//   writer terakhir menang.
//

use std::sync::Arc;

use ahash::AHashMap as HashMap;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::domain::{Clock, OptionKind, OptionMid, RawContract};
use crate::metrics::CACHE_LOOKUPS;
use crate::symbol;
use crate::upstream::{ChainSource, UpstreamError};

pub const DEFAULT_TTL_SECS: i64 = 300;
const STRIKE_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone)]
pub struct ChainCacheEntry {
    pub fetched_at: DateTime<Utc>,
    pub contracts: Arc<Vec<RawContract>>,
}

pub struct ChainCache {
    source: Arc<dyn ChainSource>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    entries: RwLock<HashMap<String, ChainCacheEntry>>,
}

fn cache_key(ticker: &str) -> String {
    ticker.trim().to_ascii_uppercase()
}

impl ChainCache {
    pub fn new(source: Arc<dyn ChainSource>, clock: Arc<dyn Clock>, ttl_secs: i64) -> Self {
        Self {
            source,
            clock,
            ttl: chrono::Duration::seconds(ttl_secs),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> { &self.clock }

    /// Full chain for `ticker`, refetched when missing or older than the TTL.
    pub async fn get_chain(&self, ticker: &str) -> Result<Arc<Vec<RawContract>>, UpstreamError> {
        let key = cache_key(ticker);
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(e) if self.clock.now() - e.fetched_at < self.ttl => {
                    CACHE_LOOKUPS.with_label_values(&["hit"]).inc();
                    return Ok(e.contracts.clone());
                }
                Some(e) => {
                    CACHE_LOOKUPS.with_label_values(&["expired"]).inc();
                    debug!(ticker = %key, fetched_at = %e.fetched_at, "chain cache expired");
                }
                None => {
                    CACHE_LOOKUPS.with_label_values(&["miss"]).inc();
                    debug!(ticker = %key, "chain cache miss");
                }
            }
        }

        // lock tidak ditahan selama fetch
        let contracts = Arc::new(self.source.fetch_chain(&key).await?);
        let entry = ChainCacheEntry { fetched_at: self.clock.now(), contracts: contracts.clone() };
        self.entries.write().await.insert(key, entry);
        Ok(contracts)
    }

    /// Best-effort mid lookup for one contract. Never fails: any fetch error
    /// or missing match yields `None`.
    pub async fn get_mid(&self, ticker: &str, kind: OptionKind, strike: f64, expiry: NaiveDate) -> Option<OptionMid> {
        let chain = match self.get_chain(ticker).await {
            Ok(c) => c,
            Err(e) => {
                debug!(%ticker, error = %e, "mid lookup degraded to unknown");
                return None;
            }
        };
        chain.iter().find_map(|rc| {
            let d = symbol::decode(&rc.symbol)?;
            let matches = d.kind == kind && d.expiry == expiry && (d.strike - strike).abs() < STRIKE_TOLERANCE;
            matches.then(|| OptionMid {
                symbol: rc.symbol.clone(),
                bid: rc.bid,
                ask: rc.ask,
                mid: rc.mid(),
                iv: rc.iv,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{contract, expiry_in, FakeChainSource, FixedClock};

    fn setup(chain: Vec<RawContract>) -> (Arc<FakeChainSource>, Arc<FixedClock>, ChainCache) {
        let src = Arc::new(FakeChainSource::new(chain));
        let clock = Arc::new(FixedClock::new());
        let cache = ChainCache::new(src.clone(), clock.clone(), DEFAULT_TTL_SECS);
        (src, clock, cache)
    }

    #[tokio::test]
    async fn fresh_read_does_not_refetch() {
        let (src, clock, cache) = setup(vec![contract("XYZ", OptionKind::Call, 100.0, 30, 1.0, 1.2, 0.3)]);
        let first = cache.get_chain("xyz").await.unwrap();
        clock.advance(chrono::Duration::seconds(299));
        let second = cache.get_chain("XYZ").await.unwrap();
        assert_eq!(src.calls(), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn expired_read_refetches_once() {
        let (src, clock, cache) = setup(vec![]);
        cache.get_chain("XYZ").await.unwrap();
        clock.advance(chrono::Duration::seconds(300));
        cache.get_chain("XYZ").await.unwrap();
        assert_eq!(src.calls(), 2);
        cache.get_chain("XYZ").await.unwrap();
        assert_eq!(src.calls(), 2);
    }

    #[tokio::test]
    async fn failed_refetch_does_not_serve_stale() {
        let (src, clock, cache) = setup(vec![contract("XYZ", OptionKind::Put, 90.0, 30, 1.0, 1.2, 0.3)]);
        cache.get_chain("XYZ").await.unwrap();
        clock.advance(chrono::Duration::minutes(6));
        src.set(Err(UpstreamError::Status { status: 503, reason: "Service Unavailable".into() }));

        let err = cache.get_chain("XYZ").await.unwrap_err();
        assert_eq!(err, UpstreamError::Status { status: 503, reason: "Service Unavailable".into() });
    }

    #[tokio::test]
    async fn mid_lookup_matches_within_tolerance() {
        let (_src, _clock, cache) = setup(vec![
            contract("XYZ", OptionKind::Call, 110.0, 30, 2.0, 2.4, 0.3),
            contract("XYZ", OptionKind::Put, 110.0, 30, 3.0, 3.4, 0.3),
        ]);
        let mid = cache.get_mid("XYZ", OptionKind::Call, 110.004, expiry_in(30)).await.unwrap();
        assert!((mid.mid - 2.2).abs() < 1e-9);

        assert!(cache.get_mid("XYZ", OptionKind::Call, 110.01, expiry_in(30)).await.is_none());
        assert!(cache.get_mid("XYZ", OptionKind::Call, 110.0, expiry_in(31)).await.is_none());
    }

    #[tokio::test]
    async fn mid_lookup_degrades_on_upstream_error() {
        let (src, _clock, cache) = setup(vec![]);
        src.set(Err(UpstreamError::Transport("connection reset".into())));
        assert!(cache.get_mid("XYZ", OptionKind::Call, 100.0, expiry_in(30)).await.is_none());
    }
}
