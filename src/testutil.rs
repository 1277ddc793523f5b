// ===============================
// src/testutil.rs (fakes untuk unit test)
// ===============================
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use crate::domain::{Clock, OptionKind, RawContract, SpotQuote};
use crate::symbol;
use crate::upstream::{ChainSource, SpotSource, UpstreamError};

pub struct FixedClock(Mutex<DateTime<Utc>>);
impl FixedClock {
    /// 2026-10-15 14:30 UTC
    pub fn new() -> Self { Self(Mutex::new(Utc.with_ymd_and_hms(2026, 10, 15, 14, 30, 0).unwrap())) }
    pub fn advance(&self, by: Duration) { *self.0.lock().unwrap() += by; }
}
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> { *self.0.lock().unwrap() }
}

pub fn today() -> NaiveDate { FixedClock::new().today() }

pub fn expiry_in(days: i64) -> NaiveDate { today() + Duration::days(days) }

pub fn contract(ticker: &str, kind: OptionKind, strike: f64, dte: i64, bid: f64, ask: f64, iv: f64) -> RawContract {
    RawContract {
        symbol: symbol::encode(ticker, kind, strike, expiry_in(dte)).unwrap(),
        bid,
        ask,
        iv,
        open_interest: 100.0,
        volume: 10.0,
        delta: 0.5,
        last_trade_price: (bid + ask) / 2.0,
        prev_day_close: (bid + ask) / 2.0,
    }
}

/// Chain source returning a fixed chain (or a fixed error) and counting calls.
pub struct FakeChainSource {
    pub chain: Mutex<Result<Vec<RawContract>, UpstreamError>>,
    pub calls: AtomicUsize,
}
impl FakeChainSource {
    pub fn new(chain: Vec<RawContract>) -> Self { Self { chain: Mutex::new(Ok(chain)), calls: AtomicUsize::new(0) } }
    pub fn set(&self, res: Result<Vec<RawContract>, UpstreamError>) { *self.chain.lock().unwrap() = res; }
    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}
#[async_trait]
impl ChainSource for FakeChainSource {
    async fn fetch_chain(&self, _ticker: &str) -> Result<Vec<RawContract>, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.chain.lock().unwrap().clone()
    }
}

pub struct FakeSpot(pub Option<f64>);
#[async_trait]
impl SpotSource for FakeSpot {
    async fn fetch_spot(&self, ticker: &str) -> Result<SpotQuote, UpstreamError> {
        match self.0 {
            Some(price) => Ok(SpotQuote { ticker: ticker.to_string(), price, prev_close: price }),
            None => Err(UpstreamError::Status { status: 404, reason: "Not Found".into() }),
        }
    }
}
