// Copyright 2021-2022 Farcaster Devs
//
// This library is free software; you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public
// License as published by the Free Software Foundation; either
// version 3 of the License, or (at your option) any later version.
//
// This library is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this library; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301, USA

//! Market prices. The feed asks one provider at a time and rotates to the next provider on
//! failure. Each request gets an identifier, a response carrying an identifier other than the
//! current one belongs to an abandoned request and is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::offer::PRICE_PRECISION;
use crate::services;
use crate::trade::statistics::TradeStatistics;
use crate::{Error, Res};

/// Maximum age of a market price usable to price an offer, in seconds.
pub const MARKET_PRICE_MAX_AGE_SEC: i64 = 1800;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPrice {
    pub currency_code: String,
    /// Counter currency units per monero.
    pub price: f64,
    pub timestamp_sec: i64,
    /// `false` for prices derived from our own trade statistics.
    pub is_externally_provided: bool,
}

impl MarketPrice {
    pub fn new(
        currency_code: impl Into<String>,
        price: f64,
        timestamp_sec: i64,
        is_externally_provided: bool,
    ) -> Self {
        Self {
            currency_code: currency_code.into(),
            price,
            timestamp_sec,
            is_externally_provided,
        }
    }

    pub fn is_price_available(&self) -> bool {
        self.price > 0.0
    }

    pub fn is_recent_price_available(&self, now_sec: i64) -> bool {
        self.is_price_available() && now_sec - self.timestamp_sec < MARKET_PRICE_MAX_AGE_SEC
    }

    pub fn is_recent_external_price_available(&self, now_sec: i64) -> bool {
        self.is_externally_provided && self.is_recent_price_available(now_sec)
    }
}

impl fmt::Display for MarketPrice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @{}", self.currency_code, self.price, self.timestamp_sec)
    }
}

/// A price node.
pub trait PriceProvider: Send + Sync {
    fn base_url(&self) -> &str;

    /// Blocking request of every price the provider knows.
    fn request_all_prices(&self) -> Result<Vec<MarketPrice>, services::Error>;
}

#[derive(Debug, Default)]
struct PriceState {
    provider_index: usize,
    request_id: u64,
    cache: HashMap<String, MarketPrice>,
    update_counter: u64,
    last_request_millis: i64,
    last_error: Option<String>,
}

impl PriceState {
    fn has_external_prices(&self) -> bool {
        self.cache.values().any(|p| p.is_externally_provided)
    }
}

pub struct PriceFeedService {
    providers: Vec<Arc<dyn PriceProvider>>,
    clock: Arc<dyn Clock>,
    state: Mutex<PriceState>,
    updated: Condvar,
}

impl fmt::Debug for PriceFeedService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriceFeedService")
            .field("providers", &self.providers.len())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl PriceFeedService {
    pub fn new(providers: Vec<Arc<dyn PriceProvider>>, clock: Arc<dyn Clock>) -> Self {
        Self {
            providers,
            clock,
            state: Mutex::new(PriceState::default()),
            updated: Condvar::new(),
        }
    }

    fn provider(&self, index: usize) -> Res<Arc<dyn PriceProvider>> {
        self.providers
            .get(index)
            .cloned()
            .ok_or_else(|| Error::IllegalState("No price provider configured".into()))
    }

    pub fn provider_base_url(&self) -> Option<String> {
        let index = self.state.lock().provider_index;
        self.providers.get(index).map(|p| p.base_url().to_string())
    }

    /// Start a new request, abandoning any request in flight.
    pub fn begin_request(&self) -> Res<(u64, Arc<dyn PriceProvider>)> {
        let mut state = self.state.lock();
        let provider = self.provider(state.provider_index)?;
        state.request_id += 1;
        debug!(request_id = state.request_id, provider = provider.base_url(), "Requesting prices");
        Ok((state.request_id, provider))
    }

    /// Select the next provider. Returns `true` when the selection looped back to the first one.
    pub fn rotate_provider(&self) -> bool {
        let mut state = self.state.lock();
        Self::rotate(&mut state, self.providers.len())
    }

    fn rotate(state: &mut PriceState, len: usize) -> bool {
        if len == 0 {
            return false;
        }
        state.provider_index = (state.provider_index + 1) % len;
        if state.provider_index == 0 {
            warn!("Exhausted price provider list, looping to beginning");
            true
        } else {
            false
        }
    }

    /// Apply the response of request `request_id`. Responses of abandoned requests are dropped.
    /// A failed request rotates to the next provider. Returns whether prices were applied.
    pub fn apply_response(
        &self,
        request_id: u64,
        response: Result<Vec<MarketPrice>, services::Error>,
    ) -> bool {
        let mut state = self.state.lock();
        if request_id != state.request_id {
            debug!(
                request_id,
                current = state.request_id,
                "Ignoring response of an earlier price request"
            );
            return false;
        }
        match response {
            Ok(prices) => {
                for price in prices {
                    state.cache.insert(price.currency_code.clone(), price);
                }
                state.update_counter += 1;
                state.last_request_millis = self.clock.now_millis();
                state.last_error = None;
                self.updated.notify_all();
                true
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "We received an error requesting prices, selecting a new provider"
                );
                state.last_error = Some(e.to_string());
                Self::rotate(&mut state, self.providers.len());
                false
            }
        }
    }

    /// Request prices from the current provider, blocking the calling thread.
    pub fn request_prices(&self) -> Res<()> {
        let (request_id, provider) = self.begin_request()?;
        let response = provider.request_all_prices();
        let failure = response.as_ref().err().map(|e| e.to_string());
        self.apply_response(request_id, response);
        match failure {
            Some(message) => Err(Error::Services(services::Error::Network(message))),
            None => Ok(()),
        }
    }

    /// Request prices on a worker thread and wait at most `timeout` for them. On timeout the
    /// request is abandoned and its late response ignored.
    pub fn request_all_prices(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Res<HashMap<String, MarketPrice>> {
        let (request_id, provider) = self.begin_request()?;
        let counter = self.state.lock().update_counter;
        let feed = Arc::clone(self);
        thread::spawn(move || {
            let response = provider.request_all_prices();
            feed.apply_response(request_id, response);
        });

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.update_counter == counter && state.request_id == request_id {
            if state.last_error.is_some() && state.provider_index != 0 {
                break;
            }
            if self.updated.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        if state.update_counter != counter {
            return Ok(state.cache.clone());
        }
        if state.request_id == request_id {
            // abandon, a late response is dropped
            state.request_id += 1;
        }
        Err(Error::Timeout(format!(
            "Timeout fetching market prices within {} seconds",
            timeout.as_secs()
        )))
    }

    pub fn get_market_price(&self, currency_code: &str) -> Option<MarketPrice> {
        self.state.lock().cache.get(currency_code).cloned()
    }

    pub fn has_external_prices(&self) -> bool {
        self.state.lock().has_external_prices()
    }

    pub fn last_request_millis(&self) -> i64 {
        self.state.lock().last_request_millis
    }

    /// Wait until an externally provided price is available. Always resolves: with the prices
    /// or with [`Error::Timeout`].
    pub fn await_external_prices(&self, timeout: Duration) -> Res<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.has_external_prices() {
            if self.updated.wait_until(&mut state, deadline).timed_out() {
                if state.has_external_prices() {
                    break;
                }
                return Err(Error::Timeout(format!(
                    "No external market price within {} seconds",
                    timeout.as_secs()
                )));
            }
        }
        Ok(())
    }

    /// Use the price of the latest trade of each currency where no external price is known.
    pub fn apply_latest_trade_statistics_prices(&self, statistics: &[TradeStatistics]) {
        let mut latest: HashMap<&str, &TradeStatistics> = HashMap::new();
        for s in statistics {
            match latest.get(s.counter_currency_code.as_str()) {
                Some(current) if current.date >= s.date => {}
                _ => {
                    latest.insert(s.counter_currency_code.as_str(), s);
                }
            }
        }
        let mut state = self.state.lock();
        for (currency, s) in latest {
            if state
                .cache
                .get(currency)
                .map_or(false, |p| p.is_externally_provided)
            {
                continue;
            }
            let price = s.price as f64 / 10f64.powi(PRICE_PRECISION as i32);
            info!(currency, price, "Market price from trade statistics");
            state.cache.insert(
                currency.to_string(),
                MarketPrice::new(currency, price, s.date / 1000, false),
            );
        }
        state.update_counter += 1;
        self.updated.notify_all();
    }
}
