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

//! Anonymised trade statistics, gossiped by the maker once the deposits are published.

use std::collections::HashMap;

use monero::Amount;
use parking_lot::Mutex;
use tracing::debug;

use super::Trade;
use crate::consensus::{self, serialize};
use crate::crypto::sha256;
use crate::offer::OfferDirection;

/// Extra data key of the truncated arbitrator address.
pub const ARBITRATOR_ADDRESS: &str = "arbAddr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeStatistics {
    pub direction: OfferDirection,
    pub counter_currency_code: String,
    pub payment_method_id: String,
    pub price: u64,
    pub amount: Amount,
    pub date: i64,
    pub maker_deposit_tx_hash: String,
    pub taker_deposit_tx_hash: String,
    pub extra_data: Vec<(String, String)>,
}

impl_consensus_fields!(TradeStatistics {
    direction,
    counter_currency_code,
    payment_method_id,
    price,
    amount,
    date,
    maker_deposit_tx_hash,
    taker_deposit_tx_hash,
    extra_data,
});

impl_strict_encoding!(TradeStatistics);

impl TradeStatistics {
    /// Statistics of a trade with published deposits. The arbitrator is identified by the first
    /// four characters of its onion address only, local addresses are kept whole.
    pub fn from_trade(trade: &Trade) -> Option<Self> {
        let maker_deposit_tx_hash = trade.maker.deposit_tx_hash.clone()?;
        let taker_deposit_tx_hash = trade.taker.deposit_tx_hash.clone()?;
        let arbitrator = trade.arbitrator.node_address.as_ref()?;
        let address = if arbitrator.is_onion() {
            arbitrator.full_address().chars().take(4).collect()
        } else {
            arbitrator.full_address()
        };
        Some(Self {
            direction: trade.offer.direction,
            counter_currency_code: trade.offer.counter_currency_code.clone(),
            payment_method_id: trade.offer.payment_method_id.clone(),
            price: trade.price,
            amount: trade.amount,
            date: trade.date,
            maker_deposit_tx_hash,
            taker_deposit_tx_hash,
            extra_data: vec![(ARBITRATOR_ADDRESS.to_string(), address)],
        })
    }

    pub fn hash(&self) -> Result<[u8; 32], consensus::Error> {
        Ok(sha256(&serialize(self)?))
    }
}

/// Trade statistics known by this node, unique by hash.
#[derive(Debug, Default)]
pub struct TradeStatisticsManager {
    statistics: Mutex<HashMap<[u8; 32], TradeStatistics>>,
}

impl TradeStatisticsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if already known.
    pub fn add(&self, statistics: TradeStatistics) -> Result<bool, consensus::Error> {
        let hash = statistics.hash()?;
        let mut map = self.statistics.lock();
        if map.contains_key(&hash) {
            return Ok(false);
        }
        debug!(currency = %statistics.counter_currency_code, "New trade statistics");
        map.insert(hash, statistics);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.statistics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_currency(&self, currency_code: &str) -> Vec<TradeStatistics> {
        let mut list: Vec<TradeStatistics> = self
            .statistics
            .lock()
            .values()
            .filter(|s| s.counter_currency_code == currency_code)
            .cloned()
            .collect();
        list.sort_by_key(|s| s.date);
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::TradeRole;
    use crate::trade::tests::offer;

    #[test]
    fn statistics_need_both_deposits() {
        let o = offer(OfferDirection::Sell);
        let amount = o.amount;
        let mut trade = Trade::new(TradeRole::Maker, o, amount, 42, Amount::from_pico(0), 1);
        assert!(TradeStatistics::from_trade(&trade).is_none());
        trade.maker.deposit_tx_hash = Some("maker".into());
        trade.taker.deposit_tx_hash = Some("taker".into());
        let stats = TradeStatistics::from_trade(&trade).unwrap();
        assert_eq!(
            stats.extra_data,
            vec![(ARBITRATOR_ADDRESS.to_string(), "arbi".to_string())]
        );

        let manager = TradeStatisticsManager::new();
        assert!(manager.add(stats.clone()).unwrap());
        assert!(!manager.add(stats).unwrap());
        assert_eq!(manager.for_currency("EUR").len(), 1);
        assert!(manager.for_currency("USD").is_empty());
    }
}
