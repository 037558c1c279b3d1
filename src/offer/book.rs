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

//! Offers seen on the network. An offer can be received again with a new payload (edited or
//! republished), the book keeps the latest one per identifier. Removal is guarded by the
//! payload hash so an outdated removal never drops the newer version of an offer.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Offer, OfferDirection, OfferId};
use crate::services::Filter;

#[derive(Debug, Clone)]
struct Entry {
    offer: Offer,
    payload_hash: [u8; 32],
}

pub struct OfferBook {
    offers: Mutex<Vec<Entry>>,
    filter: Arc<dyn Filter>,
}

impl std::fmt::Debug for OfferBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferBook")
            .field("offers", &self.offers.lock().len())
            .finish()
    }
}

impl OfferBook {
    pub fn new(filter: Arc<dyn Filter>) -> Self {
        Self {
            offers: Mutex::new(Vec::new()),
            filter,
        }
    }

    fn is_filtered(&self, offer: &Offer) -> bool {
        self.filter.is_node_address_banned(&offer.owner_node_address)
            || self.filter.is_currency_banned(&offer.counter_currency_code)
            || self.filter.is_payment_method_banned(&offer.payment_method_id)
    }

    /// Add an offer, replacing any offer with the same identifier. Returns `false` when the
    /// offer is filtered out or cannot be hashed.
    pub fn on_added(&self, offer: Offer) -> bool {
        if self.is_filtered(&offer) {
            debug!(offer_id = %offer.short_id(), "Ignoring filtered offer");
            return false;
        }
        let payload_hash = match offer.payload_hash() {
            Ok(hash) => hash,
            Err(e) => {
                warn!(offer_id = %offer.short_id(), error = %e, "Cannot hash offer");
                return false;
            }
        };
        let mut offers = self.offers.lock();
        offers.retain(|e| {
            let keep = e.offer.id != offer.id;
            if !keep {
                debug!(offer_id = %offer.short_id(), "Replacing offer with same id");
            }
            keep
        });
        offers.push(Entry {
            offer,
            payload_hash,
        });
        true
    }

    /// Remove an offer if the stored version has the same payload. Returns whether it was
    /// removed.
    pub fn on_removed(&self, offer: &Offer) -> bool {
        let payload_hash = match offer.payload_hash() {
            Ok(hash) => hash,
            Err(_) => return false,
        };
        let mut offers = self.offers.lock();
        match offers.iter().position(|e| e.offer.id == offer.id) {
            Some(index) if offers[index].payload_hash == payload_hash => {
                offers.remove(index);
                true
            }
            Some(_) => {
                debug!(offer_id = %offer.short_id(), "Not removing newer version of offer");
                false
            }
            None => false,
        }
    }

    pub fn get(&self, offer_id: &OfferId) -> Option<Offer> {
        self.offers
            .lock()
            .iter()
            .find(|e| e.offer.id == *offer_id)
            .map(|e| e.offer.clone())
    }

    pub fn offers(&self) -> Vec<Offer> {
        self.offers.lock().iter().map(|e| e.offer.clone()).collect()
    }

    pub fn offers_for(&self, currency_code: &str, direction: OfferDirection) -> Vec<Offer> {
        self.offers
            .lock()
            .iter()
            .filter(|e| {
                e.offer.counter_currency_code == currency_code && e.offer.direction == direction
            })
            .map(|e| e.offer.clone())
            .collect()
    }

    /// Number of offers per currency for one direction.
    pub fn offer_counts(&self, direction: OfferDirection) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.offers.lock().iter().filter(|e| e.offer.direction == direction) {
            *counts
                .entry(entry.offer.counter_currency_code.clone())
                .or_insert(0) += 1;
        }
        counts
    }

    pub fn buy_offer_count(&self, currency_code: &str) -> usize {
        self.count(currency_code, OfferDirection::Buy)
    }

    pub fn sell_offer_count(&self, currency_code: &str) -> usize {
        self.count(currency_code, OfferDirection::Sell)
    }

    fn count(&self, currency_code: &str, direction: OfferDirection) -> usize {
        self.offers
            .lock()
            .iter()
            .filter(|e| {
                e.offer.counter_currency_code == currency_code && e.offer.direction == direction
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.offers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
