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

//! Offer availability check. Before taking an offer the taker asks the maker whether the offer
//! is still available at the taker's price. A check is identified by the uid of its request; a
//! response with another uid, or arriving after the check was cancelled or timed out, is
//! ignored.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Error as OfferError, Offer, OfferId, OfferState};
use crate::consensus::{self, Decodable, Encodable};
use crate::crypto::KeyRing;
use crate::network::NodeAddress;
use crate::price::MarketPrice;
use crate::protocol::message::NetworkMessage;
use crate::restrictions::Ppm;
use crate::services::{Filter, P2pNetwork};
use crate::{Error, Res};

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[display(Debug)]
pub enum AvailabilityResult {
    Available,
    OfferTaken,
    PriceOutOfTolerance,
    MarketPriceNotAvailable,
    NoArbitrators,
    UserIgnored,
    UnknownError,
}

impl AvailabilityResult {
    pub fn is_available(&self) -> bool {
        *self == AvailabilityResult::Available
    }
}

impl Encodable for AvailabilityResult {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        (*self as u8 + 1).consensus_encode(writer)
    }
}

impl Decodable for AvailabilityResult {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        match Decodable::consensus_decode(d)? {
            0x01u8 => Ok(AvailabilityResult::Available),
            0x02u8 => Ok(AvailabilityResult::OfferTaken),
            0x03u8 => Ok(AvailabilityResult::PriceOutOfTolerance),
            0x04u8 => Ok(AvailabilityResult::MarketPriceNotAvailable),
            0x05u8 => Ok(AvailabilityResult::NoArbitrators),
            0x06u8 => Ok(AvailabilityResult::UserIgnored),
            0x07u8 => Ok(AvailabilityResult::UnknownError),
            _ => Err(consensus::Error::UnknownType),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferAvailabilityRequest {
    pub offer_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub takers_trade_price: u64,
    pub uid: String,
}

impl_consensus_fields!(OfferAvailabilityRequest {
    offer_id,
    sender_node_address,
    takers_trade_price,
    uid,
});

impl_strict_encoding!(OfferAvailabilityRequest);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferAvailabilityResponse {
    pub offer_id: OfferId,
    pub sender_node_address: NodeAddress,
    pub result: AvailabilityResult,
    pub arbitrator: Option<NodeAddress>,
    /// Uid of the request answered.
    pub uid: String,
}

impl_consensus_fields!(OfferAvailabilityResponse {
    offer_id,
    sender_node_address,
    result,
    arbitrator,
    uid,
});

impl_strict_encoding!(OfferAvailabilityResponse);

/// Maker side: answer an availability request for `offer`, `None` when the offer is unknown.
pub fn evaluate_request(
    offer: Option<&Offer>,
    request: &OfferAvailabilityRequest,
    market_price: Option<&MarketPrice>,
    now_sec: i64,
    tolerance: Ppm,
    filter: &dyn Filter,
) -> AvailabilityResult {
    let offer = match offer {
        Some(offer) if offer.state == OfferState::Available => offer,
        _ => return AvailabilityResult::OfferTaken,
    };
    if filter.is_node_address_banned(&request.sender_node_address) {
        return AvailabilityResult::UserIgnored;
    }
    if offer.arbitrator_signer.is_none() {
        return AvailabilityResult::NoArbitrators;
    }
    match offer.verify_trade_price(request.takers_trade_price, market_price, now_sec, tolerance) {
        Ok(()) => AvailabilityResult::Available,
        Err(OfferError::MarketPriceNotAvailable) => AvailabilityResult::MarketPriceNotAvailable,
        Err(OfferError::PriceMismatch { .. }) | Err(OfferError::PriceOutOfTolerance { .. }) => {
            AvailabilityResult::PriceOutOfTolerance
        }
        Err(e) => {
            warn!(offer_id = %offer.short_id(), error = %e, "Availability check failed");
            AvailabilityResult::UnknownError
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Check {
    Pending { uid: String, started: Instant },
    Done(AvailabilityResult, Option<NodeAddress>),
    Cancelled,
}

/// Taker side of the availability checks.
pub struct OfferAvailabilityService {
    p2p: Arc<dyn P2pNetwork>,
    node_address: NodeAddress,
    timeout: Duration,
    checks: Mutex<HashMap<OfferId, Check>>,
    answered: Condvar,
}

impl std::fmt::Debug for OfferAvailabilityService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfferAvailabilityService")
            .field("node_address", &self.node_address)
            .field("timeout", &self.timeout)
            .field("checks", &self.checks.lock().len())
            .finish()
    }
}

impl OfferAvailabilityService {
    pub fn new(p2p: Arc<dyn P2pNetwork>, node_address: NodeAddress, timeout: Duration) -> Self {
        Self {
            p2p,
            node_address,
            timeout,
            checks: Mutex::new(HashMap::new()),
            answered: Condvar::new(),
        }
    }

    /// Ask the maker of `offer`. A check already running for the offer is superseded. Returns
    /// the uid of the request.
    pub fn send_request(
        &self,
        offer: &Offer,
        key_ring: &KeyRing,
        takers_trade_price: u64,
    ) -> Res<String> {
        if offer.is_my_offer(key_ring) {
            return Err(Error::IllegalState(format!(
                "Offer {} is our own offer",
                offer.short_id()
            )));
        }
        let uid = Uuid::new_v4().to_string();
        self.checks.lock().insert(
            offer.id,
            Check::Pending {
                uid: uid.clone(),
                started: Instant::now(),
            },
        );
        let request = OfferAvailabilityRequest {
            offer_id: offer.id,
            sender_node_address: self.node_address.clone(),
            takers_trade_price,
            uid: uid.clone(),
        };
        debug!(offer_id = %offer.short_id(), uid = %uid, "Sending offer availability request");
        if let Err(e) = self.p2p.send_message(
            &offer.owner_node_address,
            NetworkMessage::OfferAvailabilityRequest(request),
        ) {
            self.checks.lock().remove(&offer.id);
            return Err(e.into());
        }
        Ok(uid)
    }

    /// Record the maker's answer. Returns `false` when no check waits for it.
    pub fn on_response(&self, response: OfferAvailabilityResponse) -> bool {
        let mut checks = self.checks.lock();
        match checks.get(&response.offer_id) {
            Some(Check::Pending { uid, started }) if *uid == response.uid => {
                info!(
                    offer_id = %response.offer_id.short_id(),
                    result = %response.result,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Offer availability response"
                );
                checks.insert(
                    response.offer_id,
                    Check::Done(response.result, response.arbitrator),
                );
                self.answered.notify_all();
                true
            }
            _ => {
                debug!(
                    offer_id = %response.offer_id.short_id(),
                    uid = %response.uid,
                    "Ignoring availability response"
                );
                false
            }
        }
    }

    /// Cancel the running check of an offer. No-op, returning `false`, when the check finished
    /// or never started.
    pub fn cancel(&self, offer_id: &OfferId) -> bool {
        let mut checks = self.checks.lock();
        match checks.get(offer_id) {
            Some(Check::Pending { .. }) => {
                checks.insert(*offer_id, Check::Cancelled);
                self.answered.notify_all();
                true
            }
            _ => false,
        }
    }

    /// Wait for the answer to the running check. A check still pending after the timeout is
    /// dropped. The check is forgotten once this returns.
    pub fn await_result(
        &self,
        offer_id: &OfferId,
    ) -> Res<(AvailabilityResult, Option<NodeAddress>)> {
        let deadline = Instant::now() + self.timeout;
        let mut checks = self.checks.lock();
        loop {
            match checks.remove(offer_id) {
                Some(Check::Done(result, arbitrator)) => return Ok((result, arbitrator)),
                Some(Check::Cancelled) => {
                    return Err(Error::IllegalState(format!(
                        "Availability check of offer {} was cancelled",
                        offer_id.short_id()
                    )))
                }
                None => {
                    return Err(Error::IllegalState(format!(
                        "No availability check for offer {}",
                        offer_id.short_id()
                    )))
                }
                Some(pending) => {
                    checks.insert(*offer_id, pending);
                }
            }
            if self.answered.wait_until(&mut checks, deadline).timed_out() {
                return match checks.remove(offer_id) {
                    Some(Check::Done(result, arbitrator)) => Ok((result, arbitrator)),
                    _ => Err(Error::Timeout(format!(
                        "Offer availability check timed out for offer {}",
                        offer_id.short_id()
                    ))),
                };
            }
        }
    }

    /// Send a request and wait for its answer.
    pub fn check_availability(
        &self,
        offer: &Offer,
        key_ring: &KeyRing,
        takers_trade_price: u64,
    ) -> Res<(AvailabilityResult, Option<NodeAddress>)> {
        self.send_request(offer, key_ring, takers_trade_price)?;
        self.await_result(&offer.id)
    }
}
