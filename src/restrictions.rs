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

//! Trade restrictions: amounts, deposit percentages and lock times. Percentages are integer parts
//! per million so that no settlement amount ever goes through floating point.

use std::fmt;
use std::io;

use monero::Amount;
use thiserror::Error;

use crate::consensus::{self, Decodable, Encodable};

/// Piconero in one monero.
pub const PICO_PER_XMR: u64 = 1_000_000_000_000;

/// Monero blocks mined per day, two minutes target.
pub const BLOCKS_PER_DAY: u64 = 720;

/// Lock time delay on test networks, in blocks.
pub const TEST_NETWORK_LOCK_TIME: u64 = 5;

/// Amount any account can trade regardless of its age or signing state.
pub fn tolerated_small_trade_amount() -> Amount {
    Amount::from_pico(PICO_PER_XMR / 10)
}

/// Minimum trade amount that makes a peer eligible to sign its counterparty's witness.
pub fn minimum_trade_amount_for_signing() -> Amount {
    Amount::from_pico(PICO_PER_XMR / 10)
}

/// Trade limit of a buyer taking an offer that waives the buyer's security deposit.
pub fn max_trade_limit_buyer_as_taker_without_deposit() -> Amount {
    Amount::from_pico(PICO_PER_XMR)
}

pub fn min_trade_amount() -> Amount {
    Amount::from_pico(PICO_PER_XMR / 100)
}

/// Lower bound of any security deposit.
pub fn min_security_deposit() -> Amount {
    Amount::from_pico(PICO_PER_XMR / 10)
}

pub const MIN_SECURITY_DEPOSIT_PCT: Ppm = Ppm(150_000);
pub const MAX_SECURITY_DEPOSIT_PCT: Ppm = Ppm(500_000);
pub const DEFAULT_PENALTY_FEE_PCT: Ppm = Ppm(250_000);

/// Delay in blocks between the deposit and the earliest unilateral reclaim. Payments that can be
/// reversed get twice the window of blockchain settled ones.
pub fn lock_time(is_blockchain: bool) -> u64 {
    if is_blockchain {
        10 * BLOCKS_PER_DAY
    } else {
        20 * BLOCKS_PER_DAY
    }
}

/// Fraction in parts per million.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ppm(pub u32);

impl Ppm {
    pub const ZERO: Ppm = Ppm(0);
    pub const ONE: Ppm = Ppm(1_000_000);

    /// `amount × self`, rounded down.
    pub fn apply(&self, amount: Amount) -> Amount {
        let pico = (amount.as_pico() as u128 * self.0 as u128) / 1_000_000;
        Amount::from_pico(pico as u64)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Ppm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:04}%", self.0 / 10_000, self.0 % 10_000)
    }
}

impl Encodable for Ppm {
    fn consensus_encode<W: io::Write>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.0.consensus_encode(writer)
    }
}

impl Decodable for Ppm {
    fn consensus_decode<D: io::Read>(d: &mut D) -> Result<Self, consensus::Error> {
        Ok(Ppm(Decodable::consensus_decode(d)?))
    }
}

/// Validation error of a security deposit percentage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DepositPctError {
    #[error("Security deposit must be at least {min}")]
    TooLow { min: Ppm },
    #[error("Security deposit must not exceed {max}")]
    TooHigh { max: Ppm },
}

/// Check a security deposit percentage against the allowed range.
pub fn validate_security_deposit_pct(pct: Ppm) -> Result<(), DepositPctError> {
    if pct < MIN_SECURITY_DEPOSIT_PCT {
        Err(DepositPctError::TooLow {
            min: MIN_SECURITY_DEPOSIT_PCT,
        })
    } else if pct > MAX_SECURITY_DEPOSIT_PCT {
        Err(DepositPctError::TooHigh {
            max: MAX_SECURITY_DEPOSIT_PCT,
        })
    } else {
        Ok(())
    }
}

/// Security deposit for `amount` at `pct`, floored at [`min_security_deposit`]. A zero percentage
/// means no deposit at all.
pub fn security_deposit(amount: Amount, pct: Ppm) -> Amount {
    if pct.is_zero() {
        return Amount::from_pico(0);
    }
    std::cmp::max(pct.apply(amount), min_security_deposit())
}
