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

//! Node configuration loaded from YAML. Every field has a default so an empty document is a
//! valid mainnet configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::network::{Network, NetworkContext};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unable to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub network: Network,
    /// Number of witnesses kept in the fast lookup cache in front of the witness map.
    pub witness_cache_capacity: usize,
    /// Upper bound of a blocking wait for external market prices.
    pub price_request_timeout_secs: u64,
    /// Period between two price requests.
    pub price_request_period_secs: u64,
    /// Deadline of an offer availability check.
    pub availability_timeout_secs: u64,
    /// Tolerance of the trade price against the market price for market based offers, in
    /// parts per million.
    pub price_tolerance_ppm: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            witness_cache_capacity: 1_000,
            price_request_timeout_secs: 20,
            price_request_period_secs: 60,
            availability_timeout_secs: 30,
            price_tolerance_ppm: 10_000,
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::from_yaml(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.witness_cache_capacity == 0 {
            return Err(Error::Invalid(
                "witness_cache_capacity must be positive".into(),
            ));
        }
        if self.price_request_timeout_secs == 0 {
            return Err(Error::Invalid(
                "price_request_timeout_secs must be positive".into(),
            ));
        }
        if self.price_tolerance_ppm > 1_000_000 {
            return Err(Error::Invalid(
                "price_tolerance_ppm must not exceed 1000000".into(),
            ));
        }
        Ok(())
    }

    pub fn network_context(&self) -> NetworkContext {
        NetworkContext::new(self.network)
    }

    pub fn price_request_timeout(&self) -> Duration {
        Duration::from_secs(self.price_request_timeout_secs)
    }

    pub fn availability_timeout(&self) -> Duration {
        Duration::from_secs(self.availability_timeout_secs)
    }
}
