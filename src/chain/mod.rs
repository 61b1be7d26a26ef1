//! Chain module - static chain configuration and adapter routing
//!
//! This module provides:
//! - Chain descriptors (confirmations, fee schedule, activation)
//! - Direction compatibility between chains
//! - The fee model applied at transaction creation
//! - Adapter lookup per bridge direction

pub mod adapter;
pub mod fee;
pub mod units;

pub use adapter::{
    AdapterError, AdapterRegistry, ChainAdapter, LegReceipt, TransferLeg,
};
pub use fee::{compute_fee, FeeQuote};

use crate::config::Settings;
use crate::error::{BridgeError, BridgeResult, ValidationError};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Chains the bridge knows how to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainId {
    /// Native VRTY ledger
    Vrty,
    Ethereum,
    Polygon,
    Arbitrum,
    Bsc,
}

impl ChainId {
    pub const ALL: [ChainId; 5] = [
        ChainId::Vrty,
        ChainId::Ethereum,
        ChainId::Polygon,
        ChainId::Arbitrum,
        ChainId::Bsc,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainId::Vrty => "vrty",
            ChainId::Ethereum => "ethereum",
            ChainId::Polygon => "polygon",
            ChainId::Arbitrum => "arbitrum",
            ChainId::Bsc => "bsc",
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, ChainId::Vrty)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainId::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s.to_ascii_lowercase())
            .ok_or_else(|| ValidationError::UnknownChain(s.to_string()))
    }
}

/// Fee schedule of a destination chain, in base units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeSchedule {
    pub base_fee: u128,
    pub percentage_basis_points: u32,
    pub min_fee: u128,
    pub max_fee: u128,
}

/// Immutable per-chain configuration
#[derive(Debug, Clone, Serialize)]
pub struct ChainDescriptor {
    pub id: ChainId,
    pub native_asset_symbol: String,
    pub confirmations_required: u64,
    pub block_time_secs: u64,
    pub fee_schedule: FeeSchedule,
    pub is_active: bool,
}

impl ChainDescriptor {
    /// Expected seconds until `confirmations_required` blocks have passed
    pub fn confirmation_time_secs(&self) -> u64 {
        self.confirmations_required
            .saturating_mul(self.block_time_secs)
    }
}

/// How value moves for a direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    /// Native VRTY is escrowed, wVRTY minted on the destination
    LockAndMint,
    /// wVRTY is burned, native VRTY released
    BurnAndRelease,
    /// wVRTY burned on one wrapped chain and minted on another
    BurnAndMint,
}

/// Ordered (source, destination) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BridgeDirection {
    pub source: ChainId,
    pub destination: ChainId,
}

impl BridgeDirection {
    pub fn new(source: ChainId, destination: ChainId) -> Self {
        Self {
            source,
            destination,
        }
    }

    pub fn mode(&self) -> BridgeMode {
        if self.source.is_native() {
            BridgeMode::LockAndMint
        } else if self.destination.is_native() {
            BridgeMode::BurnAndRelease
        } else {
            BridgeMode::BurnAndMint
        }
    }
}

impl fmt::Display for BridgeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.destination)
    }
}

/// Resolved direction with the destination's descriptor
#[derive(Debug, Clone)]
pub struct Route {
    pub direction: BridgeDirection,
    pub destination: ChainDescriptor,
}

/// Static chain configuration loaded at startup
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    chains: HashMap<ChainId, ChainDescriptor>,
    directions: HashSet<BridgeDirection>,
}

impl ChainRegistry {
    /// Build a registry, rejecting duplicate ids, bad fee schedules and
    /// directions that reference unknown chains
    pub fn new(
        descriptors: Vec<ChainDescriptor>,
        directions: impl IntoIterator<Item = BridgeDirection>,
    ) -> BridgeResult<Self> {
        let mut chains = HashMap::new();
        for descriptor in descriptors {
            let fees = &descriptor.fee_schedule;
            if fees.min_fee > fees.max_fee {
                return Err(BridgeError::Config(format!(
                    "Chain {} has min_fee {} above max_fee {}",
                    descriptor.id, fees.min_fee, fees.max_fee
                )));
            }
            if fees.percentage_basis_points > 10_000 {
                return Err(BridgeError::Config(format!(
                    "Chain {} has a fee percentage above 100%",
                    descriptor.id
                )));
            }
            let id = descriptor.id;
            if chains.insert(id, descriptor).is_some() {
                return Err(BridgeError::Config(format!("Chain {} configured twice", id)));
            }
        }

        let mut pairs = HashSet::new();
        for direction in directions {
            if direction.source == direction.destination {
                return Err(BridgeError::Config(format!(
                    "Route {} bridges a chain to itself",
                    direction
                )));
            }
            for chain in [direction.source, direction.destination] {
                if !chains.contains_key(&chain) {
                    return Err(BridgeError::Config(format!(
                        "Route {} references unconfigured chain {}",
                        direction, chain
                    )));
                }
            }
            pairs.insert(direction);
        }

        Ok(Self {
            chains,
            directions: pairs,
        })
    }

    /// Build the registry from settings
    pub fn from_settings(settings: &Settings) -> BridgeResult<Self> {
        let decimals = settings.bridge.token_decimals;
        let mut descriptors = Vec::new();

        for (name, chain) in &settings.chains {
            let id: ChainId = name
                .parse()
                .map_err(|e: ValidationError| BridgeError::Config(e.to_string()))?;
            let fee_schedule = FeeSchedule {
                base_fee: units::parse_config_amount(&chain.fees.base_fee, decimals)?,
                percentage_basis_points: chain.fees.percentage_basis_points,
                min_fee: units::parse_config_amount(&chain.fees.min_fee, decimals)?,
                max_fee: units::parse_config_amount(&chain.fees.max_fee, decimals)?,
            };

            if !chain.enabled {
                warn!("Chain {} is configured but inactive", id);
            }

            descriptors.push(ChainDescriptor {
                id,
                native_asset_symbol: chain.native_asset_symbol.clone(),
                confirmations_required: chain.confirmations_required,
                block_time_secs: chain.block_time_secs,
                fee_schedule,
                is_active: chain.enabled,
            });
        }

        let directions = settings
            .routes
            .iter()
            .map(|r| BridgeDirection::new(r.source, r.destination));

        let registry = Self::new(descriptors, directions)?;
        info!(
            "Chain registry loaded: {} chains, {} supported directions",
            registry.chains.len(),
            registry.supported_directions().len()
        );
        Ok(registry)
    }

    /// Get a descriptor by chain id
    pub fn get(&self, id: ChainId) -> Option<&ChainDescriptor> {
        self.chains.get(&id)
    }

    /// All descriptors, ordered by chain id
    pub fn descriptors(&self) -> Vec<&ChainDescriptor> {
        let mut all: Vec<_> = self.chains.values().collect();
        all.sort_by_key(|d| d.id);
        all
    }

    /// Directions currently usable: configured and both ends active
    pub fn supported_directions(&self) -> Vec<BridgeDirection> {
        self.directions
            .iter()
            .filter(|d| self.is_active(d.source) && self.is_active(d.destination))
            .copied()
            .collect()
    }

    fn is_active(&self, id: ChainId) -> bool {
        self.chains.get(&id).map(|c| c.is_active).unwrap_or(false)
    }

    /// Validate a requested direction and resolve both descriptors
    pub fn resolve(&self, source: ChainId, destination: ChainId) -> Result<Route, ValidationError> {
        if source == destination {
            return Err(ValidationError::SameChain(source));
        }

        let src = self
            .chains
            .get(&source)
            .ok_or_else(|| ValidationError::UnknownChain(source.to_string()))?;
        let dst = self
            .chains
            .get(&destination)
            .ok_or_else(|| ValidationError::UnknownChain(destination.to_string()))?;

        if !src.is_active {
            return Err(ValidationError::ChainInactive(source));
        }
        if !dst.is_active {
            return Err(ValidationError::ChainInactive(destination));
        }

        let direction = BridgeDirection::new(source, destination);
        if !self.directions.contains(&direction) {
            return Err(ValidationError::UnsupportedDirection {
                source_chain: source,
                destination,
            });
        }

        Ok(Route {
            direction,
            destination: dst.clone(),
        })
    }
}
