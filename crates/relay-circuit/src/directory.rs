//! Relay directory
//!
//! Route selection draws from a directory of relay descriptors. The
//! provider behind it is pluggable; the static one covers fixed fleets
//! and tests, a fetched JSON document can seed it just the same.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::{RelayError, RelayResult};

/// Published descriptor for one relay node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNodeInfo {
    pub id: String,
    /// Dialable address, e.g. `wss://relay-1.example.net/cell`
    pub address: String,
    /// ML-KEM public key for the per-hop exchange
    pub kem_public: Vec<u8>,
    /// X25519 public key for the per-hop exchange
    pub ec_public: [u8; 32],
    pub region: Option<String>,
}

/// Source of relay descriptors
pub trait RelayDirectory: Send + Sync {
    fn relays(&self) -> Vec<RelayNodeInfo>;
}

/// Fixed in-memory relay set
pub struct StaticDirectory {
    relays: Vec<RelayNodeInfo>,
}

impl StaticDirectory {
    pub fn new(relays: Vec<RelayNodeInfo>) -> Self {
        Self { relays }
    }

    /// Parse a directory document, a JSON array of descriptors
    pub fn from_json(document: &str) -> RelayResult<Self> {
        let relays: Vec<RelayNodeInfo> = serde_json::from_str(document)
            .map_err(|e| RelayError::Directory(e.to_string()))?;
        Ok(Self { relays })
    }
}

impl RelayDirectory for StaticDirectory {
    fn relays(&self) -> Vec<RelayNodeInfo> {
        self.relays.clone()
    }
}

/// Pick `hops` distinct relays, skipping any whose id is excluded
pub fn pick_route(
    directory: &dyn RelayDirectory,
    hops: usize,
    exclude: &HashSet<String>,
) -> RelayResult<Vec<RelayNodeInfo>> {
    let pool: Vec<RelayNodeInfo> = directory
        .relays()
        .into_iter()
        .filter(|relay| !exclude.contains(&relay.id))
        .collect();
    if pool.len() < hops {
        return Err(RelayError::NotEnoughRelays {
            need: hops,
            have: pool.len(),
        });
    }
    let mut rng = rand::thread_rng();
    Ok(pool.choose_multiple(&mut rng, hops).cloned().collect())
}
