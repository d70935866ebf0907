use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use super::node::Address;

/// A node's self-declared capabilities, exchanged during the handshake and
/// refreshed by `NodeStateUpdate` packets.
///
/// Immutable for the duration of a session except through such updates.
/// `addresses` never contains duplicates (by host and port).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeState {
    /// Addresses the node claims to be reachable at.
    pub addresses: Vec<Address>,
    /// Trading pair identifiers the node is willing to trade, e.g. "LTC/BTC".
    pub pairs: Vec<String>,
    /// Per-currency identifiers for auxiliary chain clients.
    pub aux_identifiers: BTreeMap<String, String>,
    /// Per-currency public keys for auxiliary chain clients.
    pub aux_pub_keys: BTreeMap<String, String>,
    /// Per-currency connection URIs for auxiliary chain clients.
    pub aux_uris: BTreeMap<String, Vec<String>>,
    /// Per-token contract or asset identifiers.
    pub token_identifiers: BTreeMap<String, String>,
}

impl NodeState {
    /// Append an address unless an equal one (by host and port) is present.
    pub fn add_address(&mut self, address: Address) {
        if !self.addresses.contains(&address) {
            self.addresses.push(address);
        }
    }

    pub fn is_pair_active(&self, pair_id: &str) -> bool {
        self.pairs.iter().any(|p| p == pair_id)
    }
}
