use std::fmt::Display;
use std::hash::Hash;
use std::hash::Hasher;
use std::str::FromStr;
use std::time::SystemTime;

use serde::Deserialize;
use serde::Serialize;

/// Length of an alias in hex characters.
const ALIAS_LENGTH: usize = 10;

/// A node's long-lived public identity: its 32-byte Ed25519 verifying key.
///
/// Ordering is lexicographic over the raw bytes. The duplicate-connection
/// tie-break relies on both ends of a connection applying this same ordering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodePubKey([u8; 32]);

impl NodePubKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Deterministic human-readable handle for this key, used in logs and by
    /// the RPC surface. Two distinct keys may collide on alias; the alias is a
    /// convenience, not an identity.
    pub fn alias(&self) -> String {
        hex::encode(&self.0[..ALIAS_LENGTH / 2])
    }
}

impl Display for NodePubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for NodePubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodePubKey({})", self.alias())
    }
}

impl FromStr for NodePubKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("node pub key must be 32 bytes"))?;
        Ok(Self(arr))
    }
}

/// A host/port pair a node can be reached at. `host` may be an IPv4 or IPv6
/// literal, a DNS name, or a `.onion` hidden-service address.
///
/// Equality and hashing ignore `last_connected`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub last_connected: Option<SystemTime>,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            last_connected: None,
        }
    }

    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The durable record the pool keeps for every node it has completed a
/// handshake with. Persisted through the `NodeStore` on every mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub pub_key: NodePubKey,
    /// Known addresses, most recently connected first.
    pub addresses: Vec<Address>,
    /// The last address that yielded a successful handshake.
    pub last_address: Option<Address>,
    pub reputation_score: i64,
    pub banned: bool,
}

impl Node {
    pub fn new(pub_key: NodePubKey, addresses: Vec<Address>, last_address: Option<Address>) -> Self {
        Self {
            pub_key,
            addresses,
            last_address,
            reputation_score: 0,
            banned: false,
        }
    }
}

/// A named, signed contribution to a node's long-term reputation score.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ReputationEvent {
    ManualBan,
    SwapMisbehavior,
    SwapAbuse,
    WireProtocolErr,
    InvalidAuth,
    SwapSuccess,
}

impl ReputationEvent {
    /// The signed delta this event applies to a node's score.
    pub fn delta(self) -> i64 {
        match self {
            ReputationEvent::ManualBan => i64::MIN,
            ReputationEvent::SwapMisbehavior => -50,
            ReputationEvent::SwapAbuse => -100,
            ReputationEvent::WireProtocolErr => -10,
            ReputationEvent::InvalidAuth => -20,
            ReputationEvent::SwapSuccess => 1,
        }
    }

    /// Whether this event alone warrants an immediate ban when the pool runs
    /// with strict reputation enforcement.
    pub fn is_abusive(self) -> bool {
        matches!(
            self,
            ReputationEvent::SwapMisbehavior | ReputationEvent::SwapAbuse
        )
    }
}

impl Display for ReputationEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReputationEvent::ManualBan => "manual ban",
            ReputationEvent::SwapMisbehavior => "swap misbehavior",
            ReputationEvent::SwapAbuse => "swap abuse",
            ReputationEvent::WireProtocolErr => "wire protocol error",
            ReputationEvent::InvalidAuth => "invalid auth",
            ReputationEvent::SwapSuccess => "swap success",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_equality_ignores_last_connected() {
        let a = Address::new("192.0.2.7", 9735);
        let mut b = a.clone();
        b.last_connected = Some(SystemTime::now());
        assert_eq!(a, b);
    }

    #[test]
    fn pub_key_ordering_is_lexicographic() {
        let low = NodePubKey::new([0xaa; 32]);
        let high = NodePubKey::new([0xbb; 32]);
        assert!(low < high);

        let mut almost = [0xaa; 32];
        almost[31] = 0xab;
        assert!(low < NodePubKey::new(almost));
    }

    #[test]
    fn alias_is_deterministic() {
        let pk = NodePubKey::new([0xab; 32]);
        assert_eq!(pk.alias(), "ababababab");
        assert_eq!(pk.alias().len(), ALIAS_LENGTH);
    }

    #[test]
    fn pub_key_hex_round_trip() {
        let pk = NodePubKey::new([7; 32]);
        let parsed: NodePubKey = pk.to_string().parse().unwrap();
        assert_eq!(pk, parsed);
    }
}
