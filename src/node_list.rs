use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::bail;
use anyhow::Result;
use tracing::info;
use tracing::warn;

use crate::error::PoolError;
use crate::models::node::Address;
use crate::models::node::Node;
use crate::models::node::NodePubKey;
use crate::models::node::ReputationEvent;

/// A node's score must stay above this for the pool to keep talking to it.
pub const BAN_THRESHOLD: i64 = -100;

/// Durable storage for node records. Persistence is best-effort: the pool
/// logs store failures and carries on with its in-memory state.
pub trait NodeStore: Send + Sync {
    fn load(&self) -> Result<Vec<Node>>;
    fn upsert(&self, node: &Node) -> Result<()>;
    fn remove(&self, pub_key: &NodePubKey) -> Result<()>;
}

/// An in-memory `NodeStore`. The daemon wires this in by default; deployments
/// with a real persistence engine supply their own implementation.
#[derive(Default)]
pub struct MemNodeStore {
    nodes: Mutex<HashMap<NodePubKey, Node>>,
}

impl NodeStore for MemNodeStore {
    fn load(&self) -> Result<Vec<Node>> {
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    fn upsert(&self, node: &Node) -> Result<()> {
        self.nodes
            .lock()
            .unwrap()
            .insert(node.pub_key, node.clone());
        Ok(())
    }

    fn remove(&self, pub_key: &NodePubKey) -> Result<()> {
        self.nodes.lock().unwrap().remove(pub_key);
        Ok(())
    }
}

struct NodeEntry {
    id: u64,
    node: Node,
}

struct Inner {
    nodes: HashMap<NodePubKey, NodeEntry>,
    insertion_order: Vec<NodePubKey>,
    aliases: HashMap<String, NodePubKey>,
    next_id: u64,
}

/// The catalog of every node we have ever completed a handshake with, keyed
/// by public key. Serializes its own mutation; all reads are snapshots.
pub struct NodeList {
    inner: Mutex<Inner>,
    store: Arc<dyn NodeStore>,
    /// When set, a single abusive swap event is enough to ban a node.
    strict: bool,
}

/// What a reputation event did to the node it was applied to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReputationOutcome {
    pub score: i64,
    pub banned_now: bool,
}

impl NodeList {
    pub fn new(store: Arc<dyn NodeStore>, strict: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: HashMap::new(),
                insertion_order: Vec::new(),
                aliases: HashMap::new(),
                next_id: 1,
            }),
            store,
            strict,
        }
    }

    /// One-shot bulk read from the store, done once at startup.
    pub fn load(&self) -> Result<usize> {
        let nodes = self.store.load()?;
        let count = nodes.len();
        let mut inner = self.inner.lock().unwrap();
        for node in nodes {
            insert_entry(&mut inner, node);
        }
        Ok(count)
    }

    pub fn get(&self, pub_key: &NodePubKey) -> Option<Node> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(pub_key)
            .map(|e| e.node.clone())
    }

    pub fn has(&self, pub_key: &NodePubKey) -> bool {
        self.inner.lock().unwrap().nodes.contains_key(pub_key)
    }

    pub fn count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn get_id(&self, pub_key: &NodePubKey) -> Option<u64> {
        self.inner.lock().unwrap().nodes.get(pub_key).map(|e| e.id)
    }

    pub fn get_alias(&self, pub_key: &NodePubKey) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(pub_key)
            .map(|e| e.node.pub_key.alias())
    }

    pub fn get_pub_key_for_alias(&self, alias: &str) -> Result<NodePubKey, PoolError> {
        self.inner
            .lock()
            .unwrap()
            .aliases
            .get(alias)
            .copied()
            .ok_or_else(|| PoolError::NodeNotFound(alias.to_string()))
    }

    /// Insert a brand-new node record. Fails if the key is already known.
    pub fn create_node(
        &self,
        pub_key: NodePubKey,
        addresses: Vec<Address>,
        last_address: Option<Address>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.nodes.contains_key(&pub_key) {
            bail!("node {pub_key} already exists");
        }
        let node = Node::new(pub_key, crate::addr::dedupe(addresses), last_address);
        self.persist(&node);
        insert_entry(&mut inner, node);
        Ok(())
    }

    /// Replace a node's address set, preserving `last_connected` timestamps
    /// on addresses that were already known.
    pub fn update_addresses(
        &self,
        pub_key: &NodePubKey,
        addresses: Vec<Address>,
        last_address: Option<Address>,
    ) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .nodes
            .get_mut(pub_key)
            .ok_or_else(|| PoolError::NodeNotFound(pub_key.to_string()))?;

        let old = std::mem::take(&mut entry.node.addresses);
        let mut fresh = crate::addr::dedupe(addresses);
        for address in &mut fresh {
            if address.last_connected.is_none() {
                if let Some(known) = old.iter().find(|a| **a == *address) {
                    address.last_connected = known.last_connected;
                }
            }
        }
        entry.node.addresses = fresh;
        if let Some(last_address) = last_address {
            entry.node.last_address = Some(last_address);
        }
        let node = entry.node.clone();
        self.persist(&node);
        Ok(())
    }

    /// Record a successful handshake: create the node if this is the first
    /// one, merge its advertised addresses, and stamp the connected address.
    /// `last_connected` is only ever updated here, after the handshake
    /// completed.
    pub fn record_handshake(
        &self,
        pub_key: NodePubKey,
        advertised: Vec<Address>,
        connected_address: Option<Address>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let now = SystemTime::now();

        if !inner.nodes.contains_key(&pub_key) {
            let node = Node::new(pub_key, crate::addr::dedupe(advertised.clone()), None);
            insert_entry(&mut inner, node);
            info!("Created node record for {}", pub_key.alias());
        }

        let entry = inner.nodes.get_mut(&pub_key).expect("node was just inserted");
        for address in advertised {
            if !entry.node.addresses.contains(&address) {
                entry.node.addresses.push(address);
            }
        }
        if let Some(mut connected) = connected_address {
            connected.last_connected = Some(now);
            match entry.node.addresses.iter().position(|a| *a == connected) {
                Some(index) => entry.node.addresses[index].last_connected = Some(now),
                None => entry.node.addresses.insert(0, connected.clone()),
            }
            entry.node.last_address = Some(connected);
        }
        let node = entry.node.clone();
        self.persist(&node);
    }

    /// Apply a reputation event. Returns the node's new score and whether
    /// this event pushed it over the ban threshold.
    pub fn add_reputation_event(
        &self,
        pub_key: &NodePubKey,
        event: ReputationEvent,
    ) -> Result<ReputationOutcome, PoolError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .nodes
            .get_mut(pub_key)
            .ok_or_else(|| PoolError::NodeNotFound(pub_key.to_string()))?;

        entry.node.reputation_score = entry.node.reputation_score.saturating_add(event.delta());
        let score = entry.node.reputation_score;

        let should_ban =
            !entry.node.banned && (score < BAN_THRESHOLD || (self.strict && event.is_abusive()));
        if should_ban {
            entry.node.banned = true;
            warn!(
                "Node {} fell below the ban threshold (score {score}, event {event})",
                pub_key.alias()
            );
        }
        let node = entry.node.clone();
        self.persist(&node);
        Ok(ReputationOutcome {
            score,
            banned_now: should_ban,
        })
    }

    pub fn ban(&self, pub_key: &NodePubKey) -> Result<(), PoolError> {
        self.set_banned(pub_key, true)
    }

    pub fn un_ban(&self, pub_key: &NodePubKey) -> Result<(), PoolError> {
        self.set_banned(pub_key, false)
    }

    fn set_banned(&self, pub_key: &NodePubKey, banned: bool) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .nodes
            .get_mut(pub_key)
            .ok_or_else(|| PoolError::NodeNotFound(pub_key.to_string()))?;
        if entry.node.banned == banned {
            return Err(if banned {
                PoolError::NodeAlreadyBanned(*pub_key)
            } else {
                PoolError::NodeNotBanned(*pub_key)
            });
        }
        entry.node.banned = banned;
        let node = entry.node.clone();
        self.persist(&node);
        Ok(())
    }

    pub fn is_banned(&self, pub_key: &NodePubKey) -> bool {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(pub_key)
            .is_some_and(|e| e.node.banned)
    }

    /// Pre-handshake filter for inbound connections: whether any banned node
    /// is known to live at this host.
    pub fn is_banned_host(&self, host: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.nodes.values().any(|e| {
            e.node.banned
                && (e.node.addresses.iter().any(|a| a.host == host)
                    || e.node.last_address.as_ref().is_some_and(|a| a.host == host))
        })
    }

    /// Prune an address that turned out to be unreachable.
    pub fn remove_address(&self, pub_key: &NodePubKey, address: &Address) -> Result<(), PoolError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .nodes
            .get_mut(pub_key)
            .ok_or_else(|| PoolError::NodeNotFound(pub_key.to_string()))?;
        entry.node.addresses.retain(|a| a != address);
        if entry.node.last_address.as_ref() == Some(address) {
            entry.node.last_address = None;
        }
        let node = entry.node.clone();
        self.persist(&node);
        Ok(())
    }

    /// Visit every node in insertion order.
    pub fn for_each(&self, mut visitor: impl FnMut(&Node)) {
        let inner = self.inner.lock().unwrap();
        for pub_key in &inner.insertion_order {
            if let Some(entry) = inner.nodes.get(pub_key) {
                visitor(&entry.node);
            }
        }
    }

    fn persist(&self, node: &Node) {
        if let Err(err) = self.store.upsert(node) {
            warn!("Failed to persist node {}: {err:#}", node.pub_key.alias());
        }
    }
}

fn insert_entry(inner: &mut Inner, node: Node) {
    let pub_key = node.pub_key;
    let id = inner.next_id;
    inner.next_id += 1;
    inner.aliases.insert(pub_key.alias(), pub_key);
    inner.insertion_order.push(pub_key);
    inner.nodes.insert(pub_key, NodeEntry { id, node });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_list(strict: bool) -> NodeList {
        NodeList::new(Arc::new(MemNodeStore::default()), strict)
    }

    fn pk(byte: u8) -> NodePubKey {
        NodePubKey::new([byte; 32])
    }

    #[test]
    fn create_and_lookup() {
        let list = test_list(false);
        list.create_node(pk(1), vec![Address::new("a", 1)], None)
            .unwrap();
        assert!(list.has(&pk(1)));
        assert_eq!(list.count(), 1);
        assert_eq!(list.get_id(&pk(1)), Some(1));
        assert_eq!(list.get_alias(&pk(1)), Some(pk(1).alias()));
        assert_eq!(list.get_pub_key_for_alias(&pk(1).alias()).unwrap(), pk(1));
        assert!(list.create_node(pk(1), vec![], None).is_err());
    }

    #[test]
    fn reputation_events_accumulate_and_ban() {
        let list = test_list(false);
        list.create_node(pk(1), vec![], None).unwrap();

        let outcome = list
            .add_reputation_event(&pk(1), ReputationEvent::SwapAbuse)
            .unwrap();
        assert_eq!(outcome.score, -100);
        assert!(!outcome.banned_now);

        let outcome = list
            .add_reputation_event(&pk(1), ReputationEvent::InvalidAuth)
            .unwrap();
        assert_eq!(outcome.score, -120);
        assert!(outcome.banned_now);
        assert!(list.is_banned(&pk(1)));

        // already banned, no second ban notification
        let outcome = list
            .add_reputation_event(&pk(1), ReputationEvent::WireProtocolErr)
            .unwrap();
        assert!(!outcome.banned_now);
    }

    #[test]
    fn strict_mode_bans_on_abusive_event() {
        let list = test_list(true);
        list.create_node(pk(1), vec![], None).unwrap();
        let outcome = list
            .add_reputation_event(&pk(1), ReputationEvent::SwapMisbehavior)
            .unwrap();
        assert!(outcome.banned_now);

        let lenient = test_list(false);
        lenient.create_node(pk(1), vec![], None).unwrap();
        let outcome = lenient
            .add_reputation_event(&pk(1), ReputationEvent::SwapMisbehavior)
            .unwrap();
        assert!(!outcome.banned_now);
    }

    #[test]
    fn swap_success_rewards() {
        let list = test_list(false);
        list.create_node(pk(1), vec![], None).unwrap();
        let outcome = list
            .add_reputation_event(&pk(1), ReputationEvent::SwapSuccess)
            .unwrap();
        assert_eq!(outcome.score, 1);
    }

    #[test]
    fn ban_unban_round_trip() {
        let list = test_list(false);
        list.create_node(pk(1), vec![], None).unwrap();
        let before = list.get(&pk(1)).unwrap();

        list.ban(&pk(1)).unwrap();
        assert!(list.is_banned(&pk(1)));
        assert!(matches!(
            list.ban(&pk(1)),
            Err(PoolError::NodeAlreadyBanned(_))
        ));

        list.un_ban(&pk(1)).unwrap();
        assert!(matches!(
            list.un_ban(&pk(1)),
            Err(PoolError::NodeNotBanned(_))
        ));

        let after = list.get(&pk(1)).unwrap();
        assert_eq!(before.reputation_score, after.reputation_score);
        assert_eq!(before.banned, after.banned);
        assert_eq!(before.addresses, after.addresses);
    }

    #[test]
    fn unknown_node_errors() {
        let list = test_list(false);
        assert!(matches!(
            list.add_reputation_event(&pk(9), ReputationEvent::SwapSuccess),
            Err(PoolError::NodeNotFound(_))
        ));
        assert!(matches!(list.ban(&pk(9)), Err(PoolError::NodeNotFound(_))));
    }

    #[test]
    fn update_addresses_preserves_last_connected() {
        let list = test_list(false);
        list.create_node(pk(1), vec![Address::new("a", 1)], None)
            .unwrap();
        list.record_handshake(pk(1), vec![], Some(Address::new("a", 1)));
        let stamped = list.get(&pk(1)).unwrap().addresses[0].last_connected;
        assert!(stamped.is_some());

        list.update_addresses(
            &pk(1),
            vec![Address::new("a", 1), Address::new("b", 2)],
            None,
        )
        .unwrap();
        let node = list.get(&pk(1)).unwrap();
        assert_eq!(node.addresses.len(), 2);
        assert_eq!(
            node.addresses.iter().find(|a| a.host == "a").unwrap().last_connected,
            stamped
        );
        assert!(node
            .addresses
            .iter()
            .find(|a| a.host == "b")
            .unwrap()
            .last_connected
            .is_none());
    }

    #[test]
    fn record_handshake_sets_last_address_only_on_success_path() {
        let list = test_list(false);
        list.record_handshake(
            pk(1),
            vec![Address::new("adv", 9735)],
            Some(Address::new("dialed", 9735)),
        );
        let node = list.get(&pk(1)).unwrap();
        assert_eq!(node.last_address.as_ref().unwrap().host, "dialed");
        assert!(node.last_address.as_ref().unwrap().last_connected.is_some());
        assert!(node.addresses.contains(&Address::new("adv", 9735)));
    }

    #[test]
    fn banned_host_filter() {
        let list = test_list(false);
        list.create_node(pk(1), vec![Address::new("198.51.100.3", 9735)], None)
            .unwrap();
        assert!(!list.is_banned_host("198.51.100.3"));
        list.ban(&pk(1)).unwrap();
        assert!(list.is_banned_host("198.51.100.3"));
        assert!(!list.is_banned_host("198.51.100.4"));
    }

    #[test]
    fn for_each_visits_in_insertion_order() {
        let list = test_list(false);
        for byte in [3u8, 1, 2] {
            list.create_node(pk(byte), vec![], None).unwrap();
        }
        let mut seen = Vec::new();
        list.for_each(|node| seen.push(node.pub_key));
        assert_eq!(seen, vec![pk(3), pk(1), pk(2)]);
    }

    #[test]
    fn remove_address_prunes_last_address() {
        let list = test_list(false);
        let addr = Address::new("a", 1);
        list.create_node(pk(1), vec![addr.clone()], Some(addr.clone()))
            .unwrap();
        list.remove_address(&pk(1), &addr).unwrap();
        let node = list.get(&pk(1)).unwrap();
        assert!(node.addresses.is_empty());
        assert!(node.last_address.is_none());
    }

    #[test]
    fn load_restores_persisted_nodes() {
        let store = Arc::new(MemNodeStore::default());
        let list = NodeList::new(store.clone(), false);
        list.create_node(pk(1), vec![Address::new("a", 1)], None)
            .unwrap();
        list.ban(&pk(1)).unwrap();

        let restored = NodeList::new(store, false);
        assert_eq!(restored.load().unwrap(), 1);
        assert!(restored.is_banned(&pk(1)));
    }
}
