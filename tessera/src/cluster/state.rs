use crate::routing::locator::{ReplicaLocator, ReplicaSet};
use crate::routing::Token;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use super::metadata::{Metadata, Strategy};
use super::node::{Node, NodeState, PoolContext};

/// Represents the state of the cluster: known nodes, keyspaces, and the token ring.
///
/// It is immutable after creation, and is replaced atomically whenever the
/// topology changes. Can be accessed through
/// [Session::get_cluster_state()](crate::client::session::Session::get_cluster_state).
#[derive(Clone)]
pub struct ClusterState {
    /// Incremented by one for every new snapshot.
    pub(crate) version: u64,

    /// All nodes known to be part of the cluster, accessible by their address.
    pub(crate) known_peers: HashMap<SocketAddr, Arc<Node>>, // Invariant: nonempty after Cluster::new()

    /// The same set of nodes as `known_peers`, sorted by address.
    pub(crate) all_nodes: Vec<Arc<Node>>,

    /// Nodes of every datacenter, sorted by address.
    pub(crate) datacenters: HashMap<String, Vec<Arc<Node>>>,

    /// Replication strategies of all keyspaces, accessible by their name.
    pub(crate) keyspaces: HashMap<String, Strategy>,

    pub(crate) locator: ReplicaLocator,
}

/// Enables printing [ClusterState] struct in a neat way, skipping the ring,
/// which is large.
pub(crate) struct ClusterStateNeatDebug<'a>(pub(crate) &'a ClusterState);
impl std::fmt::Debug for ClusterStateNeatDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cluster_state = &self.0;
        f.debug_struct("ClusterState")
            .field("version", &cluster_state.version)
            .field(
                "nodes",
                &cluster_state
                    .all_nodes
                    .iter()
                    .map(|node| (node.address, node.state()))
                    .collect::<Vec<_>>(),
            )
            .field("ring_size", &cluster_state.locator.ring().len())
            .field("keyspaces", &cluster_state.keyspaces.keys())
            .finish()
    }
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        ClusterStateNeatDebug(self).fmt(f)
    }
}

impl ClusterState {
    fn from_nodes(version: u64, known_peers: HashMap<SocketAddr, Arc<Node>>, keyspaces: HashMap<String, Strategy>) -> Self {
        let mut all_nodes: Vec<Arc<Node>> = known_peers.values().cloned().collect();
        all_nodes.sort_unstable_by_key(|node| node.address);
        let locator = ReplicaLocator::new(all_nodes.iter());

        let mut datacenters: HashMap<String, Vec<Arc<Node>>> = HashMap::new();
        for node in &all_nodes {
            if let Some(dc) = &node.datacenter {
                datacenters.entry(dc.clone()).or_default().push(node.clone());
            }
        }

        ClusterState {
            version,
            known_peers,
            all_nodes,
            datacenters,
            keyspaces,
            locator,
        }
    }

    /// The first snapshot. Every discovered node starts `Up`.
    pub(crate) fn new(metadata: Metadata, context: &Arc<PoolContext>) -> Self {
        let known_peers = metadata
            .peers
            .iter()
            .map(|peer| (peer.address, Arc::new(Node::new(peer, NodeState::Up, context))))
            .collect();
        Self::from_nodes(0, known_peers, metadata.keyspaces)
    }

    /// A snapshot with freshly read metadata merged in.
    ///
    /// Nodes which are already known keep their state and their pool. Newly
    /// discovered nodes start `Up`. Nodes missing from `metadata` are kept:
    /// only a `RemovedNode` event removes a node. When `metadata` carries no
    /// keyspaces (schema was not fetched), the previous ones are kept.
    pub(crate) fn with_metadata(&self, metadata: Metadata, context: &Arc<PoolContext>) -> Self {
        let mut known_peers = self.known_peers.clone();
        for peer in &metadata.peers {
            let node = match self.known_peers.get(&peer.address) {
                Some(node) => Node::with_peer(node, peer),
                None => Node::new(peer, NodeState::Up, context),
            };
            known_peers.insert(peer.address, Arc::new(node));
        }

        let keyspaces = if metadata.keyspaces.is_empty() {
            self.keyspaces.clone()
        } else {
            metadata.keyspaces
        };

        Self::from_nodes(self.version + 1, known_peers, keyspaces)
    }

    /// A snapshot where the node at `address` is replaced by `f(node)`.
    /// Returns `None` if the node is unknown.
    pub(crate) fn with_node_replaced(&self, address: SocketAddr, f: impl FnOnce(&Node) -> Node) -> Option<Self> {
        let node = self.known_peers.get(&address)?;
        let mut known_peers = self.known_peers.clone();
        known_peers.insert(address, Arc::new(f(node)));
        Some(Self::from_nodes(self.version + 1, known_peers, self.keyspaces.clone()))
    }

    /// A snapshot with `node` added, or `None` if its address is already known.
    pub(crate) fn with_node_added(&self, node: Node) -> Option<Self> {
        if self.known_peers.contains_key(&node.address) {
            return None;
        }
        let mut known_peers = self.known_peers.clone();
        known_peers.insert(node.address, Arc::new(node));
        Some(Self::from_nodes(self.version + 1, known_peers, self.keyspaces.clone()))
    }

    /// A snapshot without the node at `address`, together with the removed node.
    pub(crate) fn without_node(&self, address: SocketAddr) -> Option<(Self, Arc<Node>)> {
        let mut known_peers = self.known_peers.clone();
        let removed = known_peers.remove(&address)?;
        Some((
            Self::from_nodes(self.version + 1, known_peers, self.keyspaces.clone()),
            removed,
        ))
    }

    /// Finds a node by IP address. Events identify nodes by IP only, as the
    /// port they carry is the one the server listens on, which may differ from
    /// the one the driver connects through.
    pub(crate) fn node_by_ip(&self, ip: IpAddr) -> Option<&Arc<Node>> {
        self.all_nodes.iter().find(|node| node.address.ip() == ip)
    }

    /// Waits until the pools of all `Up` nodes have tried to connect once.
    pub(crate) async fn wait_until_all_pools_are_initialized(&self) {
        futures::future::join_all(self.all_nodes.iter().filter(|node| node.is_up()).map(|node| node.warm_up())).await;
    }

    /// Version of this snapshot. Every change produces a snapshot with a higher version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Access the replication strategies of all keyspaces.
    pub fn get_keyspaces(&self) -> &HashMap<String, Strategy> {
        &self.keyspaces
    }

    /// Returns the replication strategy of the keyspace, if known.
    pub fn get_keyspace(&self, keyspace: impl AsRef<str>) -> Option<&Strategy> {
        self.keyspaces.get(keyspace.as_ref())
    }

    /// Returns a slice of all nodes known to the driver, sorted by address.
    pub fn get_nodes_info(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    /// Returns the nodes of `datacenter`, sorted by address.
    pub fn get_datacenter_nodes(&self, datacenter: &str) -> &[Arc<Node>] {
        self.datacenters.get(datacenter).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the node with the given address, if known.
    pub fn get_node(&self, address: SocketAddr) -> Option<&Arc<Node>> {
        self.known_peers.get(&address)
    }

    /// Returns the nodes owning `token` in `keyspace`, primary owner first.
    ///
    /// An unknown keyspace yields no replicas.
    pub fn get_token_endpoints(&self, keyspace: &str, token: Token) -> Vec<Arc<Node>> {
        self.replicas(keyspace, token).into_iter().cloned().collect()
    }

    pub(crate) fn replicas(&self, keyspace: &str, token: Token) -> ReplicaSet<'_> {
        match self.keyspaces.get(keyspace) {
            Some(strategy) => self.locator.replicas_for_token(token, strategy),
            None => ReplicaSet::new(),
        }
    }

    /// Replicas used to route a request. When the keyspace is not given or
    /// not known, only the primary owner of the token.
    pub(crate) fn replicas_for_routing(&self, keyspace: Option<&str>, token: Token) -> ReplicaSet<'_> {
        match keyspace.and_then(|ks| self.keyspaces.get(ks)) {
            Some(strategy) => self.locator.replicas_for_token(token, strategy),
            None => self
                .locator
                .replicas_for_token(token, &Strategy::SimpleStrategy { replication_factor: 1 }),
        }
    }

    /// Returns a ring of nodes, to which tokens are assigned.
    pub fn ring(&self) -> impl Iterator<Item = (Token, &Arc<Node>)> {
        self.locator.ring().iter().map(|(token, node)| (*token, node))
    }

    #[cfg(test)]
    pub(crate) fn from_test_nodes(nodes: Vec<Arc<Node>>, keyspaces: HashMap<String, Strategy>) -> Self {
        let known_peers = nodes.into_iter().map(|node| (node.address, node)).collect();
        Self::from_nodes(0, known_peers, keyspaces)
    }
}
