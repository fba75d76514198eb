use arc_swap::ArcSwapOption;
use itertools::Itertools;
use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cluster::metadata::Peer;
use crate::errors::{BrokenConnectionError, ConnectionPoolError, UseKeyspaceError};
use crate::network::{Connection, NodeConnectionPool, PoolConfig, PoolEvent, VerifiedKeyspaceName};
use crate::routing::Token;

use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Liveness of a node as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NodeState {
    /// The node is routable.
    Up,
    /// The node was reported down, or its connections could not be opened.
    Down,
    /// The node was just announced and has not been probed yet.
    Unknown,
}

impl Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeState::Up => "UP",
            NodeState::Down => "DOWN",
            NodeState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Node represents a cluster node along with its data and connections.
///
/// A `Node` is part of an immutable [`ClusterState`](crate::cluster::ClusterState)
/// snapshot and never changes. When the liveness or the metadata of a node
/// changes, a new `Node` is created which shares the connection pool of the
/// previous one.
#[derive(Debug)]
pub struct Node {
    /// Address of the node, which is also its identity.
    pub address: SocketAddr,
    /// Host id as reported by the node, if known.
    pub host_id: Option<Uuid>,
    /// Datacenter of the node, if known.
    pub datacenter: Option<String>,
    /// Rack of the node, if known.
    pub rack: Option<String>,
    /// Schema version last reported for this node.
    pub schema_version: Option<Uuid>,

    pub(crate) tokens: Vec<Token>,
    state: NodeState,
    pool: Arc<LazyPool>,
}

/// A way that Nodes are often passed and accessed in the driver's code.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    pub(crate) fn new(peer: &Peer, state: NodeState, context: &Arc<PoolContext>) -> Self {
        Self {
            address: peer.address,
            host_id: peer.host_id,
            datacenter: peer.datacenter.clone(),
            rack: peer.rack.clone(),
            schema_version: peer.schema_version,
            tokens: peer.tokens.clone(),
            state,
            pool: Arc::new(LazyPool::new(peer.address, context.clone())),
        }
    }

    /// The same node in another state. The pool is preserved.
    pub(crate) fn with_state(&self, state: NodeState) -> Self {
        Self {
            address: self.address,
            host_id: self.host_id,
            datacenter: self.datacenter.clone(),
            rack: self.rack.clone(),
            schema_version: self.schema_version,
            tokens: self.tokens.clone(),
            state,
            pool: self.pool.clone(),
        }
    }

    /// The same node described by fresh metadata. State and pool are preserved.
    pub(crate) fn with_peer(&self, peer: &Peer) -> Self {
        Self {
            address: self.address,
            host_id: peer.host_id.or(self.host_id),
            datacenter: peer.datacenter.clone(),
            rack: peer.rack.clone(),
            schema_version: peer.schema_version,
            tokens: peer.tokens.clone(),
            state: self.state,
            pool: self.pool.clone(),
        }
    }

    /// The same node with its pool torn down and replaced by one that
    /// connects on first use.
    pub(crate) fn with_fresh_pool(&self) -> Self {
        self.shutdown_pool(BrokenConnectionError::HostDown);
        Self {
            pool: Arc::new(LazyPool::new(self.address, self.pool.context.clone())),
            ..self.with_state(self.state)
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_up(&self) -> bool {
        self.state == NodeState::Up
    }

    /// Returns true if the driver has any open connections in the pool for this
    /// node.
    pub fn is_connected(&self) -> bool {
        self.pool.get().is_some_and(NodeConnectionPool::is_connected)
    }

    /// Returns a connection with a free stream, creating the pool if this is
    /// the first time the node is used. Never hands out connections of a
    /// node which is not `Up`.
    pub(crate) async fn connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        if self.state == NodeState::Down {
            return Err(ConnectionPoolError::Suspended);
        }
        self.pool.get_or_init()?.acquire().await
    }

    pub(crate) fn get_working_connections(&self) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        match self.pool.get() {
            Some(pool) => pool.get_working_connections(),
            None => Err(ConnectionPoolError::Initializing),
        }
    }

    /// Starts connecting in the background and waits for the first result.
    pub(crate) async fn warm_up(&self) {
        if let Ok(pool) = self.pool.get_or_init() {
            pool.wait_until_initialized().await;
        }
    }

    pub(crate) fn suspend_pool(&self) {
        if let Some(pool) = self.pool.get() {
            pool.suspend();
        }
    }

    pub(crate) fn resume_pool(&self) {
        if let Some(pool) = self.pool.get() {
            pool.resume();
        }
    }

    pub(crate) fn shutdown_pool(&self, reason: BrokenConnectionError) {
        if let Some(pool) = self.pool.get() {
            pool.shutdown(reason);
        }
    }

    pub(crate) async fn use_keyspace(&self, keyspace_name: VerifiedKeyspaceName) -> Result<(), UseKeyspaceError> {
        if let Some(pool) = self.pool.get() {
            pool.use_keyspace(keyspace_name).await?;
        }
        Ok(())
    }

    pub(crate) fn has_pool(&self) -> bool {
        self.pool.get().is_some()
    }

    #[cfg(test)]
    pub(crate) fn shares_pool_with(&self, other: &Node) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

/// What every pool of a session is created with.
pub(crate) struct PoolContext {
    config: PoolConfig,
    keyspace: ArcSwapOption<VerifiedKeyspaceName>,
    event_sender: mpsc::UnboundedSender<PoolEvent>,
    shut_down: AtomicBool,
}

impl PoolContext {
    pub(crate) fn new(config: PoolConfig, event_sender: mpsc::UnboundedSender<PoolEvent>) -> Self {
        Self {
            config,
            keyspace: ArcSwapOption::empty(),
            event_sender,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Keyspace issued by connections opened from now on.
    pub(crate) fn set_keyspace(&self, keyspace_name: VerifiedKeyspaceName) {
        self.keyspace.store(Some(Arc::new(keyspace_name)));
    }

    /// No pool is created after this.
    pub(crate) fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolContext")
            .field("config", &self.config)
            .field("keyspace", &self.keyspace.load())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// A pool which is created the first time a node is routed to.
#[derive(Debug)]
struct LazyPool {
    address: SocketAddr,
    context: Arc<PoolContext>,
    pool: OnceLock<NodeConnectionPool>,
}

impl LazyPool {
    fn new(address: SocketAddr, context: Arc<PoolContext>) -> Self {
        Self {
            address,
            context,
            pool: OnceLock::new(),
        }
    }

    fn get(&self) -> Option<&NodeConnectionPool> {
        self.pool.get()
    }

    fn get_or_init(&self) -> Result<&NodeConnectionPool, ConnectionPoolError> {
        if self.context.is_shut_down() {
            return Err(ConnectionPoolError::ShutDown);
        }
        let pool = self.pool.get_or_init(|| {
            debug!("[{}] Creating connection pool", self.address);
            NodeConnectionPool::new(
                self.address,
                &self.context.config,
                self.context.keyspace.load_full().map(|name| (*name).clone()),
                Some(self.context.event_sender.clone()),
            )
        });
        // Shutdown may have raced with the creation above.
        if self.context.is_shut_down() {
            pool.shutdown(BrokenConnectionError::SessionShutDown);
            return Err(ConnectionPoolError::ShutDown);
        }
        Ok(pool)
    }
}

/// Describes a database server known on `Session` startup.
///
/// The name derives from SessionBuilder's `known_node()` family of methods.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname, optionally with a port.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

#[derive(Error, Debug)]
pub(crate) enum DnsLookupError {
    #[error("Failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    #[error("Empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    timeout: Duration,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    match tokio::time::timeout(timeout, lookup_host(host)).await {
        Ok(res) => res.map_err(Into::into),
        Err(_) => Err(DnsLookupError::Timeout(timeout.as_millis())),
    }
}

// Resolves a hostname, preferring an IPv4 address. A hostname without a port
// is retried with the default CQL port.
pub(crate) async fn resolve_hostname(hostname: &str, timeout: Duration) -> Result<SocketAddr, DnsLookupError> {
    let addrs = match lookup_host_with_timeout(hostname, timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        Err(e) => {
            let addrs = lookup_host_with_timeout((hostname, 9042), timeout)
                .await
                .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

/// Resolves the contact points. Returns the addresses that were resolved
/// together with all hostnames that had to be looked up.
pub(crate) async fn resolve_contact_points(
    known_nodes: &[KnownNode],
    timeout: Duration,
) -> (Vec<SocketAddr>, Vec<String>) {
    let mut addresses: Vec<SocketAddr> = Vec::with_capacity(known_nodes.len());
    let mut hostnames: Vec<String> = Vec::new();

    for node in known_nodes {
        match node {
            KnownNode::Hostname(hostname) => hostnames.push(hostname.clone()),
            KnownNode::Address(address) => addresses.push(*address),
        }
    }

    let resolved = futures::future::join_all(hostnames.iter().map(|hostname| async move {
        match resolve_hostname(hostname, timeout).await {
            Ok(address) => Some(address),
            Err(e) => {
                warn!("Hostname resolution failed for {}: {}", hostname, &e);
                None
            }
        }
    }))
    .await;
    addresses.extend(resolved.into_iter().flatten());
    addresses.dedup();

    (addresses, hostnames)
}
