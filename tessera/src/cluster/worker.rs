use crate::cluster::control_connection::ControlConnection;
use crate::cluster::metadata::Peer;
use crate::cluster::node::{KnownNode, Node, NodeState, PoolContext};
use crate::errors::{
    BrokenConnectionError, ConnectionError, MetadataError, NewSessionError, SchemaAgreementError, UseKeyspaceError,
};
use crate::network::{
    open_connection, use_keyspace_result, ConnectionConfig, PoolConfig, PoolEvent, PoolEventKind, VerifiedKeyspaceName,
};
use tessera_cql::frame::response::event::{Event, SchemaChangeEvent, StatusChangeEvent, TopologyChangeEvent};

use arc_swap::{ArcSwap, ArcSwapOption};
use futures::future::{join_all, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt, future::RemoteHandle};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::metadata_reader::MetadataReader;
use super::state::{ClusterState, ClusterStateNeatDebug};

const CONTROL_CONNECTION_REPAIR_INTERVAL: Duration = Duration::from_secs(1);

/// Settings of the cluster worker, derived from the session configuration.
#[derive(Debug, Clone)]
pub(crate) struct ClusterConfig {
    pub(crate) known_nodes: Vec<KnownNode>,
    pub(crate) pool_config: PoolConfig,
    pub(crate) fetch_schema_metadata: bool,
    pub(crate) hostname_resolution_timeout: Duration,
    pub(crate) metadata_refresh_interval: Duration,
    pub(crate) down_host_grace_period: Duration,
}

/// Cluster manages up to date information and connections to database nodes.
/// All state can be accessed by cloning Arc<ClusterState> in the `state` field
pub(crate) struct Cluster {
    // `ArcSwap<ClusterState>` is wrapped in `Arc` to support sharing cluster state
    // between `Cluster` and `ClusterWorker`
    state: Arc<ArcSwap<ClusterState>>,
    control_connection: Arc<ArcSwapOption<ControlConnection>>,
    context: Arc<PoolContext>,

    refresh_channel: mpsc::Sender<RefreshRequest>,
    use_keyspace_channel: mpsc::Sender<UseKeyspaceRequest>,
    shutdown_channel: mpsc::Sender<oneshot::Sender<()>>,

    _worker_handle: RemoteHandle<()>,
}

// Channels are left out; only the current snapshot is printed.
impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("data", &ClusterStateNeatDebug(&self.state.load()))
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

// Works in the background to keep the cluster updated
struct ClusterWorker {
    // Cluster state to keep updated:
    cluster_state: Arc<ArcSwap<ClusterState>>,
    context: Arc<PoolContext>,

    metadata_reader: MetadataReader,
    probe_config: ConnectionConfig,
    config: ClusterConfig,

    refresh_channel: mpsc::Receiver<RefreshRequest>,
    use_keyspace_channel: mpsc::Receiver<UseKeyspaceRequest>,
    shutdown_channel: mpsc::Receiver<oneshot::Sender<()>>,

    // Events pushed by the control connection.
    server_events_channel: mpsc::Receiver<Event>,
    // Reachability reports of the pools.
    pool_events_channel: mpsc::UnboundedReceiver<PoolEvent>,
    // Schema changes are forwarded here, for statement cache invalidation.
    schema_change_sender: mpsc::UnboundedSender<SchemaChangeEvent>,

    probes: FuturesUnordered<BoxFuture<'static, ProbeOutcome>>,
    probing: HashSet<SocketAddr>,

    // Nodes reported down by the cluster, with the generation of their grace timer.
    grace_timers: FuturesUnordered<BoxFuture<'static, (SocketAddr, u64)>>,
    reported_down: HashMap<SocketAddr, u64>,
    next_generation: u64,
}

#[derive(Debug)]
struct RefreshRequest {
    response_chan: oneshot::Sender<Result<(), MetadataError>>,
}

#[derive(Debug)]
struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_chan: oneshot::Sender<Result<(), UseKeyspaceError>>,
}

struct ProbeOutcome {
    address: SocketAddr,
    delay: Duration,
    result: Result<(), ConnectionError>,
}

impl Cluster {
    pub(crate) async fn new(
        config: ClusterConfig,
        schema_change_sender: mpsc::UnboundedSender<SchemaChangeEvent>,
    ) -> Result<Cluster, NewSessionError> {
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let (refresh_sender, refresh_receiver) = mpsc::channel(32);
        let (use_keyspace_sender, use_keyspace_receiver) = mpsc::channel(32);
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);
        let (server_events_sender, server_events_receiver) = mpsc::channel(32);
        // Unbounded, so that pool refillers never block on a busy worker.
        let (pool_events_sender, pool_events_receiver) = mpsc::unbounded_channel();

        let context = Arc::new(PoolContext::new(config.pool_config.clone(), pool_events_sender));
        let control_connection = Arc::new(ArcSwapOption::empty());

        let mut metadata_reader = MetadataReader::new(
            config.known_nodes.clone(),
            config.hostname_resolution_timeout,
            config.pool_config.connection_config.clone(),
            server_events_sender,
            config.fetch_schema_metadata,
            control_connection.clone(),
        )
        .await?;

        let metadata = metadata_reader.read_metadata(true).await?;
        let cluster_state = ClusterState::new(metadata, &context);
        cluster_state.wait_until_all_pools_are_initialized().await;
        info!(
            "Connected to a cluster of {} nodes through {}",
            cluster_state.get_nodes_info().len(),
            metadata_reader.control_connection_address()
        );

        let cluster_state: Arc<ArcSwap<ClusterState>> = Arc::new(ArcSwap::from(Arc::new(cluster_state)));

        let worker = ClusterWorker {
            cluster_state: cluster_state.clone(),
            context: context.clone(),

            metadata_reader,
            probe_config: config.pool_config.connection_config.clone(),
            config,

            refresh_channel: refresh_receiver,
            use_keyspace_channel: use_keyspace_receiver,
            shutdown_channel: shutdown_receiver,
            server_events_channel: server_events_receiver,
            pool_events_channel: pool_events_receiver,
            schema_change_sender,

            probes: FuturesUnordered::new(),
            probing: HashSet::new(),
            grace_timers: FuturesUnordered::new(),
            reported_down: HashMap::new(),
            next_generation: 0,
        };

        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        Ok(Cluster {
            state: cluster_state,
            control_connection,
            context,
            refresh_channel: refresh_sender,
            use_keyspace_channel: use_keyspace_sender,
            shutdown_channel: shutdown_sender,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn get_state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.context.is_shut_down()
    }

    pub(crate) async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.refresh_channel
            .send(RefreshRequest {
                response_chan: response_sender,
            })
            .await
            .map_err(|_| MetadataError::WorkerStopped)?;

        response_receiver.await.unwrap_or(Err(MetadataError::WorkerStopped))
    }

    pub(crate) async fn use_keyspace(&self, keyspace_name: VerifiedKeyspaceName) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.use_keyspace_channel
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_chan: response_sender,
            })
            .await
            .map_err(|_| UseKeyspaceError::SessionShutDown)?;

        response_receiver.await.unwrap_or(Err(UseKeyspaceError::SessionShutDown))
    }

    /// Checks if all `Up` nodes report the same schema version.
    ///
    /// If so, returns that agreed upon version.
    pub(crate) async fn check_schema_agreement(&self) -> Result<Option<Uuid>, SchemaAgreementError> {
        let control_connection = self
            .control_connection
            .load_full()
            .ok_or(SchemaAgreementError::ControlConnectionUnavailable)?;

        let versions = control_connection
            .query_schema_versions()
            .await
            .map_err(|err| match err {
                MetadataError::Query { error, .. } => SchemaAgreementError::RequestError(error),
                other => SchemaAgreementError::MalformedRow(other),
            })?;

        let state = self.get_state();
        let mut up_versions = versions
            .into_iter()
            .filter(|(address, _)| state.get_node(*address).is_some_and(|node| node.is_up()))
            .map(|(_, version)| version);

        let Some(first) = up_versions.next() else {
            return Ok(None);
        };
        let agreed = up_versions.all(|version| version == first);
        debug!("Schema versions agree: {}", agreed);
        Ok(if agreed { first } else { None })
    }

    /// Polls [`check_schema_agreement`](Self::check_schema_agreement) every
    /// `interval` until the versions agree or `timeout` elapses.
    pub(crate) async fn await_schema_agreement(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Uuid, SchemaAgreementError> {
        let poll = async {
            loop {
                if let Some(version) = self.check_schema_agreement().await? {
                    return Ok(version);
                }
                tokio::time::sleep(interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .unwrap_or(Err(SchemaAgreementError::Timeout(timeout)))
    }

    /// Stops the worker and the control connection, and closes every pool.
    /// Idempotent.
    pub(crate) async fn shutdown(&self) {
        self.shutdown_pools();

        let (done_sender, done_receiver) = oneshot::channel();
        if self.shutdown_channel.send(done_sender).await.is_ok() {
            let _ = done_receiver.await;
        }
    }

    fn shutdown_pools(&self) {
        if !self.context.is_shut_down() {
            debug!("Shutting down all connection pools");
        }
        self.context.shut_down();
        for node in self.get_state().get_nodes_info() {
            node.shutdown_pool(BrokenConnectionError::SessionShutDown);
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // The worker, and the control connection with it, stops together with its handle.
        self.shutdown_pools();
    }
}

impl ClusterWorker {
    pub(crate) async fn work(mut self) {
        use tokio::time::Instant;

        let mut last_refresh_time = Instant::now();
        let mut control_connection_works = true;

        loop {
            let mut cur_request: Option<RefreshRequest> = None;

            // Wait until it's time for the next refresh
            let sleep_until: Instant = last_refresh_time
                .checked_add(if control_connection_works {
                    self.config.metadata_refresh_interval
                } else {
                    CONTROL_CONNECTION_REPAIR_INTERVAL
                })
                .unwrap_or_else(Instant::now);

            let sleep_future = tokio::time::sleep_until(sleep_until);
            tokio::pin!(sleep_future);

            tokio::select! {
                _sleep_finished = sleep_future => {
                    // Time to do periodic refresh.
                },

                maybe_refresh_request = self.refresh_channel.recv() => {
                    match maybe_refresh_request {
                        Some(request) => cur_request = Some(request),
                        None => return, // If refresh_channel was closed then cluster was dropped, we can stop working
                    }
                }

                maybe_cql_event = self.server_events_channel.recv() => {
                    let Some(event) = maybe_cql_event else {
                        return;
                    };
                    debug!("Received server event: {:?}", event);
                    if !self.handle_server_event(event) {
                        continue; // Don't go to refreshing
                    }
                }

                Some(event) = self.pool_events_channel.recv() => {
                    self.handle_pool_event(event);
                    continue;
                }

                Some(outcome) = self.probes.next(), if !self.probes.is_empty() => {
                    self.handle_probe_outcome(outcome);
                    continue;
                }

                Some((address, generation)) = self.grace_timers.next(), if !self.grace_timers.is_empty() => {
                    self.handle_grace_period_expiry(address, generation);
                    continue;
                }

                maybe_use_keyspace_request = self.use_keyspace_channel.recv() => {
                    let Some(request) = maybe_use_keyspace_request else {
                        return;
                    };
                    self.context.set_keyspace(request.keyspace_name.clone());
                    let cluster_state = self.cluster_state.load_full();
                    tokio::spawn(Self::handle_use_keyspace_request(cluster_state, request));
                    continue; // Don't go to refreshing, wait for the next event
                }

                maybe_shutdown = self.shutdown_channel.recv() => {
                    self.metadata_reader.close();
                    if let Some(done) = maybe_shutdown {
                        let _ = done.send(());
                    }
                    debug!("Cluster worker stopped");
                    return;
                }

                error = self.metadata_reader.wait_for_control_connection_error() => {
                    warn!(
                        control_connection_address = %self.metadata_reader.control_connection_address(),
                        error = %error,
                        "Control connection broke, reopening it"
                    );
                    self.metadata_reader.mark_broken(error);
                    // The first repair attempt is immediate.
                }
            }

            debug!("Requesting metadata refresh");
            last_refresh_time = Instant::now();
            let refresh_res = self.perform_refresh().await;

            if let Err(error) = &refresh_res {
                warn!(
                    cluster_state_version = self.cluster_state.load().version(),
                    error = %error,
                    "Metadata refresh failed, serving a possibly stale cluster state"
                );
            }
            control_connection_works = refresh_res.is_ok();

            // Send refresh result if there was a request
            if let Some(request) = cur_request {
                // We can ignore sending error - if no one waits for the response we can drop it
                let _ = request.response_chan.send(refresh_res);
            }
        }
    }

    async fn handle_use_keyspace_request(cluster_state: Arc<ClusterState>, request: UseKeyspaceRequest) {
        let result = Self::send_use_keyspace(cluster_state, &request.keyspace_name).await;

        // Don't care if nobody wants request result
        let _ = request.response_chan.send(result);
    }

    async fn send_use_keyspace(
        cluster_state: Arc<ClusterState>,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let use_keyspace_futures = cluster_state
            .get_nodes_info()
            .iter()
            .filter(|node| node.has_pool())
            .map(|node| node.use_keyspace(keyspace_name.clone()));
        let use_keyspace_results: Vec<Result<(), UseKeyspaceError>> = join_all(use_keyspace_futures).await;

        use_keyspace_result(use_keyspace_results.into_iter())
    }

    async fn perform_refresh(&mut self) -> Result<(), MetadataError> {
        // Fail over only to nodes which are not known to be down.
        let candidates = self
            .cluster_state
            .load()
            .get_nodes_info()
            .iter()
            .filter(|node| node.state() != NodeState::Down)
            .map(|node| node.address)
            .collect();
        self.metadata_reader.set_known_peers(candidates);

        let metadata = self.metadata_reader.read_metadata(false).await?;
        let cluster_state = self.cluster_state.load_full();
        let new_cluster_state = cluster_state.with_metadata(metadata, &self.context);
        for node in new_cluster_state.get_nodes_info() {
            if cluster_state.get_node(node.address).is_none() {
                info!("Discovered node {} in {:?}", node.address, node.datacenter);
            }
        }
        self.update_cluster_state(new_cluster_state);

        Ok(())
    }

    fn update_cluster_state(&self, new_cluster_state: ClusterState) {
        self.cluster_state.store(Arc::new(new_cluster_state));
    }

    // Replaces the node at `address` with `f(node)`. Returns false if the node is unknown.
    fn update_node(&self, address: SocketAddr, f: impl FnOnce(&Node) -> Node) -> bool {
        match self.cluster_state.load().with_node_replaced(address, f) {
            Some(new_cluster_state) => {
                self.update_cluster_state(new_cluster_state);
                true
            }
            None => false,
        }
    }

    /// Applies a server event. Returns true if metadata should be refreshed.
    fn handle_server_event(&mut self, event: Event) -> bool {
        match event {
            Event::Topology(TopologyChangeEvent::NewNode(event_address)) => {
                let cluster_state = self.cluster_state.load_full();
                if cluster_state.node_by_ip(event_address.ip()).is_some() {
                    return false;
                }
                // Nodes share the port of the control connection.
                let address = SocketAddr::new(
                    event_address.ip(),
                    self.metadata_reader.control_connection_address().port(),
                );
                let node = Node::new(&Peer::from_address(address), NodeState::Unknown, &self.context);
                if let Some(new_cluster_state) = cluster_state.with_node_added(node) {
                    info!("Node {} joined the cluster", address);
                    self.update_cluster_state(new_cluster_state);
                    self.schedule_probe(address, Duration::ZERO);
                }
                // Read its datacenter, rack and tokens.
                true
            }
            Event::Topology(TopologyChangeEvent::RemovedNode(event_address)) => {
                let cluster_state = self.cluster_state.load_full();
                let Some(address) = cluster_state.node_by_ip(event_address.ip()).map(|node| node.address) else {
                    return false;
                };
                if let Some((new_cluster_state, removed)) = cluster_state.without_node(address) {
                    info!("Node {} left the cluster", address);
                    self.update_cluster_state(new_cluster_state);
                    removed.shutdown_pool(BrokenConnectionError::HostRemoved);
                    self.reported_down.remove(&address);
                }
                false
            }
            Event::Status(StatusChangeEvent::Up(event_address)) => {
                let Some(node) = self.cluster_state.load().node_by_ip(event_address.ip()).cloned() else {
                    return false;
                };
                self.reported_down.remove(&node.address);
                if node.state() != NodeState::Up {
                    info!("Node {} is up", node.address);
                    self.update_node(node.address, |node| node.with_state(NodeState::Up));
                    node.resume_pool();
                }
                false
            }
            Event::Status(StatusChangeEvent::Down(event_address)) => {
                let Some(node) = self.cluster_state.load().node_by_ip(event_address.ip()).cloned() else {
                    return false;
                };
                if self.reported_down.contains_key(&node.address) {
                    return false;
                }
                info!("Node {} is down", node.address);
                self.update_node(node.address, |node| node.with_state(NodeState::Down));
                node.suspend_pool();
                self.start_grace_timer(node.address);
                false
            }
            Event::Schema(schema_change) => {
                let _ = self.schema_change_sender.send(schema_change);
                false
            }
        }
    }

    fn handle_pool_event(&mut self, event: PoolEvent) {
        debug!("Received pool event: {:?}", event);
        let Some(node) = self.cluster_state.load().get_node(event.address).cloned() else {
            return;
        };
        match event.kind {
            PoolEventKind::Unreachable(error) => {
                if node.state() == NodeState::Up {
                    warn!(error = %error, "Node {} is unreachable, marking it down", node.address);
                    self.update_node(node.address, |node| node.with_state(NodeState::Down));
                }
            }
            PoolEventKind::Established => {
                // A node reported down by the cluster comes back with an `Up` event or a probe.
                if node.state() != NodeState::Up && !self.reported_down.contains_key(&node.address) {
                    info!("Node {} is reachable again", node.address);
                    self.update_node(node.address, |node| node.with_state(NodeState::Up));
                }
            }
        }
    }

    fn start_grace_timer(&mut self, address: SocketAddr) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.reported_down.insert(address, generation);

        let grace_period = self.config.down_host_grace_period;
        self.grace_timers.push(
            async move {
                tokio::time::sleep(grace_period).await;
                (address, generation)
            }
            .boxed(),
        );
    }

    fn handle_grace_period_expiry(&mut self, address: SocketAddr, generation: u64) {
        // The node came back, or went down again and has a newer timer.
        if self.reported_down.get(&address) != Some(&generation) {
            return;
        }
        let still_down = self
            .cluster_state
            .load()
            .get_node(address)
            .is_some_and(|node| node.state() == NodeState::Down);
        if !still_down {
            return;
        }

        info!(
            "Node {} has been down for {:?}, closing its pool",
            address, self.config.down_host_grace_period
        );
        self.update_node(address, Node::with_fresh_pool);
        self.schedule_probe(address, self.config.pool_config.reconnect_base_delay);
    }

    fn schedule_probe(&mut self, address: SocketAddr, delay: Duration) {
        if !self.probing.insert(address) {
            return;
        }
        let config = self.probe_config.clone();
        self.probes.push(
            async move {
                tokio::time::sleep(delay).await;
                let result = open_connection(address, None, &config).await.map(|_| ());
                ProbeOutcome {
                    address,
                    delay,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn handle_probe_outcome(&mut self, outcome: ProbeOutcome) {
        self.probing.remove(&outcome.address);
        let Some(node) = self.cluster_state.load().get_node(outcome.address).cloned() else {
            return;
        };
        if node.state() == NodeState::Up {
            return;
        }

        match outcome.result {
            Ok(()) => {
                info!("Node {} answered a probe, marking it up", node.address);
                self.reported_down.remove(&node.address);
                self.update_node(node.address, |node| node.with_state(NodeState::Up));
                node.resume_pool();
            }
            Err(error) => {
                debug!(error = %error, "Probe of node {} failed", node.address);
                if node.state() == NodeState::Unknown {
                    self.update_node(node.address, |node| node.with_state(NodeState::Down));
                }
                let pool_config = &self.config.pool_config;
                let delay = (outcome.delay * 2)
                    .max(pool_config.reconnect_base_delay)
                    .min(pool_config.reconnect_max_delay);
                self.schedule_probe(node.address, delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tessera_cql::frame::request::RequestOpcode;
    use tessera_cql::frame::response::event::{SchemaChangeTarget, SchemaChangeType};

    use tessera_cql::value::SerializedValues;
    use tessera_cql::Consistency;

    use super::*;
    use crate::errors::{ConnectionPoolError, RequestAttemptError};
    use crate::network::Connection;
    use crate::utils::test_utils::{
        mock_cluster, setup_tracing, MockNode, NodeInfo, Reaction, Rule, SCHEMA_VERSION,
    };

    fn config(nodes: &[&MockNode]) -> ClusterConfig {
        ClusterConfig {
            known_nodes: nodes.iter().map(|node| KnownNode::Address(node.address())).collect(),
            pool_config: PoolConfig::default(),
            fetch_schema_metadata: true,
            hostname_resolution_timeout: Duration::from_secs(1),
            metadata_refresh_interval: Duration::from_secs(60),
            down_host_grace_period: Duration::from_secs(30),
        }
    }

    async fn cluster(config: ClusterConfig) -> (Cluster, mpsc::UnboundedReceiver<SchemaChangeEvent>) {
        let (schema_change_sender, schema_change_receiver) = mpsc::unbounded_channel();
        let cluster = Cluster::new(config, schema_change_sender).await.unwrap();
        (cluster, schema_change_receiver)
    }

    async fn wait_for(cluster: &Cluster, mut condition: impl FnMut(&ClusterState) -> bool) {
        while !condition(&cluster.get_state()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn state_of(state: &ClusterState, node: &MockNode) -> Option<NodeState> {
        state.get_node(node.address()).map(|node| node.state())
    }

    /// Sends a query `node` never answers, pushes `event` through the control
    /// node once the query arrived and returns how the query ended.
    async fn pending_query_after(
        cluster: &Cluster,
        control: &MockNode,
        node: &MockNode,
        event: Event,
    ) -> Result<(), RequestAttemptError> {
        node.add_rule(
            Rule::on(RequestOpcode::Query)
                .containing("SELECT forever")
                .then(Reaction::NoReply),
        );
        let conn: Arc<Connection> = cluster
            .get_state()
            .get_node(node.address())
            .unwrap()
            .connection()
            .await
            .unwrap();

        let pending = conn.query_unpaged("SELECT forever", SerializedValues::EMPTY, Consistency::One, None);
        let push = async {
            while node.count_matching(RequestOpcode::Query, "SELECT forever") == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            control.push_event(&event);
        };
        let (res, ()) = tokio::join!(pending, push);
        res.map(|_| ())
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn discovers_nodes_and_keyspaces() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc2", &[100])]).await;
        nodes[0].set_keyspace("ks", &[("class", "SimpleStrategy"), ("replication_factor", "1")]);
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;

        let state = cluster.get_state();
        assert_eq!(state.get_nodes_info().len(), 2);
        assert!(state.get_nodes_info().iter().all(|node| node.is_up() && node.is_connected()));
        assert_eq!(
            state.get_node(nodes[1].address()).unwrap().datacenter.as_deref(),
            Some("dc2")
        );
        assert!(state.get_keyspace("ks").is_some());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn empty_contact_points_are_rejected() {
        let (schema_change_sender, _) = mpsc::unbounded_channel();
        assert_matches!(
            Cluster::new(config(&[]), schema_change_sender).await,
            Err(NewSessionError::EmptyKnownNodesList)
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn flapping_node_keeps_its_pool() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;
        let before = cluster.get_state().get_node(nodes[1].address()).unwrap().clone();

        nodes[0].push_event(&Event::Status(StatusChangeEvent::Down(nodes[1].address())));
        wait_for(&cluster, |state| state_of(state, &nodes[1]) == Some(NodeState::Down)).await;
        let down = cluster.get_state().get_node(nodes[1].address()).unwrap().clone();
        assert_matches!(down.connection().await, Err(ConnectionPoolError::Suspended));

        nodes[0].push_event(&Event::Status(StatusChangeEvent::Up(nodes[1].address())));
        wait_for(&cluster, |state| state_of(state, &nodes[1]) == Some(NodeState::Up)).await;
        let up = cluster.get_state().get_node(nodes[1].address()).unwrap().clone();

        assert!(up.shares_pool_with(&before));
        assert!(up.connection().await.is_ok());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn node_down_past_grace_period_is_torn_down_and_removable() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let mut config = config(&[&nodes[0]]);
        config.down_host_grace_period = Duration::from_millis(100);
        let (cluster, _) = cluster(config).await;
        let before = cluster.get_state().get_node(nodes[1].address()).unwrap().clone();

        // The node is really gone, so the probe after the grace period fails.
        nodes[1].stop();
        nodes[0].push_event(&Event::Status(StatusChangeEvent::Down(nodes[1].address())));
        wait_for(&cluster, |state| {
            state
                .get_node(nodes[1].address())
                .is_some_and(|node| !node.shares_pool_with(&before))
        })
        .await;
        assert_eq!(state_of(&cluster.get_state(), &nodes[1]), Some(NodeState::Down));

        nodes[0].push_event(&Event::Topology(TopologyChangeEvent::RemovedNode(nodes[1].address())));
        wait_for(&cluster, |state| state_of(state, &nodes[1]).is_none()).await;
        assert_eq!(cluster.get_state().get_nodes_info().len(), 1);

        // The cluster no longer lists it either.
        nodes[0].set_peers(Vec::new());
        cluster.refresh_metadata().await.unwrap();
        assert!(state_of(&cluster.get_state(), &nodes[1]).is_none());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn removed_node_fails_its_pending_requests() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;

        let removed = Event::Topology(TopologyChangeEvent::RemovedNode(nodes[1].address()));
        assert_matches!(
            pending_query_after(&cluster, &nodes[0], &nodes[1], removed).await,
            Err(RequestAttemptError::BrokenConnection(BrokenConnectionError::HostRemoved))
        );
        assert!(state_of(&cluster.get_state(), &nodes[1]).is_none());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn down_node_fails_its_pending_requests() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;

        let down = Event::Status(StatusChangeEvent::Down(nodes[1].address()));
        assert_matches!(
            pending_query_after(&cluster, &nodes[0], &nodes[1], down).await,
            Err(RequestAttemptError::BrokenConnection(BrokenConnectionError::HostDown))
        );
        assert_eq!(state_of(&cluster.get_state(), &nodes[1]), Some(NodeState::Down));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn new_node_is_probed_before_use() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        // The first node does not know about the second one yet.
        nodes[0].set_peers(Vec::new());
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;
        assert_eq!(cluster.get_state().get_nodes_info().len(), 1);

        nodes[0].push_event(&Event::Topology(TopologyChangeEvent::NewNode(nodes[1].address())));
        wait_for(&cluster, |state| state_of(state, &nodes[1]).is_some()).await;
        wait_for(&cluster, |state| state_of(state, &nodes[1]) == Some(NodeState::Up)).await;
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unreachable_node_is_marked_down_until_it_recovers() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;

        nodes[1].stop();
        wait_for(&cluster, |state| state_of(state, &nodes[1]) == Some(NodeState::Down)).await;

        nodes[1].restart().unwrap();
        wait_for(&cluster, |state| state_of(state, &nodes[1]) == Some(NodeState::Up)).await;
    }

    #[tokio::test]
    #[ntest::timeout(15000)]
    async fn control_connection_moves_to_another_node() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;
        let version = cluster.get_state().version();

        nodes[0].stop();
        // Queries are still served from the last known state.
        assert_eq!(cluster.get_state().get_nodes_info().len(), 2);

        loop {
            if cluster.refresh_metadata().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(cluster.get_state().version() > version);
        assert_eq!(nodes[1].count(RequestOpcode::Register), 1);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn schema_changes_are_forwarded() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0])]).await;
        let (cluster, mut schema_changes) = cluster(config(&[&nodes[0]])).await;

        let change = SchemaChangeEvent {
            change_type: SchemaChangeType::Updated,
            keyspace: "ks".to_owned(),
            target: SchemaChangeTarget::Table { name: "t".to_owned() },
        };
        nodes[0].push_event(&Event::Schema(change.clone()));
        assert_eq!(schema_changes.recv().await, Some(change));
        drop(cluster);
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn use_keyspace_reaches_every_node() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;

        cluster
            .use_keyspace(VerifiedKeyspaceName::new("ks", false).unwrap())
            .await
            .unwrap();
        for node in &nodes {
            assert!(node.count_matching(RequestOpcode::Query, "USE ks") >= 1);
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn schema_agreement_considers_up_nodes() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;

        assert_eq!(cluster.check_schema_agreement().await.unwrap(), Some(SCHEMA_VERSION));

        let other = Uuid::from_u128(7);
        nodes[1].set_schema_version(other);
        assert_eq!(cluster.check_schema_agreement().await.unwrap(), None);
        assert_matches!(
            cluster
                .await_schema_agreement(Duration::from_millis(100), Duration::from_millis(20))
                .await,
            Err(SchemaAgreementError::Timeout(_))
        );

        nodes[0].set_schema_version(other);
        assert_eq!(
            cluster
                .await_schema_agreement(Duration::from_secs(2), Duration::from_millis(20))
                .await
                .unwrap(),
            other
        );
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn shutdown_closes_everything() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (cluster, _) = cluster(config(&[&nodes[0]])).await;

        cluster.shutdown().await;
        cluster.shutdown().await;
        assert!(cluster.is_shut_down());

        for node in cluster.get_state().get_nodes_info() {
            assert_matches!(node.connection().await, Err(ConnectionPoolError::ShutDown));
        }
        while nodes.iter().any(|node| node.open_connections() > 0) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_matches!(cluster.refresh_metadata().await, Err(MetadataError::WorkerStopped));
    }
}
