//! The [`Session`]: entry point for running statements against a cluster.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::execution::{run_request, ExecuteRequestContext, RequestKind, RunRequestResult};
use super::statement_cache::StatementCache;
use super::Compression;
use crate::authentication::AuthenticatorProvider;
use crate::cluster::{Cluster, ClusterConfig, ClusterState, KnownNode};
use crate::errors::{
    BadQuery, ExecutionError, MetadataError, NewSessionError, PrepareError, SchemaAgreementError,
    UseKeyspaceError,
};
use crate::network::{ConnectionConfig, PoolConfig, VerifiedKeyspaceName, MAX_STREAMS_LIMIT};
use crate::policies::load_balancing::{
    DcAwareRoundRobinPolicy, LoadBalancingPolicy, RoundRobinPolicy, RoutingInfo, TokenAwarePolicy,
};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::response::query_result::QueryResult;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use crate::statement::StatementConfig;
use tessera_cql::value::{BoundValues, SerializedValues};
use tessera_cql::{Consistency, SerialConsistency};

/// Everything [`Session::connect`] needs to know.
///
/// Fields are public and can be set directly; the
/// [`SessionBuilder`](super::session_builder::SessionBuilder) wraps the same
/// settings in chained calls.
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Contact points. The first one that answers is asked for the rest of
    /// the topology, so one live node is enough.
    pub known_nodes: Vec<KnownNode>,

    /// Datacenter whose nodes are preferred by the default load balancing policy.
    pub local_datacenter: Option<String>,

    /// Load balancing policy used for statements which do not set their own.
    /// If `None`, a [`TokenAwarePolicy`] wrapping a [`RoundRobinPolicy`]
    /// (or a [`DcAwareRoundRobinPolicy`] when `local_datacenter` is set) is used.
    pub load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,

    /// Retry policy used for statements which do not set their own.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// Consistency of statements which do not set their own.
    pub default_consistency: Consistency,

    /// Serial consistency of statements which do not set their own.
    pub default_serial_consistency: Option<SerialConsistency>,

    /// Timeout of a single attempt of a request, unless the statement sets its own.
    pub request_timeout: Duration,

    /// Timeout for establishing connections to a node, handshake included.
    pub connect_timeout: Duration,

    /// Timeout of resolving the hostnames of the known nodes.
    pub hostname_resolution_timeout: Duration,

    /// Connections opened to each node up front and kept open.
    pub pool_min_connections: usize,

    /// Connections the pool of a node may grow to when all are saturated.
    pub pool_max_connections: usize,

    /// Requests that may be in flight on one connection at a time.
    pub max_streams_per_connection: usize,

    /// Body compression to ask for. A node which does not offer it gets
    /// uncompressed frames.
    pub compression: Option<Compression>,

    /// Sets `TCP_NODELAY` on every socket.
    pub tcp_nodelay: bool,

    /// Idle time before the kernel starts sending TCP keepalive probes.
    /// `None` leaves `SO_KEEPALIVE` off.
    pub tcp_keepalive_interval: Option<Duration>,

    /// How often an idle connection sends `OPTIONS` to check it is alive.
    /// If `None`, no such keepalive requests are sent.
    pub connection_keepalive_interval: Option<Duration>,

    /// Answers `AUTHENTICATE` challenges. Each handshake gets its own
    /// authenticator from the provider.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// Keyspace every connection switches to before serving requests.
    /// [`Session::use_keyspace`] changes it later.
    pub used_keyspace: Option<String>,

    /// Quote `used_keyspace` instead of letting the server lowercase it.
    pub keyspace_case_sensitive: bool,

    /// If true, keyspace replication strategies are fetched, which token
    /// aware routing needs to find all replicas of a key.
    pub fetch_schema_metadata: bool,

    /// How often the topology is refreshed even without server events.
    pub cluster_metadata_refresh_interval: Duration,

    /// How long a node reported down keeps its pool, in case it comes back.
    pub down_host_grace_period: Duration,

    /// First delay of reconnecting a broken pool; doubles on every failure.
    pub reconnect_base_delay: Duration,

    /// Cap on the reconnection delay.
    pub reconnect_max_delay: Duration,

    /// Interval of polling schema versions in [`Session::await_schema_agreement`].
    pub schema_agreement_interval: Duration,

    /// Timeout of [`Session::await_schema_agreement`].
    pub schema_agreement_timeout: Duration,
}

impl SessionConfig {
    /// No contact points yet, `LocalQuorum`, [`DefaultRetryPolicy`], token
    /// aware round robin, no compression, one to four connections per node.
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            local_datacenter: None,
            load_balancing_policy: None,
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            default_consistency: Consistency::LocalQuorum,
            default_serial_consistency: Some(SerialConsistency::LocalSerial),
            request_timeout: Duration::from_secs(12),
            connect_timeout: Duration::from_secs(5),
            hostname_resolution_timeout: Duration::from_secs(5),
            pool_min_connections: 1,
            pool_max_connections: 4,
            max_streams_per_connection: 128,
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connection_keepalive_interval: None,
            authenticator: None,
            used_keyspace: None,
            keyspace_case_sensitive: false,
            fetch_schema_metadata: true,
            cluster_metadata_refresh_interval: Duration::from_secs(60),
            down_host_grace_period: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_secs(10),
            schema_agreement_interval: Duration::from_millis(200),
            schema_agreement_timeout: Duration::from_secs(60),
        }
    }

    /// Adds a contact point given as `host` or `host:port`, resolved at
    /// connect time. The port defaults to 9042.
    ///
    /// ```
    /// # use tessera::client::session::SessionConfig;
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("10.0.0.7");
    /// config.add_known_node("cassandra.internal:19042");
    /// assert_eq!(config.known_nodes.len(), 2);
    /// ```
    pub fn add_known_node(&mut self, host: impl AsRef<str>) {
        let host = host.as_ref().to_owned();
        self.known_nodes.push(KnownNode::Hostname(host));
    }

    /// Adds a contact point that needs no resolution.
    pub fn add_known_node_addr(&mut self, address: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(address));
    }

    /// [`add_known_node`](Self::add_known_node) for each of `hosts`.
    pub fn add_known_nodes(&mut self, hosts: impl IntoIterator<Item = impl AsRef<str>>) {
        hosts.into_iter().for_each(|host| self.add_known_node(host));
    }

    fn validate(&self) -> Result<(), NewSessionError> {
        if self.pool_min_connections == 0 {
            return Err(NewSessionError::InvalidConfig(
                "pool_min_connections must be at least 1",
            ));
        }
        if self.pool_min_connections > self.pool_max_connections {
            return Err(NewSessionError::InvalidConfig(
                "pool_min_connections must not exceed pool_max_connections",
            ));
        }
        if !(1..=MAX_STREAMS_LIMIT).contains(&self.max_streams_per_connection) {
            return Err(NewSessionError::InvalidConfig(
                "max_streams_per_connection must be between 1 and 32768",
            ));
        }
        Ok(())
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            compression: self.compression,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            connect_timeout: self.connect_timeout,
            keepalive_interval: self.connection_keepalive_interval,
            max_streams: self.max_streams_per_connection,
            orphan_threshold: (self.max_streams_per_connection / 2).max(1),
            authenticator: self.authenticator.clone(),
            ..Default::default()
        }
    }

    fn cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            known_nodes: self.known_nodes.clone(),
            pool_config: PoolConfig {
                connection_config: self.connection_config(),
                min_connections: self.pool_min_connections,
                max_connections: self.pool_max_connections,
                reconnect_base_delay: self.reconnect_base_delay,
                reconnect_max_delay: self.reconnect_max_delay,
            },
            fetch_schema_metadata: self.fetch_schema_metadata,
            hostname_resolution_timeout: self.hostname_resolution_timeout,
            metadata_refresh_interval: self.cluster_metadata_refresh_interval,
            down_host_grace_period: self.down_host_grace_period,
        }
    }

    fn default_load_balancing_policy(&self) -> Arc<dyn LoadBalancingPolicy> {
        if let Some(policy) = &self.load_balancing_policy {
            return policy.clone();
        }
        let child_policy: Arc<dyn LoadBalancingPolicy> = match &self.local_datacenter {
            Some(local_dc) => Arc::new(DcAwareRoundRobinPolicy::new(local_dc.clone())),
            None => Arc::new(RoundRobinPolicy::new()),
        };
        Arc::new(TokenAwarePolicy::new(child_policy))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// A connected client of one cluster.
///
/// A session owns the background worker keeping the topology current, a
/// connection pool per node and the cache of prepared statements. It is
/// torn down by [`Session::shutdown`], or when dropped.
pub struct Session {
    cluster: Cluster,
    default_load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    default_retry_policy: Arc<dyn RetryPolicy>,
    default_consistency: Consistency,
    default_serial_consistency: Option<SerialConsistency>,
    request_timeout: Duration,
    schema_agreement_interval: Duration,
    schema_agreement_timeout: Duration,
    statement_cache: Arc<StatementCache>,
    keyspace_name: ArcSwapOption<String>,

    _invalidation_handle: RemoteHandle<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("cluster", &self.cluster)
            .field("default_load_balancing_policy", &self.default_load_balancing_policy)
            .field("default_retry_policy", &self.default_retry_policy)
            .field("default_consistency", &self.default_consistency)
            .field("request_timeout", &self.request_timeout)
            .field("keyspace_name", &self.keyspace_name)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Connects to the cluster described by `config`.
    ///
    /// Returns once the topology has been read through one of the contact
    /// points and, if `used_keyspace` is set, every pool has switched to it.
    /// Fails if no contact point can be reached.
    ///
    /// ```rust,no_run
    /// # async fn connect() -> Result<(), tessera::errors::NewSessionError> {
    /// use tessera::client::session::{Session, SessionConfig};
    ///
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("127.0.0.1:9042");
    /// let session = Session::connect(config).await?;
    /// # drop(session);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        config.validate()?;

        let (schema_change_sender, mut schema_change_receiver) = mpsc::unbounded_channel();
        let cluster = Cluster::new(config.cluster_config(), schema_change_sender).await?;

        let statement_cache = Arc::new(StatementCache::new());
        let (invalidation, invalidation_handle) = {
            let statement_cache = statement_cache.clone();
            async move {
                while let Some(schema_change) = schema_change_receiver.recv().await {
                    statement_cache.invalidate(&schema_change);
                }
            }
            .remote_handle()
        };
        tokio::spawn(invalidation);

        let session = Session {
            cluster,
            default_load_balancing_policy: config.default_load_balancing_policy(),
            default_retry_policy: config.retry_policy.clone(),
            default_consistency: config.default_consistency,
            default_serial_consistency: config.default_serial_consistency,
            request_timeout: config.request_timeout,
            schema_agreement_interval: config.schema_agreement_interval,
            schema_agreement_timeout: config.schema_agreement_timeout,
            statement_cache,
            keyspace_name: ArcSwapOption::empty(),
            _invalidation_handle: invalidation_handle,
        };

        if let Some(keyspace_name) = config.used_keyspace {
            session
                .use_keyspace(keyspace_name, config.keyspace_case_sensitive)
                .await?;
        }

        Ok(session)
    }

    /// Runs a statement as text and returns its whole result.
    ///
    /// Values are serialized with their natural CQL types. The statement is
    /// routed to a replica only if it carries a routing key; for typed values
    /// and automatic routing, use a [`PreparedStatement`].
    ///
    /// ```rust
    /// # use tessera::client::session::Session;
    /// # async fn insert(session: &Session) -> Result<(), tessera::errors::ExecutionError> {
    /// use tessera_cql::value::CqlValue;
    ///
    /// session
    ///     .query_unpaged(
    ///         "INSERT INTO shop.orders (id, item) VALUES (?, ?)",
    ///         [CqlValue::Int(17), CqlValue::Text("lamp".to_owned())],
    ///     )
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn query_unpaged(
        &self,
        statement: impl Into<Statement>,
        values: impl Into<BoundValues>,
    ) -> Result<QueryResult, ExecutionError> {
        let statement: Statement = statement.into();
        self.check_not_shut_down()?;

        let values = SerializedValues::from_untyped(&values.into()).map_err(BadQuery::from)?;
        let current_keyspace = self.keyspace_name.load_full();
        let routing_info = RoutingInfo {
            consistency: statement.config.determine_consistency(self.default_consistency),
            serial_consistency: statement
                .config
                .determine_serial_consistency(self.default_serial_consistency),
            token: statement.calculate_token(),
            keyspace: statement
                .get_keyspace()
                .or(current_keyspace.as_deref().map(String::as_str)),
        };

        let result = self
            .run(
                RequestKind::Query(&statement.contents),
                &values,
                &routing_info,
                &statement.config,
            )
            .await?;

        // `USE` sent as a plain statement switches only the connection it
        // went through; switch all of them.
        if let Some(keyspace) = result.set_keyspace() {
            let keyspace_name = VerifiedKeyspaceName::new(keyspace, true).map_err(BadQuery::from)?;
            self.switch_keyspace(keyspace_name).await?;
        }

        Ok(result)
    }

    /// Has every `Up` node parse the statement, for later runs by id.
    ///
    /// The statement is prepared on all `Up` nodes. Preparing the same text
    /// again returns the cached statement without contacting any node, and
    /// concurrent callers preparing the same text share one round trip per node.
    ///
    /// ```rust
    /// # use tessera::client::session::Session;
    /// # async fn restock(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    /// use tessera_cql::value::CqlValue;
    ///
    /// let update = session
    ///     .prepare("UPDATE shop.stock SET count = ? WHERE item = ?")
    ///     .await?;
    /// for item in ["lamp", "desk"] {
    ///     let values = [CqlValue::Int(10), CqlValue::Text(item.to_owned())];
    ///     session.execute_unpaged(&update, values).await?;
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn prepare(&self, statement: impl Into<Statement>) -> Result<PreparedStatement, PrepareError> {
        let statement: Statement = statement.into();
        if self.cluster.is_shut_down() {
            return Err(PrepareError::SessionShutDown);
        }

        let cluster_state = self.cluster.get_state();
        let shared = self
            .statement_cache
            .get_or_prepare(&statement.contents, &cluster_state)
            .await?;

        Ok(PreparedStatement::new(shared, statement.config))
    }

    /// Runs a prepared statement and returns its whole result.
    ///
    /// The token of the partition key is computed from the values, so the
    /// request goes to a replica first. If a node no longer knows the
    /// statement, it is prepared there again and the request is resent.
    pub async fn execute_unpaged(
        &self,
        prepared: &PreparedStatement,
        values: impl Into<BoundValues>,
    ) -> Result<QueryResult, ExecutionError> {
        self.check_not_shut_down()?;

        let values = prepared.serialize_values(&values.into())?;
        let routing_info = RoutingInfo {
            consistency: prepared.config.determine_consistency(self.default_consistency),
            serial_consistency: prepared
                .config
                .determine_serial_consistency(self.default_serial_consistency),
            token: prepared.calculate_token(&values)?,
            keyspace: prepared.get_keyspace_name(),
        };

        self.run(
            RequestKind::Execute(&prepared.shared),
            &values,
            &routing_info,
            &prepared.config,
        )
        .await
    }

    async fn run(
        &self,
        request: RequestKind<'_>,
        values: &SerializedValues,
        routing_info: &RoutingInfo<'_>,
        config: &StatementConfig,
    ) -> Result<QueryResult, ExecutionError> {
        let cluster_state = self.cluster.get_state();
        let context = ExecuteRequestContext {
            routing_info,
            is_idempotent: config.is_idempotent,
            request_timeout: config.request_timeout.unwrap_or(self.request_timeout),
            load_balancing_policy: config
                .load_balancing_policy
                .as_deref()
                .unwrap_or(&*self.default_load_balancing_policy),
            retry_policy: config
                .retry_policy
                .as_deref()
                .unwrap_or(&*self.default_retry_policy),
        };

        let RunRequestResult {
            mut response,
            coordinator,
        } = match run_request(&cluster_state, request, values, context).await {
            Ok(result) => result,
            // Connections closed by a shutdown fail their requests with
            // transport errors; report the shutdown itself.
            Err(_) if self.cluster.is_shut_down() => return Err(ExecutionError::SessionShutDown),
            Err(err) => return Err(err),
        };

        let tracing_id = response.tracing_id;
        let warnings = std::mem::take(&mut response.warnings);
        let result = response.into_result()?;
        Ok(QueryResult::new(coordinator, result, tracing_id, warnings))
    }

    /// Makes `keyspace_name` the default keyspace of every connection, so
    /// statements can name tables without qualifying them.
    ///
    /// Names are 1 to 48 characters of letters, digits and underscores.
    /// With `case_sensitive` the name is quoted; otherwise the server
    /// lowercases it. The prepared statement cache is emptied on success.
    ///
    /// `USE` goes out on every connection, so a failed switch may still have
    /// moved some of them. Concurrent switches to different keyspaces can
    /// leave connections disagreeing.
    ///
    /// ```rust
    /// # use tessera::client::session::Session;
    /// # async fn example(session: &Session) -> Result<(), Box<dyn std::error::Error>> {
    /// session.use_keyspace("shop", false).await?;
    /// session.query_unpaged("SELECT item FROM orders", ()).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        if self.cluster.is_shut_down() {
            return Err(UseKeyspaceError::SessionShutDown);
        }
        let keyspace_name = VerifiedKeyspaceName::new(&keyspace_name.into(), case_sensitive)?;
        self.switch_keyspace(keyspace_name).await
    }

    async fn switch_keyspace(&self, keyspace_name: VerifiedKeyspaceName) -> Result<(), UseKeyspaceError> {
        let name = keyspace_name.as_str().to_owned();
        self.cluster.use_keyspace(keyspace_name).await?;
        debug!("Switched to keyspace {}", name);
        self.keyspace_name.store(Some(Arc::new(name)));
        // Unqualified table names now resolve differently.
        self.statement_cache.clear();
        Ok(())
    }

    /// Current default keyspace.
    pub fn get_keyspace(&self) -> Option<Arc<String>> {
        self.keyspace_name.load_full()
    }

    /// Waits until all `Up` nodes report the same schema version, polling
    /// every `schema_agreement_interval`.
    ///
    /// Fails with [`SchemaAgreementError::Timeout`] after `schema_agreement_timeout`.
    pub async fn await_schema_agreement(&self) -> Result<Uuid, SchemaAgreementError> {
        self.cluster
            .await_schema_agreement(self.schema_agreement_timeout, self.schema_agreement_interval)
            .await
    }

    /// Checks once whether all `Up` nodes report the same schema version,
    /// returning the version if they do.
    pub async fn check_schema_agreement(&self) -> Result<Option<Uuid>, SchemaAgreementError> {
        self.cluster.check_schema_agreement().await
    }

    /// Reads the topology again right now instead of waiting for an event
    /// or the periodic refresh.
    pub async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        self.cluster.refresh_metadata().await
    }

    /// Snapshot of the topology. It is never updated in place: a change
    /// publishes a new snapshot.
    pub fn get_cluster_state(&self) -> Arc<ClusterState> {
        self.cluster.get_state()
    }

    /// Closes all connections and stops the background worker.
    ///
    /// Requests in flight fail, and every later operation fails immediately
    /// with a "session shut down" error. Calling it more than once is harmless.
    pub async fn shutdown(&self) {
        self.cluster.shutdown().await;
    }

    /// Whether [`Session::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.cluster.is_shut_down()
    }

    fn check_not_shut_down(&self) -> Result<(), ExecutionError> {
        if self.cluster.is_shut_down() {
            return Err(ExecutionError::SessionShutDown);
        }
        Ok(())
    }
}
