//! Fluent construction of a [`Session`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::session::{Session, SessionConfig};
use super::Compression;
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::errors::NewSessionError;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;
use tessera_cql::{Consistency, SerialConsistency};

/// Collects a [`SessionConfig`] step by step and connects with it.
///
/// Every setter consumes and returns the builder. Settings left alone keep
/// the defaults documented on [`SessionConfig`].
///
/// ```
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use tessera::client::Compression;
/// # use tessera::policies::retry::FallthroughRetryPolicy;
/// # use tessera::SessionBuilder;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session = SessionBuilder::new()
///     .known_nodes(["10.0.0.1:9042", "db2.example.com"])
///     .local_datacenter("eu-west")
///     .user("app", "secret")
///     .compression(Some(Compression::Lz4))
///     .retry_policy(Arc::new(FallthroughRetryPolicy::new()))
///     .request_timeout(Duration::from_secs(3))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionBuilder {
    /// What [`SessionBuilder::build`] connects with.
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// A builder holding the default configuration and no known nodes.
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a contact point given as `host` or `host:port`, resolved at
    /// connect time. The port defaults to 9042.
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Adds a contact point given as an address.
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// Adds several contact points, as [`SessionBuilder::known_node`] does.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.config.add_known_nodes(hostnames);
        self
    }

    /// Answers `PasswordAuthenticator` challenges with these credentials.
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(username, passwd)));
        self
    }

    /// Answers authentication challenges with sessions from `authenticator_provider`.
    pub fn authenticator_provider(mut self, authenticator_provider: Arc<dyn AuthenticatorProvider>) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Datacenter whose nodes the default load balancing tries first.
    pub fn local_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.config.local_datacenter = Some(datacenter.into());
        self
    }

    /// Load balancing for statements without their own.
    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing_policy = Some(policy);
        self
    }

    /// Retry policy for statements without their own.
    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Consistency for statements without their own.
    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    /// Serial consistency for statements without their own.
    pub fn default_serial_consistency(mut self, serial_consistency: Option<SerialConsistency>) -> Self {
        self.config.default_serial_consistency = serial_consistency;
        self
    }

    /// Time one attempt may wait for its response.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Time a new connection may take, handshake included. The operating
    /// system may give up on the TCP connect sooner.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Connections kept open per node, and how far a saturated pool may grow.
    pub fn pool_size(mut self, min_connections: usize, max_connections: usize) -> Self {
        self.config.pool_min_connections = min_connections;
        self.config.pool_max_connections = max_connections;
        self
    }

    /// Requests one connection may have in flight, at most 32768.
    pub fn max_streams_per_connection(mut self, max_streams: usize) -> Self {
        self.config.max_streams_per_connection = max_streams;
        self
    }

    /// Sends `OPTIONS` on connections idle for this long; a connection
    /// that does not answer in time is closed.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.connection_keepalive_interval = Some(interval);
        self
    }

    /// `TCP_NODELAY` on every socket.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// Enables TCP keepalive probes after this much idle time.
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Body compression to ask for. Nodes that do not offer it get
    /// uncompressed frames.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Period of topology refreshes that happen without any server event.
    pub fn cluster_metadata_refresh_interval(mut self, interval: Duration) -> Self {
        self.config.cluster_metadata_refresh_interval = interval;
        self
    }

    /// How long a node reported down stays suspended before it is probed.
    pub fn down_host_grace_period(mut self, period: Duration) -> Self {
        self.config.down_host_grace_period = period;
        self
    }

    /// First and largest delay between attempts to refill a pool.
    pub fn reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.reconnect_base_delay = base;
        self.config.reconnect_max_delay = max;
        self
    }

    /// Whether replication strategies are read from `system_schema`.
    /// Without them token aware routing only knows primary owners.
    pub fn fetch_schema_metadata(mut self, fetch: bool) -> Self {
        self.config.fetch_schema_metadata = fetch;
        self
    }

    /// Keyspace every connection switches to before serving requests.
    /// [`Session::use_keyspace`] changes it later.
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Deadline of [`Session::await_schema_agreement`].
    pub fn schema_agreement_timeout(mut self, timeout: Duration) -> Self {
        self.config.schema_agreement_timeout = timeout;
        self
    }

    /// Polling period of [`Session::await_schema_agreement`].
    pub fn schema_agreement_interval(mut self, interval: Duration) -> Self {
        self.config.schema_agreement_interval = interval;
        self
    }

    /// Validates the configuration and connects. See [`Session::connect`].
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tessera_cql::{Consistency, SerialConsistency};

    use super::{Compression, SessionBuilder};
    use crate::cluster::KnownNode;
    use crate::errors::NewSessionError;
    use crate::utils::test_utils::{setup_tracing, MockNode};

    #[test]
    fn default_session_builder() {
        setup_tracing();
        let builder = SessionBuilder::new();

        assert!(builder.config.known_nodes.is_empty());
        assert_eq!(builder.config.compression, None);
        assert_eq!(builder.config.default_consistency, Consistency::LocalQuorum);
        assert_eq!(builder.config.pool_min_connections, 1);
        assert_eq!(builder.config.max_streams_per_connection, 128);
    }

    #[test]
    fn add_known_nodes() {
        setup_tracing();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 17, 0, 3)), 1357);
        let builder = SessionBuilder::new()
            .known_node("test_hostname")
            .known_nodes(["test_hostname1", "test_hostname2"])
            .known_node_addr(addr);

        assert_eq!(
            builder.config.known_nodes,
            vec![
                KnownNode::Hostname("test_hostname".into()),
                KnownNode::Hostname("test_hostname1".into()),
                KnownNode::Hostname("test_hostname2".into()),
                KnownNode::Address(addr),
            ]
        );
    }

    #[test]
    fn all_builder_methods() {
        setup_tracing();
        let builder = SessionBuilder::new()
            .compression(Some(Compression::Snappy))
            .tcp_nodelay(false)
            .tcp_keepalive_interval(Duration::from_secs(42))
            .keepalive_interval(Duration::from_secs(7))
            .default_consistency(Consistency::Two)
            .default_serial_consistency(Some(SerialConsistency::Serial))
            .request_timeout(Duration::from_secs(3))
            .connection_timeout(Duration::from_secs(10))
            .pool_size(2, 8)
            .max_streams_per_connection(1024)
            .local_datacenter("dc2")
            .use_keyspace("ks", true)
            .fetch_schema_metadata(false)
            .down_host_grace_period(Duration::from_secs(1))
            .reconnect_delays(Duration::from_millis(10), Duration::from_secs(1))
            .schema_agreement_interval(Duration::from_millis(50))
            .schema_agreement_timeout(Duration::from_secs(5));

        let config = &builder.config;
        assert_eq!(config.compression, Some(Compression::Snappy));
        assert!(!config.tcp_nodelay);
        assert_eq!(config.tcp_keepalive_interval, Some(Duration::from_secs(42)));
        assert_eq!(config.connection_keepalive_interval, Some(Duration::from_secs(7)));
        assert_eq!(config.default_consistency, Consistency::Two);
        assert_eq!(config.default_serial_consistency, Some(SerialConsistency::Serial));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!((config.pool_min_connections, config.pool_max_connections), (2, 8));
        assert_eq!(config.max_streams_per_connection, 1024);
        assert_eq!(config.local_datacenter.as_deref(), Some("dc2"));
        assert_eq!(config.used_keyspace.as_deref(), Some("ks"));
        assert!(config.keyspace_case_sensitive);
        assert!(!config.fetch_schema_metadata);
        assert_eq!(config.down_host_grace_period, Duration::from_secs(1));
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(10));
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(1));
        assert_eq!(config.schema_agreement_interval, Duration::from_millis(50));
        assert_eq!(config.schema_agreement_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    #[ntest::timeout(5000)]
    async fn invalid_configurations_are_rejected() {
        setup_tracing();
        assert_matches!(
            SessionBuilder::new().build().await,
            Err(NewSessionError::EmptyKnownNodesList)
        );

        let node = MockNode::start().await;
        for builder in [
            SessionBuilder::new().pool_size(0, 1),
            SessionBuilder::new().max_streams_per_connection(0),
            SessionBuilder::new().max_streams_per_connection(40000),
        ] {
            assert_matches!(
                builder.known_node_addr(node.address()).build().await,
                Err(NewSessionError::InvalidConfig(_))
            );
        }
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn keyspace_is_used_from_the_start() {
        setup_tracing();
        let node = MockNode::start().await;
        let session = SessionBuilder::new()
            .known_node_addr(node.address())
            .use_keyspace("ks", false)
            .build()
            .await
            .unwrap();

        assert_eq!(session.get_keyspace().as_deref().map(String::as_str), Some("ks"));
    }
}
