use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use rand::rng;
use rand::seq::{IndexedRandom, SliceRandom};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::cluster::control_connection::ControlConnection;
use crate::cluster::metadata::Metadata;
use crate::cluster::node::{resolve_contact_points, KnownNode};
use crate::errors::{BrokenConnectionError, ConnectionError, MetadataError, NewSessionError};
use crate::network::{open_connection, ConnectionConfig, ErrorReceiver};
use tessera_cql::frame::response::event::Event;

pub(crate) struct WorkingControlConnection {
    connection: Arc<ControlConnection>,
    error_channel: ErrorReceiver,
}

pub(crate) enum ControlConnectionState {
    Working(WorkingControlConnection),
    Broken { last_error: ConnectionError },
}

/// Owns the control connection and reads metadata through it, moving the
/// control connection to another node whenever reading fails.
pub(crate) struct MetadataReader {
    control_connection_config: ConnectionConfig,
    hostname_resolution_timeout: Duration,

    control_connection_address: SocketAddr,
    control_connection_state: ControlConnectionState,
    // Published for schema agreement checks.
    shared_control_connection: Arc<ArcSwapOption<ControlConnection>>,

    known_peers: Vec<SocketAddr>,
    fetch_schema: bool,

    initial_known_nodes: Vec<KnownNode>,
}

impl MetadataReader {
    pub(crate) async fn new(
        initial_known_nodes: Vec<KnownNode>,
        hostname_resolution_timeout: Duration,
        mut connection_config: ConnectionConfig,
        server_event_sender: mpsc::Sender<Event>,
        fetch_schema: bool,
        shared_control_connection: Arc<ArcSwapOption<ControlConnection>>,
    ) -> Result<Self, NewSessionError> {
        let (initial_peers, resolved_hostnames) =
            resolve_contact_points(&initial_known_nodes, hostname_resolution_timeout).await;
        let Some(&control_connection_address) = initial_peers.choose(&mut rng()) else {
            return Err(NewSessionError::FailedToResolveAnyHostname(resolved_hostnames));
        };

        connection_config.event_sender = Some(server_event_sender);

        let mut reader = MetadataReader {
            control_connection_config: connection_config,
            hostname_resolution_timeout,
            control_connection_address,
            control_connection_state: ControlConnectionState::Broken {
                last_error: ConnectionError::BrokenConnection(BrokenConnectionError::ChannelError),
            },
            shared_control_connection,
            known_peers: initial_peers,
            fetch_schema,
            initial_known_nodes,
        };
        reader.reconnect().await;
        Ok(reader)
    }

    /// Fetches current metadata from the cluster.
    ///
    /// On failure, the control connection is moved to each known peer in
    /// random order, and then to each contact point, until a read succeeds.
    /// An initial read which fails on the first node falls back to metadata
    /// made of the contact points only.
    pub(crate) async fn read_metadata(&mut self, initial: bool) -> Result<Metadata, MetadataError> {
        let prev_err = match self.fetch_metadata(initial).await {
            Ok(metadata) => {
                debug!("Fetched new metadata");
                self.update_known_peers(&metadata);
                return Ok(metadata);
            }
            Err(err) => err,
        };

        // The current control connection failed. Try the other peers in random order.
        self.known_peers.shuffle(&mut rng());
        debug!("Known peers: {:?}", self.known_peers);

        let failed_address = self.control_connection_address;
        let other_peers: Vec<SocketAddr> = self
            .known_peers
            .iter()
            .copied()
            .filter(|peer| *peer != failed_address)
            .collect();

        let mut result = self.retry_fetch_metadata_on_nodes(initial, other_peers, prev_err).await;

        if let Err(prev_err) = result {
            warn!(
                "Failed to establish control connection and fetch metadata on all known peers. \
                Falling back to initial contact points."
            );
            let (initial_peers, _hostnames) =
                resolve_contact_points(&self.initial_known_nodes, self.hostname_resolution_timeout).await;
            result = self.retry_fetch_metadata_on_nodes(initial, initial_peers, prev_err).await;
        }

        match &result {
            Ok(metadata) => {
                self.update_known_peers(metadata);
                debug!("Fetched new metadata");
            }
            Err(error) => error!(
                error = %error,
                target = %self.control_connection_address,
                "Could not fetch metadata"
            ),
        }

        result
    }

    async fn retry_fetch_metadata_on_nodes(
        &mut self,
        initial: bool,
        nodes: Vec<SocketAddr>,
        prev_err: MetadataError,
    ) -> Result<Metadata, MetadataError> {
        let mut result = Err(prev_err);
        for peer in nodes {
            let err = match result {
                Ok(_) => break,
                Err(err) => err,
            };

            warn!(
                control_connection_address = %self.control_connection_address,
                error = %err,
                "Failed to fetch metadata using current control connection"
            );

            self.control_connection_address = peer;
            debug!(
                "Retrying to establish the control connection on {}",
                self.control_connection_address
            );
            self.reconnect().await;

            result = self.fetch_metadata(initial).await;
        }
        result
    }

    async fn fetch_metadata(&self, initial: bool) -> Result<Metadata, MetadataError> {
        let conn = match &self.control_connection_state {
            ControlConnectionState::Working(working) => &working.connection,
            ControlConnectionState::Broken { last_error } => {
                return Err(MetadataError::NoControlConnection(last_error.clone()));
            }
        };

        let res = conn.query_metadata(self.fetch_schema).await;

        if initial {
            if let Err(err) = res {
                warn!(
                    error = %err,
                    "Initial metadata read failed, proceeding with metadata \
                    consisting only of the initial peer list and no tokens. \
                    Token aware routing is disabled until the next refresh."
                );
                return Ok(Metadata::new_dummy(&self.known_peers));
            }
        }

        res
    }

    async fn reconnect(&mut self) {
        self.control_connection_state =
            match open_connection(self.control_connection_address, None, &self.control_connection_config).await {
                Ok((conn, error_channel)) => {
                    debug!("Control connection established to {}", self.control_connection_address);
                    let connection = Arc::new(ControlConnection::new(Arc::new(conn)));
                    self.shared_control_connection.store(Some(connection.clone()));
                    ControlConnectionState::Working(WorkingControlConnection {
                        connection,
                        error_channel,
                    })
                }
                Err(e) => {
                    debug!(
                        "Failed to open control connection to {}: {}",
                        self.control_connection_address, e
                    );
                    self.shared_control_connection.store(None);
                    ControlConnectionState::Broken { last_error: e }
                }
            };
    }

    fn update_known_peers(&mut self, metadata: &Metadata) {
        if !metadata.peers.is_empty() {
            self.known_peers = metadata.peers.iter().map(|peer| peer.address).collect();
        }
    }

    /// Restricts failover candidates to the given nodes. Used to skip nodes
    /// which are known to be down.
    pub(crate) fn set_known_peers(&mut self, peers: Vec<SocketAddr>) {
        if !peers.is_empty() {
            self.known_peers = peers;
        }
    }

    pub(crate) fn is_working(&self) -> bool {
        matches!(self.control_connection_state, ControlConnectionState::Working(_))
    }

    pub(crate) fn control_connection_address(&self) -> SocketAddr {
        self.control_connection_address
    }

    /// Resolves once the control connection breaks. Never resolves while it
    /// is already broken. Cancel safe.
    pub(crate) async fn wait_for_control_connection_error(&mut self) -> BrokenConnectionError {
        match &mut self.control_connection_state {
            ControlConnectionState::Working(working) => (&mut working.error_channel)
                .await
                .unwrap_or(BrokenConnectionError::ChannelError),
            ControlConnectionState::Broken { .. } => futures::future::pending().await,
        }
    }

    pub(crate) fn mark_broken(&mut self, error: BrokenConnectionError) {
        self.shared_control_connection.store(None);
        self.control_connection_state = ControlConnectionState::Broken {
            last_error: ConnectionError::BrokenConnection(error),
        };
    }

    pub(crate) fn close(&mut self) {
        if let ControlConnectionState::Working(working) = &self.control_connection_state {
            working.connection.close(BrokenConnectionError::SessionShutDown);
        }
        self.mark_broken(BrokenConnectionError::SessionShutDown);
    }
}

#[cfg(test)]
mod tests {
    use tessera_cql::frame::request::RequestOpcode;

    use super::*;
    use crate::errors::DbError;
    use crate::utils::test_utils::{mock_cluster, setup_tracing, NodeInfo, Reaction, Rule};

    async fn reader(contact_points: Vec<SocketAddr>) -> (MetadataReader, mpsc::Receiver<Event>) {
        let (event_sender, event_receiver) = mpsc::channel(32);
        let reader = MetadataReader::new(
            contact_points.into_iter().map(KnownNode::Address).collect(),
            Duration::from_secs(1),
            ConnectionConfig::default(),
            event_sender,
            true,
            Arc::new(ArcSwapOption::empty()),
        )
        .await
        .unwrap();
        (reader, event_receiver)
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn control_connection_fails_over_to_another_node() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0]), NodeInfo::new("dc1", &[100])]).await;
        let (mut reader, _events) = reader(vec![nodes[0].address()]).await;

        let metadata = reader.read_metadata(true).await.unwrap();
        assert_eq!(metadata.peers.len(), 2);
        assert_eq!(reader.control_connection_address(), nodes[0].address());

        nodes[0].stop();
        let error = reader.wait_for_control_connection_error().await;
        reader.mark_broken(error);
        assert!(!reader.is_working());

        let metadata = reader.read_metadata(false).await.unwrap();
        assert_eq!(metadata.peers.len(), 2);
        assert_eq!(reader.control_connection_address(), nodes[1].address());
        assert!(reader.is_working());
        assert!(reader.shared_control_connection.load().is_some());
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn failed_initial_read_yields_contact_points_only() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0])]).await;
        nodes[0].add_rule(
            Rule::on(RequestOpcode::Query)
                .containing("system.peers")
                .then(Reaction::Error(DbError::Overloaded, "busy".to_owned())),
        );
        let (mut reader, _events) = reader(vec![nodes[0].address()]).await;

        let metadata = reader.read_metadata(true).await.unwrap();
        assert_eq!(metadata.peers.len(), 1);
        assert_eq!(metadata.peers[0].address, nodes[0].address());
        assert!(metadata.peers[0].tokens.is_empty());

        // Later refreshes report the error instead.
        assert!(matches!(
            reader.read_metadata(false).await,
            Err(MetadataError::Query { table: "system.peers", .. })
        ));
    }

    #[tokio::test]
    #[ntest::timeout(10000)]
    async fn unreachable_contact_point_leaves_control_connection_broken() {
        setup_tracing();
        let nodes = mock_cluster(&[NodeInfo::new("dc1", &[0])]).await;
        let address = nodes[0].address();
        nodes[0].stop();

        let (mut reader, _events) = reader(vec![address]).await;
        assert!(!reader.is_working());
        assert!(matches!(
            reader.read_metadata(true).await,
            Err(MetadataError::NoControlConnection(_))
        ));
    }
}
