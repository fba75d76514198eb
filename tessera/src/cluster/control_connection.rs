//! Specially treated single connection used to fetch metadata
//! and receive events from the cluster.

use std::net::SocketAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::cluster::metadata::{self, Metadata};
use crate::errors::{BrokenConnectionError, MetadataError};
use crate::network::Connection;

/// The single connection used to fetch metadata and receive events from the cluster.
pub(crate) struct ControlConnection {
    conn: Arc<Connection>,
}

impl ControlConnection {
    pub(super) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.conn.get_connect_address()
    }

    pub(super) fn close(&self, reason: BrokenConnectionError) {
        self.conn.close(reason);
    }

    pub(super) async fn query_metadata(&self, fetch_schema: bool) -> Result<Metadata, MetadataError> {
        metadata::fetch_metadata(&self.conn, fetch_schema).await
    }

    /// Schema version reported for every node visible from the control connection.
    pub(crate) async fn query_schema_versions(&self) -> Result<Vec<(SocketAddr, Option<Uuid>)>, MetadataError> {
        Ok(metadata::fetch_peers(&self.conn)
            .await?
            .into_iter()
            .map(|peer| (peer.address, peer.schema_version))
            .collect())
    }
}

impl std::fmt::Debug for ControlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlConnection")
            .field("address", &self.get_connect_address())
            .finish()
    }
}
