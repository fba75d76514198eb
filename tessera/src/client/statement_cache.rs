//! Session-wide cache of prepared statements, keyed by statement text.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tessera_cql::frame::response::event::{SchemaChangeEvent, SchemaChangeTarget};
use tessera_cql::frame::response::result;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::cluster::{ClusterState, Node};
use crate::errors::{AggregateExecutionError, PrepareError, RequestAttemptError};
use crate::statement::prepared::PreparedStatementSharedData;

type CacheEntry = Arc<OnceCell<Arc<PreparedStatementSharedData>>>;

/// Prepared statements of a session.
///
/// The first caller for a text prepares it on every `Up` host; callers
/// arriving meanwhile wait for that preparation instead of starting their own.
#[derive(Debug, Default)]
pub(crate) struct StatementCache {
    entries: DashMap<String, CacheEntry>,
}

impl StatementCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn get_or_prepare(
        &self,
        statement: &str,
        cluster: &ClusterState,
    ) -> Result<Arc<PreparedStatementSharedData>, PrepareError> {
        let entry = self.entries.entry(statement.to_owned()).or_default().clone();
        entry
            .get_or_try_init(|| prepare_on_all_hosts(statement, cluster))
            .await
            .cloned()
    }

    /// Drops statements which refer to the changed keyspace or table.
    /// They are prepared again on next use.
    pub(crate) fn invalidate(&self, event: &SchemaChangeEvent) {
        let table = match &event.target {
            SchemaChangeTarget::Keyspace => None,
            SchemaChangeTarget::Table { name } => Some(name.as_str()),
            // Types and functions do not change bind marker metadata
            // of statements which are already prepared.
            _ => return,
        };

        let before = self.entries.len();
        self.entries.retain(|_, entry| match entry.get() {
            Some(shared) => !shared.references(&event.keyspace, table),
            // Still being prepared; keep it.
            None => true,
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(
                keyspace = event.keyspace,
                table,
                removed,
                "Invalidated prepared statements after a schema change"
            );
        }
    }

    pub(crate) fn clear(&self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

async fn prepare_on(node: &Node, statement: &str) -> Result<result::Prepared, RequestAttemptError> {
    let connection = node.connection().await?;
    connection.prepare(statement).await
}

async fn prepare_on_all_hosts(
    statement: &str,
    cluster: &ClusterState,
) -> Result<Arc<PreparedStatementSharedData>, PrepareError> {
    let nodes: Vec<&Arc<Node>> = cluster
        .get_nodes_info()
        .iter()
        .filter(|node| node.is_up())
        .collect();
    if nodes.is_empty() {
        return Err(PrepareError::NoHostAvailable);
    }

    let results = join_all(nodes.iter().map(|node| async move {
        (node.address, prepare_on(node, statement).await)
    }))
    .await;

    let mut shared: Option<Arc<PreparedStatementSharedData>> = None;
    let mut failures: Vec<(SocketAddr, RequestAttemptError)> = Vec::new();
    for (address, result) in results {
        let prepared = match result {
            Ok(prepared) => prepared,
            Err(err) => {
                debug!("Failed to prepare statement on {}: {}", address, err);
                failures.push((address, err));
                continue;
            }
        };

        match &shared {
            Some(shared) => {
                if &prepared.prepared_metadata != shared.metadata() {
                    return Err(PrepareError::MetadataMismatch);
                }
                shared.record_host(address, prepared.id);
            }
            None => {
                let id = prepared.id.clone();
                let first = Arc::new(PreparedStatementSharedData::new(statement.to_owned(), prepared));
                first.record_host(address, id);
                shared = Some(first);
            }
        }
    }

    match shared {
        Some(shared) => {
            debug!(
                statement,
                prepared_on = nodes.len() - failures.len(),
                failed_on = failures.len(),
                "Prepared statement"
            );
            Ok(shared)
        }
        None => Err(PrepareError::AllAttemptsFailed(AggregateExecutionError {
            attempts: failures,
        })),
    }
}
