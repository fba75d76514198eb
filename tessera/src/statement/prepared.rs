//! Defines the [`PreparedStatement`] type, which represents a statement
//! that has been prepared in advance on the server.

use bytes::Bytes;
use dashmap::DashMap;
use smallvec::{smallvec, SmallVec};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::{impl_statement_options, StatementConfig};
use crate::errors::{BadQuery, RequestAttemptError};
use crate::network::Connection;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;
use crate::routing::partitioner::{compose_routing_key, murmur3_token};
use crate::routing::Token;
use tessera_cql::frame::response::result::{
    self, ColumnSpec, PartitionKeyIndex, PreparedMetadata, ResultMetadata,
};
use tessera_cql::value::{BoundValues, SerializedValues};
use tessera_cql::{Consistency, SerialConsistency};

/// A statement the hosts have parsed ahead of time.
///
/// Obtained from [`Session::prepare`](crate::client::session::Session::prepare).
/// Executions send only the statement id and the values, which are
/// serialized with the bind marker types the server reported. Those
/// markers also say which values form the partition key, so every
/// execution has a token and goes to a replica first.
///
/// Clones share the server-side part behind an [`Arc`] and differ only in
/// their overrides. Preparing the same text twice yields clones of the
/// same statement.
///
/// A host that forgot the statement, e.g. after a restart, answers with
/// `Unprepared`. The statement is then prepared on that host again and
/// the request is resent once.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub(crate) config: StatementConfig,
    pub(crate) shared: Arc<PreparedStatementSharedData>,
}

/// Part of a prepared statement shared by all its clones and by the
/// session's statement cache.
#[derive(Debug)]
pub(crate) struct PreparedStatementSharedData {
    statement: String,
    id: Bytes,
    metadata: PreparedMetadata,
    result_metadata: ResultMetadata,
    // Id under which each host knows the statement. An empty cell means
    // the host is being prepared on (or has not been yet).
    host_ids: DashMap<SocketAddr, Arc<OnceCell<Bytes>>>,
}

impl PreparedStatementSharedData {
    /// Builds the shared data from the first successful `PREPARE` response.
    pub(crate) fn new(statement: String, prepared: result::Prepared) -> Self {
        Self {
            statement,
            id: prepared.id,
            metadata: prepared.prepared_metadata,
            result_metadata: prepared.result_metadata,
            host_ids: DashMap::new(),
        }
    }

    pub(crate) fn statement(&self) -> &str {
        &self.statement
    }

    pub(crate) fn metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    /// Records that `address` knows the statement under `id`.
    pub(crate) fn record_host(&self, address: SocketAddr, id: Bytes) {
        self.host_ids
            .insert(address, Arc::new(OnceCell::new_with(Some(id))));
    }

    pub(crate) fn host_id(&self, address: SocketAddr) -> Option<Bytes> {
        self.host_ids
            .get(&address)
            .and_then(|cell| cell.get().cloned())
    }

    /// Returns the id under which the host behind `connection` knows the
    /// statement, preparing it there first if needed.
    ///
    /// Concurrent callers for the same host share a single `PREPARE`.
    pub(crate) async fn id_for_host(
        &self,
        address: SocketAddr,
        connection: &Connection,
    ) -> Result<Bytes, RequestAttemptError> {
        // The map guard must not be held across the await below.
        let cell = self.host_ids.entry(address).or_default().clone();
        cell.get_or_try_init(|| async {
            let prepared = connection.prepare(&self.statement).await?;
            if prepared.prepared_metadata != self.metadata {
                return Err(RequestAttemptError::PreparedMetadataMismatch);
            }
            Ok(prepared.id)
        })
        .await
        .cloned()
    }

    /// Forgets the id of a host which reported it as unknown, unless
    /// another task has already replaced it.
    pub(crate) fn forget_host_id(&self, address: SocketAddr, stale_id: &Bytes) {
        self.host_ids
            .remove_if(&address, |_, cell| cell.get() == Some(stale_id));
    }

    /// Whether the statement binds or returns columns of the given
    /// keyspace (and table, if given).
    pub(crate) fn references(&self, keyspace: &str, table: Option<&str>) -> bool {
        self.metadata
            .col_specs
            .iter()
            .chain(self.result_metadata.col_specs.iter())
            .any(|spec| {
                spec.table_spec.ks_name == keyspace
                    && table.map_or(true, |table| spec.table_spec.table_name == table)
            })
    }
}

impl_statement_options!(PreparedStatement);

impl PreparedStatement {
    pub(crate) fn new(shared: Arc<PreparedStatementSharedData>, config: StatementConfig) -> Self {
        Self { config, shared }
    }

    /// Id the statement was first prepared under.
    pub fn get_id(&self) -> &Bytes {
        &self.shared.id
    }

    /// The statement text.
    pub fn get_statement(&self) -> &str {
        &self.shared.statement
    }

    /// Whether any bind marker belongs to the partition key. Without one
    /// there is no token and replicas cannot be preferred.
    pub fn is_token_aware(&self) -> bool {
        !self.get_variable_pk_indexes().is_empty()
    }

    /// Computes the routing key of the statement with the given values.
    ///
    /// Returns `None` when the statement has no partition key bind markers.
    /// A missing or null partition key component is an error.
    pub fn compute_routing_key(&self, bound_values: &SerializedValues) -> Result<Option<Bytes>, BadQuery> {
        let pk_indexes = self.get_variable_pk_indexes();
        if pk_indexes.is_empty() {
            return Ok(None);
        }

        // pk_indexes are sorted by bind marker index, so a single pass over the
        // values suffices. `sequence` puts each component at its position
        // within the partition key.
        let mut pk_values: SmallVec<[Option<(usize, &[u8])>; 8]> = smallvec![None; pk_indexes.len()];
        let mut values_iter = bound_values.iter();
        let mut values_iter_offset = 0;
        for pk_index in pk_indexes.iter().copied() {
            let index = pk_index.index as usize;
            let value = values_iter
                .nth(index - values_iter_offset)
                .flatten()
                .ok_or(BadQuery::PartitionKeyMissing(index))?;
            if let Some(slot) = pk_values.get_mut(pk_index.sequence as usize) {
                *slot = Some((index, value));
            }
            values_iter_offset = index + 1;
        }

        let components = pk_values.into_iter().flatten().collect::<SmallVec<[_; 8]>>();
        compose_routing_key(components.into_iter()).map(Some)
    }

    /// [`compute_routing_key`](Self::compute_routing_key) hashed with Murmur3.
    pub fn calculate_token(&self, bound_values: &SerializedValues) -> Result<Option<Token>, BadQuery> {
        Ok(self
            .compute_routing_key(bound_values)?
            .map(|routing_key| murmur3_token(&routing_key)))
    }

    /// Keyspace of the first column the statement binds or returns.
    pub fn get_keyspace_name(&self) -> Option<&str> {
        self.first_col_spec().map(|spec| spec.table_spec.ks_name.as_str())
    }

    /// Table of the first column the statement binds or returns.
    pub fn get_table_name(&self) -> Option<&str> {
        self.first_col_spec().map(|spec| spec.table_spec.table_name.as_str())
    }

    fn first_col_spec(&self) -> Option<&ColumnSpec> {
        self.shared
            .metadata
            .col_specs
            .first()
            .or_else(|| self.shared.result_metadata.col_specs.first())
    }

    /// Bind markers as reported by the server.
    pub fn get_prepared_metadata(&self) -> &PreparedMetadata {
        &self.shared.metadata
    }

    /// Column of each bind marker, in marker order.
    pub fn get_variable_col_specs(&self) -> &[ColumnSpec] {
        &self.shared.metadata.col_specs
    }

    /// Which bind markers make up the partition key, sorted by marker.
    pub fn get_variable_pk_indexes(&self) -> &[PartitionKeyIndex] {
        &self.shared.metadata.pk_indexes
    }

    /// Columns the statement returns.
    pub fn get_result_metadata(&self) -> &ResultMetadata {
        &self.shared.result_metadata
    }

    /// Serializes values with the types of the statement's bind markers.
    pub fn serialize_values(&self, values: &BoundValues) -> Result<SerializedValues, BadQuery> {
        let types = self.shared.metadata.col_specs.iter().map(|spec| &spec.typ);
        Ok(SerializedValues::from_typed(values, types)?)
    }
}
