//! Types for representing results of CQL queries.

use std::net::SocketAddr;

use thiserror::Error;
use uuid::Uuid;

use tessera_cql::frame::response::event::SchemaChangeEvent;
use tessera_cql::frame::response::result::{self, ColumnSpec, RawRow, Rows};
use tessera_cql::value::{deser_cql_value, CqlValue, DeserializeValueError};

/// Result of a single request to the database. It represents any kind of Result frame.
///
/// Rows, if any, are kept as raw cells. They can be decoded with
/// [`QueryResult::decode_rows`] or handed to an application level codec.
///
/// NOTE: this is a result of a single CQL request, so at most one page of rows.
#[derive(Debug, Clone)]
pub struct QueryResult {
    coordinator: SocketAddr,
    kind: ResultKind,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
}

#[derive(Debug, Clone)]
enum ResultKind {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    SchemaChange(SchemaChangeEvent),
}

impl QueryResult {
    pub(crate) fn new(
        coordinator: SocketAddr,
        result: result::Result,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        let kind = match result {
            result::Result::Rows(rows) => ResultKind::Rows(rows),
            result::Result::SetKeyspace(keyspace) => ResultKind::SetKeyspace(keyspace),
            result::Result::SchemaChange(change) => ResultKind::SchemaChange(change),
            // A statement id is never what a query returns to the caller.
            result::Result::Void | result::Result::Prepared(_) => ResultKind::Void,
        };
        Self {
            coordinator,
            kind,
            tracing_id,
            warnings,
        }
    }

    /// Address of the node which answered the request.
    pub fn coordinator(&self) -> SocketAddr {
        self.coordinator
    }

    /// Warnings emitted by the database.
    #[inline]
    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    /// Tracing id of the request, if tracing was enabled on the server.
    #[inline]
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Returns a bool indicating the current response is of Rows type.
    #[inline]
    pub fn is_rows(&self) -> bool {
        matches!(self.kind, ResultKind::Rows(_))
    }

    /// Returns `Ok` for a request's result that shouldn't contain any rows.\
    /// Will return `Ok` for `INSERT` result, but a `SELECT` result, even an empty one, will cause an error.\
    /// Opposite of [`QueryResult::into_rows`].
    #[inline]
    pub fn result_not_rows(&self) -> Result<(), ResultNotRowsError> {
        match self.kind {
            ResultKind::Rows(_) => Err(ResultNotRowsError),
            _ => Ok(()),
        }
    }

    /// The rows, if the response is of Rows type.
    pub fn rows(&self) -> Option<&Rows> {
        match &self.kind {
            ResultKind::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Transforms itself into the raw rows.
    pub fn into_rows(self) -> Result<Rows, IntoRowsResultError> {
        match self.kind {
            ResultKind::Rows(rows) => Ok(rows),
            _ => Err(IntoRowsResultError::ResultNotRows),
        }
    }

    /// Number of rows; zero unless the response is of Rows type.
    pub fn rows_num(&self) -> usize {
        self.rows().map_or(0, |rows| rows.rows.len())
    }

    /// Specification of the returned columns, in response order.
    pub fn column_specs(&self) -> &[ColumnSpec] {
        self.rows()
            .map_or(&[], |rows| rows.metadata.col_specs.as_slice())
    }

    /// The keyspace set by a `USE` statement.
    pub fn set_keyspace(&self) -> Option<&str> {
        match &self.kind {
            ResultKind::SetKeyspace(keyspace) => Some(keyspace),
            _ => None,
        }
    }

    /// The schema change made by a DDL statement.
    pub fn schema_change(&self) -> Option<&SchemaChangeEvent> {
        match &self.kind {
            ResultKind::SchemaChange(change) => Some(change),
            _ => None,
        }
    }

    /// Decodes every row with the column types from the result metadata.
    pub fn decode_rows(&self) -> Result<Vec<Vec<Option<CqlValue>>>, IntoRowsResultError> {
        let rows = self.rows().ok_or(IntoRowsResultError::ResultNotRows)?;
        rows.rows
            .iter()
            .map(|row| decode_row(row, &rows.metadata.col_specs))
            .collect()
    }
}

fn decode_row(row: &RawRow, col_specs: &[ColumnSpec]) -> Result<Vec<Option<CqlValue>>, IntoRowsResultError> {
    if row.len() != col_specs.len() {
        return Err(IntoRowsResultError::ColumnCountMismatch {
            expected: col_specs.len(),
            got: row.len(),
        });
    }
    row.iter()
        .zip(col_specs)
        .map(|(cell, spec)| {
            cell.as_ref()
                .map(|bytes| deser_cql_value(&spec.typ, &mut &bytes[..]))
                .transpose()
                .map_err(|error| IntoRowsResultError::Deserialize {
                    column: spec.name.clone(),
                    error,
                })
        })
        .collect()
}

/// An error returned by [`QueryResult::into_rows`] and [`QueryResult::decode_rows`].
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum IntoRowsResultError {
    /// Result is not of Rows kind
    #[error("Result is not of Rows kind")]
    ResultNotRows,

    /// A row has a different number of cells than the metadata declares.
    #[error("Row has {got} cells, metadata declares {expected} columns")]
    ColumnCountMismatch {
        /// Columns in the metadata.
        expected: usize,
        /// Cells in the row.
        got: usize,
    },

    /// A cell could not be decoded.
    #[error("Failed to decode column {column}: {error}")]
    Deserialize {
        /// Name of the column.
        column: String,
        /// The cause.
        error: DeserializeValueError,
    },
}

/// Expected that result would be of non-Rows kind, but it was of Rows kind.
#[derive(Debug, Error, Clone)]
#[error("The result is of Rows kind, but it was expected to be Void")]
pub struct ResultNotRowsError;
