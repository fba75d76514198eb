//! CQL protocol-level representation of a `RESULT` response.

use crate::frame::frame_errors::{
    ColumnSpecParseErrorKind, CqlResultParseError, LowLevelDeserializationError,
    PreparedParseError, ResultMetadataParseError, RowsParseError,
};
use crate::frame::request::CqlRequestSerializationError;
use crate::frame::response::event::SchemaChangeEvent;
use crate::frame::types;
use crate::value::ColumnType;
use bytes::{BufMut, Bytes};
use std::sync::Arc;

const FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const FLAG_NO_METADATA: i32 = 0x0004;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableSpec {
    pub ks_name: String,
    pub table_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub table_spec: TableSpec,
    pub name: String,
    pub typ: ColumnType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    pub col_count: usize,
    pub col_specs: Vec<ColumnSpec>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PartitionKeyIndex {
    /// index in the serialized values
    pub index: u16,
    /// sequence number in partition key
    pub sequence: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedMetadata {
    pub flags: i32,
    pub col_count: usize,
    /// pk_indexes are sorted by `index` and can be reordered in partition key order
    /// using `sequence` field
    pub pk_indexes: Vec<PartitionKeyIndex>,
    pub col_specs: Vec<ColumnSpec>,
}

/// One row of raw cells, `None` standing for null.
pub type RawRow = Vec<Option<Bytes>>;

#[derive(Debug, Clone)]
pub struct Rows {
    pub metadata: Arc<ResultMetadata>,
    pub paging_state: Option<Bytes>,
    pub rows: Vec<RawRow>,
}

#[derive(Debug, Clone)]
pub struct Prepared {
    pub id: Bytes,
    pub prepared_metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone)]
pub enum Result {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(Prepared),
    SchemaChange(SchemaChangeEvent),
}

fn deser_table_spec(buf: &mut &[u8]) -> std::result::Result<TableSpec, LowLevelDeserializationError> {
    let ks_name = types::read_string(buf)?.to_owned();
    let table_name = types::read_string(buf)?.to_owned();
    Ok(TableSpec {
        ks_name,
        table_name,
    })
}

fn deser_col_specs(
    buf: &mut &[u8],
    global_table_spec: Option<TableSpec>,
    col_count: usize,
) -> std::result::Result<Vec<ColumnSpec>, ResultMetadataParseError> {
    let mk_err = |column_index, kind: ColumnSpecParseErrorKind| {
        ResultMetadataParseError::ColumnSpecParseError { column_index, kind }
    };

    let mut col_specs = Vec::with_capacity(col_count.min(buf.len()));
    for col_idx in 0..col_count {
        let table_spec = match &global_table_spec {
            Some(spec) => spec.clone(),
            None => deser_table_spec(buf)
                .map_err(|err| mk_err(col_idx, ColumnSpecParseErrorKind::TableSpecParseError(err)))?,
        };
        let name = types::read_string(buf)
            .map_err(|err| mk_err(col_idx, ColumnSpecParseErrorKind::ColumnNameParseError(err)))?
            .to_owned();
        let typ = ColumnType::deserialize(buf).map_err(|err| mk_err(col_idx, err.into()))?;
        col_specs.push(ColumnSpec {
            table_spec,
            name,
            typ,
        });
    }
    Ok(col_specs)
}

fn deser_result_metadata(
    buf: &mut &[u8],
) -> std::result::Result<(ResultMetadata, Option<Bytes>), ResultMetadataParseError> {
    let flags = types::read_int(buf)
        .map_err(|err| ResultMetadataParseError::FlagsParseError(err.into()))?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & FLAG_HAS_MORE_PAGES != 0;
    let no_metadata = flags & FLAG_NO_METADATA != 0;

    let col_count =
        types::read_int_length(buf).map_err(ResultMetadataParseError::ColumnCountParseError)?;

    let paging_state = has_more_pages
        .then(|| types::read_bytes(buf).map_err(ResultMetadataParseError::PagingStateParseError))
        .transpose()?
        .map(Bytes::copy_from_slice);

    let col_specs = if no_metadata {
        vec![]
    } else {
        let global_table_spec = global_tables_spec
            .then(|| {
                deser_table_spec(buf).map_err(ResultMetadataParseError::GlobalTableSpecParseError)
            })
            .transpose()?;

        deser_col_specs(buf, global_table_spec, col_count)?
    };

    Ok((
        ResultMetadata {
            col_count,
            col_specs,
        },
        paging_state,
    ))
}

fn deser_prepared_metadata(
    buf: &mut &[u8],
) -> std::result::Result<PreparedMetadata, ResultMetadataParseError> {
    let flags = types::read_int(buf)
        .map_err(|err| ResultMetadataParseError::FlagsParseError(err.into()))?;
    let global_tables_spec = flags & FLAG_GLOBAL_TABLES_SPEC != 0;

    let col_count =
        types::read_int_length(buf).map_err(ResultMetadataParseError::ColumnCountParseError)?;

    let pk_count: usize =
        types::read_int_length(buf).map_err(ResultMetadataParseError::PkCountParseError)?;

    let mut pk_indexes = Vec::with_capacity(pk_count.min(buf.len()));
    for i in 0..pk_count {
        pk_indexes.push(PartitionKeyIndex {
            index: types::read_short(buf)
                .map_err(|err| ResultMetadataParseError::PkIndexParseError(err.into()))?,
            sequence: i as u16,
        });
    }
    pk_indexes.sort_unstable_by_key(|pki| pki.index);

    let global_table_spec = global_tables_spec
        .then(|| deser_table_spec(buf).map_err(ResultMetadataParseError::GlobalTableSpecParseError))
        .transpose()?;

    let col_specs = deser_col_specs(buf, global_table_spec, col_count)?;

    Ok(PreparedMetadata {
        flags,
        col_count,
        pk_indexes,
        col_specs,
    })
}

fn deser_rows(
    buf_bytes: &Bytes,
    buf: &mut &[u8],
    cached_metadata: Option<&Arc<ResultMetadata>>,
) -> std::result::Result<Rows, RowsParseError> {
    let (server_metadata, paging_state) = deser_result_metadata(buf)?;

    let metadata = match cached_metadata {
        Some(cached) if server_metadata.col_specs.is_empty() => Arc::clone(cached),
        _ => {
            if server_metadata.col_count != server_metadata.col_specs.len() {
                return Err(if server_metadata.col_specs.is_empty() {
                    RowsParseError::NoMetadata
                } else {
                    RowsParseError::ColumnCountMismatch {
                        col_count: server_metadata.col_count,
                        col_specs_count: server_metadata.col_specs.len(),
                    }
                });
            }
            Arc::new(server_metadata)
        }
    };

    let rows_count: usize =
        types::read_int_length(buf).map_err(RowsParseError::RowsCountParseError)?;

    let mut rows = Vec::with_capacity(rows_count.min(buf.len()));
    for row in 0..rows_count {
        let mut cells = Vec::with_capacity(metadata.col_count);
        for column in 0..metadata.col_count {
            let cell = types::read_bytes_opt(buf)
                .map_err(|err| RowsParseError::CellParseError { row, column, err })?;
            // Cells share the frame's allocation.
            cells.push(cell.map(|c| buf_bytes.slice_ref(c)));
        }
        rows.push(cells);
    }

    Ok(Rows {
        metadata,
        paging_state,
        rows,
    })
}

fn deser_prepared(buf: &mut &[u8]) -> std::result::Result<Prepared, PreparedParseError> {
    let id = Bytes::copy_from_slice(
        types::read_short_bytes(buf).map_err(PreparedParseError::IdParseError)?,
    );
    let prepared_metadata =
        deser_prepared_metadata(buf).map_err(PreparedParseError::PreparedMetadataParseError)?;
    let (result_metadata, paging_state) =
        deser_result_metadata(buf).map_err(PreparedParseError::ResultMetadataParseError)?;
    if paging_state.is_some() {
        return Err(PreparedParseError::NonZeroPagingState);
    }

    Ok(Prepared {
        id,
        prepared_metadata,
        result_metadata,
    })
}

/// Parses a `RESULT` body.
///
/// `cached_metadata` is used for rows whose metadata the server skipped
/// because the request asked it to.
pub fn deserialize(
    buf_bytes: Bytes,
    cached_metadata: Option<&Arc<ResultMetadata>>,
) -> std::result::Result<Result, CqlResultParseError> {
    let buf = &mut &*buf_bytes;
    Ok(
        match types::read_int(buf)
            .map_err(|err| CqlResultParseError::ResultIdParseError(err.into()))?
        {
            0x0001 => Result::Void,
            0x0002 => Result::Rows(deser_rows(&buf_bytes, buf, cached_metadata)?),
            0x0003 => Result::SetKeyspace(
                types::read_string(buf)
                    .map_err(CqlResultParseError::SetKeyspaceParseError)?
                    .to_owned(),
            ),
            0x0004 => Result::Prepared(deser_prepared(buf)?),
            0x0005 => Result::SchemaChange(SchemaChangeEvent::deserialize(buf)?),
            id => return Err(CqlResultParseError::UnknownResultId(id)),
        },
    )
}

fn write_col_specs(
    col_specs: &[ColumnSpec],
    buf: &mut Vec<u8>,
) -> std::result::Result<(), CqlRequestSerializationError> {
    for spec in col_specs {
        types::write_string(&spec.table_spec.ks_name, buf)?;
        types::write_string(&spec.table_spec.table_name, buf)?;
        types::write_string(&spec.name, buf)?;
        spec.typ.serialize(buf)?;
    }
    Ok(())
}

fn write_result_metadata(
    metadata: &ResultMetadata,
    paging_state: Option<&Bytes>,
    buf: &mut Vec<u8>,
) -> std::result::Result<(), CqlRequestSerializationError> {
    let mut flags = 0;
    if paging_state.is_some() {
        flags |= FLAG_HAS_MORE_PAGES;
    }
    if metadata.col_specs.is_empty() {
        flags |= FLAG_NO_METADATA;
    }
    types::write_int(flags, buf);
    types::write_int_length(metadata.col_count, buf)?;
    if let Some(state) = paging_state {
        types::write_bytes(state, buf)?;
    }
    write_col_specs(&metadata.col_specs, buf)
}

impl Result {
    /// Writes a `RESULT` body. Global table specs are never emitted.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> std::result::Result<(), CqlRequestSerializationError> {
        match self {
            Result::Void => types::write_int(0x0001, buf),
            Result::Rows(rows) => {
                types::write_int(0x0002, buf);
                write_result_metadata(&rows.metadata, rows.paging_state.as_ref(), buf)?;
                types::write_int_length(rows.rows.len(), buf)?;
                for row in &rows.rows {
                    for cell in row {
                        types::write_bytes_opt(cell.as_deref(), buf)?;
                    }
                }
            }
            Result::SetKeyspace(keyspace) => {
                types::write_int(0x0003, buf);
                types::write_string(keyspace, buf)?;
            }
            Result::Prepared(prepared) => {
                types::write_int(0x0004, buf);
                types::write_short_bytes(&prepared.id, buf)?;
                let metadata = &prepared.prepared_metadata;
                types::write_int(metadata.flags & !FLAG_GLOBAL_TABLES_SPEC, buf);
                types::write_int_length(metadata.col_count, buf)?;
                types::write_int_length(metadata.pk_indexes.len(), buf)?;
                let mut by_sequence = metadata.pk_indexes.clone();
                by_sequence.sort_unstable_by_key(|pki| pki.sequence);
                for pki in by_sequence {
                    buf.put_u16(pki.index);
                }
                write_col_specs(&metadata.col_specs, buf)?;
                write_result_metadata(&prepared.result_metadata, None, buf)?;
            }
            Result::SchemaChange(event) => {
                types::write_int(0x0005, buf);
                event.serialize(buf)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn spec(name: &str, typ: ColumnType) -> ColumnSpec {
        ColumnSpec {
            table_spec: TableSpec {
                ks_name: "ks".into(),
                table_name: "t".into(),
            },
            name: name.into(),
            typ,
        }
    }

    fn reparse(result: &Result, cached: Option<&Arc<ResultMetadata>>) -> Result {
        let mut buf = Vec::new();
        result.serialize(&mut buf).unwrap();
        deserialize(Bytes::from(buf), cached).unwrap()
    }

    #[test]
    fn rows_with_nulls_and_paging_state() {
        let metadata = Arc::new(ResultMetadata {
            col_count: 2,
            col_specs: vec![spec("a", ColumnType::Int), spec("b", ColumnType::Text)],
        });
        let rows = Result::Rows(Rows {
            metadata: metadata.clone(),
            paging_state: Some(Bytes::from_static(b"next")),
            rows: vec![
                vec![Some(Bytes::from_static(&[0, 0, 0, 1])), None],
                vec![None, Some(Bytes::from_static(b"x"))],
            ],
        });

        let parsed = reparse(&rows, None);
        assert_matches!(parsed, Result::Rows(parsed) => {
            assert_eq!(parsed.metadata, metadata);
            assert_eq!(parsed.paging_state.as_deref(), Some(&b"next"[..]));
            assert_eq!(parsed.rows[0][0].as_deref(), Some(&[0u8, 0, 0, 1][..]));
            assert_eq!(parsed.rows[0][1], None);
            assert_eq!(parsed.rows[1][1].as_deref(), Some(&b"x"[..]));
        });
    }

    #[test]
    fn rows_without_metadata_use_cached_or_fail() {
        let cached = Arc::new(ResultMetadata {
            col_count: 1,
            col_specs: vec![spec("a", ColumnType::BigInt)],
        });

        let mut body = Vec::new();
        types::write_int(0x0002, &mut body);
        types::write_int(FLAG_NO_METADATA, &mut body);
        types::write_int(1, &mut body);
        types::write_int(1, &mut body);
        types::write_bytes(&7_i64.to_be_bytes(), &mut body).unwrap();
        let body = Bytes::from(body);

        assert_matches!(
            deserialize(body.clone(), Some(&cached)),
            Ok(Result::Rows(rows)) if Arc::ptr_eq(&rows.metadata, &cached) && rows.rows.len() == 1
        );
        assert_matches!(
            deserialize(body, None),
            Err(CqlResultParseError::RowsParseError(RowsParseError::NoMetadata))
        );
    }

    #[test]
    fn prepared_keeps_partition_key_order() {
        let mut body = Vec::new();
        types::write_int(0x0004, &mut body);
        types::write_short_bytes(b"id", &mut body).unwrap();
        // prepared metadata: global spec, 3 columns, pk = (col 2, col 0)
        types::write_int(FLAG_GLOBAL_TABLES_SPEC, &mut body);
        types::write_int(3, &mut body);
        types::write_int(2, &mut body);
        types::write_short(2, &mut body);
        types::write_short(0, &mut body);
        types::write_string("ks", &mut body).unwrap();
        types::write_string("t", &mut body).unwrap();
        for (name, id) in [("a", 0x0009_u16), ("b", 0x000D), ("c", 0x0002)] {
            types::write_string(name, &mut body).unwrap();
            types::write_short(id, &mut body);
        }
        // result metadata: none
        types::write_int(FLAG_NO_METADATA, &mut body);
        types::write_int(0, &mut body);

        let parsed = deserialize(Bytes::from(body), None).unwrap();
        assert_matches!(parsed, Result::Prepared(prepared) => {
            assert_eq!(prepared.id, Bytes::from_static(b"id"));
            let pm = &prepared.prepared_metadata;
            assert_eq!(
                pm.pk_indexes,
                vec![
                    PartitionKeyIndex { index: 0, sequence: 1 },
                    PartitionKeyIndex { index: 2, sequence: 0 },
                ]
            );
            assert_eq!(pm.col_specs[2], spec("c", ColumnType::BigInt));

            let reparsed = reparse(&Result::Prepared(prepared.clone()), None);
            assert_matches!(reparsed, Result::Prepared(p) if p.prepared_metadata.pk_indexes == pm.pk_indexes);
        });
    }

    #[test]
    fn unknown_result_kind() {
        let mut body = Vec::new();
        types::write_int(0x0042, &mut body);
        assert_matches!(
            deserialize(Bytes::from(body), None),
            Err(CqlResultParseError::UnknownResultId(0x42))
        );
    }
}
