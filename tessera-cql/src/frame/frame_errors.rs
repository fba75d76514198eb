//! Errors produced while reading and parsing frames.

use std::num::TryFromIntError;
use std::sync::Arc;

use super::TryFromPrimitiveError;
use thiserror::Error;

/// An error that occurred while reading a frame header or its body off the wire.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum FrameHeaderParseError {
    /// Failed to read the 9 header bytes.
    #[error("Failed to read the frame header: {0}")]
    HeaderIoError(std::io::Error),

    /// A frame arrived with the request direction bit.
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,

    /// A frame arrived with the response direction bit where a request was expected.
    #[error("Received frame marked as coming from the server")]
    FrameFromServer,

    /// Protocol version other than 4.
    #[error("Received a frame from version {0}, but only 4 is supported")]
    VersionNotSupported(u8),

    /// The advertised body length exceeds the accepted maximum.
    #[error("Frame body of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// The opcode byte does not name a known message.
    #[error("Unrecognized opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),

    /// Failed to read a chunk of the body.
    #[error("Failed to read a chunk of the frame body: {0}")]
    BodyChunkIoError(std::io::Error),

    /// The transport hit EOF in the middle of a body.
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
}

/// An error that occurred while decompressing a body or stripping its extensions.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum FrameBodyExtensionsParseError {
    /// The frame is flagged as compressed but no algorithm was negotiated.
    #[error("Frame is compressed, but no compression negotiated for connection.")]
    NoCompressionNegotiated,

    /// Malformed tracing id.
    #[error("Malformed trace id: {0}")]
    TraceIdParse(LowLevelDeserializationError),

    /// Malformed warnings list.
    #[error("Malformed warnings list: {0}")]
    WarningsParse(LowLevelDeserializationError),

    /// Malformed custom payload map.
    #[error("Malformed custom payload map: {0}")]
    CustomPayloadMapParse(LowLevelDeserializationError),

    /// LZ4 decompression failed.
    #[error("Error decompressing lz4 data: {0}")]
    Lz4Decompress(String),

    /// Snappy decompression failed.
    #[error("Snappy decompression failed")]
    SnapDecompress,
}

/// Failure to parse one of the primitive wire types.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum LowLevelDeserializationError {
    /// The buffer ended early.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// A length or count did not fit the target integer type.
    #[error(transparent)]
    TryFromIntError(#[from] TryFromIntError),

    /// Not enough bytes left in the buffer.
    #[error("Too few bytes received: expected {expected}, received {received}")]
    TooFewBytesReceived {
        /// Bytes needed.
        expected: usize,
        /// Bytes available.
        received: usize,
    },

    /// A `[value]` length that is neither non-negative, -1 nor -2.
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),

    /// A consistency code outside the known set.
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),

    /// An `[inet]` whose address length is neither 4 nor 16.
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),

    /// A `[string]` that is not valid UTF-8.
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}

/// Failure to parse a response body.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlResponseParseError {
    /// Malformed `ERROR`.
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(#[from] CqlErrorParseError),

    /// Malformed `AUTHENTICATE`.
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    CqlAuthenticateParseError(LowLevelDeserializationError),

    /// Malformed `AUTH_CHALLENGE`.
    #[error("Failed to deserialize AUTH_CHALLENGE response: {0}")]
    CqlAuthChallengeParseError(LowLevelDeserializationError),

    /// Malformed `AUTH_SUCCESS`.
    #[error("Failed to deserialize AUTH_SUCCESS response: {0}")]
    CqlAuthSuccessParseError(LowLevelDeserializationError),

    /// Malformed `SUPPORTED`.
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    CqlSupportedParseError(LowLevelDeserializationError),

    /// Malformed `EVENT`.
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlEventParseError(#[from] CqlEventParseError),

    /// Malformed `RESULT`.
    #[error(transparent)]
    CqlResultParseError(#[from] CqlResultParseError),
}

/// Failure to parse an `ERROR` response.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlErrorParseError {
    /// Malformed error code.
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),

    /// Malformed reason string.
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),

    /// One of the code-specific fields is malformed.
    #[error("Malformed error field {field} of DB error {db_error}: {err}")]
    MalformedErrorField {
        /// Name of the error the field belongs to.
        db_error: &'static str,
        /// Name of the field.
        field: &'static str,
        /// Underlying failure.
        err: LowLevelDeserializationError,
    },
}

/// Failure to parse an `EVENT` response.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlEventParseError {
    /// Malformed event type string.
    #[error("Malformed event type string: {0}")]
    EventTypeParseError(LowLevelDeserializationError),

    /// Event type string not known to the driver.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// Malformed `SCHEMA_CHANGE` payload.
    #[error("Failed to deserialize schema change event: {0}")]
    SchemaChangeEventParseError(#[from] SchemaChangeEventParseError),

    /// Malformed `TOPOLOGY_CHANGE` payload.
    #[error("Failed to deserialize topology change event: {0}")]
    TopologyChangeEventParseError(ClusterChangeEventParseError),

    /// Malformed `STATUS_CHANGE` payload.
    #[error("Failed to deserialize status change event: {0}")]
    StatusChangeEventParseError(ClusterChangeEventParseError),
}

/// Failure to parse a schema change, either as an event or as a `RESULT`.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum SchemaChangeEventParseError {
    /// Malformed change type.
    #[error("Malformed schema change type string: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),

    /// Malformed target kind.
    #[error("Malformed schema change target string: {0}")]
    TargetTypeParseError(LowLevelDeserializationError),

    /// Malformed keyspace name.
    #[error("Malformed name of keyspace affected by schema change: {0}")]
    AffectedKeyspaceParseError(LowLevelDeserializationError),

    /// Malformed table, type, function or aggregate name.
    #[error("Malformed name of the affected schema object: {0}")]
    AffectedTargetNameParseError(LowLevelDeserializationError),

    /// Malformed argument count.
    #[error("Malformed number of function arguments: {0}")]
    ArgumentCountParseError(LowLevelDeserializationError),

    /// Malformed argument type.
    #[error("Malformed function argument type: {0}")]
    FunctionArgumentParseError(LowLevelDeserializationError),

    /// Change kind other than CREATED, UPDATED or DROPPED.
    #[error("Unknown type of schema change: {0}")]
    UnknownTypeOfChange(String),

    /// Target kind not known to the driver.
    #[error("Unknown target of schema change: {0}")]
    UnknownTargetOfSchemaChange(String),
}

/// Failure to parse a topology or status change event.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ClusterChangeEventParseError {
    /// Malformed change type.
    #[error("Malformed type of change: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),

    /// Malformed node address.
    #[error("Malformed node address: {0}")]
    NodeAddressParseError(LowLevelDeserializationError),

    /// Change type not known to the driver.
    #[error("Unknown type of change: {0}")]
    UnknownTypeOfChange(String),
}

/// Failure to parse a `RESULT` response.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlResultParseError {
    /// Malformed result kind.
    #[error("Malformed RESULT response id: {0}")]
    ResultIdParseError(LowLevelDeserializationError),

    /// Result kind not known to the driver.
    #[error("Unknown RESULT response id: {0}")]
    UnknownResultId(i32),

    /// Malformed `SetKeyspace` result.
    #[error("RESULT:SetKeyspace response deserialization failed: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),

    /// Malformed `SchemaChange` result.
    #[error("RESULT:SchemaChange response deserialization failed: {0}")]
    SchemaChangeParseError(#[from] SchemaChangeEventParseError),

    /// Malformed `Prepared` result.
    #[error("RESULT:Prepared response deserialization failed: {0}")]
    PreparedParseError(#[from] PreparedParseError),

    /// Malformed `Rows` result.
    #[error("RESULT:Rows response deserialization failed: {0}")]
    RowsParseError(#[from] RowsParseError),
}

/// Failure to parse a `Prepared` result.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum PreparedParseError {
    /// Malformed statement id.
    #[error("Malformed prepared statement's id: {0}")]
    IdParseError(LowLevelDeserializationError),

    /// Malformed bind variables metadata.
    #[error("Malformed prepared statement's prepared metadata: {0}")]
    PreparedMetadataParseError(ResultMetadataParseError),

    /// Malformed result metadata.
    #[error("Malformed prepared statement's result metadata: {0}")]
    ResultMetadataParseError(ResultMetadataParseError),

    /// The server sent a paging state in a `Prepared` result.
    #[error("Invalid prepared metadata: paging state must not be present")]
    NonZeroPagingState,
}

/// Failure to parse result or prepared metadata.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ResultMetadataParseError {
    /// Malformed flags.
    #[error("Malformed metadata flags: {0}")]
    FlagsParseError(LowLevelDeserializationError),

    /// Malformed column count.
    #[error("Malformed column count: {0}")]
    ColumnCountParseError(LowLevelDeserializationError),

    /// Malformed partition key count.
    #[error("Malformed partition key count: {0}")]
    PkCountParseError(LowLevelDeserializationError),

    /// Malformed partition key index.
    #[error("Malformed partition key index: {0}")]
    PkIndexParseError(LowLevelDeserializationError),

    /// Malformed paging state.
    #[error("Malformed paging state: {0}")]
    PagingStateParseError(LowLevelDeserializationError),

    /// Malformed global table spec.
    #[error("Malformed global table spec: {0}")]
    GlobalTableSpecParseError(LowLevelDeserializationError),

    /// Malformed column spec.
    #[error("Malformed spec of column {column_index}: {kind}")]
    ColumnSpecParseError {
        /// Zero-based index of the column.
        column_index: usize,
        /// What exactly failed.
        kind: ColumnSpecParseErrorKind,
    },
}

/// What failed while parsing a single column spec.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ColumnSpecParseErrorKind {
    /// Malformed keyspace or table name.
    #[error("Malformed table spec: {0}")]
    TableSpecParseError(LowLevelDeserializationError),

    /// Malformed column name.
    #[error("Malformed column name: {0}")]
    ColumnNameParseError(LowLevelDeserializationError),

    /// Malformed column type.
    #[error("Malformed column type: {0}")]
    ColumnTypeParseError(#[from] CqlTypeParseError),
}

/// Failure to parse a column type.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlTypeParseError {
    /// Malformed type id.
    #[error("Malformed type id: {0}")]
    TypeIdParseError(LowLevelDeserializationError),

    /// Malformed custom type class name.
    #[error("Malformed custom type name: {0}")]
    CustomTypeNameParseError(LowLevelDeserializationError),

    /// Malformed UDT keyspace.
    #[error("Malformed name of UDT keyspace: {0}")]
    UdtKeyspaceNameParseError(LowLevelDeserializationError),

    /// Malformed UDT name.
    #[error("Malformed UDT name: {0}")]
    UdtNameParseError(LowLevelDeserializationError),

    /// Malformed UDT field count.
    #[error("Malformed UDT fields count: {0}")]
    UdtFieldsCountParseError(LowLevelDeserializationError),

    /// Malformed UDT field name.
    #[error("Malformed UDT's field name: {0}")]
    UdtFieldNameParseError(LowLevelDeserializationError),

    /// Malformed tuple length.
    #[error("Malformed tuple length: {0}")]
    TupleLengthParseError(LowLevelDeserializationError),

    /// Type id not known to the driver.
    #[error("Type not yet implemented, id: {0}")]
    TypeNotImplemented(u16),
}

/// Failure to parse a `Rows` result.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum RowsParseError {
    /// Malformed result metadata.
    #[error("Malformed result metadata: {0}")]
    ResultMetadataParseError(#[from] ResultMetadataParseError),

    /// Malformed row count.
    #[error("Malformed rows count: {0}")]
    RowsCountParseError(LowLevelDeserializationError),

    /// Malformed cell.
    #[error("Malformed cell at row {row}, column {column}: {err}")]
    CellParseError {
        /// Zero-based row index.
        row: usize,
        /// Zero-based column index.
        column: usize,
        /// Underlying failure.
        err: LowLevelDeserializationError,
    },

    /// The server skipped metadata but the request did not provide it.
    #[error("Result metadata was skipped by the server and none is cached")]
    NoMetadata,

    /// Column count disagrees with the number of column specs.
    #[error(
        "Mismatch between declared column count ({col_count}) \
        and the number of column specs ({col_specs_count})"
    )]
    ColumnCountMismatch {
        /// Declared column count.
        col_count: usize,
        /// Number of specs actually present.
        col_specs_count: usize,
    },
}
