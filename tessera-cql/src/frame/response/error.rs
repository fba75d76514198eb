//! The `ERROR` response body (protocol v4, section 9).

use bytes::{BufMut, Bytes};
use thiserror::Error;

use crate::frame::frame_errors::{CqlErrorParseError, LowLevelDeserializationError};
use crate::frame::request::CqlRequestSerializationError;
use crate::frame::types;
use crate::Consistency;

/// An `ERROR` response: a typed error plus the server's human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    /// The typed error.
    pub error: DbError,
    /// Message sent by the server.
    pub reason: String,
}

mod code {
    pub(super) const SERVER_ERROR: i32 = 0x0000;
    pub(super) const PROTOCOL_ERROR: i32 = 0x000A;
    pub(super) const BAD_CREDENTIALS: i32 = 0x0100;
    pub(super) const UNAVAILABLE: i32 = 0x1000;
    pub(super) const OVERLOADED: i32 = 0x1001;
    pub(super) const IS_BOOTSTRAPPING: i32 = 0x1002;
    pub(super) const TRUNCATE_ERROR: i32 = 0x1003;
    pub(super) const WRITE_TIMEOUT: i32 = 0x1100;
    pub(super) const READ_TIMEOUT: i32 = 0x1200;
    pub(super) const READ_FAILURE: i32 = 0x1300;
    pub(super) const FUNCTION_FAILURE: i32 = 0x1400;
    pub(super) const WRITE_FAILURE: i32 = 0x1500;
    pub(super) const SYNTAX_ERROR: i32 = 0x2000;
    pub(super) const UNAUTHORIZED: i32 = 0x2100;
    pub(super) const INVALID: i32 = 0x2200;
    pub(super) const CONFIG_ERROR: i32 = 0x2300;
    pub(super) const ALREADY_EXISTS: i32 = 0x2400;
    pub(super) const UNPREPARED: i32 = 0x2500;
}

/// Reads the code-specific fields of one error, attributing failures to
/// the field being read.
struct FieldReader<'a, 'b> {
    buf: &'a mut &'b [u8],
    db_error: &'static str,
}

impl<'a, 'b> FieldReader<'a, 'b> {
    fn new(buf: &'a mut &'b [u8], db_error: &'static str) -> Self {
        FieldReader { buf, db_error }
    }

    fn field<T, E: Into<LowLevelDeserializationError>>(
        &mut self,
        field: &'static str,
        read: impl FnOnce(&mut &'b [u8]) -> Result<T, E>,
    ) -> Result<T, CqlErrorParseError> {
        read(&mut *self.buf).map_err(|err| CqlErrorParseError::MalformedErrorField {
            db_error: self.db_error,
            field,
            err: err.into(),
        })
    }

    fn consistency(&mut self) -> Result<Consistency, CqlErrorParseError> {
        self.field("CONSISTENCY", types::read_consistency)
    }

    fn int(&mut self, field: &'static str) -> Result<i32, CqlErrorParseError> {
        self.field(field, types::read_int)
    }

    fn flag(&mut self, field: &'static str) -> Result<bool, CqlErrorParseError> {
        self.field(field, |buf| types::read_raw_bytes(1, buf).map(|byte| byte[0] != 0))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CqlErrorParseError> {
        self.field(field, |buf| types::read_string(buf).map(str::to_owned))
    }

    fn write_type(&mut self) -> Result<WriteType, CqlErrorParseError> {
        self.field("WRITE_TYPE", |buf| types::read_string(buf).map(WriteType::from))
    }
}

impl Error {
    /// Deserializes an `ERROR` body.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlErrorParseError> {
        let error_code = types::read_int(buf).map_err(CqlErrorParseError::ErrorCodeParseError)?;
        let reason = types::read_string(buf)
            .map_err(CqlErrorParseError::ReasonParseError)?
            .to_owned();

        let error = match error_code {
            code::SERVER_ERROR => DbError::ServerError,
            code::PROTOCOL_ERROR => DbError::ProtocolError,
            code::BAD_CREDENTIALS => DbError::AuthenticationError,
            code::OVERLOADED => DbError::Overloaded,
            code::IS_BOOTSTRAPPING => DbError::IsBootstrapping,
            code::TRUNCATE_ERROR => DbError::TruncateError,
            code::SYNTAX_ERROR => DbError::SyntaxError,
            code::UNAUTHORIZED => DbError::Unauthorized,
            code::INVALID => DbError::Invalid,
            code::CONFIG_ERROR => DbError::ConfigError,
            code::UNAVAILABLE => {
                let mut r = FieldReader::new(buf, "UNAVAILABLE");
                DbError::Unavailable {
                    consistency: r.consistency()?,
                    required: r.int("REQUIRED")?,
                    alive: r.int("ALIVE")?,
                }
            }
            code::WRITE_TIMEOUT => {
                let mut r = FieldReader::new(buf, "WRITE_TIMEOUT");
                DbError::WriteTimeout {
                    consistency: r.consistency()?,
                    received: r.int("RECEIVED")?,
                    required: r.int("REQUIRED")?,
                    write_type: r.write_type()?,
                }
            }
            code::READ_TIMEOUT => {
                let mut r = FieldReader::new(buf, "READ_TIMEOUT");
                DbError::ReadTimeout {
                    consistency: r.consistency()?,
                    received: r.int("RECEIVED")?,
                    required: r.int("REQUIRED")?,
                    data_present: r.flag("DATA_PRESENT")?,
                }
            }
            code::READ_FAILURE => {
                let mut r = FieldReader::new(buf, "READ_FAILURE");
                DbError::ReadFailure {
                    consistency: r.consistency()?,
                    received: r.int("RECEIVED")?,
                    required: r.int("REQUIRED")?,
                    numfailures: r.int("NUM_FAILURES")?,
                    data_present: r.flag("DATA_PRESENT")?,
                }
            }
            code::WRITE_FAILURE => {
                let mut r = FieldReader::new(buf, "WRITE_FAILURE");
                DbError::WriteFailure {
                    consistency: r.consistency()?,
                    received: r.int("RECEIVED")?,
                    required: r.int("REQUIRED")?,
                    numfailures: r.int("NUM_FAILURES")?,
                    write_type: r.write_type()?,
                }
            }
            code::FUNCTION_FAILURE => {
                let mut r = FieldReader::new(buf, "FUNCTION_FAILURE");
                DbError::FunctionFailure {
                    keyspace: r.string("KEYSPACE")?,
                    function: r.string("FUNCTION")?,
                    arg_types: r.field("ARG_TYPES", types::read_string_list)?,
                }
            }
            code::ALREADY_EXISTS => {
                let mut r = FieldReader::new(buf, "ALREADY_EXISTS");
                DbError::AlreadyExists {
                    keyspace: r.string("KEYSPACE")?,
                    table: r.string("TABLE")?,
                }
            }
            code::UNPREPARED => DbError::Unprepared {
                statement_id: FieldReader::new(buf, "UNPREPARED").field("STATEMENT_ID", |buf| {
                    types::read_short_bytes(buf).map(Bytes::copy_from_slice)
                })?,
            },
            other => DbError::Other(other),
        };

        Ok(Error { error, reason })
    }

    /// Serializes an `ERROR` body, as a server would send it.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_int(self.error.code(), buf);
        types::write_string(&self.reason, buf)?;

        let counts = |consistency: &Consistency, received: &i32, required: &i32, buf: &mut Vec<u8>| {
            types::write_consistency(*consistency, buf);
            types::write_int(*received, buf);
            types::write_int(*required, buf);
        };
        match &self.error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => counts(consistency, required, alive, buf),
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => {
                counts(consistency, received, required, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => {
                counts(consistency, received, required, buf);
                buf.put_u8(u8::from(*data_present));
            }
            DbError::ReadFailure {
                consistency,
                received,
                required,
                numfailures,
                data_present,
            } => {
                counts(consistency, received, required, buf);
                types::write_int(*numfailures, buf);
                buf.put_u8(u8::from(*data_present));
            }
            DbError::WriteFailure {
                consistency,
                received,
                required,
                numfailures,
                write_type,
            } => {
                counts(consistency, received, required, buf);
                types::write_int(*numfailures, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::FunctionFailure {
                keyspace,
                function,
                arg_types,
            } => {
                types::write_string(keyspace, buf)?;
                types::write_string(function, buf)?;
                types::write_string_list(arg_types, buf)?;
            }
            DbError::AlreadyExists { keyspace, table } => {
                types::write_string(keyspace, buf)?;
                types::write_string(table, buf)?;
            }
            DbError::Unprepared { statement_id } => types::write_short_bytes(statement_id, buf)?,
            _ => {}
        }
        Ok(())
    }
}

/// An error reported by the database for a request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    /// The statement does not parse.
    #[error("Syntax error in the statement")]
    SyntaxError,

    /// The statement parses but cannot be executed as written.
    #[error("Invalid statement")]
    Invalid,

    /// A keyspace or table to be created exists already.
    #[error("Keyspace {keyspace} or table {table} already exists")]
    AlreadyExists {
        /// The keyspace created, or the one the table was created in.
        keyspace: String,
        /// The table created; empty when a keyspace was created.
        table: String,
    },

    /// A user defined function threw.
    #[error("Function {keyspace}.{function}({arg_types:?}) failed")]
    FunctionFailure {
        /// Keyspace of the function.
        keyspace: String,
        /// Name of the function.
        function: String,
        /// CQL types of its arguments.
        arg_types: Vec<String>,
    },

    /// The credentials were rejected.
    #[error("Authentication failed")]
    AuthenticationError,

    /// The logged in role lacks a permission the request needs.
    #[error("Unauthorized")]
    Unauthorized,

    /// The request conflicts with the server configuration.
    #[error("Configuration error")]
    ConfigError,

    /// The coordinator knows too few live replicas to reach the consistency.
    /// Nothing was attempted.
    #[error("Cannot achieve {consistency}: {required} replicas required, {alive} alive")]
    Unavailable {
        /// Requested consistency.
        consistency: Consistency,
        /// Replicas needed for it.
        required: i32,
        /// Replicas known alive.
        alive: i32,
    },

    /// The coordinator refuses work until its load drops.
    #[error("Coordinator is overloaded")]
    Overloaded,

    /// The coordinator has not finished joining the cluster.
    #[error("Coordinator is bootstrapping")]
    IsBootstrapping,

    /// `TRUNCATE` did not complete.
    #[error("Truncate failed")]
    TruncateError,

    /// Too few replicas answered a read in time.
    #[error(
        "Read timed out at {consistency}: {received} of {required} replicas answered \
        (data present: {data_present})"
    )]
    ReadTimeout {
        /// Requested consistency.
        consistency: Consistency,
        /// Replicas that answered.
        received: i32,
        /// Replicas needed.
        required: i32,
        /// Whether the replica asked for the data answered.
        data_present: bool,
    },

    /// Too few replicas acknowledged a write in time. The write may still
    /// have been applied by some of them.
    #[error(
        "Write of type {write_type} timed out at {consistency}: \
        {received} of {required} replicas acknowledged"
    )]
    WriteTimeout {
        /// Requested consistency.
        consistency: Consistency,
        /// Replicas that acknowledged.
        received: i32,
        /// Replicas needed.
        required: i32,
        /// Kind of write.
        write_type: WriteType,
    },

    /// Replicas failed a read for another reason than a timeout.
    #[error(
        "Read failed at {consistency}: {received} of {required} replicas answered, \
        {numfailures} failed (data present: {data_present})"
    )]
    ReadFailure {
        /// Requested consistency.
        consistency: Consistency,
        /// Replicas that answered.
        received: i32,
        /// Replicas needed.
        required: i32,
        /// Replicas that failed.
        numfailures: i32,
        /// Whether the replica asked for the data answered.
        data_present: bool,
    },

    /// Replicas failed a write for another reason than a timeout.
    #[error(
        "Write of type {write_type} failed at {consistency}: {received} of {required} \
        replicas acknowledged, {numfailures} failed"
    )]
    WriteFailure {
        /// Requested consistency.
        consistency: Consistency,
        /// Replicas that acknowledged.
        received: i32,
        /// Replicas needed.
        required: i32,
        /// Replicas that failed.
        numfailures: i32,
        /// Kind of write.
        write_type: WriteType,
    },

    /// The coordinator does not know the prepared statement id, e.g.
    /// because it restarted. The statement has to be prepared again.
    #[error("Statement is not prepared on this node")]
    Unprepared {
        /// The unknown id.
        statement_id: Bytes,
    },

    /// A bug on the server side.
    #[error("Internal server error")]
    ServerError,

    /// The server could not make sense of a frame.
    #[error("Protocol error")]
    ProtocolError,

    /// An error code this crate does not know.
    #[error("Unknown error code {0:#06x}")]
    Other(i32),
}

impl DbError {
    /// Numeric error code, as sent on the wire.
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => code::SERVER_ERROR,
            DbError::ProtocolError => code::PROTOCOL_ERROR,
            DbError::AuthenticationError => code::BAD_CREDENTIALS,
            DbError::Unavailable { .. } => code::UNAVAILABLE,
            DbError::Overloaded => code::OVERLOADED,
            DbError::IsBootstrapping => code::IS_BOOTSTRAPPING,
            DbError::TruncateError => code::TRUNCATE_ERROR,
            DbError::WriteTimeout { .. } => code::WRITE_TIMEOUT,
            DbError::ReadTimeout { .. } => code::READ_TIMEOUT,
            DbError::ReadFailure { .. } => code::READ_FAILURE,
            DbError::FunctionFailure { .. } => code::FUNCTION_FAILURE,
            DbError::WriteFailure { .. } => code::WRITE_FAILURE,
            DbError::SyntaxError => code::SYNTAX_ERROR,
            DbError::Unauthorized => code::UNAUTHORIZED,
            DbError::Invalid => code::INVALID,
            DbError::ConfigError => code::CONFIG_ERROR,
            DbError::AlreadyExists { .. } => code::ALREADY_EXISTS,
            DbError::Unprepared { .. } => code::UNPREPARED,
            DbError::Other(code) => *code,
        }
    }
}

/// The kind of write that timed out or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    /// A single, non-counter write.
    Simple,
    /// A logged batch whose batch log write succeeded.
    Batch,
    /// An unlogged batch.
    UnloggedBatch,
    /// A counter update.
    Counter,
    /// The batch log write of a logged batch.
    BatchLog,
    /// The Paxos phase of a conditional update.
    Cas,
    /// A materialized view update.
    View,
    /// A write to CDC-tracked data that exceeded the CDC space.
    Cdc,
    /// A write type this crate does not know.
    Other(String),
}

const WRITE_TYPES: [(WriteType, &str); 8] = [
    (WriteType::Simple, "SIMPLE"),
    (WriteType::Batch, "BATCH"),
    (WriteType::UnloggedBatch, "UNLOGGED_BATCH"),
    (WriteType::Counter, "COUNTER"),
    (WriteType::BatchLog, "BATCH_LOG"),
    (WriteType::Cas, "CAS"),
    (WriteType::View, "VIEW"),
    (WriteType::Cdc, "CDC"),
];

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for WriteType {
    fn from(name: &str) -> WriteType {
        WRITE_TYPES
            .iter()
            .find(|(_, known)| *known == name)
            .map_or_else(|| WriteType::Other(name.to_owned()), |(write_type, _)| write_type.clone())
    }
}

impl WriteType {
    /// Name of the write type as sent on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Other(name) => name,
            known => WRITE_TYPES
                .iter()
                .find(|(write_type, _)| write_type == known)
                .map_or("", |(_, name)| *name),
        }
    }
}
