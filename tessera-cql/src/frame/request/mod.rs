//! Request bodies.
//!
//! The driver only ever serializes requests. Deserialization exists for
//! in-process test nodes that need to see what was sent.

pub mod auth_response;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use bytes::Bytes;
use thiserror::Error;

pub use auth_response::AuthResponse;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::{Query, QueryParameters};
pub use register::Register;
pub use startup::Startup;

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;
use crate::Consistency;

/// Opcodes of the requests this crate knows.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RequestOpcode {
    /// `STARTUP`
    Startup = 0x01,
    /// `OPTIONS`
    Options = 0x05,
    /// `QUERY`
    Query = 0x07,
    /// `PREPARE`
    Prepare = 0x09,
    /// `EXECUTE`
    Execute = 0x0A,
    /// `REGISTER`
    Register = 0x0B,
    /// `AUTH_RESPONSE`
    AuthResponse = 0x0F,
}

const REQUEST_OPCODES: [(RequestOpcode, &str); 7] = [
    (RequestOpcode::Startup, "STARTUP"),
    (RequestOpcode::Options, "OPTIONS"),
    (RequestOpcode::Query, "QUERY"),
    (RequestOpcode::Prepare, "PREPARE"),
    (RequestOpcode::Execute, "EXECUTE"),
    (RequestOpcode::Register, "REGISTER"),
    (RequestOpcode::AuthResponse, "AUTH_RESPONSE"),
];

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        REQUEST_OPCODES
            .iter()
            .map(|(opcode, _)| *opcode)
            .find(|opcode| *opcode as u8 == value)
            .ok_or(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            })
    }
}

impl std::fmt::Display for RequestOpcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = REQUEST_OPCODES
            .iter()
            .find(|(opcode, _)| opcode == self)
            .map_or("?", |(_, name)| *name);
        f.write_str(name)
    }
}

/// A request body that can be put in a frame.
pub trait SerializableRequest {
    /// Opcode written to the frame header.
    const OPCODE: RequestOpcode;

    /// Appends the body to `buf`.
    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError>;

    /// Serializes the body into a fresh buffer.
    fn to_bytes(&self) -> Result<Bytes, CqlRequestSerializationError> {
        let mut body = Vec::new();
        self.serialize(&mut body)?;
        Ok(Bytes::from(body))
    }
}

/// A request body that can be read back.
pub trait DeserializableRequest: SerializableRequest + Sized {
    /// Reads the body from the front of `buf`.
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError>;
}

/// Failure to build a request frame.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum CqlRequestSerializationError {
    /// A string, byte sequence or collection does not fit its length prefix.
    #[error("Request field does not fit its length prefix: {0}")]
    FieldTooLong(#[from] std::num::TryFromIntError),

    /// Snappy failed to compress the body.
    #[error("Snappy compression failed")]
    SnapCompressError,
}

/// Failure to read a request body.
#[non_exhaustive]
#[derive(Debug, Error, Clone)]
pub enum RequestDeserializationError {
    /// A primitive was truncated or malformed.
    #[error("Malformed request body: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    /// Flags announcing fields this crate does not read.
    #[error("Unsupported query flags: {flags:#04x}")]
    UnknownFlags {
        /// The offending bits.
        flags: u8,
    },
    /// Values were bound by name.
    #[error("Values bound by name are not supported")]
    NamedValuesUnsupported,
    /// The serial consistency field held a non-serial level.
    #[error("{0} is not a serial consistency")]
    ExpectedSerialConsistency(Consistency),
    /// `REGISTER` named an unknown event class.
    #[error("Unknown event class: {0}")]
    UnknownEventType(String),
}

/// Any request, as read by the receiving side.
#[derive(Debug)]
#[non_exhaustive]
pub enum Request<'r> {
    /// `STARTUP`
    Startup(Startup<'r>),
    /// `OPTIONS`
    Options,
    /// `QUERY`
    Query(Query<'r>),
    /// `PREPARE`
    Prepare(Prepare<'r>),
    /// `EXECUTE`
    Execute(Execute<'r>),
    /// `REGISTER`
    Register(Register),
    /// `AUTH_RESPONSE`
    AuthResponse(AuthResponse),
}

impl Request<'_> {
    /// Reads a body of the given opcode.
    pub fn deserialize(
        buf: &mut &[u8],
        opcode: RequestOpcode,
    ) -> Result<Self, RequestDeserializationError> {
        Ok(match opcode {
            RequestOpcode::Options => Request::Options,
            RequestOpcode::Startup => Request::Startup(Startup::deserialize(buf)?),
            RequestOpcode::Query => Request::Query(Query::deserialize(buf)?),
            RequestOpcode::Prepare => Request::Prepare(Prepare::deserialize(buf)?),
            RequestOpcode::Execute => Request::Execute(Execute::deserialize(buf)?),
            RequestOpcode::Register => Request::Register(Register::deserialize(buf)?),
            RequestOpcode::AuthResponse => Request::AuthResponse(AuthResponse::deserialize(buf)?),
        })
    }

    /// Consistency requested by a `QUERY` or `EXECUTE`.
    pub fn get_consistency(&self) -> Option<Consistency> {
        match self {
            Request::Query(query) => Some(query.parameters.consistency),
            Request::Execute(execute) => Some(execute.parameters.consistency),
            _ => None,
        }
    }
}
