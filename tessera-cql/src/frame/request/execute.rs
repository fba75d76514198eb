//! `EXECUTE` body.

use bytes::Bytes;

use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

use super::{
    CqlRequestSerializationError, DeserializableRequest, QueryParameters,
    RequestDeserializationError,
};

/// Runs a statement prepared earlier on the same node.
#[derive(Debug, PartialEq, Eq)]
pub struct Execute<'a> {
    /// Id returned by `PREPARE`.
    pub id: Bytes,
    /// Consistency and bound values.
    pub parameters: QueryParameters<'a>,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_short_bytes(&self.id, buf)?;
        self.parameters.serialize(buf)
    }
}

impl DeserializableRequest for Execute<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        Ok(Execute {
            id: Bytes::copy_from_slice(types::read_short_bytes(buf)?),
            parameters: QueryParameters::deserialize(buf)?,
        })
    }
}
