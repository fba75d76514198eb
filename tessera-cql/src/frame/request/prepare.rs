use std::borrow::Cow;

use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

use super::{CqlRequestSerializationError, DeserializableRequest, RequestDeserializationError};

/// Asks the node to parse and cache a statement. The reply carries the
/// id used by `EXECUTE` and the types of its bind markers.
#[derive(Debug, PartialEq, Eq)]
pub struct Prepare<'a> {
    /// Statement text.
    pub query: Cow<'a, str>,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(types::write_long_string(&self.query, buf)?)
    }
}

impl DeserializableRequest for Prepare<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let text = types::read_long_string(buf)?;
        Ok(Prepare {
            query: Cow::Owned(text.to_owned()),
        })
    }
}
