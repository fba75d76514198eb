//! `STARTUP` body.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

use super::{CqlRequestSerializationError, DeserializableRequest, RequestDeserializationError};

/// First request on every connection. The node answers `READY`, or
/// `AUTHENTICATE` when credentials are required.
#[derive(Debug)]
pub struct Startup<'a> {
    /// Chosen options, keyed by the names in [`super::options`].
    pub options: HashMap<Cow<'a, str>, Cow<'a, str>>,
}

impl SerializableRequest for Startup<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(types::write_string_map(&self.options, buf)?)
    }
}

impl DeserializableRequest for Startup<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let mut options = HashMap::new();
        for (key, value) in types::read_string_map(buf)? {
            options.insert(Cow::Owned(key), Cow::Owned(value));
        }
        Ok(Startup { options })
    }
}
