use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types;

use super::{CqlRequestSerializationError, DeserializableRequest, RequestDeserializationError};

/// Answer to `AUTHENTICATE` or to a later `AUTH_CHALLENGE`.
#[derive(Debug)]
pub struct AuthResponse {
    /// SASL token. `None` is sent as a null `[bytes]`.
    pub response: Option<Vec<u8>>,
}

impl SerializableRequest for AuthResponse {
    const OPCODE: RequestOpcode = RequestOpcode::AuthResponse;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(types::write_bytes_opt(self.response.as_deref(), buf)?)
    }
}

impl DeserializableRequest for AuthResponse {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        Ok(AuthResponse {
            response: types::read_bytes_opt(buf)?.map(<[u8]>::to_vec),
        })
    }
}
