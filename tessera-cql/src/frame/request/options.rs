use crate::frame::request::{RequestOpcode, SerializableRequest};

use super::CqlRequestSerializationError;

/// Asks which `STARTUP` options the node supports. The body is empty,
/// which also makes it the keepalive request.
pub struct Options;

impl SerializableRequest for Options {
    const OPCODE: RequestOpcode = RequestOpcode::Options;

    fn serialize(&self, _buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        Ok(())
    }
}

// `STARTUP` keys, also listed by `SUPPORTED`.

/// Compression algorithm for every later frame.
pub const COMPRESSION: &str = "COMPRESSION";
/// Version of the query language; mandatory.
pub const CQL_VERSION: &str = "CQL_VERSION";
/// Client identification shown by the server.
pub const DRIVER_NAME: &str = "DRIVER_NAME";
/// Client version shown by the server.
pub const DRIVER_VERSION: &str = "DRIVER_VERSION";

/// Value sent for [`CQL_VERSION`].
pub const DEFAULT_CQL_PROTOCOL_VERSION: &str = "4.0.0";
/// Value sent for [`DRIVER_NAME`].
pub const DEFAULT_DRIVER_NAME: &str = "tessera";
