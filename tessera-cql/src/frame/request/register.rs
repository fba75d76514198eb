use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::server_event_type::EventType;
use crate::frame::types;

use super::{CqlRequestSerializationError, DeserializableRequest, RequestDeserializationError};

/// Subscribes the connection to event classes. Events then arrive on
/// stream id -1 for as long as the connection lives.
#[derive(Debug)]
pub struct Register {
    /// Classes to subscribe to.
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        let names: Vec<String> = self
            .event_types_to_register_for
            .iter()
            .map(|class| class.as_str().to_owned())
            .collect();
        Ok(types::write_string_list(&names, buf)?)
    }
}

impl DeserializableRequest for Register {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let mut event_types_to_register_for = Vec::new();
        for name in types::read_string_list(buf)? {
            match name.parse() {
                Ok(class) => event_types_to_register_for.push(class),
                Err(_) => return Err(RequestDeserializationError::UnknownEventType(name)),
            }
        }
        Ok(Register {
            event_types_to_register_for,
        })
    }
}
