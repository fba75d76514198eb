//! `QUERY` body and the parameter block it shares with `EXECUTE`.

use std::borrow::Cow;

use bytes::BufMut;

use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::types::{self, Consistency, SerialConsistency};
use crate::value::SerializedValues;

use super::{CqlRequestSerializationError, DeserializableRequest, RequestDeserializationError};

/// Bits of the `<flags>` byte.
mod flag {
    pub(super) const VALUES: u8 = 0x01;
    pub(super) const SERIAL_CONSISTENCY: u8 = 0x10;
    pub(super) const NAMES_FOR_VALUES: u8 = 0x40;

    /// Flags this crate writes itself and can therefore read back.
    pub(super) const UNDERSTOOD: u8 = VALUES | SERIAL_CONSISTENCY;
}

/// Runs an unprepared statement.
#[derive(Debug, PartialEq, Eq)]
pub struct Query<'q> {
    /// Statement text.
    pub contents: Cow<'q, str>,
    /// Consistency and bound values.
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(buf)
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        Ok(Query {
            contents: Cow::Owned(types::read_long_string(buf)?.to_owned()),
            parameters: QueryParameters::deserialize(buf)?,
        })
    }
}

/// The `<query_parameters>` block of `QUERY` and `EXECUTE`.
///
/// Results are always requested whole: no page size, paging state or
/// client timestamp is ever sent.
#[derive(Debug, PartialEq, Eq, Default)]
pub struct QueryParameters<'a> {
    /// Consistency the coordinator must reach.
    pub consistency: Consistency,
    /// Consistency of the Paxos phase of a conditional statement.
    pub serial_consistency: Option<SerialConsistency>,
    /// Bound values, serialized in marker order.
    pub values: Cow<'a, SerializedValues>,
}

impl QueryParameters<'_> {
    fn flags(&self) -> u8 {
        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= flag::VALUES;
        }
        if self.serial_consistency.is_some() {
            flags |= flag::SERIAL_CONSISTENCY;
        }
        flags
    }

    /// Writes the block to `buf`.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), CqlRequestSerializationError> {
        types::write_consistency(self.consistency, buf);
        let flags = self.flags();
        buf.put_u8(flags);
        if flags & flag::VALUES != 0 {
            self.values.write_to_request(buf);
        }
        if let Some(serial) = self.serial_consistency {
            types::write_serial_consistency(serial, buf);
        }
        Ok(())
    }

    /// Reads a block written by [`QueryParameters::serialize`].
    ///
    /// Any flag this crate does not write itself is rejected, since the
    /// fields it announces would be silently misread otherwise.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;
        let flags = types::read_raw_bytes(1, buf)?[0];

        if flags & flag::NAMES_FOR_VALUES != 0 {
            return Err(RequestDeserializationError::NamedValuesUnsupported);
        }
        let rejected = flags & !flag::UNDERSTOOD;
        if rejected != 0 {
            return Err(RequestDeserializationError::UnknownFlags { flags: rejected });
        }

        let values = if flags & flag::VALUES != 0 {
            SerializedValues::new_from_frame(buf)?
        } else {
            SerializedValues::new()
        };

        let serial_consistency = if flags & flag::SERIAL_CONSISTENCY != 0 {
            let read = types::read_consistency(buf)?;
            let serial = SerialConsistency::try_from(read)
                .map_err(|_| RequestDeserializationError::ExpectedSerialConsistency(read))?;
            Some(serial)
        } else {
            None
        };

        Ok(QueryParameters {
            consistency,
            serial_consistency,
            values: Cow::Owned(values),
        })
    }
}
