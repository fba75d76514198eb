//! Notations of section 3 of the v4 protocol: the primitives every frame
//! body is built from.
//!
//! Readers advance a `&mut &[u8]` past what they consumed; writers append to
//! any [`BufMut`]. Lengths that do not fit their on-wire width are reported
//! as [`TryFromIntError`] instead of being truncated.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::num::TryFromIntError;

use bytes::{BufMut, Bytes};
use thiserror::Error;
use uuid::Uuid;

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;

/// Consistency level of a request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    LocalOne = 0x000A,

    // Only valid for reads, which then go through Paxos.
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

const CONSISTENCIES: [Consistency; 11] = [
    Consistency::Any,
    Consistency::One,
    Consistency::Two,
    Consistency::Three,
    Consistency::Quorum,
    Consistency::All,
    Consistency::LocalQuorum,
    Consistency::EachQuorum,
    Consistency::Serial,
    Consistency::LocalSerial,
    Consistency::LocalOne,
];

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        CONSISTENCIES
            .into_iter()
            .find(|consistency| *consistency as u16 == code)
            .ok_or(TryFromPrimitiveError {
                enum_name: "Consistency",
                primitive: code,
            })
    }
}

/// Consistency level used for the Paxos phase of conditional statements.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = 0x0008,
    LocalSerial = 0x0009,
}

impl Consistency {
    /// Whether this is one of the serial levels.
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }

    /// Whether only replicas in the coordinator's datacenter take part.
    pub fn is_dc_local(&self) -> bool {
        matches!(
            self,
            Consistency::LocalOne | Consistency::LocalQuorum | Consistency::LocalSerial
        )
    }
}

impl From<SerialConsistency> for Consistency {
    fn from(sc: SerialConsistency) -> Self {
        match sc {
            SerialConsistency::Serial => Consistency::Serial,
            SerialConsistency::LocalSerial => Consistency::LocalSerial,
        }
    }
}

/// Returned when a non-serial [`Consistency`] is converted into a [`SerialConsistency`].
#[derive(Debug, Error, Clone)]
#[error("{0} is not a serial consistency")]
pub struct NonSerialConsistencyError(Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            other => Err(NonSerialConsistencyError(other)),
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Splits `count` bytes off the front of `buf`.
pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (taken, rest) = buf.split_at(count);
    *buf = rest;
    Ok(taken)
}

fn read_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], LowLevelDeserializationError> {
    let mut array = [0u8; N];
    array.copy_from_slice(read_raw_bytes(N, buf)?);
    Ok(array)
}

/// `[int]`
pub fn read_int(buf: &mut &[u8]) -> Result<i32, LowLevelDeserializationError> {
    read_array(buf).map(i32::from_be_bytes)
}

/// `[int]`
pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

/// `[int]` used as a length or count; negative values are rejected.
pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(usize::try_from(read_int(buf)?)?)
}

pub(crate) fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int(i32::try_from(v)?, buf);
    Ok(())
}

/// `[long]`
pub fn read_long(buf: &mut &[u8]) -> Result<i64, LowLevelDeserializationError> {
    read_array(buf).map(i64::from_be_bytes)
}

/// `[long]`
pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

/// `[short]`, which the protocol defines as unsigned.
pub fn read_short(buf: &mut &[u8]) -> Result<u16, LowLevelDeserializationError> {
    read_array(buf).map(u16::from_be_bytes)
}

/// `[short]`
pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

fn read_short_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    read_short(buf).map(usize::from)
}

fn write_short_length(v: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short(u16::try_from(v)?, buf);
    Ok(())
}

/// `[bytes]`; a negative length means null.
pub fn read_bytes_opt<'a>(buf: &mut &'a [u8]) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    match usize::try_from(read_int(buf)?) {
        Ok(len) => read_raw_bytes(len, buf).map(Some),
        Err(_) => Ok(None),
    }
}

/// `[bytes]` which must not be null.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

/// `[short bytes]`
pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

/// `[bytes]`
pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

/// `[bytes]`, writing `None` as null.
pub fn write_bytes_opt(v: Option<impl AsRef<[u8]>>, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

/// `[short bytes]`
pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

/// `[string]`
pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    Ok(std::str::from_utf8(read_short_bytes(buf)?)?)
}

/// `[string]`
pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_bytes(v.as_bytes(), buf)
}

/// `[long string]`
pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    Ok(std::str::from_utf8(read_bytes(buf)?)?)
}

/// `[long string]`
pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_bytes(v.as_bytes(), buf)
}

// `[short n]` followed by n elements.
fn read_short_counted<T>(
    buf: &mut &[u8],
    mut read_element: impl FnMut(&mut &[u8]) -> Result<T, LowLevelDeserializationError>,
) -> Result<Vec<T>, LowLevelDeserializationError> {
    let count = read_short_length(buf)?;
    // The count comes from the peer; do not trust it for the allocation.
    let mut elements = Vec::with_capacity(count.min(buf.len()));
    for _ in 0..count {
        elements.push(read_element(buf)?);
    }
    Ok(elements)
}

/// `[string list]`
pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    read_short_counted(buf, |buf| read_string(buf).map(str::to_owned))
}

/// `[string list]`
pub fn write_string_list(v: &[String], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    v.iter().try_for_each(|s| write_string(s, buf))
}

/// `[string map]`
pub fn read_string_map(buf: &mut &[u8]) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let entries = read_short_counted(buf, |buf| {
        Ok((read_string(buf)?.to_owned(), read_string(buf)?.to_owned()))
    })?;
    Ok(entries.into_iter().collect())
}

/// `[string map]`
pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    v.iter().try_for_each(|(key, val)| {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)
    })
}

/// `[string multimap]`, as sent in `SUPPORTED`.
pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let entries = read_short_counted(buf, |buf| {
        Ok((read_string(buf)?.to_owned(), read_string_list(buf)?))
    })?;
    Ok(entries.into_iter().collect())
}

/// `[string multimap]`
pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    v.iter().try_for_each(|(key, values)| {
        write_string(key, buf)?;
        write_string_list(values, buf)
    })
}

/// `[bytes map]`, as used by custom payloads.
pub fn read_bytes_map(buf: &mut &[u8]) -> Result<HashMap<String, Bytes>, LowLevelDeserializationError> {
    let entries = read_short_counted(buf, |buf| {
        Ok((
            read_string(buf)?.to_owned(),
            Bytes::copy_from_slice(read_bytes(buf)?),
        ))
    })?;
    Ok(entries.into_iter().collect())
}

/// `[uuid]`
pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    read_array(buf).map(Uuid::from_bytes)
}

/// `[uuid]`
pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(uuid.as_bytes());
}

/// `[consistency]`
pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    Ok(Consistency::try_from(read_short(buf)?)?)
}

/// `[consistency]`
pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

/// `[consistency]` restricted to the serial levels.
pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_consistency(c.into(), buf);
}

/// `[inet]`: one length byte, the address, then the port as `[int]`.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let [len] = read_array::<1>(buf)?;
    let ip = match len {
        4 => IpAddr::from(read_array::<4>(buf)?),
        16 => IpAddr::from(read_array::<16>(buf)?),
        other => return Err(LowLevelDeserializationError::InvalidInetLength(other)),
    };
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

/// `[inet]`
pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(16);
            buf.put_slice(&ip.octets());
        }
    }
    write_int(i32::from(addr.port()), buf)
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn every_consistency_code_is_known() {
        for consistency in CONSISTENCIES {
            let mut buf = Vec::new();
            write_consistency(consistency, &mut buf);
            assert_eq!(read_consistency(&mut &buf[..]).unwrap(), consistency);
        }

        let err = read_consistency(&mut &[0x12u8, 0x34][..]).unwrap_err();
        assert_matches!(err, LowLevelDeserializationError::UnknownConsistency(_));
        assert!(err.to_string().contains("4660"));
    }

    #[test]
    fn serial_consistency_conversion() {
        assert_eq!(
            SerialConsistency::try_from(Consistency::LocalSerial).unwrap(),
            SerialConsistency::LocalSerial
        );
        assert!(SerialConsistency::try_from(Consistency::Quorum).is_err());
        assert_eq!(Consistency::from(SerialConsistency::Serial), Consistency::Serial);
        assert!(Consistency::LocalOne.is_dc_local());
        assert!(!Consistency::Quorum.is_dc_local());
    }

    #[test]
    fn inet_of_both_families() {
        for addr in [
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1234),
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 2345),
        ] {
            let mut buf = Vec::new();
            write_inet(addr, &mut buf);
            assert_eq!(read_inet(&mut &buf[..]).unwrap(), addr);
        }
    }

    #[test]
    fn truncated_inet_is_an_error() {
        assert_matches!(
            read_inet(&mut &[4u8, 127, 0][..]),
            Err(LowLevelDeserializationError::TooFewBytesReceived {
                expected: 4,
                received: 2
            })
        );
        assert_matches!(
            read_inet(&mut &[5u8, 1, 2, 3, 4, 5][..]),
            Err(LowLevelDeserializationError::InvalidInetLength(5))
        );
    }

    #[test]
    fn string_map_preserves_startup_options() {
        let options = HashMap::from([
            ("CQL_VERSION".to_owned(), "4.0.0".to_owned()),
            ("COMPRESSION".to_owned(), "lz4".to_owned()),
        ]);
        let mut buf = Vec::new();
        write_string_map(&options, &mut buf).unwrap();
        assert_eq!(read_string_map(&mut &buf[..]).unwrap(), options);
    }

    #[test]
    fn null_bytes_are_none() {
        let mut buf = Vec::new();
        write_bytes_opt(None::<&[u8]>, &mut buf).unwrap();
        write_bytes_opt(Some(&[1u8, 2][..]), &mut buf).unwrap();

        let mut slice = &buf[..];
        assert_eq!(read_bytes_opt(&mut slice).unwrap(), None);
        assert_eq!(read_bytes_opt(&mut slice).unwrap(), Some(&[1u8, 2][..]));
        assert!(slice.is_empty());
    }

    #[test]
    fn lengths_are_checked() {
        assert_matches!(
            read_short_bytes(&mut &[0u8, 10, 1, 2][..]),
            Err(LowLevelDeserializationError::TooFewBytesReceived {
                expected: 10,
                received: 2
            })
        );
        // A huge element count must fail on the missing data, not allocate.
        assert_matches!(
            read_string_list(&mut &[0xffu8, 0xff][..]),
            Err(LowLevelDeserializationError::TooFewBytesReceived { .. })
        );
        assert_matches!(
            read_int_length(&mut &(-1i32).to_be_bytes()[..]),
            Err(LowLevelDeserializationError::TryFromIntError(_))
        );
    }
}
