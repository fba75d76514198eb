//! CQL column types and the subset of values the driver encodes and decodes itself.
//!
//! Cells travel as `[int length][bytes]`, with a negative length meaning null.
//! [`CqlValue::serialize`] and [`deser_cql_value`] deal with the bytes only;
//! the length prefix is handled by [`SerializedValues`] and the rows parser.

use crate::frame::frame_errors::{CqlTypeParseError, LowLevelDeserializationError};
use crate::frame::types;
use bytes::BufMut;
use chrono::{DateTime, TimeZone, Utc};
use std::net::IpAddr;
use std::num::TryFromIntError;
use thiserror::Error;
use uuid::Uuid;

/// A CQL type as described by result and prepared metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    Boolean,
    Blob,
    Counter,
    Date,
    Decimal,
    Double,
    Duration,
    Float,
    Int,
    BigInt,
    Text,
    Timestamp,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    UserDefinedType {
        keyspace: String,
        type_name: String,
        field_types: Vec<(String, ColumnType)>,
    },
    SmallInt,
    TinyInt,
    Time,
    Timeuuid,
    Tuple(Vec<ColumnType>),
    Uuid,
    Varint,
}

/// A decoded (or to-be-encoded) CQL value.
///
/// Decimal, varint, duration and UDT values are not modelled; reading them
/// yields [`DeserializeValueError::Unsupported`].
#[derive(Clone, Debug, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(i64),
    /// Days since -5877641-06-23, i.e. 2^31 is the unix epoch.
    Date(u32),
    Double(f64),
    Float(f32),
    Int(i32),
    BigInt(i64),
    Text(String),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    Tuple(Vec<Option<CqlValue>>),
    Uuid(Uuid),
    Timeuuid(Uuid),
    SmallInt(i16),
    TinyInt(i8),
    /// Nanoseconds since midnight.
    Time(i64),
    /// A non-null value with zero bytes, legal for most non-text types.
    Empty,
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SerializeValueError {
    #[error("Value {value} cannot be serialized as {typ:?}")]
    TypeMismatch { value: &'static str, typ: ColumnType },
    #[error("Value too large to be sent: {0}")]
    TooLarge(#[from] TryFromIntError),
    #[error("Too many values, at most {max} can be bound to a statement", max = u16::MAX)]
    TooManyValues,
    #[error("Statement expects {expected} values, got {got}")]
    WrongValueCount { expected: usize, got: usize },
    #[error("Values of type {typ:?} are not supported by this driver")]
    Unsupported { typ: ColumnType },
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum DeserializeValueError {
    #[error("Expected {expected} bytes for {typ:?}, got {got}")]
    BadLength {
        typ: ColumnType,
        expected: usize,
        got: usize,
    },
    #[error(transparent)]
    LowLevel(#[from] LowLevelDeserializationError),
    #[error("Ascii value contains non-ascii bytes")]
    NonAscii,
    #[error("Null element inside a {0:?} value")]
    NullElement(ColumnType),
    #[error("Values of type {typ:?} are not supported by this driver")]
    Unsupported { typ: ColumnType },
}

impl ColumnType {
    /// Parses an `[option]` type description.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlTypeParseError> {
        use ColumnType::*;
        let id = types::read_short(buf)
            .map_err(|err| CqlTypeParseError::TypeIdParseError(err.into()))?;
        Ok(match id {
            0x0000 => {
                let type_str =
                    types::read_string(buf).map_err(CqlTypeParseError::CustomTypeNameParseError)?;
                match type_str {
                    "org.apache.cassandra.db.marshal.DurationType" => Duration,
                    _ => Custom(type_str.to_owned()),
                }
            }
            0x0001 => Ascii,
            0x0002 => BigInt,
            0x0003 => Blob,
            0x0004 => Boolean,
            0x0005 => Counter,
            0x0006 => Decimal,
            0x0007 => Double,
            0x0008 => Float,
            0x0009 => Int,
            0x000B => Timestamp,
            0x000C => Uuid,
            0x000D => Text,
            0x000E => Varint,
            0x000F => Timeuuid,
            0x0010 => Inet,
            0x0011 => Date,
            0x0012 => Time,
            0x0013 => SmallInt,
            0x0014 => TinyInt,
            0x0015 => Duration,
            0x0020 => List(Box::new(Self::deserialize(buf)?)),
            0x0021 => Map(
                Box::new(Self::deserialize(buf)?),
                Box::new(Self::deserialize(buf)?),
            ),
            0x0022 => Set(Box::new(Self::deserialize(buf)?)),
            0x0030 => {
                let keyspace = types::read_string(buf)
                    .map_err(CqlTypeParseError::UdtKeyspaceNameParseError)?
                    .to_owned();
                let type_name = types::read_string(buf)
                    .map_err(CqlTypeParseError::UdtNameParseError)?
                    .to_owned();
                let fields_size: usize = types::read_short(buf)
                    .map_err(|err| CqlTypeParseError::UdtFieldsCountParseError(err.into()))?
                    .into();

                let mut field_types = Vec::with_capacity(fields_size);
                for _ in 0..fields_size {
                    let field_name = types::read_string(buf)
                        .map_err(CqlTypeParseError::UdtFieldNameParseError)?
                        .to_owned();
                    field_types.push((field_name, Self::deserialize(buf)?));
                }

                UserDefinedType {
                    keyspace,
                    type_name,
                    field_types,
                }
            }
            0x0031 => {
                let len: usize = types::read_short(buf)
                    .map_err(|err| CqlTypeParseError::TupleLengthParseError(err.into()))?
                    .into();
                let mut types = Vec::with_capacity(len);
                for _ in 0..len {
                    types.push(Self::deserialize(buf)?);
                }
                Tuple(types)
            }
            id => return Err(CqlTypeParseError::TypeNotImplemented(id)),
        })
    }

    /// Writes the `[option]` type description.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
        use ColumnType::*;
        let id: u16 = match self {
            Custom(_) => 0x0000,
            Ascii => 0x0001,
            BigInt => 0x0002,
            Blob => 0x0003,
            Boolean => 0x0004,
            Counter => 0x0005,
            Decimal => 0x0006,
            Double => 0x0007,
            Float => 0x0008,
            Int => 0x0009,
            Timestamp => 0x000B,
            Uuid => 0x000C,
            Text => 0x000D,
            Varint => 0x000E,
            Timeuuid => 0x000F,
            Inet => 0x0010,
            Date => 0x0011,
            Time => 0x0012,
            SmallInt => 0x0013,
            TinyInt => 0x0014,
            Duration => 0x0015,
            List(_) => 0x0020,
            Map(_, _) => 0x0021,
            Set(_) => 0x0022,
            UserDefinedType { .. } => 0x0030,
            Tuple(_) => 0x0031,
        };
        types::write_short(id, buf);
        match self {
            Custom(name) => types::write_string(name, buf)?,
            List(elem) | Set(elem) => elem.serialize(buf)?,
            Map(key, value) => {
                key.serialize(buf)?;
                value.serialize(buf)?;
            }
            UserDefinedType {
                keyspace,
                type_name,
                field_types,
            } => {
                types::write_string(keyspace, buf)?;
                types::write_string(type_name, buf)?;
                types::write_short(field_types.len().try_into()?, buf);
                for (name, typ) in field_types {
                    types::write_string(name, buf)?;
                    typ.serialize(buf)?;
                }
            }
            Tuple(elems) => {
                types::write_short(elems.len().try_into()?, buf);
                for typ in elems {
                    typ.serialize(buf)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn fixed_size(&self) -> Option<usize> {
        use ColumnType::*;
        match self {
            Boolean | TinyInt => Some(1),
            SmallInt => Some(2),
            Int | Float | Date => Some(4),
            BigInt | Counter | Double | Timestamp | Time => Some(8),
            Uuid | Timeuuid => Some(16),
            _ => None,
        }
    }
}

impl CqlValue {
    fn kind(&self) -> &'static str {
        match self {
            CqlValue::Ascii(_) => "ascii",
            CqlValue::Boolean(_) => "boolean",
            CqlValue::Blob(_) => "blob",
            CqlValue::Counter(_) => "counter",
            CqlValue::Date(_) => "date",
            CqlValue::Double(_) => "double",
            CqlValue::Float(_) => "float",
            CqlValue::Int(_) => "int",
            CqlValue::BigInt(_) => "bigint",
            CqlValue::Text(_) => "text",
            CqlValue::Timestamp(_) => "timestamp",
            CqlValue::Inet(_) => "inet",
            CqlValue::List(_) => "list",
            CqlValue::Map(_) => "map",
            CqlValue::Set(_) => "set",
            CqlValue::Tuple(_) => "tuple",
            CqlValue::Uuid(_) => "uuid",
            CqlValue::Timeuuid(_) => "timeuuid",
            CqlValue::SmallInt(_) => "smallint",
            CqlValue::TinyInt(_) => "tinyint",
            CqlValue::Time(_) => "time",
            CqlValue::Empty => "empty",
        }
    }

    /// The column type a value maps to when no metadata is available.
    ///
    /// Element types of empty collections are irrelevant on the wire and come out as blob.
    pub fn natural_type(&self) -> ColumnType {
        fn elem_type(elems: &[CqlValue]) -> ColumnType {
            elems
                .first()
                .map(CqlValue::natural_type)
                .unwrap_or(ColumnType::Blob)
        }

        match self {
            CqlValue::Ascii(_) => ColumnType::Ascii,
            CqlValue::Boolean(_) => ColumnType::Boolean,
            CqlValue::Blob(_) | CqlValue::Empty => ColumnType::Blob,
            CqlValue::Counter(_) => ColumnType::Counter,
            CqlValue::Date(_) => ColumnType::Date,
            CqlValue::Double(_) => ColumnType::Double,
            CqlValue::Float(_) => ColumnType::Float,
            CqlValue::Int(_) => ColumnType::Int,
            CqlValue::BigInt(_) => ColumnType::BigInt,
            CqlValue::Text(_) => ColumnType::Text,
            CqlValue::Timestamp(_) => ColumnType::Timestamp,
            CqlValue::Inet(_) => ColumnType::Inet,
            CqlValue::List(elems) => ColumnType::List(Box::new(elem_type(elems))),
            CqlValue::Set(elems) => ColumnType::Set(Box::new(elem_type(elems))),
            CqlValue::Map(entries) => match entries.first() {
                Some((k, v)) => {
                    ColumnType::Map(Box::new(k.natural_type()), Box::new(v.natural_type()))
                }
                None => ColumnType::Map(Box::new(ColumnType::Blob), Box::new(ColumnType::Blob)),
            },
            CqlValue::Tuple(elems) => ColumnType::Tuple(
                elems
                    .iter()
                    .map(|e| e.as_ref().map_or(ColumnType::Blob, CqlValue::natural_type))
                    .collect(),
            ),
            CqlValue::Uuid(_) => ColumnType::Uuid,
            CqlValue::Timeuuid(_) => ColumnType::Timeuuid,
            CqlValue::SmallInt(_) => ColumnType::SmallInt,
            CqlValue::TinyInt(_) => ColumnType::TinyInt,
            CqlValue::Time(_) => ColumnType::Time,
        }
    }

    /// Appends the value's bytes, without the length prefix, checking it against `typ`.
    pub fn serialize(&self, typ: &ColumnType, buf: &mut Vec<u8>) -> Result<(), SerializeValueError> {
        let mismatch = || SerializeValueError::TypeMismatch {
            value: self.kind(),
            typ: typ.clone(),
        };

        match (self, typ) {
            (CqlValue::Empty, ColumnType::Ascii | ColumnType::Text | ColumnType::Blob) => {
                return Err(mismatch())
            }
            (CqlValue::Empty, _) => {}
            (CqlValue::Ascii(s) | CqlValue::Text(s), ColumnType::Ascii) if s.is_ascii() => {
                buf.put_slice(s.as_bytes())
            }
            (CqlValue::Ascii(s) | CqlValue::Text(s), ColumnType::Text) => {
                buf.put_slice(s.as_bytes())
            }
            (CqlValue::Blob(b), ColumnType::Blob) => buf.put_slice(b),
            (CqlValue::Boolean(b), ColumnType::Boolean) => buf.put_u8(u8::from(*b)),
            (CqlValue::TinyInt(v), ColumnType::TinyInt) => buf.put_i8(*v),
            (CqlValue::SmallInt(v), ColumnType::SmallInt) => buf.put_i16(*v),
            (CqlValue::Int(v), ColumnType::Int) => buf.put_i32(*v),
            (CqlValue::Date(v), ColumnType::Date) => buf.put_u32(*v),
            (CqlValue::BigInt(v), ColumnType::BigInt)
            | (CqlValue::Counter(v), ColumnType::Counter)
            | (CqlValue::Timestamp(v), ColumnType::Timestamp)
            | (CqlValue::Time(v), ColumnType::Time) => buf.put_i64(*v),
            (CqlValue::Float(v), ColumnType::Float) => buf.put_f32(*v),
            (CqlValue::Double(v), ColumnType::Double) => buf.put_f64(*v),
            (CqlValue::Uuid(v), ColumnType::Uuid) | (CqlValue::Timeuuid(v), ColumnType::Timeuuid) => {
                buf.put_slice(v.as_bytes())
            }
            (CqlValue::Inet(IpAddr::V4(ip)), ColumnType::Inet) => buf.put_slice(&ip.octets()),
            (CqlValue::Inet(IpAddr::V6(ip)), ColumnType::Inet) => buf.put_slice(&ip.octets()),
            (CqlValue::List(elems), ColumnType::List(elem_typ))
            | (CqlValue::Set(elems), ColumnType::Set(elem_typ)) => {
                types::write_int_length(elems.len(), buf)?;
                for elem in elems {
                    write_cell(Some(elem), elem_typ, buf)?;
                }
            }
            (CqlValue::Map(entries), ColumnType::Map(key_typ, value_typ)) => {
                types::write_int_length(entries.len(), buf)?;
                for (key, value) in entries {
                    write_cell(Some(key), key_typ, buf)?;
                    write_cell(Some(value), value_typ, buf)?;
                }
            }
            (CqlValue::Tuple(elems), ColumnType::Tuple(elem_types))
                if elems.len() == elem_types.len() =>
            {
                for (elem, elem_typ) in elems.iter().zip(elem_types) {
                    write_cell(elem.as_ref(), elem_typ, buf)?;
                }
            }
            (
                _,
                ColumnType::Custom(_)
                | ColumnType::Decimal
                | ColumnType::Varint
                | ColumnType::Duration
                | ColumnType::UserDefinedType { .. },
            ) => return Err(SerializeValueError::Unsupported { typ: typ.clone() }),
            _ => return Err(mismatch()),
        }
        Ok(())
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    /// Converts a timestamp value into a UTC datetime.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(millis) => Utc.timestamp_millis_opt(*millis).single(),
            _ => None,
        }
    }

    /// Elements of a list or a set.
    pub fn as_collection(&self) -> Option<&[CqlValue]> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(CqlValue, CqlValue)]> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl<Tz: TimeZone> From<DateTime<Tz>> for CqlValue {
    fn from(value: DateTime<Tz>) -> Self {
        CqlValue::Timestamp(value.timestamp_millis())
    }
}

impl From<i32> for CqlValue {
    fn from(value: i32) -> Self {
        CqlValue::Int(value)
    }
}

impl From<i64> for CqlValue {
    fn from(value: i64) -> Self {
        CqlValue::BigInt(value)
    }
}

impl From<bool> for CqlValue {
    fn from(value: bool) -> Self {
        CqlValue::Boolean(value)
    }
}

impl From<&str> for CqlValue {
    fn from(value: &str) -> Self {
        CqlValue::Text(value.to_owned())
    }
}

impl From<String> for CqlValue {
    fn from(value: String) -> Self {
        CqlValue::Text(value)
    }
}

impl From<Uuid> for CqlValue {
    fn from(value: Uuid) -> Self {
        CqlValue::Uuid(value)
    }
}

impl From<IpAddr> for CqlValue {
    fn from(value: IpAddr) -> Self {
        CqlValue::Inet(value)
    }
}

fn write_cell(
    value: Option<&CqlValue>,
    typ: &ColumnType,
    buf: &mut Vec<u8>,
) -> Result<(), SerializeValueError> {
    let Some(value) = value else {
        buf.put_i32(-1);
        return Ok(());
    };
    let len_pos = buf.len();
    buf.put_i32(0);
    if let Err(err) = value.serialize(typ, buf) {
        buf.truncate(len_pos);
        return Err(err);
    }
    let written: i32 = (buf.len() - len_pos - 4).try_into()?;
    buf[len_pos..len_pos + 4].copy_from_slice(&written.to_be_bytes());
    Ok(())
}

/// Decodes the bytes of a non-null cell of type `typ`.
pub fn deser_cql_value(
    typ: &ColumnType,
    buf: &mut &[u8],
) -> Result<CqlValue, DeserializeValueError> {
    use ColumnType::*;

    if buf.is_empty() && !matches!(typ, Ascii | Blob | Text) {
        return Ok(CqlValue::Empty);
    }

    if let Some(expected) = typ.fixed_size() {
        if buf.len() != expected {
            return Err(DeserializeValueError::BadLength {
                typ: typ.clone(),
                expected,
                got: buf.len(),
            });
        }
    }

    let whole = std::mem::take(buf);
    Ok(match typ {
        Ascii => {
            if !whole.is_ascii() {
                return Err(DeserializeValueError::NonAscii);
            }
            CqlValue::Ascii(utf8(whole)?)
        }
        Text => CqlValue::Text(utf8(whole)?),
        Blob => CqlValue::Blob(whole.to_vec()),
        Boolean => CqlValue::Boolean(whole[0] != 0),
        TinyInt => CqlValue::TinyInt(i8::from_be_bytes([whole[0]])),
        SmallInt => CqlValue::SmallInt(i16::from_be_bytes(fixed(whole))),
        Int => CqlValue::Int(i32::from_be_bytes(fixed(whole))),
        Date => CqlValue::Date(u32::from_be_bytes(fixed(whole))),
        Float => CqlValue::Float(f32::from_be_bytes(fixed(whole))),
        BigInt => CqlValue::BigInt(i64::from_be_bytes(fixed(whole))),
        Counter => CqlValue::Counter(i64::from_be_bytes(fixed(whole))),
        Timestamp => CqlValue::Timestamp(i64::from_be_bytes(fixed(whole))),
        Time => CqlValue::Time(i64::from_be_bytes(fixed(whole))),
        Double => CqlValue::Double(f64::from_be_bytes(fixed(whole))),
        Uuid => CqlValue::Uuid(uuid::Uuid::from_bytes(fixed(whole))),
        Timeuuid => CqlValue::Timeuuid(uuid::Uuid::from_bytes(fixed(whole))),
        Inet => match whole.len() {
            4 => CqlValue::Inet(IpAddr::from(fixed::<4>(whole))),
            16 => CqlValue::Inet(IpAddr::from(fixed::<16>(whole))),
            len => {
                return Err(DeserializeValueError::BadLength {
                    typ: typ.clone(),
                    expected: 4,
                    got: len,
                })
            }
        },
        List(elem_typ) | Set(elem_typ) => {
            let mut rest = whole;
            let count = types::read_int_length(&mut rest)?;
            let mut elems = Vec::with_capacity(count.min(rest.len()));
            for _ in 0..count {
                elems.push(read_non_null_cell(elem_typ, typ, &mut rest)?);
            }
            if matches!(typ, List(_)) {
                CqlValue::List(elems)
            } else {
                CqlValue::Set(elems)
            }
        }
        Map(key_typ, value_typ) => {
            let mut rest = whole;
            let count = types::read_int_length(&mut rest)?;
            let mut entries = Vec::with_capacity(count.min(rest.len()));
            for _ in 0..count {
                let key = read_non_null_cell(key_typ, typ, &mut rest)?;
                let value = read_non_null_cell(value_typ, typ, &mut rest)?;
                entries.push((key, value));
            }
            CqlValue::Map(entries)
        }
        Tuple(elem_types) => {
            let mut rest = whole;
            let mut elems = Vec::with_capacity(elem_types.len());
            for elem_typ in elem_types {
                // Trailing elements may be missing entirely.
                if rest.is_empty() {
                    elems.push(None);
                    continue;
                }
                elems.push(
                    types::read_bytes_opt(&mut rest)?
                        .map(|mut cell| deser_cql_value(elem_typ, &mut cell))
                        .transpose()?,
                );
            }
            CqlValue::Tuple(elems)
        }
        Custom(_) | Decimal | Varint | Duration | UserDefinedType { .. } => {
            return Err(DeserializeValueError::Unsupported { typ: typ.clone() })
        }
    })
}

fn read_non_null_cell(
    typ: &ColumnType,
    parent: &ColumnType,
    buf: &mut &[u8],
) -> Result<CqlValue, DeserializeValueError> {
    match types::read_bytes_opt(buf)? {
        Some(mut cell) => deser_cql_value(typ, &mut cell),
        None => Err(DeserializeValueError::NullElement(parent.clone())),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, LowLevelDeserializationError> {
    Ok(std::str::from_utf8(bytes)?.to_owned())
}

// Callers check the length beforehand.
fn fixed<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Values bound to a single statement, already serialized.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
}

impl SerializedValues {
    /// Creates empty value list
    pub const fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            element_count: 0,
        }
    }

    /// A const empty instance, useful for taking references
    pub const EMPTY: &'static SerializedValues = &SerializedValues::new();

    /// Serializes `val` as `typ` and appends it to the list.
    pub fn add_value(&mut self, val: &CqlValue, typ: &ColumnType) -> Result<(), SerializeValueError> {
        self.push(Some(val), typ)
    }

    /// Appends a null.
    pub fn add_null(&mut self) -> Result<(), SerializeValueError> {
        self.push(None, &ColumnType::Blob)
    }

    fn push(&mut self, val: Option<&CqlValue>, typ: &ColumnType) -> Result<(), SerializeValueError> {
        if self.element_count == u16::MAX {
            return Err(SerializeValueError::TooManyValues);
        }
        write_cell(val, typ, &mut self.serialized_values)?;
        self.element_count += 1;
        Ok(())
    }

    /// Serializes values for a statement without metadata; each value is
    /// written as its natural type.
    pub fn from_untyped(values: &BoundValues) -> Result<Self, SerializeValueError> {
        let mut serialized = Self::new();
        for value in &values.0 {
            match value {
                Some(v) => serialized.add_value(v, &v.natural_type())?,
                None => serialized.add_null()?,
            }
        }
        Ok(serialized)
    }

    /// Serializes values for a prepared statement whose bind markers have `types`.
    pub fn from_typed<'t>(
        values: &BoundValues,
        types: impl ExactSizeIterator<Item = &'t ColumnType>,
    ) -> Result<Self, SerializeValueError> {
        if values.0.len() != types.len() {
            return Err(SerializeValueError::WrongValueCount {
                expected: types.len(),
                got: values.0.len(),
            });
        }
        let mut serialized = Self::new();
        for (value, typ) in values.0.iter().zip(types) {
            serialized.push(value.as_ref(), typ)?;
        }
        Ok(serialized)
    }

    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    pub fn len(&self) -> u16 {
        self.element_count
    }

    /// Raw cells, `None` standing for null.
    pub fn iter(&self) -> impl Iterator<Item = Option<&[u8]>> {
        SerializedValuesIterator {
            serialized_values: &self.serialized_values,
        }
    }

    pub fn write_to_request(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.element_count);
        buf.put(&self.serialized_values[..])
    }

    /// Reads `[short n][n x bytes]` as found in QUERY and EXECUTE bodies.
    pub fn new_from_frame(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let element_count = types::read_short(buf)?;
        let start: &[u8] = *buf;
        for _ in 0..element_count {
            types::read_bytes_opt(buf)?;
        }
        let serialized_values = start[..start.len() - buf.len()].to_vec();
        Ok(SerializedValues {
            serialized_values,
            element_count,
        })
    }
}

struct SerializedValuesIterator<'a> {
    serialized_values: &'a [u8],
}

impl<'a> Iterator for SerializedValuesIterator<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.serialized_values.is_empty() {
            return None;
        }
        // Only well-formed buffers are ever built.
        types::read_bytes_opt(&mut self.serialized_values).ok()
    }
}

/// Positional values supplied by the caller, `None` binding a null.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BoundValues(pub Vec<Option<CqlValue>>);

impl BoundValues {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CqlValue> {
        self.0.get(index).and_then(Option::as_ref)
    }
}

impl From<()> for BoundValues {
    fn from(_: ()) -> Self {
        BoundValues::default()
    }
}

impl From<Vec<CqlValue>> for BoundValues {
    fn from(values: Vec<CqlValue>) -> Self {
        BoundValues(values.into_iter().map(Some).collect())
    }
}

impl From<Vec<Option<CqlValue>>> for BoundValues {
    fn from(values: Vec<Option<CqlValue>>) -> Self {
        BoundValues(values)
    }
}

impl<const N: usize> From<[CqlValue; N]> for BoundValues {
    fn from(values: [CqlValue; N]) -> Self {
        BoundValues(values.into_iter().map(Some).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn cell(value: &CqlValue, typ: &ColumnType) -> Vec<u8> {
        let mut buf = Vec::new();
        value.serialize(typ, &mut buf).unwrap();
        buf
    }

    #[test]
    fn fixed_width_values() {
        assert_eq!(cell(&CqlValue::Int(2137), &ColumnType::Int), 2137_i32.to_be_bytes());
        assert_eq!(
            deser_cql_value(&ColumnType::Double, &mut &2.0_f64.to_be_bytes()[..]).unwrap(),
            CqlValue::Double(2.0)
        );
        assert_matches!(
            deser_cql_value(&ColumnType::Int, &mut &[0u8, 1, 2][..]),
            Err(DeserializeValueError::BadLength { expected: 4, got: 3, .. })
        );
    }

    #[test]
    fn empty_cell_is_empty_value_except_for_text_and_blob() {
        assert_eq!(
            deser_cql_value(&ColumnType::Int, &mut &[][..]).unwrap(),
            CqlValue::Empty
        );
        assert_eq!(
            deser_cql_value(&ColumnType::Text, &mut &[][..]).unwrap(),
            CqlValue::Text(String::new())
        );
    }

    #[test]
    fn ascii_rejects_non_ascii() {
        assert_matches!(
            deser_cql_value(&ColumnType::Ascii, &mut "zażółć".as_bytes()),
            Err(DeserializeValueError::NonAscii)
        );
        let mut buf = Vec::new();
        assert_matches!(
            CqlValue::Text("zażółć".into()).serialize(&ColumnType::Ascii, &mut buf),
            Err(SerializeValueError::TypeMismatch { .. })
        );
    }

    #[test]
    fn nested_collections() {
        let typ = ColumnType::Map(
            Box::new(ColumnType::Text),
            Box::new(ColumnType::List(Box::new(ColumnType::Int))),
        );
        let value = CqlValue::Map(vec![
            (
                CqlValue::Text("a".into()),
                CqlValue::List(vec![CqlValue::Int(1), CqlValue::Int(2)]),
            ),
            (CqlValue::Text("b".into()), CqlValue::List(vec![])),
        ]);
        let bytes = cell(&value, &typ);
        assert_eq!(deser_cql_value(&typ, &mut &bytes[..]).unwrap(), value);
    }

    #[test]
    fn tuple_with_null_and_missing_trailing_elements() {
        let typ = ColumnType::Tuple(vec![ColumnType::Int, ColumnType::Text, ColumnType::Boolean]);
        let mut bytes = Vec::new();
        bytes.extend(4_i32.to_be_bytes());
        bytes.extend(7_i32.to_be_bytes());
        bytes.extend((-1_i32).to_be_bytes());

        assert_eq!(
            deser_cql_value(&typ, &mut &bytes[..]).unwrap(),
            CqlValue::Tuple(vec![Some(CqlValue::Int(7)), None, None])
        );
    }

    #[test]
    fn timestamp_to_chrono() {
        let dt = Utc.with_ymd_and_hms(2021, 3, 24, 12, 0, 0).unwrap();
        let value = CqlValue::from(dt);
        assert_eq!(value, CqlValue::Timestamp(1_616_587_200_000));
        assert_eq!(value.as_datetime(), Some(dt));
    }

    #[test]
    fn unsupported_types_are_reported() {
        assert_matches!(
            deser_cql_value(&ColumnType::Varint, &mut &[1u8][..]),
            Err(DeserializeValueError::Unsupported { typ: ColumnType::Varint })
        );
    }

    #[test]
    fn column_type_description_parses_back() {
        let typ = ColumnType::UserDefinedType {
            keyspace: "ks".into(),
            type_name: "address".into(),
            field_types: vec![
                ("street".into(), ColumnType::Text),
                (
                    "tags".into(),
                    ColumnType::Set(Box::new(ColumnType::Tuple(vec![
                        ColumnType::Uuid,
                        ColumnType::Inet,
                    ]))),
                ),
            ],
        };
        let mut buf = Vec::new();
        typ.serialize(&mut buf).unwrap();
        assert_eq!(ColumnType::deserialize(&mut &buf[..]).unwrap(), typ);
    }

    #[test]
    fn serialized_values_typed_and_untyped() {
        let values = BoundValues(vec![Some(CqlValue::Int(5)), None]);
        let untyped = SerializedValues::from_untyped(&values).unwrap();
        assert_eq!(untyped.len(), 2);
        assert_eq!(
            untyped.iter().collect::<Vec<_>>(),
            vec![Some(&5_i32.to_be_bytes()[..]), None]
        );

        let types = [ColumnType::BigInt, ColumnType::Text];
        assert_matches!(
            SerializedValues::from_typed(&values, types.iter()),
            Err(SerializeValueError::TypeMismatch { value: "int", .. })
        );
        assert_matches!(
            SerializedValues::from_typed(&values, types[..1].iter()),
            Err(SerializeValueError::WrongValueCount { expected: 1, got: 2 })
        );

        let mut request = Vec::new();
        untyped.write_to_request(&mut request);
        let parsed = SerializedValues::new_from_frame(&mut &request[..]).unwrap();
        assert_eq!(parsed, untyped);
    }
}
