//! CQL protocol-level representation of an `EVENT` response.
//!
//! Events arrive on stream `-1` of a connection that sent `REGISTER`.

use crate::frame::frame_errors::{
    ClusterChangeEventParseError, CqlEventParseError, SchemaChangeEventParseError,
};
use crate::frame::request::CqlRequestSerializationError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use std::net::SocketAddr;

/// Event that the server notified the client about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Topology(TopologyChangeEvent),
    Status(StatusChangeEvent),
    Schema(SchemaChangeEvent),
}

/// A node joined or left the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

/// The server observed a node going up or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

/// Kind of change made to a schema element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

impl SchemaChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaChangeType::Created => "CREATED",
            SchemaChangeType::Updated => "UPDATED",
            SchemaChangeType::Dropped => "DROPPED",
        }
    }
}

/// Schema element affected by a change. The keyspace lives in [`SchemaChangeEvent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table { name: String },
    Type { name: String },
    Function { name: String, arguments: Vec<String> },
    Aggregate { name: String, arguments: Vec<String> },
}

/// A schema element was created, altered or dropped.
///
/// The same layout is carried by `RESULT` responses of kind `SchemaChange`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChangeEvent {
    pub change_type: SchemaChangeType,
    pub keyspace: String,
    pub target: SchemaChangeTarget,
}

impl Event {
    /// Deserialize an event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::EventTypeParseError)?
            .parse()?;
        match event_type {
            EventType::TopologyChange => Ok(Self::Topology(
                TopologyChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::TopologyChangeEventParseError)?,
            )),
            EventType::StatusChange => Ok(Self::Status(
                StatusChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::StatusChangeEventParseError)?,
            )),
            EventType::SchemaChange => Ok(Self::Schema(SchemaChangeEvent::deserialize(buf)?)),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Event::Topology(_) => EventType::TopologyChange,
            Event::Status(_) => EventType::StatusChange,
            Event::Schema(_) => EventType::SchemaChange,
        }
    }

    /// Writes the event body, as a server would push it.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_string(&self.event_type().to_string(), buf)?;
        match self {
            Event::Topology(TopologyChangeEvent::NewNode(addr)) => {
                types::write_string("NEW_NODE", buf)?;
                types::write_inet(*addr, buf);
            }
            Event::Topology(TopologyChangeEvent::RemovedNode(addr)) => {
                types::write_string("REMOVED_NODE", buf)?;
                types::write_inet(*addr, buf);
            }
            Event::Status(StatusChangeEvent::Up(addr)) => {
                types::write_string("UP", buf)?;
                types::write_inet(*addr, buf);
            }
            Event::Status(StatusChangeEvent::Down(addr)) => {
                types::write_string("DOWN", buf)?;
                types::write_inet(*addr, buf);
            }
            Event::Schema(schema_change) => schema_change.serialize(buf)?,
        }
        Ok(())
    }
}

fn read_arguments(buf: &mut &[u8]) -> Result<Vec<String>, SchemaChangeEventParseError> {
    let count = types::read_short(buf)
        .map_err(|err| SchemaChangeEventParseError::ArgumentCountParseError(err.into()))?;
    (0..count)
        .map(|_| {
            types::read_string(buf)
                .map(str::to_owned)
                .map_err(SchemaChangeEventParseError::FunctionArgumentParseError)
        })
        .collect()
}

impl SchemaChangeEvent {
    /// Deserialize a schema change from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, SchemaChangeEventParseError> {
        let change_type =
            match types::read_string(buf).map_err(SchemaChangeEventParseError::TypeOfChangeParseError)? {
                "CREATED" => SchemaChangeType::Created,
                "UPDATED" => SchemaChangeType::Updated,
                "DROPPED" => SchemaChangeType::Dropped,
                other => {
                    return Err(SchemaChangeEventParseError::UnknownTypeOfChange(
                        other.to_owned(),
                    ))
                }
            };

        let target_kind =
            types::read_string(buf).map_err(SchemaChangeEventParseError::TargetTypeParseError)?;
        let keyspace = types::read_string(buf)
            .map_err(SchemaChangeEventParseError::AffectedKeyspaceParseError)?
            .to_owned();

        let read_name = |buf: &mut &[u8]| {
            types::read_string(buf)
                .map(str::to_owned)
                .map_err(SchemaChangeEventParseError::AffectedTargetNameParseError)
        };

        let target = match target_kind {
            "KEYSPACE" => SchemaChangeTarget::Keyspace,
            "TABLE" => SchemaChangeTarget::Table {
                name: read_name(buf)?,
            },
            "TYPE" => SchemaChangeTarget::Type {
                name: read_name(buf)?,
            },
            "FUNCTION" => SchemaChangeTarget::Function {
                name: read_name(buf)?,
                arguments: read_arguments(buf)?,
            },
            "AGGREGATE" => SchemaChangeTarget::Aggregate {
                name: read_name(buf)?,
                arguments: read_arguments(buf)?,
            },
            other => {
                return Err(SchemaChangeEventParseError::UnknownTargetOfSchemaChange(
                    other.to_owned(),
                ))
            }
        };

        Ok(Self {
            change_type,
            keyspace,
            target,
        })
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_string(self.change_type.as_str(), buf)?;
        let kind = match &self.target {
            SchemaChangeTarget::Keyspace => "KEYSPACE",
            SchemaChangeTarget::Table { .. } => "TABLE",
            SchemaChangeTarget::Type { .. } => "TYPE",
            SchemaChangeTarget::Function { .. } => "FUNCTION",
            SchemaChangeTarget::Aggregate { .. } => "AGGREGATE",
        };
        types::write_string(kind, buf)?;
        types::write_string(&self.keyspace, buf)?;
        match &self.target {
            SchemaChangeTarget::Keyspace => {}
            SchemaChangeTarget::Table { name } | SchemaChangeTarget::Type { name } => {
                types::write_string(name, buf)?;
            }
            SchemaChangeTarget::Function { name, arguments }
            | SchemaChangeTarget::Aggregate { name, arguments } => {
                types::write_string(name, buf)?;
                types::write_string_list(arguments, buf)?;
            }
        }
        Ok(())
    }

    /// Name of the table this change touches, if it targets a table.
    pub fn table(&self) -> Option<&str> {
        match &self.target {
            SchemaChangeTarget::Table { name } => Some(name),
            _ => None,
        }
    }
}

impl TopologyChangeEvent {
    /// Deserialize a topology change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }

    pub fn address(&self) -> SocketAddr {
        match self {
            TopologyChangeEvent::NewNode(addr) | TopologyChangeEvent::RemovedNode(addr) => *addr,
        }
    }
}

impl StatusChangeEvent {
    /// Deserialize a status change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }

    pub fn address(&self) -> SocketAddr {
        match self {
            StatusChangeEvent::Up(addr) | StatusChangeEvent::Down(addr) => *addr,
        }
    }
}
