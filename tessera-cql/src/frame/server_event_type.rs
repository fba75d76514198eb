//! Names of the event classes a connection can register for.

use std::fmt;
use std::str::FromStr;

use super::frame_errors::CqlEventParseError;

/// A class of server-pushed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Nodes joining, leaving or moving.
    TopologyChange,
    /// Nodes going up or down.
    StatusChange,
    /// DDL applied anywhere in the cluster.
    SchemaChange,
}

impl EventType {
    /// Every class, in registration order.
    pub const ALL: [EventType; 3] = [
        EventType::TopologyChange,
        EventType::StatusChange,
        EventType::SchemaChange,
    ];

    /// Wire name of the class.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CqlEventParseError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|class| class.as_str() == name)
            .ok_or_else(|| CqlEventParseError::UnknownEventType(name.to_owned()))
    }
}
