//! Errors returned by the driver.
//!
//! Errors are layered the same way the driver is: a single request attempt
//! fails with a [`RequestAttemptError`], a connection dies with a
//! [`BrokenConnectionError`], and the caller of [`Session`](crate::client::session::Session)
//! operations sees an [`ExecutionError`] which, when every candidate host was
//! tried, aggregates the per-host causes.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tessera_cql::frame::frame_errors::{
    CqlErrorParseError, CqlResponseParseError, CqlResultParseError, FrameBodyExtensionsParseError,
    FrameHeaderParseError,
};
use tessera_cql::frame::request::CqlRequestSerializationError;
pub use tessera_cql::frame::response::error::{DbError, WriteType};
use tessera_cql::value::{DeserializeValueError, SerializeValueError};
use thiserror::Error;

use crate::authentication::AuthError;

/// Error returned to the caller of a statement execution.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The load balancing policy produced no candidate host.
    #[error("Load balancing policy returned an empty plan")]
    EmptyPlan,

    /// The database answered with an error that was not retried.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Caller passed an invalid statement or values.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Every candidate host was tried and none succeeded.
    #[error(transparent)]
    Aggregate(#[from] AggregateExecutionError),

    /// A single attempt failed and the retry policy decided not to retry.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// Failed to prepare a statement.
    #[error(transparent)]
    PrepareError(#[from] PrepareError),

    /// Failed to change the keyspace.
    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),

    /// Schema agreement failed.
    #[error(transparent)]
    SchemaAgreementError(#[from] SchemaAgreementError),

    /// Metadata refresh failed.
    #[error(transparent)]
    MetadataError(#[from] MetadataError),

    /// The session has been shut down.
    #[error("Session has been shut down")]
    SessionShutDown,
}

/// Failure of every host in a query plan.
///
/// Lists the attempted hosts in the order they were tried, each with the
/// error its last attempt ended with.
#[derive(Error, Debug, Clone)]
pub struct AggregateExecutionError {
    /// Attempted hosts with their causes, in plan order.
    pub attempts: Vec<(SocketAddr, RequestAttemptError)>,
}

impl AggregateExecutionError {
    /// Addresses of the attempted hosts, in plan order.
    pub fn hosts(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.attempts.iter().map(|(addr, _)| *addr)
    }
}

impl fmt::Display for AggregateExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "All {} attempted hosts failed:", self.attempts.len())?;
        for (addr, err) in &self.attempts {
            write!(f, " [{}: {}]", addr, err)?;
        }
        Ok(())
    }
}

/// Error caused by the caller passing invalid input.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    /// Bound values could not be serialized.
    #[error("Serializing values failed: {0}")]
    SerializeValuesError(#[from] SerializeValueError),

    /// The request could not be serialized into a frame.
    #[error("Serializing request failed: {0}")]
    SerializationError(#[from] CqlRequestSerializationError),

    /// Partition key value is missing.
    #[error("Partition key component at index {0} is null or missing")]
    PartitionKeyMissing(usize),

    /// A partition key component exceeds the routing key length limit.
    #[error("Partition key component at index {index} is {len} bytes long, max is 65535")]
    ValuesTooLongForKey {
        /// Index of the bind marker.
        index: usize,
        /// Length of the serialized component.
        len: usize,
    },

    /// Invalid keyspace name.
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),
}

/// Invalid keyspace name given to `USE`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BadKeyspaceName {
    /// Keyspace name is empty.
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters.
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character, only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// Failure of a single attempt of a request on a single host.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// No connection to the host could be obtained.
    #[error("Host is unavailable: {0}")]
    HostUnavailable(#[from] ConnectionPoolError),

    /// Connection broke while the request was pending.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// All stream ids of the connection are in use.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// The attempt did not complete in time.
    #[error("Request attempt timed out after {0:?}")]
    Timeout(Duration),

    /// The database answered with an error.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Received a RESULT server response, but failed to deserialize it.
    #[error(transparent)]
    CqlResultParseError(#[from] CqlResultParseError),

    /// Received an ERROR server response, but failed to deserialize it.
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(#[from] CqlErrorParseError),

    /// Received a response of a kind that does not answer the request.
    #[error("Received unexpected response from the server: {0}. Expected RESULT or ERROR response.")]
    UnexpectedResponse(&'static str),

    /// Failed to serialize the request.
    #[error("Failed to serialize request: {0}")]
    SerializationError(#[from] CqlRequestSerializationError),

    /// Response body extensions were malformed.
    #[error("Failed to deserialize frame body extensions: {0}")]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    /// A host prepared the statement with metadata different from the
    /// metadata the statement was first prepared with.
    #[error("Statement prepared on this host has different metadata than before")]
    PreparedMetadataMismatch,
}

impl RequestAttemptError {
    /// Whether the request may not have reached the server at all.
    pub(crate) fn happened_before_write(&self) -> bool {
        matches!(
            self,
            RequestAttemptError::HostUnavailable(_)
                | RequestAttemptError::UnableToAllocStreamId
                | RequestAttemptError::SerializationError(_)
        )
    }
}

impl From<CqlResponseParseError> for RequestAttemptError {
    fn from(err: CqlResponseParseError) -> Self {
        match err {
            CqlResponseParseError::CqlErrorParseError(e) => e.into(),
            CqlResponseParseError::CqlResultParseError(e) => e.into(),
            _ => RequestAttemptError::UnexpectedResponse("malformed non-result response"),
        }
    }
}

impl From<tessera_cql::frame::response::Error> for RequestAttemptError {
    fn from(err: tessera_cql::frame::response::Error) -> Self {
        RequestAttemptError::DbError(err.error, err.reason)
    }
}

/// Error that breaks a connection and fails every request pending on it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BrokenConnectionError {
    /// Writing to the socket failed.
    #[error("Failed to write a frame: {0}")]
    WriteError(Arc<std::io::Error>),

    /// Reading or parsing a frame header failed.
    #[error("Failed to read a frame: {0}")]
    ReadError(Arc<FrameHeaderParseError>),

    /// Too many requests timed out without their stream ids being released.
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    /// Keepalive request was not answered in time.
    #[error("Timed out while waiting for response to keepalive request on connection to node {0}")]
    KeepaliveTimeout(SocketAddr),

    /// Keepalive request failed.
    #[error("Failed to execute keepalive request: {0}")]
    KeepaliveRequestError(Arc<RequestAttemptError>),

    /// Server answered on a stream id no request was using.
    #[error("Received response with unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    /// Internal channel to the connection's router closed.
    #[error("Connection's router has stopped")]
    ChannelError,

    /// The session was shut down.
    #[error("Session has been shut down")]
    SessionShutDown,

    /// The host was removed from the cluster.
    #[error("Host has been removed from the cluster")]
    HostRemoved,

    /// The host was reported down.
    #[error("Host has been marked down")]
    HostDown,

    /// The pool dropped an idle connection.
    #[error("Connection closed as idle")]
    Idle,
}

/// Error that occurred while opening a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Connecting did not finish in time.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error has occurred.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// Database error during the handshake.
    #[error("Database returned an error during connection setup: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthenticationError(AuthError),

    /// Server requires authentication and no authenticator is configured.
    #[error("Server requires authentication ({0}) but no authenticator was configured")]
    MissingAuthentication(String),

    /// Connection broke during the handshake.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// A request sent during the handshake failed.
    #[error("Handshake request failed: {0}")]
    RequestError(#[from] RequestAttemptError),

    /// Server answered a handshake request with something unexpected.
    #[error("Unexpected response during connection setup: {0}")]
    UnexpectedResponse(&'static str),

    /// Setting the keyspace on a fresh connection failed.
    #[error("Failed to set keyspace on a new connection: {0}")]
    UseKeyspace(#[from] Arc<UseKeyspaceError>),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

/// The host's connection pool could not provide a connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// Every connection failed and the pool is waiting to reconnect.
    #[error("The pool is broken; Last connection failed with: {last_connection_error}")]
    Broken {
        /// Error the last connection attempt failed with.
        last_connection_error: Arc<ConnectionError>,
    },

    /// The pool has not opened its first connection yet.
    #[error("Pool is still being initialized")]
    Initializing,

    /// The host is marked down.
    #[error("Pool is suspended because the host is down")]
    Suspended,

    /// Every connection is saturated and the pool is at its maximum size.
    #[error("All {0} connections of the pool are saturated")]
    Saturated(usize),

    /// The session has been shut down.
    #[error("Pool has been shut down")]
    ShutDown,
}

/// Error returned by [`Session::prepare`](crate::client::session::Session::prepare).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PrepareError {
    /// No host could be used to prepare.
    #[error("No host was available to prepare the statement")]
    NoHostAvailable,

    /// Every host failed to prepare.
    #[error("Preparation failed on every host: {0}")]
    AllAttemptsFailed(AggregateExecutionError),

    /// Hosts disagree on the statement's metadata.
    #[error("Prepared statement metadata differs between hosts")]
    MetadataMismatch,

    /// The session has been shut down.
    #[error("Session has been shut down")]
    SessionShutDown,
}

/// Error returned by [`Session::use_keyspace`](crate::client::session::Session::use_keyspace).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    /// Invalid keyspace name.
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The `USE` request failed.
    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    /// Server acknowledged a different keyspace than requested.
    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        /// Requested name.
        expected_keyspace_name_lowercase: String,
        /// Acknowledged name.
        result_keyspace_name_lowercase: String,
    },

    /// Server answered with an unexpected response.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(&'static str),

    /// No connection accepted the change.
    #[error("Could not set keyspace on any connection: {0}")]
    NoWorkingConnection(String),

    /// The session has been shut down.
    #[error("Session has been shut down")]
    SessionShutDown,
}

/// Error returned while waiting for schema agreement.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SchemaAgreementError {
    /// The control connection is not working.
    #[error("Control connection is not available")]
    ControlConnectionUnavailable,

    /// Querying schema versions failed.
    #[error("Failed to fetch schema versions: {0}")]
    RequestError(#[from] RequestAttemptError),

    /// A system table row could not be read.
    #[error("Malformed schema version row: {0}")]
    MalformedRow(#[from] MetadataError),

    /// Versions did not converge in time.
    #[error("Schema agreement timed out after {0:?}")]
    Timeout(Duration),
}

/// Error that occurred while reading cluster metadata.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    /// Querying a system table failed.
    #[error("Failed to query {table}: {error}")]
    Query {
        /// The system table.
        table: &'static str,
        /// The cause.
        error: RequestAttemptError,
    },

    /// A system table row has an unexpected shape.
    #[error("Malformed row in {table}: {reason}")]
    MalformedRow {
        /// The system table.
        table: &'static str,
        /// What was wrong.
        reason: String,
    },

    /// A cell could not be decoded.
    #[error("Failed to decode a cell of {table}: {error}")]
    Deserialize {
        /// The system table.
        table: &'static str,
        /// The cause.
        error: DeserializeValueError,
    },

    /// No contact point could be reached.
    #[error("Could not connect to any contact point; last error: {0}")]
    NoControlConnection(ConnectionError),

    /// The cluster worker has stopped.
    #[error("Cluster worker has stopped")]
    WorkerStopped,
}

/// Error returned by [`SessionBuilder::build`](crate::client::session_builder::SessionBuilder::build).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// No contact points were given.
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// None of the hostnames resolved.
    #[error("Failed to resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// Initial metadata could not be fetched from any contact point.
    #[error(transparent)]
    MetadataError(#[from] MetadataError),

    /// The configured keyspace could not be used.
    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),

    /// The configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}
