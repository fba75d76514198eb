//! This module holds entities that represent the whole configurable
//! driver session with the cluster.
//! The following abstractions are involved:
//! - [Session](session::Session) - the main entity of the driver. It:
//!   - contains and manages all driver configuration,
//!   - launches and communicates with the background worker keeping the topology current,
//!   - executes CQL requests, taking all configuration into consideration.
//! - [SessionBuilder](session_builder::SessionBuilder) - just a convenient builder for a `Session`.

pub mod session;

pub mod session_builder;

pub(crate) mod execution;
pub(crate) mod statement_cache;

pub use tessera_cql::frame::Compression;
