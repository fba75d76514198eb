//! This module holds entities that represent the cluster as a whole,
//! nodes in the cluster (together with a pool of connections),
//! the cluster's state, and the background worker keeping it current.
//!
//! This includes:
//! - node's representation ([Node]) and its liveness ([NodeState]),
//! - [metadata] representation and fetching: topology and keyspace replication,
//! - [ClusterState], which is a snapshot of the cluster's state.
//!   - [ClusterState] is replaced atomically upon every change,
//!     so a snapshot handed to a request never changes under it.
//  - the control connection, which is the single connection used
//    to fetch metadata and receive events from the cluster.

mod worker;
pub(crate) use worker::{Cluster, ClusterConfig};

mod state;
pub use state::ClusterState;

pub(crate) mod node;
pub use node::{KnownNode, Node, NodeRef, NodeState};

mod control_connection;
mod metadata_reader;

pub mod metadata;
