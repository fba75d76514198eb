//! CQL protocol-level types used by the tessera driver.
//!
//! This crate knows how to frame requests, parse responses and server events,
//! and encode or decode the handful of CQL values the driver itself needs.
//! It holds no connection or cluster state.

pub mod frame;
pub mod value;

pub use crate::frame::types::{Consistency, SerialConsistency};
