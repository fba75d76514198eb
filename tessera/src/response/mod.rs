//! This module holds entities that represent responses to requests
//! sent to the cluster by the driver.

pub mod query_result;

pub use query_result::QueryResult;
