//! Async Rust driver core for databases speaking the CQL binary protocol (v4).
//!
//! # Driver overview
//! ### Connecting
//! All driver activity revolves around the [Session]\
//! `Session` is created by specifying a few known nodes and connecting to them.
//! The rest of the cluster is discovered from the `system.peers` table and
//! kept current by a control connection listening for server events.
//!
//! ```rust,no_run
//! use tessera::{Session, SessionBuilder};
//! use std::error::Error;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!    let session: Session = SessionBuilder::new()
//!         .known_node("127.0.0.1:9042")
//!         .known_node("1.2.3.4:9876")
//!         .local_datacenter("dc1")
//!         .build()
//!         .await?;
//!
//!    Ok(())
//! }
//! ```
//! `Session` is usually created using the [SessionBuilder].\
//! All configuration options for a `Session` can be specified while building.
//!
//! ### Making queries
//! After successfully connecting to the cluster we can make queries.\
//! The driver supports two statement types:
//! * [Simple](crate::Session::query_unpaged)
//! * [Prepared](crate::Session::execute_unpaged) (need to be [prepared](crate::Session::prepare) before use)
//!
//! To specify options for a single statement create the statement object and configure it:
//! * For simple: [Statement](crate::statement::unprepared::Statement)
//! * For prepared: [PreparedStatement](crate::statement::prepared::PreparedStatement)
//!
//! Prepared statements are routed to a replica of the partition they touch,
//! computed from the bound values.
//!
//! ```rust
//! # use tessera::Session;
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! use tessera_cql::value::CqlValue;
//!
//! let prepared = session
//!     .prepare("INSERT INTO ks.tab (a, b) VALUES(?, ?)")
//!     .await?;
//! session
//!     .execute_unpaged(&prepared, [CqlValue::Int(2), CqlValue::Text("some text".to_owned())])
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Receiving results
//! A [QueryResult] holds the raw rows of a single response together with
//! their column specifications:
//!
//! ```rust
//! # use tessera::Session;
//! # use std::error::Error;
//! # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
//! let result = session.query_unpaged("SELECT a, b FROM ks.tab", ()).await?;
//!
//! for row in result.decode_rows()? {
//!     println!("{:?}", row);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Shutting down
//! [Session::shutdown] closes every connection and stops the background
//! worker; requests issued afterwards fail immediately.

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

pub(crate) mod network;
pub(crate) mod utils;

pub use client::session::{Session, SessionConfig};
pub use client::session_builder::SessionBuilder;
pub use response::QueryResult;
pub use statement::prepared::PreparedStatement;
pub use statement::unprepared::Statement;
pub use tessera_cql::{Consistency, SerialConsistency};
