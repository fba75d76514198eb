//! Plain-text statements.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tessera_cql::{Consistency, SerialConsistency};

use super::{impl_statement_options, StatementConfig};
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;
use crate::routing::partitioner::murmur3_token;
use crate::routing::Token;

/// A statement sent as text on every execution.
///
/// Nothing is known about its bind markers, so values are serialized from
/// their own types and routing is token aware only when the caller supplies
/// a routing key.
///
/// ```
/// # use tessera::statement::{Consistency, Statement};
/// let statement = Statement::new("SELECT v FROM ks.t WHERE k = ?")
///     .with_consistency(Consistency::LocalOne)
///     .with_routing_key(&b"key"[..]);
/// assert!(statement.calculate_token().is_some());
/// ```
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    /// Text of the statement.
    pub contents: String,
    routing_key: Option<Bytes>,
    keyspace: Option<String>,
}

impl_statement_options!(Statement);

impl Statement {
    /// A statement with no overrides.
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            config: StatementConfig::default(),
            contents: contents.into(),
            routing_key: None,
            keyspace: None,
        }
    }

    /// Builder form of [`set_consistency`](Self::set_consistency).
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.set_consistency(consistency);
        self
    }

    /// Sets the serialized partition key the statement is routed by.
    ///
    /// A composite key must already be framed as `[u16 length][bytes][0x00]`
    /// per component.
    pub fn set_routing_key(&mut self, routing_key: Option<Bytes>) {
        self.routing_key = routing_key;
    }

    /// Builder form of [`set_routing_key`](Self::set_routing_key).
    pub fn with_routing_key(mut self, routing_key: impl Into<Bytes>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    /// The routing key, if one was set.
    pub fn get_routing_key(&self) -> Option<&Bytes> {
        self.routing_key.as_ref()
    }

    /// Names the keyspace whose replication decides the replicas of the
    /// routing key. Unset, the session's current keyspace is used.
    pub fn set_keyspace(&mut self, keyspace: Option<String>) {
        self.keyspace = keyspace;
    }

    /// The routing keyspace, if one was set.
    pub fn get_keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    /// Murmur3 token of the routing key.
    pub fn calculate_token(&self) -> Option<Token> {
        self.routing_key.as_deref().map(murmur3_token)
    }
}

impl From<String> for Statement {
    fn from(contents: String) -> Self {
        Self::new(contents)
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Self {
        Self::new(contents)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::Statement;
    use crate::routing::partitioner::murmur3_token;
    use tessera_cql::{Consistency, SerialConsistency};

    #[test]
    fn token_follows_routing_key() {
        let mut statement = Statement::new("SELECT * FROM ks.t WHERE pk = 'hello'");
        assert_eq!(statement.calculate_token(), None);

        statement.set_routing_key(Some(Bytes::from_static(b"hello")));
        assert_eq!(statement.calculate_token(), Some(murmur3_token(b"hello")));

        statement.set_routing_key(None);
        assert_eq!(statement.calculate_token(), None);
    }

    #[test]
    fn overrides_start_unset() {
        let statement: Statement = "SELECT 1".into();
        assert_eq!(statement.get_consistency(), None);
        assert_eq!(statement.get_serial_consistency(), None);
        assert_eq!(statement.get_request_timeout(), None);
        assert!(!statement.get_is_idempotent());
        assert!(statement.get_retry_policy().is_none());
        assert!(statement.get_load_balancing_policy().is_none());
        assert_eq!(statement.get_keyspace(), None);
    }

    #[test]
    fn overrides_reach_the_config() {
        let mut statement = Statement::new("UPDATE ks.t SET v = 1 WHERE k = 0 IF v = 0".to_owned())
            .with_consistency(Consistency::Quorum);
        statement.set_serial_consistency(Some(SerialConsistency::LocalSerial));
        statement.set_is_idempotent(true);
        statement.set_request_timeout(Some(Duration::from_secs(2)));
        statement.set_keyspace(Some("ks".to_owned()));

        assert_eq!(statement.config.consistency, Some(Consistency::Quorum));
        assert_eq!(
            statement.config.serial_consistency,
            Some(Some(SerialConsistency::LocalSerial))
        );
        assert!(statement.config.is_idempotent);
        assert_eq!(statement.config.request_timeout, Some(Duration::from_secs(2)));
        assert_eq!(statement.get_keyspace(), Some("ks"));

        statement.unset_consistency();
        assert_eq!(statement.get_consistency(), None);
    }
}
