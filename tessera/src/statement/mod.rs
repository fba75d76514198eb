//! What a [`Session`](crate::client::session::Session) can run.
//!
//! A [`Statement`] is plain text sent with `QUERY`. A [`PreparedStatement`]
//! is parsed once by every host and then run by id with `EXECUTE`. Both
//! carry the same set of per-statement overrides of the session defaults.

use std::sync::Arc;
use std::time::Duration;

use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;

pub mod prepared;
pub mod unprepared;

pub use prepared::PreparedStatement;
pub use tessera_cql::{Consistency, SerialConsistency};
pub use unprepared::Statement;

/// Overrides a statement carries over the session defaults.
///
/// `None` everywhere means "whatever the session says".
#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    // Outer `None`: not overridden. `Some(None)`: explicitly no serial phase.
    pub(crate) serial_consistency: Option<Option<SerialConsistency>>,
    pub(crate) is_idempotent: bool,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
}

impl StatementConfig {
    #[must_use]
    pub(crate) fn determine_consistency(&self, session_default: Consistency) -> Consistency {
        self.consistency.unwrap_or(session_default)
    }

    #[must_use]
    pub(crate) fn determine_serial_consistency(
        &self,
        session_default: Option<SerialConsistency>,
    ) -> Option<SerialConsistency> {
        match self.serial_consistency {
            Some(overridden) => overridden,
            None => session_default,
        }
    }
}

/// Accessors for the [`StatementConfig`] held in a `config` field.
macro_rules! impl_statement_options {
    ($statement:ty) => {
        impl $statement {
            /// Overrides the session's default consistency.
            pub fn set_consistency(&mut self, consistency: Consistency) {
                self.config.consistency = Some(consistency);
            }

            /// Goes back to the session's default consistency.
            pub fn unset_consistency(&mut self) {
                self.config.consistency = None;
            }

            /// The overridden consistency, if any.
            pub fn get_consistency(&self) -> Option<Consistency> {
                self.config.consistency
            }

            /// Overrides the consistency of the Paxos phase. Only conditional
            /// statements have one; `None` turns it off.
            pub fn set_serial_consistency(&mut self, serial_consistency: Option<SerialConsistency>) {
                self.config.serial_consistency = Some(serial_consistency);
            }

            /// The overridden serial consistency, if any.
            pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
                self.config.serial_consistency.flatten()
            }

            /// Marks the statement as safe to apply more than once.
            ///
            /// Retry policies only resend a request whose outcome is unknown
            /// when this is `true`. It defaults to `false`, which means
            /// "not known to be idempotent" rather than "not idempotent".
            pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
                self.config.is_idempotent = is_idempotent;
            }

            /// Whether the statement was marked idempotent.
            pub fn get_is_idempotent(&self) -> bool {
                self.config.is_idempotent
            }

            /// Bounds each attempt of the statement. `None` means the
            /// session's request timeout.
            pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
                self.config.request_timeout = timeout;
            }

            /// The overridden per-attempt timeout, if any.
            pub fn get_request_timeout(&self) -> Option<Duration> {
                self.config.request_timeout
            }

            /// Replaces the session's retry policy for this statement only.
            pub fn set_retry_policy(&mut self, retry_policy: Option<Arc<dyn RetryPolicy>>) {
                self.config.retry_policy = retry_policy;
            }

            /// The statement's own retry policy, if any.
            pub fn get_retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
                self.config.retry_policy.as_ref()
            }

            /// Replaces the session's load balancing policy for this
            /// statement only.
            pub fn set_load_balancing_policy(&mut self, policy: Option<Arc<dyn LoadBalancingPolicy>>) {
                self.config.load_balancing_policy = policy;
            }

            /// The statement's own load balancing policy, if any.
            pub fn get_load_balancing_policy(&self) -> Option<&Arc<dyn LoadBalancingPolicy>> {
                self.config.load_balancing_policy.as_ref()
            }
        }
    };
}

pub(crate) use impl_statement_options;
