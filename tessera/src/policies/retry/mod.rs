//! Deciding whether a failed attempt is tried again.
//!
//! The [Session](crate::Session) asks its [RetryPolicy] for a fresh
//! [RetrySession] per request, then consults it after every failed attempt.
//! A retry never changes the consistency the caller asked for.

mod default;

pub use default::{DefaultRetryPolicy, DefaultRetrySession, OverloadedDecision};

use crate::errors::RequestAttemptError;
use tessera_cql::Consistency;

/// A failed attempt, as shown to a [RetrySession].
pub struct RequestInfo<'a> {
    /// Why the attempt failed.
    pub error: &'a RequestAttemptError,
    /// Whether the statement was declared safe to apply more than once.
    /// `false` means unknown, not known to be unsafe.
    pub is_idempotent: bool,
    /// Consistency the attempt was sent with.
    pub consistency: Consistency,
}

/// Outcome of [RetrySession::decide_should_retry].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request to the same node once more.
    RetrySameTarget,
    /// Move on to the next node of the query plan.
    RetryNextTarget,
    /// Give up and report the error.
    DontRetry,
}

/// Creates per-request retry state.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Starts deciding about a new request.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Retry state of a single request.
pub trait RetrySession: Send + Sync {
    /// Called after each failed attempt.
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    /// Forgets everything seen so far, so the session can serve another request.
    fn reset(&mut self);
}

/// Never retries: every error reaches the caller as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

/// [RetrySession] of [FallthroughRetryPolicy].
pub struct FallthroughRetrySession;

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _: RequestInfo) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::{FallthroughRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
    use crate::errors::{BrokenConnectionError, DbError, RequestAttemptError};
    use tessera_cql::Consistency;

    #[test]
    fn fallthrough_gives_up_on_anything() {
        let mut session = FallthroughRetryPolicy::new().new_session();
        for error in [
            RequestAttemptError::DbError(DbError::Overloaded, String::new()),
            RequestAttemptError::BrokenConnection(BrokenConnectionError::ChannelError),
            RequestAttemptError::UnableToAllocStreamId,
        ] {
            let decision = session.decide_should_retry(RequestInfo {
                error: &error,
                is_idempotent: true,
                consistency: Consistency::One,
            });
            assert_eq!(decision, RetryDecision::DontRetry);
        }
    }
}
