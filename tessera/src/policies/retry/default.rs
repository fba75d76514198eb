use std::num::NonZeroUsize;

use crate::errors::{DbError, RequestAttemptError, WriteType};

use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};

/// What [DefaultRetryPolicy] does when a node turns a request away without
/// running it (`Overloaded`, `IsBootstrapping`) or fails it internally
/// (`ServerError`, `TruncateError`; idempotent requests only).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum OverloadedDecision {
    /// One more try on the same node, then the next node.
    #[default]
    SameTargetOnceThenNext,
    /// Straight to the next node.
    NextTarget,
    /// Report the error.
    DontRetry,
}

/// Retries only where another attempt is likely to succeed and cannot
/// apply a write twice unless the statement is idempotent.
///
/// | failure | decision |
/// |---|---|
/// | serial consistency | never retried |
/// | overloaded, bootstrapping | [OverloadedDecision] |
/// | server error, truncate error | [OverloadedDecision] if idempotent |
/// | unavailable | next node, once |
/// | read timeout with enough replies but no data | same node, once |
/// | batch log write timeout | same node, once, if idempotent |
/// | never written (no connection, no stream id) | next node |
/// | broken connection | next node |
/// | client timeout | next node if idempotent |
/// | anything else | never retried |
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy {
    overloaded_decision: OverloadedDecision,
    max_attempts: Option<NonZeroUsize>,
}

impl DefaultRetryPolicy {
    /// The policy with default settings.
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy::default()
    }

    /// Chooses the reaction to overloaded or failing nodes.
    pub fn with_overloaded_decision(mut self, decision: OverloadedDecision) -> Self {
        self.overloaded_decision = decision;
        self
    }

    /// Limits how many attempts one request may make, the first included.
    /// Unlimited by default, so every node of the plan may be tried.
    pub fn with_max_attempts(mut self, max_attempts: NonZeroUsize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession {
            policy: self.clone(),
            used: Used::default(),
        })
    }
}

/// Which one-shot retries a request has spent.
#[derive(Default)]
struct Used {
    attempts: usize,
    unavailable: bool,
    read_timeout: bool,
    write_timeout: bool,
    // Only for the current node.
    overloaded_same_target: bool,
}

/// [RetrySession] of [DefaultRetryPolicy].
pub struct DefaultRetrySession {
    policy: DefaultRetryPolicy,
    used: Used,
}

/// How an attempt failed, as far as retrying is concerned.
enum Failure {
    Refused,
    FailedInternally,
    Unavailable,
    ReadTimeout { enough_replies: bool, data_present: bool },
    WriteTimeout { batch_log: bool },
    NotSent,
    ConnectionLost,
    OutcomeUnknown,
    Final,
}

impl Failure {
    fn of(error: &RequestAttemptError) -> Failure {
        match error {
            RequestAttemptError::DbError(db_error, _) => match db_error {
                DbError::Overloaded | DbError::IsBootstrapping => Failure::Refused,
                DbError::ServerError | DbError::TruncateError => Failure::FailedInternally,
                DbError::Unavailable { .. } => Failure::Unavailable,
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                } => Failure::ReadTimeout {
                    enough_replies: received >= required,
                    data_present: *data_present,
                },
                DbError::WriteTimeout { write_type, .. } => Failure::WriteTimeout {
                    batch_log: *write_type == WriteType::BatchLog,
                },
                _ => Failure::Final,
            },
            error if error.happened_before_write() => Failure::NotSent,
            RequestAttemptError::BrokenConnection(_) => Failure::ConnectionLost,
            RequestAttemptError::Timeout(_) => Failure::OutcomeUnknown,
            _ => Failure::Final,
        }
    }
}

impl DefaultRetrySession {
    fn on_overload(&self) -> RetryDecision {
        match self.policy.overloaded_decision {
            OverloadedDecision::SameTargetOnceThenNext if !self.used.overloaded_same_target => {
                RetryDecision::RetrySameTarget
            }
            OverloadedDecision::SameTargetOnceThenNext | OverloadedDecision::NextTarget => {
                RetryDecision::RetryNextTarget
            }
            OverloadedDecision::DontRetry => RetryDecision::DontRetry,
        }
    }

    /// Returns `decision` and marks the one-shot retry as spent, unless it
    /// was spent already.
    fn once(spent: &mut bool, decision: RetryDecision) -> RetryDecision {
        if std::mem::replace(spent, true) {
            RetryDecision::DontRetry
        } else {
            decision
        }
    }

    fn decide(&mut self, info: &RequestInfo) -> RetryDecision {
        if info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        }
        let idempotent = info.is_idempotent;
        match Failure::of(info.error) {
            Failure::Refused => self.on_overload(),
            Failure::FailedInternally if idempotent => self.on_overload(),
            Failure::Unavailable => Self::once(&mut self.used.unavailable, RetryDecision::RetryNextTarget),
            Failure::ReadTimeout {
                enough_replies: true,
                data_present: false,
            } => Self::once(&mut self.used.read_timeout, RetryDecision::RetrySameTarget),
            Failure::WriteTimeout { batch_log: true } if idempotent => {
                Self::once(&mut self.used.write_timeout, RetryDecision::RetrySameTarget)
            }
            Failure::NotSent | Failure::ConnectionLost => RetryDecision::RetryNextTarget,
            Failure::OutcomeUnknown if idempotent => RetryDecision::RetryNextTarget,
            _ => RetryDecision::DontRetry,
        }
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        self.used.attempts += 1;
        if self
            .policy
            .max_attempts
            .is_some_and(|max| self.used.attempts >= max.get())
        {
            return RetryDecision::DontRetry;
        }

        let decision = self.decide(&request_info);
        self.used.overloaded_same_target = decision == RetryDecision::RetrySameTarget
            && matches!(
                Failure::of(request_info.error),
                Failure::Refused | Failure::FailedInternally
            );
        decision
    }

    fn reset(&mut self) {
        self.used = Used::default();
    }
}
