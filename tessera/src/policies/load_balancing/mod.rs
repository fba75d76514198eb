//! Choosing which nodes a request goes to, and in what order.
//!
//! A [`LoadBalancingPolicy`] turns a request's [`RoutingInfo`] and the
//! current [`ClusterState`] into a lazy list of candidates. The built-in
//! policies are [`RoundRobinPolicy`], [`DcAwareRoundRobinPolicy`] and
//! [`TokenAwarePolicy`], which wraps either of the others and puts the
//! replicas of the request's token first.

use std::time::Duration;

use crate::cluster::{ClusterState, NodeRef};
use crate::errors::RequestAttemptError;
use crate::routing::Token;
use tessera_cql::{Consistency, SerialConsistency};

mod dc_aware;
mod plan;
mod round_robin;
mod token_aware;

pub use dc_aware::DcAwareRoundRobinPolicy;
pub use plan::Plan;
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;

/// What a policy may know about the request it is planning for.
#[derive(Default, Clone, Debug)]
#[non_exhaustive]
pub struct RoutingInfo<'a> {
    /// Consistency the request runs at. `LOCAL_*` levels only make sense
    /// when the coordinator is in the local datacenter.
    pub consistency: Consistency,
    /// Consistency of the Paxos phase, for conditional statements.
    pub serial_consistency: Option<SerialConsistency>,
    /// Token of the partition key, when it could be computed.
    pub token: Option<Token>,
    /// Keyspace whose replication places `token` on replicas.
    pub keyspace: Option<&'a str>,
}

/// Candidates for one request, best first, produced lazily since most
/// requests never look past the first.
pub type NodeIter<'a> = Box<dyn Iterator<Item = NodeRef<'a>> + Send + Sync + 'a>;

/// Orders the nodes a request is tried on.
///
/// [`plan`](LoadBalancingPolicy::plan) is called once per request, against
/// a cluster snapshot that does not change while the request runs. The
/// execution pipeline walks the plan until an attempt succeeds or the retry
/// policy gives up, then reports every attempt back through
/// [`on_request_success`](LoadBalancingPolicy::on_request_success) and
/// [`on_request_failure`](LoadBalancingPolicy::on_request_failure).
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Candidate nodes for `request`.
    ///
    /// A call may move internal state along, such as a round robin
    /// position, but iterating the returned plan must not.
    fn plan<'a>(&'a self, request: &'a RoutingInfo, cluster: &'a ClusterState) -> NodeIter<'a>;

    /// An attempt on `node` succeeded after `latency`.
    fn on_request_success(&self, _request: &RoutingInfo, _latency: Duration, _node: NodeRef<'_>) {}

    /// An attempt on `node` failed with `error` after `latency`.
    fn on_request_failure(
        &self,
        _request: &RoutingInfo,
        _latency: Duration,
        _node: NodeRef<'_>,
        _error: &RequestAttemptError,
    ) {
    }

    /// Human readable name, for logs.
    fn name(&self) -> String;
}

/// `items` (of length `len`) started at position `counter % len` and
/// wrapped around. Nothing is skipped or repeated.
fn rotated<I>(items: I, len: usize, counter: usize) -> impl Iterator<Item = I::Item> + Clone
where
    I: Iterator + Clone,
{
    let start = counter.checked_rem(len).unwrap_or(0);
    items.clone().skip(start).chain(items.take(start))
}
