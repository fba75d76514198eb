use std::net::SocketAddr;

use smallvec::SmallVec;
use tracing::error;

use super::{LoadBalancingPolicy, NodeIter, RoutingInfo};
use crate::cluster::{ClusterState, NodeRef};

enum PlanState<'a> {
    Created,
    Iterating {
        iter: NodeIter<'a>,
        // Addresses already yielded. Plans are short, so a linear scan is enough.
        yielded: SmallVec<[SocketAddr; 8]>,
    },
    Exhausted,
}

/// The list of nodes constituting the query plan.
///
/// The policy is asked for its plan only when the first node is requested,
/// and nodes are then pulled from it one at a time. A node is never yielded
/// twice, even if the policy repeats it.
pub struct Plan<'a> {
    policy: &'a dyn LoadBalancingPolicy,
    routing_info: &'a RoutingInfo<'a>,
    cluster: &'a ClusterState,

    state: PlanState<'a>,
}

impl<'a> Plan<'a> {
    /// Prepares to ask the given [LoadBalancingPolicy] for a plan for the given `RoutingInfo`.
    pub fn new(
        policy: &'a dyn LoadBalancingPolicy,
        routing_info: &'a RoutingInfo<'a>,
        cluster: &'a ClusterState,
    ) -> Self {
        Self {
            policy,
            routing_info,
            cluster,
            state: PlanState::Created,
        }
    }
}

impl<'a> Iterator for Plan<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if let PlanState::Created = self.state {
            let mut iter = self.policy.plan(self.routing_info, self.cluster);
            match iter.next() {
                Some(first) => {
                    let mut yielded = SmallVec::new();
                    yielded.push(first.address);
                    self.state = PlanState::Iterating { iter, yielded };
                    return Some(first);
                }
                None => {
                    error!(
                        "Load balancing policy returned an empty plan! The query cannot be executed. Routing info: {:?}",
                        self.routing_info
                    );
                    self.state = PlanState::Exhausted;
                    return None;
                }
            }
        }

        match &mut self.state {
            PlanState::Iterating { iter, yielded } => {
                for node in iter.by_ref() {
                    if !yielded.contains(&node.address) {
                        yielded.push(node.address);
                        return Some(node);
                    }
                }
                self.state = PlanState::Exhausted;
                None
            }
            PlanState::Created | PlanState::Exhausted => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cluster::NodeState;
    use crate::policies::load_balancing::tests::{mock_cluster_state, node_id};

    /// Repeats every node and counts how many times it was asked for a plan.
    #[derive(Debug, Default)]
    struct StutteringPolicy {
        calls: AtomicUsize,
    }

    impl LoadBalancingPolicy for StutteringPolicy {
        fn plan<'a>(&'a self, _request: &'a RoutingInfo, cluster: &'a ClusterState) -> NodeIter<'a> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Box::new(
                cluster
                    .get_nodes_info()
                    .iter()
                    .flat_map(|node| [node, node]),
            )
        }

        fn name(&self) -> String {
            "StutteringPolicy".to_owned()
        }
    }

    #[derive(Debug)]
    struct EmptyPolicy;

    impl LoadBalancingPolicy for EmptyPolicy {
        fn plan<'a>(&'a self, _request: &'a RoutingInfo, _cluster: &'a ClusterState) -> NodeIter<'a> {
            Box::new(std::iter::empty())
        }

        fn name(&self) -> String {
            "EmptyPolicy".to_owned()
        }
    }

    #[test]
    fn plan_is_lazy_and_deduplicated() {
        let cluster = mock_cluster_state(&[NodeState::Up; 5]);
        let policy = StutteringPolicy::default();
        let info = RoutingInfo::default();

        let mut plan = Plan::new(&policy, &info, &cluster);
        assert_eq!(policy.calls.load(Ordering::Relaxed), 0);

        assert_eq!(plan.next().map(node_id), Some(1));
        assert_eq!(plan.map(node_id).collect::<Vec<_>>(), vec![2, 3, 4, 5]);
        assert_eq!(policy.calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn empty_plan_stays_empty() {
        let cluster = mock_cluster_state(&[]);
        let info = RoutingInfo::default();
        let mut plan = Plan::new(&EmptyPolicy, &info, &cluster);
        assert!(plan.next().is_none());
        assert!(plan.next().is_none());
    }
}
