use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use super::{LoadBalancingPolicy, NodeIter, RoutingInfo};
use crate::cluster::{ClusterState, NodeRef};
use crate::routing::locator::ReplicaSet;

/// A wrapper load balancing policy that adds token awareness to a child policy.
///
/// When the request carries a token, the replicas owning it are moved to the
/// front of the child's plan, keeping the order the child gave them. The
/// remaining nodes follow in the child's order. The set of nodes is exactly
/// the child's.
///
/// The replicas are computed with the replication strategy of the request's
/// keyspace. Without a known keyspace, only the primary owner of the token
/// is moved to the front.
#[derive(Debug)]
pub struct TokenAwarePolicy {
    child_policy: Arc<dyn LoadBalancingPolicy>,
}

impl TokenAwarePolicy {
    pub fn new(child_policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        Self { child_policy }
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn plan<'a>(&'a self, request: &'a RoutingInfo, cluster: &'a ClusterState) -> NodeIter<'a> {
        let child_plan = self.child_policy.plan(request, cluster);

        let Some(token) = request.token else {
            return child_plan;
        };

        let replicas = cluster.replicas_for_routing(request.keyspace, token);
        trace!(
            token = token.value(),
            keyspace = request.keyspace,
            replicas = ?replicas.iter().map(|node| node.address).collect::<Vec<_>>(),
            "TokenAware"
        );
        if replicas.is_empty() {
            return child_plan;
        }

        Box::new(ReplicasFirst::new(child_plan, replicas))
    }

    fn name(&self) -> String {
        format!("TokenAwarePolicy{{child_policy: {}}}", self.child_policy.name())
    }
}

/// Pulls nodes from the child plan, yielding replicas right away and holding
/// back everything else until no more replicas can show up.
struct ReplicasFirst<'a> {
    child_plan: NodeIter<'a>,
    replicas: ReplicaSet<'a>,
    // Only `Up` replicas can appear in the child plan.
    replicas_left: usize,
    held_back: VecDeque<NodeRef<'a>>,
}

impl<'a> ReplicasFirst<'a> {
    fn new(child_plan: NodeIter<'a>, replicas: ReplicaSet<'a>) -> Self {
        let replicas_left = replicas.iter().filter(|node| node.is_up()).count();
        Self {
            child_plan,
            replicas,
            replicas_left,
            held_back: VecDeque::new(),
        }
    }

    fn is_replica(&self, node: NodeRef<'_>) -> bool {
        self.replicas.iter().any(|replica| replica.address == node.address)
    }
}

impl<'a> Iterator for ReplicasFirst<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.replicas_left > 0 {
            match self.child_plan.next() {
                Some(node) if self.is_replica(node) => {
                    self.replicas_left -= 1;
                    return Some(node);
                }
                Some(node) => self.held_back.push_back(node),
                None => self.replicas_left = 0,
            }
        }

        self.held_back.pop_front().or_else(|| self.child_plan.next())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::cluster::NodeState;
    use crate::policies::load_balancing::tests::{
        get_plan_and_collect_node_identifiers, mock_cluster_state, node_id,
    };
    use crate::policies::load_balancing::RoundRobinPolicy;
    use crate::routing::Token;

    /// Returns `Up` nodes in a fixed order, given by their ids.
    #[derive(Debug)]
    struct FixedOrderPolicy(Vec<u8>);

    impl LoadBalancingPolicy for FixedOrderPolicy {
        fn plan<'a>(&'a self, _request: &'a RoutingInfo, cluster: &'a ClusterState) -> NodeIter<'a> {
            Box::new(
                self.0
                    .iter()
                    .filter_map(move |id| cluster.get_nodes_info().iter().find(|node| node_id(node) == *id))
                    .filter(|node| node.is_up()),
            )
        }

        fn name(&self) -> String {
            "FixedOrderPolicy".to_owned()
        }
    }

    fn routing_info(keyspace: Option<&str>, token: Option<i64>) -> RoutingInfo<'_> {
        RoutingInfo {
            token: token.map(Token::new),
            keyspace,
            ..Default::default()
        }
    }

    fn token_aware(order: &[u8]) -> TokenAwarePolicy {
        TokenAwarePolicy::new(Arc::new(FixedOrderPolicy(order.to_vec())))
    }

    #[test]
    fn replicas_come_first_in_child_order() {
        let cluster = mock_cluster_state(&[NodeState::Up; 5]);

        // SimpleStrategy rf=2: token 60 is owned by 2 and 3.
        let policy = token_aware(&[5, 3, 1, 4, 2]);
        let info = routing_info(Some("simple_ks"), Some(60));
        assert_eq!(
            get_plan_and_collect_node_identifiers(&policy, &info, &cluster),
            vec![3, 2, 5, 1, 4]
        );

        // NetworkTopologyStrategy eu=2 us=1: token 60 is owned by 2, 3 and 4.
        let policy = token_aware(&[1, 2, 3, 4, 5]);
        let info = routing_info(Some("nts_ks"), Some(60));
        assert_eq!(
            get_plan_and_collect_node_identifiers(&policy, &info, &cluster),
            vec![2, 3, 4, 1, 5]
        );
    }

    #[test]
    fn without_token_child_plan_is_unchanged() {
        let cluster = mock_cluster_state(&[NodeState::Up; 5]);
        let policy = token_aware(&[4, 2, 5, 1, 3]);
        let info = routing_info(Some("simple_ks"), None);
        assert_eq!(
            get_plan_and_collect_node_identifiers(&policy, &info, &cluster),
            vec![4, 2, 5, 1, 3]
        );
    }

    #[test]
    fn unknown_keyspace_prefers_primary_owner() {
        let cluster = mock_cluster_state(&[NodeState::Up; 5]);
        let policy = token_aware(&[1, 2, 3, 4, 5]);

        let info = routing_info(Some("no_such_ks"), Some(160));
        assert_eq!(
            get_plan_and_collect_node_identifiers(&policy, &info, &cluster),
            vec![4, 1, 2, 3, 5]
        );

        let info = routing_info(None, Some(260));
        assert_eq!(
            get_plan_and_collect_node_identifiers(&policy, &info, &cluster),
            vec![1, 2, 3, 4, 5]
        );
    }

    #[test]
    fn down_replicas_are_not_offered() {
        let cluster = mock_cluster_state(&[
            NodeState::Up,
            NodeState::Down,
            NodeState::Up,
            NodeState::Up,
            NodeState::Up,
        ]);
        let policy = TokenAwarePolicy::new(Arc::new(RoundRobinPolicy::new()));
        let info = routing_info(Some("simple_ks"), Some(60));
        assert_eq!(
            get_plan_and_collect_node_identifiers(&policy, &info, &cluster),
            vec![3, 1, 4, 5]
        );
    }

    #[test]
    fn same_nodes_as_child_with_replicas_moved_to_front() {
        let cluster = mock_cluster_state(&[
            NodeState::Up,
            NodeState::Up,
            NodeState::Unknown,
            NodeState::Up,
            NodeState::Up,
        ]);
        let orders: [&[u8]; 3] = [&[1, 2, 3, 4, 5], &[5, 4, 3, 2, 1], &[3, 5, 1, 4, 2]];

        for order in orders {
            let child = FixedOrderPolicy(order.to_vec());
            let policy = token_aware(order);
            for keyspace in ["simple_ks", "nts_ks"] {
                for token in [0, 60, 120, 180, 240, 300] {
                    let info = routing_info(Some(keyspace), Some(token));
                    let child_plan = get_plan_and_collect_node_identifiers(&child, &info, &cluster);
                    let plan = get_plan_and_collect_node_identifiers(&policy, &info, &cluster);

                    assert_eq!(
                        plan.iter().collect::<HashSet<_>>(),
                        child_plan.iter().collect::<HashSet<_>>()
                    );
                    assert_eq!(plan.len(), child_plan.len());

                    let replicas: HashSet<u8> = cluster
                        .get_token_endpoints(keyspace, Token::new(token))
                        .iter()
                        .map(node_id)
                        .collect();
                    let split = plan.iter().take_while(|id| replicas.contains(id)).count();
                    assert!(plan[split..].iter().all(|id| !replicas.contains(id)));

                    let expected_rest: Vec<u8> = child_plan
                        .iter()
                        .copied()
                        .filter(|id| !replicas.contains(id))
                        .collect();
                    assert_eq!(plan[split..], expected_rest[..]);
                }
            }
        }
    }
}
