use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use super::{rotated, LoadBalancingPolicy, NodeIter, RoutingInfo};
use crate::cluster::ClusterState;

/// Round robin that stays in one datacenter while it can.
///
/// A plan lists the `Up` nodes of the local datacenter first. Every other
/// `Up` node follows as a single remote tier, nodes of unknown datacenter
/// included. Both tiers rotate with every plan.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    counter: AtomicUsize,
    local_dc: String,
}

impl DcAwareRoundRobinPolicy {
    /// Prefers the nodes of `local_dc`.
    pub fn new(local_dc: String) -> Self {
        Self {
            counter: AtomicUsize::new(0),
            local_dc,
        }
    }

    /// The preferred datacenter.
    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn plan<'a>(&'a self, _request: &'a RoutingInfo, cluster: &'a ClusterState) -> NodeIter<'a> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let local_dc = self.local_dc.as_str();

        let local = cluster.get_datacenter_nodes(local_dc);
        let remote = cluster
            .get_nodes_info()
            .iter()
            .filter(move |node| node.datacenter.as_deref() != Some(local_dc));
        let remote_len = cluster.get_nodes_info().len() - local.len();
        trace!(local_dc, local = local.len(), remote = remote_len, "DC aware plan");

        let plan = rotated(local.iter(), local.len(), counter).chain(rotated(remote, remote_len, counter));
        Box::new(plan.filter(|node| node.is_up()))
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cluster::NodeState;
    use crate::policies::load_balancing::tests::{get_plan_and_collect_node_identifiers, mock_cluster_state};

    #[test]
    fn test_dc_aware_round_robin_policy() {
        let cluster = mock_cluster_state(&[NodeState::Up; 5]);
        let policy = DcAwareRoundRobinPolicy::new("eu".to_string());
        let info = RoutingInfo::default();

        let plans = (0..4)
            .map(|_| get_plan_and_collect_node_identifiers(&policy, &info, &cluster))
            .collect::<Vec<_>>();

        assert_eq!(
            plans,
            vec![
                vec![1, 2, 3, 4, 5],
                vec![2, 3, 1, 5, 4],
                vec![3, 1, 2, 4, 5],
                vec![1, 2, 3, 5, 4],
            ]
        );
    }

    #[test]
    fn remote_nodes_fill_in_for_a_down_local_datacenter() {
        let cluster = mock_cluster_state(&[
            NodeState::Down,
            NodeState::Down,
            NodeState::Down,
            NodeState::Up,
            NodeState::Up,
        ]);
        let policy = DcAwareRoundRobinPolicy::new("eu".to_string());
        let info = RoutingInfo::default();

        assert_eq!(get_plan_and_collect_node_identifiers(&policy, &info, &cluster), vec![4, 5]);
    }

    #[test]
    fn unknown_local_datacenter_uses_every_node_as_remote() {
        let cluster = mock_cluster_state(&[NodeState::Up; 5]);
        let policy = DcAwareRoundRobinPolicy::new("asia".to_string());
        let info = RoutingInfo::default();

        assert_eq!(
            get_plan_and_collect_node_identifiers(&policy, &info, &cluster),
            vec![1, 2, 3, 4, 5]
        );
        assert_eq!(
            get_plan_and_collect_node_identifiers(&policy, &info, &cluster),
            vec![2, 3, 4, 5, 1]
        );
    }
}
