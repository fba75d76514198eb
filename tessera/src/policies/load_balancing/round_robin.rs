use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use super::{rotated, LoadBalancingPolicy, NodeIter, RoutingInfo};
use crate::cluster::ClusterState;

/// Spreads requests evenly over every `Up` node.
///
/// Each plan starts one position further along the node list than the
/// previous one and wraps around.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Starts at the first node.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan<'a>(&'a self, _request: &'a RoutingInfo, cluster: &'a ClusterState) -> NodeIter<'a> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let nodes = cluster.get_nodes_info();
        trace!(counter, nodes = nodes.len(), "Round robin plan");

        Box::new(rotated(nodes.iter(), nodes.len(), counter).filter(|node| node.is_up()))
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_owned()
    }
}
