//! Token ring and replica computation for the supported replication strategies.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use itertools::Itertools;
use smallvec::SmallVec;
use tracing::debug;

use crate::cluster::metadata::Strategy;
use crate::cluster::{Node, NodeRef};
use crate::routing::Token;

/// Replicas are few, so they are kept inline.
pub(crate) type ReplicaSet<'a> = SmallVec<[NodeRef<'a>; 8]>;

/// A sorted sequence of (token, element) pairs, traversed clockwise.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Provides an iterator over the ring's elements starting at the given token.
    /// The iterator traverses the whole ring in the direction of increasing tokens.
    /// After reaching the maximum token it wraps around and continues from the lowest one.
    /// The iterator visits each member once.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        let binary_search_index: usize = match self.ring.binary_search_by(|e| e.0.cmp(&token)) {
            Ok(exact_match_index) => exact_match_index,
            Err(first_greater_index) => first_greater_index,
        };

        self.ring[binary_search_index..]
            .iter()
            .chain(self.ring.iter())
            .take(self.ring.len())
            .map(|(_t, e)| e)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

#[derive(Debug, Clone)]
struct DatacenterRing {
    ring: TokenRing<Arc<Node>>,
    unique_nodes: usize,
    rack_count: usize,
}

/// Finds the replicas owning a token.
///
/// Holds a global token ring for `SimpleStrategy` and one ring per
/// datacenter for `NetworkTopologyStrategy`.
#[derive(Debug, Clone)]
pub(crate) struct ReplicaLocator {
    global_ring: TokenRing<Arc<Node>>,
    unique_nodes: usize,
    datacenters: HashMap<String, DatacenterRing>,
}

impl ReplicaLocator {
    pub(crate) fn new<'a>(nodes: impl Iterator<Item = &'a Arc<Node>>) -> Self {
        let global_ring: TokenRing<Arc<Node>> = TokenRing::new(
            nodes.flat_map(|node| node.tokens.iter().map(move |token| (*token, node.clone()))),
        );
        let unique_nodes = global_ring.iter().map(|(_t, n)| n).unique().count();

        let mut per_datacenter: HashMap<&str, Vec<(Token, Arc<Node>)>> = HashMap::new();
        for (token, node) in global_ring.iter() {
            if let Some(datacenter_name) = node.datacenter.as_deref() {
                per_datacenter
                    .entry(datacenter_name)
                    .or_default()
                    .push((*token, node.clone()));
            }
        }

        let datacenters = per_datacenter
            .into_iter()
            .map(|(name, entries)| {
                let ring = TokenRing::new(entries.into_iter());
                let unique_nodes = ring.iter().map(|(_t, n)| n).unique().count();
                // A missing rack counts as a rack of its own.
                let rack_count = ring.iter().map(|(_t, n)| n.rack.as_deref()).unique().count();
                (
                    name.to_owned(),
                    DatacenterRing {
                        ring,
                        unique_nodes,
                        rack_count,
                    },
                )
            })
            .collect();

        Self {
            global_ring,
            unique_nodes,
            datacenters,
        }
    }

    pub(crate) fn ring(&self) -> &TokenRing<Arc<Node>> {
        &self.global_ring
    }

    /// Returns the replicas of `token` under `strategy`, primary owner first.
    pub(crate) fn replicas_for_token<'a>(&'a self, token: Token, strategy: &Strategy) -> ReplicaSet<'a> {
        match strategy {
            Strategy::SimpleStrategy { replication_factor } => {
                self.simple_strategy_replicas(token, *replication_factor)
            }
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            } => {
                // Datacenters are visited in name order so that the result is deterministic.
                datacenter_repfactors
                    .iter()
                    .sorted_by(|a, b| a.0.cmp(b.0))
                    .flat_map(|(dc, rf)| self.nts_replicas_in_datacenter(token, dc, *rf))
                    .collect()
            }
            Strategy::LocalStrategy => self.simple_strategy_replicas(token, 1),
            Strategy::Other { name, .. } => {
                debug!(
                    "Unknown strategy ({}), falling back to the primary owner only",
                    name
                );
                self.simple_strategy_replicas(token, 1)
            }
        }
    }

    fn simple_strategy_replicas(&self, token: Token, replication_factor: usize) -> ReplicaSet<'_> {
        let num_to_take = replication_factor.min(self.unique_nodes);
        self.global_ring
            .ring_range(token)
            .unique()
            .take(num_to_take)
            .collect()
    }

    // Walks the datacenter's ring preferring nodes on racks not used yet. Nodes
    // on already used racks are accepted only as long as the replication factor
    // exceeds the number of racks.
    fn nts_replicas_in_datacenter<'a>(
        &'a self,
        token: Token,
        datacenter_name: &str,
        replication_factor: usize,
    ) -> ReplicaSet<'a> {
        let Some(dc) = self.datacenters.get(datacenter_name) else {
            debug!("Datacenter ({}) does not exist!", datacenter_name);
            return ReplicaSet::new();
        };

        let mut replicas_left_to_find = replication_factor.min(dc.unique_nodes);
        let mut acceptable_repeats = replication_factor.saturating_sub(dc.rack_count);
        let mut used_racks: BTreeSet<Option<&str>> = BTreeSet::new();
        let mut replicas = ReplicaSet::new();

        for node in dc.ring.ring_range(token).unique() {
            if replicas_left_to_find == 0 {
                break;
            }
            let rack = node.rack.as_deref();
            if used_racks.insert(rack) {
                replicas.push(node);
                replicas_left_to_find -= 1;
            } else if acceptable_repeats > 0 {
                acceptable_repeats -= 1;
                replicas.push(node);
                replicas_left_to_find -= 1;
            }
        }

        replicas
    }
}
