//! Node ranking for placement, repair and balancing

use std::cmp::Reverse;
use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::protocol::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    LeastUsedFirst,
    MostUsedFirst,
}

/// Order nodes by utilization. Ties come out in random order: the nodes
/// are shuffled first and then stably sorted.
pub fn rank_nodes<R: Rng + ?Sized>(
    mut nodes: Vec<NodeId>,
    utilization: &HashMap<NodeId, i64>,
    order: Order,
    rng: &mut R,
) -> Vec<NodeId> {
    let load = |n: &NodeId| utilization.get(n).copied().unwrap_or(0);

    // Map iteration order must not leak into the result.
    nodes.sort();
    nodes.shuffle(rng);
    match order {
        Order::LeastUsedFirst => nodes.sort_by_key(|n| load(n)),
        Order::MostUsedFirst => nodes.sort_by_key(|n| Reverse(load(n))),
    }
    nodes
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn load(pairs: &[(&str, i64)]) -> HashMap<NodeId, i64> {
        pairs.iter().map(|(n, u)| (NodeId::from(*n), *u)).collect()
    }

    fn ids(map: &HashMap<NodeId, i64>) -> Vec<NodeId> {
        map.keys().cloned().collect()
    }

    #[test]
    fn test_orders_by_utilization() {
        let utilization = load(&[("a", 5), ("b", 1), ("c", 3)]);
        let mut rng = StdRng::seed_from_u64(7);

        let least = rank_nodes(ids(&utilization), &utilization, Order::LeastUsedFirst, &mut rng);
        assert_eq!(least, vec![NodeId::from("b"), NodeId::from("c"), NodeId::from("a")]);

        let most = rank_nodes(ids(&utilization), &utilization, Order::MostUsedFirst, &mut rng);
        assert_eq!(most, vec![NodeId::from("a"), NodeId::from("c"), NodeId::from("b")]);
    }

    #[test]
    fn test_same_seed_same_ranking() {
        let utilization = load(&[("a", 1), ("b", 1), ("c", 1), ("d", 0)]);
        let first = rank_nodes(
            ids(&utilization),
            &utilization,
            Order::LeastUsedFirst,
            &mut StdRng::seed_from_u64(42),
        );
        let second = rank_nodes(
            ids(&utilization),
            &utilization,
            Order::LeastUsedFirst,
            &mut StdRng::seed_from_u64(42),
        );
        assert_eq!(first, second);
        assert_eq!(first[0], NodeId::from("d"));
    }

    #[test]
    fn test_ties_are_broken_randomly() {
        let utilization = load(&[("a", 2), ("b", 2), ("c", 2)]);
        let mut rng = StdRng::seed_from_u64(1);
        let mut leaders = HashSet::new();
        for _ in 0..64 {
            let ranked = rank_nodes(ids(&utilization), &utilization, Order::LeastUsedFirst, &mut rng);
            leaders.insert(ranked[0].clone());
        }
        assert_eq!(leaders.len(), 3);
    }
}
