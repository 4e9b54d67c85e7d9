/*! Strategies to pick one node out of the candidates for a circuit position.
*/

use rand::distributions::{Distribution, WeightedIndex};
use rand::thread_rng;

use onion_packet::NodeDescriptor;

/// Strategy picking the node for a circuit position.
pub trait SelectionStrategy: Send + Sync {
    /// Index of the chosen candidate, `None` if nothing can be chosen.
    /// `candidates` is never empty and only contains nodes with non-zero
    /// weight.
    fn select(&self, candidates: &[NodeDescriptor]) -> Option<usize>;
}

/** Random selection weighted by advertised node weight.

This is the default: paths are unpredictable, and a node advertising twice the
weight of another is chosen twice as often.
*/
#[derive(Clone, Copy, Debug, Default)]
pub struct WeightedRandom;

impl SelectionStrategy for WeightedRandom {
    fn select(&self, candidates: &[NodeDescriptor]) -> Option<usize> {
        // weights are advertised by the nodes, their sum may not fit into u32
        let distribution = WeightedIndex::new(candidates.iter().map(|c| u64::from(c.weight))).ok()?;
        Some(distribution.sample(&mut thread_rng()))
    }
}

/// Always choose the first candidate. Paths are predictable, use it in tests
/// only.
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstCandidate;

impl SelectionStrategy for FirstCandidate {
    fn select(&self, candidates: &[NodeDescriptor]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}
