//! Coordinator election
//!
//! Best-effort and local: every node runs the same strategy over its own
//! view of the membership. Identical views give identical winners.

use std::cmp::Ordering;

use rand::Rng;

use syncmesh_core::{Capability, ElectionStrategy, Node, SyncError, SyncResult};

/// Picks one coordinator out of a candidate set
pub trait Election: Send + Sync {
    fn strategy(&self) -> ElectionStrategy;

    /// Winner among candidates advertising [`Capability::Coordinator`]
    fn promote(&self, candidates: &[Node]) -> SyncResult<Node>;
}

/// Earliest `started_at` (else `created_at`) wins; ties go to the lowest id
#[derive(Clone, Copy, Debug, Default)]
pub struct FirstReadyElection;

impl Election for FirstReadyElection {
    fn strategy(&self) -> ElectionStrategy {
        ElectionStrategy::FirstReady
    }

    fn promote(&self, candidates: &[Node]) -> SyncResult<Node> {
        eligible(candidates)
            .min_by(|a, b| a.ready_at().cmp(&b.ready_at()).then(a.id.cmp(&b.id)))
            .cloned()
            .ok_or(SyncError::NoCandidates)
    }
}

/// Lowest advertised roll wins
///
/// Candidates without a roll sort after every rolled candidate; ties go to
/// the lowest id.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomRollElection;

impl Election for RandomRollElection {
    fn strategy(&self) -> ElectionStrategy {
        ElectionStrategy::RandomRoll
    }

    fn promote(&self, candidates: &[Node]) -> SyncResult<Node> {
        eligible(candidates)
            .min_by(|a, b| compare_rolls(a.metadata.roll, b.metadata.roll).then(a.id.cmp(&b.id)))
            .cloned()
            .ok_or(SyncError::NoCandidates)
    }
}

fn compare_rolls(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn eligible(candidates: &[Node]) -> impl Iterator<Item = &Node> {
    candidates
        .iter()
        .filter(|n| n.has_capability(&Capability::Coordinator))
}

/// Election implementation for a strategy
pub fn election_for(strategy: ElectionStrategy) -> Box<dyn Election> {
    match strategy {
        ElectionStrategy::FirstReady => Box::new(FirstReadyElection),
        ElectionStrategy::RandomRoll => Box::new(RandomRollElection),
    }
}

/// Draw a local election roll in `[0, 1)`
pub fn generate_roll() -> f64 {
    rand::thread_rng().gen::<f64>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use syncmesh_core::{NodeId, NodeMetadata, Timestamp};

    fn candidate(id: u64, started_ms: i64) -> Node {
        Node::new(NodeId::new(id), format!("n{id}"))
            .with_capabilities(Capability::all())
            .with_started_at(Timestamp::from_millis(started_ms))
    }

    fn rolled(id: u64, roll: Option<f64>) -> Node {
        candidate(id, 0).with_metadata(NodeMetadata {
            roll,
            ..NodeMetadata::default()
        })
    }

    #[test]
    fn test_first_ready_picks_earliest() {
        let nodes = vec![candidate(1, 300), candidate(2, 100), candidate(3, 200)];
        let winner = FirstReadyElection.promote(&nodes).unwrap();
        assert_eq!(winner.id, NodeId::new(2));
    }

    #[test]
    fn test_first_ready_tie_lowest_id() {
        let nodes = vec![candidate(9, 100), candidate(4, 100)];
        assert_eq!(FirstReadyElection.promote(&nodes).unwrap().id, NodeId::new(4));
    }

    #[test]
    fn test_ineligible_skipped() {
        let sink_only = Node::new(NodeId::new(1), "sink")
            .with_capability(Capability::DataSink)
            .with_started_at(Timestamp::from_millis(1));
        let nodes = vec![sink_only, candidate(2, 500)];
        assert_eq!(FirstReadyElection.promote(&nodes).unwrap().id, NodeId::new(2));
    }

    #[test]
    fn test_no_candidates_both_strategies() {
        let sink_only = Node::new(NodeId::new(1), "sink").with_capability(Capability::DataSink);
        for strategy in [ElectionStrategy::FirstReady, ElectionStrategy::RandomRoll] {
            let election = election_for(strategy);
            assert_eq!(election.strategy(), strategy);
            assert_eq!(election.promote(&[]), Err(SyncError::NoCandidates));
            assert_eq!(
                election.promote(&[sink_only.clone()]),
                Err(SyncError::NoCandidates)
            );
        }
    }

    #[test]
    fn test_random_roll_lowest_wins_missing_last() {
        let nodes = vec![rolled(1, None), rolled(2, Some(0.7)), rolled(3, Some(0.2))];
        assert_eq!(RandomRollElection.promote(&nodes).unwrap().id, NodeId::new(3));

        let nodes = vec![rolled(5, None), rolled(4, None)];
        assert_eq!(RandomRollElection.promote(&nodes).unwrap().id, NodeId::new(4));

        let nodes = vec![rolled(8, Some(0.5)), rolled(6, Some(0.5))];
        assert_eq!(RandomRollElection.promote(&nodes).unwrap().id, NodeId::new(6));
    }

    #[test]
    fn test_roll_range() {
        for _ in 0..100 {
            let r = generate_roll();
            assert!((0.0..1.0).contains(&r));
        }
    }

    proptest! {
        #[test]
        fn prop_first_ready_order_independent(
            starts in proptest::collection::vec(0i64..1_000, 1..12),
            rotate in 0usize..12,
        ) {
            let nodes: Vec<Node> = starts
                .iter()
                .enumerate()
                .map(|(i, s)| candidate(i as u64 + 1, *s))
                .collect();
            let mut shuffled = nodes.clone();
            shuffled.reverse();
            let len = shuffled.len();
            shuffled.rotate_left(rotate % len);

            let a = FirstReadyElection.promote(&nodes).unwrap();
            let b = FirstReadyElection.promote(&shuffled).unwrap();
            prop_assert_eq!(a.id, b.id);
        }
    }
}
