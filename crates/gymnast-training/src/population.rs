//! The population manager interface and the fitness ranking it produces.

use std::cmp::Ordering;

use gymnast_stats::descriptive::DescriptiveStats;
use serde::{Deserialize, Serialize};

use crate::{
    agent::{AgentHandle, AgentId, Outcomes, Policy, ScoreRecord},
    stats::StructureCounts,
};

/// Owner of the evolving population.
///
/// The orchestrator only talks to the population through this trait: it takes
/// agent snapshots out, hands score records back in, and asks for the next
/// generation. Checkpoints serialize the whole manager, so implementations are
/// expected to be `Serialize + DeserializeOwned` when used with
/// [`GenerationOrchestrator`](crate::orchestrator::GenerationOrchestrator).
pub trait PopulationManager {
    /// Decision logic handed to evaluation workers.
    type Policy: Policy;
    /// Serializable snapshot of a single candidate.
    type Candidate: Serialize;

    /// Snapshots of the members to evaluate this generation, with their current outcomes.
    fn agents(&self) -> Vec<AgentHandle<Self::Policy>>;

    /// Merges the outcome maps of `records` into the members with matching ids and
    /// returns the members ordered best-first by their score on `task`.
    ///
    /// The result must not depend on the order of `records`.
    fn apply_scores(&mut self, task: &str, records: Vec<ScoreRecord>) -> Ranking;

    /// Replaces the population with the next generation, selecting on `task`.
    fn evolve(&mut self, task: &str);

    fn candidate(&self, id: AgentId) -> Option<Self::Candidate>;

    /// Structural composition of a member.
    fn structure(&self, id: AgentId) -> StructureCounts;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankedAgent {
    pub id: AgentId,
    /// Score on the ranking task, `None` if the member has no (finite) score.
    pub fitness: Option<f64>,
}

/// Population members ordered best-first by their score on one task.
///
/// Members without a score rank after every scored member; ties are broken by
/// ascending id so the ordering is fully deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    task: String,
    entries: Vec<RankedAgent>,
}

impl Ranking {
    pub fn from_outcomes<'a, I>(task: &str, members: I) -> Self
    where
        I: IntoIterator<Item = (AgentId, &'a Outcomes)>,
    {
        let mut entries = members
            .into_iter()
            .map(|(id, outcomes)| RankedAgent {
                id,
                fitness: outcomes.get(task).copied().filter(|f| !f.is_nan()),
            })
            .collect::<Vec<_>>();
        entries.sort_by(compare_ranked);
        Self {
            task: task.to_owned(),
            entries,
        }
    }

    #[must_use]
    pub fn task(&self) -> &str {
        &self.task
    }

    #[must_use]
    pub fn entries(&self) -> &[RankedAgent] {
        &self.entries
    }

    #[must_use]
    pub fn best(&self) -> Option<&RankedAgent> {
        self.entries.first()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Ids in ranking order.
    pub fn ids(&self) -> impl Iterator<Item = AgentId> + '_ {
        self.entries.iter().map(|e| e.id)
    }

    /// Fitness statistics over the scored members.
    #[must_use]
    pub fn fitness_stats(&self) -> Option<DescriptiveStats> {
        DescriptiveStats::new(self.entries.iter().filter_map(|e| e.fitness))
    }
}

fn compare_ranked(a: &RankedAgent, b: &RankedAgent) -> Ordering {
    let by_fitness = match (a.fitness, b.fitness) {
        (Some(fa), Some(fb)) => fb.total_cmp(&fa),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_fitness.then(a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(score: Option<f64>) -> Outcomes {
        score
            .map(|s| Outcomes::from([("task".to_owned(), s)]))
            .unwrap_or_default()
    }

    #[test]
    fn test_ranking_orders_best_first_and_unscored_last() {
        let members = [
            (AgentId(1), outcomes(Some(3.0))),
            (AgentId(2), outcomes(None)),
            (AgentId(3), outcomes(Some(9.0))),
            (AgentId(4), outcomes(Some(3.0))),
            (AgentId(5), outcomes(Some(f64::NAN))),
        ];
        let ranking = Ranking::from_outcomes("task", members.iter().map(|(id, o)| (*id, o)));

        let ids = ranking.ids().map(|id| id.0).collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 1, 4, 2, 5]);
        assert_eq!(ranking.best().unwrap().fitness, Some(9.0));

        let stats = ranking.fitness_stats().unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 3.0);
        assert_eq!(stats.max, 9.0);
        assert_eq!(stats.mean, 5.0);
    }

    #[test]
    fn test_ranking_ignores_input_order() {
        let members = [
            (AgentId(10), outcomes(Some(1.0))),
            (AgentId(11), outcomes(Some(2.0))),
            (AgentId(12), outcomes(None)),
        ];
        let forward = Ranking::from_outcomes("task", members.iter().map(|(id, o)| (*id, o)));
        let backward = Ranking::from_outcomes("task", members.iter().rev().map(|(id, o)| (*id, o)));
        assert_eq!(forward, backward);
    }
}
