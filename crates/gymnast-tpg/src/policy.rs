//! Acting with a team graph.
//!
//! A decision starts at the root team. Every eligible learner of the current team
//! bids on the observation, and the highest bidder wins: an atomic action ends the
//! decision, a team pointer continues it at that team.
//!
//! Eligibility depends on the [`TraversalStrategy`]:
//!
//! - `team` - learners pointing to a team already entered during this decision are
//!   skipped
//! - `learner` - learners already followed during this decision are skipped
//!
//! When no learner of a team is eligible, the highest-bidding atomic learner of the
//! team decides, and action `0` is taken if the team has none.

use std::collections::{BTreeMap, BTreeSet};

use gymnast_env::Action;
use gymnast_training::{agent::Policy, config::TraversalStrategy};
use serde::{Deserialize, Serialize};

use crate::{
    graph::{Learner, LearnerAction, LearnerId, TeamId},
    program::Memory,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum MemoryBanks {
    Shared,
    PerLearner,
}

/// Self-contained snapshot of the subgraph reachable from one root team.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamPolicy {
    root: TeamId,
    traversal: TraversalStrategy,
    teams: BTreeMap<TeamId, Vec<LearnerId>>,
    learners: BTreeMap<LearnerId, Learner>,
    banks: MemoryBanks,
    #[serde(skip)]
    shared_memory: Memory,
    #[serde(skip)]
    learner_memory: BTreeMap<LearnerId, Memory>,
}

impl TeamPolicy {
    pub(crate) fn new(
        root: TeamId,
        traversal: TraversalStrategy,
        shared_memory: bool,
        teams: BTreeMap<TeamId, Vec<LearnerId>>,
        learners: BTreeMap<LearnerId, Learner>,
    ) -> Self {
        Self {
            root,
            traversal,
            teams,
            learners,
            banks: if shared_memory {
                MemoryBanks::Shared
            } else {
                MemoryBanks::PerLearner
            },
            shared_memory: Memory::default(),
            learner_memory: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn root(&self) -> TeamId {
        self.root
    }

    #[must_use]
    pub fn team_count(&self) -> usize {
        self.teams.len()
    }

    #[must_use]
    pub fn learner_count(&self) -> usize {
        self.learners.len()
    }

    fn bid(&mut self, id: LearnerId, observation: &[f64]) -> f64 {
        let Some(learner) = self.learners.get(&id) else {
            return f64::NEG_INFINITY;
        };
        let memory = match self.banks {
            MemoryBanks::Shared => &mut self.shared_memory,
            MemoryBanks::PerLearner => self.learner_memory.entry(id).or_default(),
        };
        learner.bid(observation, memory)
    }

    fn is_eligible(
        &self,
        id: LearnerId,
        visited_teams: &BTreeSet<TeamId>,
        visited_learners: &BTreeSet<LearnerId>,
    ) -> bool {
        let Some(learner) = self.learners.get(&id) else {
            return false;
        };
        match self.traversal {
            TraversalStrategy::Team => learner
                .action
                .team()
                .is_none_or(|team| !visited_teams.contains(&team)),
            TraversalStrategy::Learner => !visited_learners.contains(&id),
        }
    }

    /// Returns the highest bidder among `candidates`. Ties go to the earlier learner.
    fn winner(&mut self, candidates: &[LearnerId], observation: &[f64]) -> Option<LearnerId> {
        let mut best: Option<(LearnerId, f64)> = None;
        for &id in candidates {
            let bid = self.bid(id, observation);
            if best.is_none_or(|(_, best_bid)| bid > best_bid) {
                best = Some((id, bid));
            }
        }
        best.map(|(id, _)| id)
    }
}

impl Policy for TeamPolicy {
    fn act(&mut self, observation: &[f64]) -> Action {
        let mut visited_teams = BTreeSet::new();
        let mut visited_learners = BTreeSet::new();
        let mut team = self.root;

        loop {
            visited_teams.insert(team);
            let members = self.teams.get(&team).cloned().unwrap_or_default();
            let eligible = members
                .iter()
                .copied()
                .filter(|&id| self.is_eligible(id, &visited_teams, &visited_learners))
                .collect::<Vec<_>>();

            let Some(winner) = self.winner(&eligible, observation) else {
                let atomic = members
                    .iter()
                    .copied()
                    .filter(|id| self.learners.get(id).is_some_and(|l| l.action.is_atomic()))
                    .collect::<Vec<_>>();
                return self
                    .winner(&atomic, observation)
                    .and_then(|id| match self.learners[&id].action {
                        LearnerAction::Atomic(action) => Some(action),
                        LearnerAction::Team(_) => None,
                    })
                    .unwrap_or(0);
            };
            visited_learners.insert(winner);

            match self.learners[&winner].action {
                LearnerAction::Atomic(action) => return action,
                LearnerAction::Team(next) => team = next,
            }
        }
    }
}
