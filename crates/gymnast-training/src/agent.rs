//! Agents under evaluation and the score records they produce.

use std::{collections::BTreeMap, fmt};

use gymnast_env::Action;
use serde::{Deserialize, Serialize};

/// Identity of a population member.
///
/// Stable across the whole run: a member keeps its id from the generation it is
/// created in until it is removed by the evolve step.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
#[serde(transparent)]
#[display("#{_0}")]
pub struct AgentId(pub u64);

/// Scores per task name.
pub type Outcomes = BTreeMap<String, f64>;

/// Decision logic of a candidate.
///
/// Policies are moved into evaluation workers by value, so they must be
/// self-contained snapshots that hold no reference back into the population.
pub trait Policy: fmt::Debug + Clone + Send + 'static {
    /// Chooses an action for the given encoded observation.
    fn act(&mut self, observation: &[f64]) -> Action;
}

/// A candidate bound to its identity and its per-task outcome cache.
#[derive(Debug, Clone)]
pub struct AgentHandle<P> {
    id: AgentId,
    policy: P,
    outcomes: Outcomes,
}

impl<P> AgentHandle<P> {
    #[must_use]
    pub fn new(id: AgentId, policy: P, outcomes: Outcomes) -> Self {
        Self {
            id,
            policy,
            outcomes,
        }
    }

    #[must_use]
    pub fn id(&self) -> AgentId {
        self.id
    }

    #[must_use]
    pub fn policy(&self) -> &P {
        &self.policy
    }

    #[must_use]
    pub fn outcomes(&self) -> &Outcomes {
        &self.outcomes
    }

    /// Returns `true` if a score for `task` is already recorded.
    #[must_use]
    pub fn is_task_done(&self, task: &str) -> bool {
        self.outcomes.contains_key(task)
    }

    #[must_use]
    pub fn score(&self, task: &str) -> Option<f64> {
        self.outcomes.get(task).copied()
    }

    /// Records `score` for `task`, replacing any previous score for that task.
    pub fn record_reward(&mut self, task: &str, score: f64) {
        self.outcomes.insert(task.to_owned(), score);
    }

    /// Snapshot of the full outcome map of this agent.
    #[must_use]
    pub fn to_record(&self) -> ScoreRecord {
        ScoreRecord {
            id: self.id,
            outcomes: self.outcomes.clone(),
            failure: None,
        }
    }
}

impl<P> AgentHandle<P>
where
    P: Policy,
{
    pub fn act(&mut self, observation: &[f64]) -> Action {
        self.policy.act(observation)
    }
}

/// Result of evaluating one agent, returned to the orchestrator by value.
///
/// `outcomes` is always the complete outcome map of the agent, not only the task
/// that was just evaluated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub id: AgentId,
    pub outcomes: Outcomes,
    pub failure: Option<JobFailure>,
}

/// Marker attached to a record whose evaluation did not complete.
///
/// Only agents without a score for `task` are ever evaluated, so the record of a
/// failed job holds no score for `task` and the agent ranks last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub task: String,
    pub reason: String,
}
