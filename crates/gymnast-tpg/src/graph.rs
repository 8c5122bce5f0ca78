//! Teams, learners and the identifiers linking them.
//!
//! ```text
//! Team ──has──→ Learner ──action──→ atomic action
//!                       └─action──→ Team (older)
//! ```
//!
//! A learner only ever points to a team created before the team that first
//! received it, which keeps the graph acyclic.

use gymnast_env::Action;
use gymnast_training::agent::{AgentId, Outcomes};
use serde::{Deserialize, Serialize};

use crate::program::{Memory, Program};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
#[display("team#{_0}")]
pub struct TeamId(pub u64);

impl From<TeamId> for AgentId {
    fn from(id: TeamId) -> Self {
        AgentId(id.0)
    }
}

impl From<AgentId> for TeamId {
    fn from(id: AgentId) -> Self {
        TeamId(id.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
#[display("learner#{_0}")]
pub struct LearnerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LearnerAction {
    Atomic(Action),
    Team(TeamId),
}

impl LearnerAction {
    #[must_use]
    pub fn is_atomic(&self) -> bool {
        matches!(self, Self::Atomic(_))
    }

    #[must_use]
    pub fn team(&self) -> Option<TeamId> {
        match self {
            Self::Atomic(_) => None,
            Self::Team(team) => Some(*team),
        }
    }
}

/// A bidding program paired with the action taken when it wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learner {
    pub program: Program,
    pub action: LearnerAction,
}

impl Learner {
    pub fn bid(&self, observation: &[f64], memory: &mut Memory) -> f64 {
        self.program.execute(observation, memory)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Team {
    pub learners: Vec<LearnerId>,
    pub outcomes: Outcomes,
}
