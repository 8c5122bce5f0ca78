//! The population of team graphs and its evolution.
//!
//! # Evolution Step
//!
//! 1. **Rank** - Root teams are ranked by their score on the task, unscored last
//! 2. **Select** - The better half of the roots survives (elitism)
//! 3. **Collect** - Learners no team holds and non-root teams no learner points to
//!    are removed, repeatedly, until nothing changes
//! 4. **Refill** - Tournament-selected survivors are cloned and mutated until the
//!    number of root teams equals the population size again
//!
//! A child team may point to any existing team, all of which are older, so the graph
//! never contains a cycle. Pointing to a root turns it into an inner team, which is
//! why refilling repeats until the root count is restored.
//!
//! Every random decision is drawn from the trainer's own [`Pcg64`], which is
//! serialized with the rest of the trainer. A trainer restored from a checkpoint
//! therefore evolves exactly like the one that wrote it.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use gymnast_training::{
    agent::{AgentHandle, AgentId, ScoreRecord},
    config::{RunConfiguration, TraversalStrategy},
    population::{PopulationManager, Ranking},
    stats::StructureCounts,
};
use rand::{Rng, SeedableRng as _, seq::IndexedRandom as _};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    graph::{Learner, LearnerAction, LearnerId, Team, TeamId},
    policy::TeamPolicy,
    program::{Program, ProgramMutation},
};

/// Controls the shape of the initial population and how it evolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerParams {
    /// Number of root teams after every evolution step
    pub population_size: usize,
    /// Number of atomic actions of the task
    pub action_count: usize,
    pub shared_memory: bool,
    pub traversal: TraversalStrategy,
    /// Maximum number of learners of an initial team (at least 2)
    pub initial_team_size: usize,
    /// Maximum number of learners a team can grow to
    pub max_team_size: usize,
    /// Maximum number of instructions of an initial program
    pub initial_program_len: usize,
    /// Number of survivors in each tournament (larger = stronger pressure)
    pub tournament_size: usize,
    /// Probability of removing one more learner from a child team
    pub learner_delete: f64,
    /// Probability of adding one more existing learner to a child team
    pub learner_add: f64,
    /// Probability of replacing a child's learner by a mutated copy
    pub learner_mutate: f64,
    /// Probability of giving a mutated learner a new action
    pub action_change: f64,
    /// Probability that a new action points to a team instead of an atomic action
    pub team_pointer: f64,
    pub program: ProgramMutation,
}

impl TrainerParams {
    #[must_use]
    pub fn new(population_size: usize, action_count: usize) -> Self {
        Self {
            population_size,
            action_count,
            shared_memory: false,
            traversal: TraversalStrategy::Team,
            initial_team_size: 5,
            max_team_size: 12,
            initial_program_len: 8,
            tournament_size: 3,
            learner_delete: 0.7,
            learner_add: 0.7,
            learner_mutate: 0.3,
            action_change: 0.1,
            team_pointer: 0.5,
            program: ProgramMutation::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &RunConfiguration, action_count: usize) -> Self {
        Self {
            shared_memory: config.shared_memory,
            traversal: config.traversal,
            ..Self::new(config.population_size, action_count)
        }
    }
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum TrainerError {
    #[display("population size must be at least 1")]
    EmptyPopulation,
    #[display("the task must offer at least one action")]
    NoActions,
}

/// A tangled-program-graph population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trainer {
    params: TrainerParams,
    teams: BTreeMap<TeamId, Team>,
    learners: BTreeMap<LearnerId, Learner>,
    next_team: u64,
    next_learner: u64,
    generation: usize,
    rng: Pcg64,
}

impl Trainer {
    /// Creates `population_size` root teams of random atomic learners.
    pub fn new(params: TrainerParams, seed: u64) -> Result<Self, TrainerError> {
        if params.population_size == 0 {
            return Err(TrainerError::EmptyPopulation);
        }
        if params.action_count == 0 {
            return Err(TrainerError::NoActions);
        }

        let mut trainer = Self {
            params,
            teams: BTreeMap::new(),
            learners: BTreeMap::new(),
            next_team: 0,
            next_learner: 0,
            generation: 0,
            rng: Pcg64::seed_from_u64(seed),
        };
        for _ in 0..trainer.params.population_size {
            trainer.add_initial_team();
        }
        Ok(trainer)
    }

    fn add_initial_team(&mut self) {
        let size = self
            .rng
            .random_range(2..=self.params.initial_team_size.max(2));
        let action_count = self.params.action_count;
        let first = self.rng.random_range(0..action_count);
        let mut learners = Vec::with_capacity(size);
        for i in 0..size {
            // the first two learners take distinct actions where the task allows it
            let action = match i {
                0 => first,
                1 if action_count > 1 => {
                    (first + self.rng.random_range(1..action_count)) % action_count
                }
                _ => self.rng.random_range(0..action_count),
            };
            let program = Program::random(&mut self.rng, self.params.initial_program_len);
            learners.push(self.insert_learner(Learner {
                program,
                action: LearnerAction::Atomic(action),
            }));
        }
        let id = self.allocate_team();
        self.teams.insert(
            id,
            Team {
                learners,
                outcomes: BTreeMap::new(),
            },
        );
    }

    #[must_use]
    pub fn params(&self) -> &TrainerParams {
        &self.params
    }

    /// Number of evolution steps performed so far.
    #[must_use]
    pub fn generation(&self) -> usize {
        self.generation
    }

    #[must_use]
    pub fn team_count(&self) -> usize {
        self.teams.len()
    }

    #[must_use]
    pub fn learner_count(&self) -> usize {
        self.learners.len()
    }

    #[must_use]
    pub fn team(&self, id: TeamId) -> Option<&Team> {
        self.teams.get(&id)
    }

    /// Teams no learner points to, in creation order.
    #[must_use]
    pub fn root_ids(&self) -> Vec<TeamId> {
        let referenced = self.referenced_teams();
        self.teams
            .keys()
            .copied()
            .filter(|id| !referenced.contains(id))
            .collect()
    }

    fn referenced_teams(&self) -> BTreeSet<TeamId> {
        self.teams
            .values()
            .flat_map(|team| &team.learners)
            .filter_map(|id| self.learners.get(id))
            .filter_map(|learner| learner.action.team())
            .collect()
    }

    fn ranking(&self, task: &str) -> Ranking {
        let roots = self.root_ids();
        Ranking::from_outcomes(
            task,
            roots
                .iter()
                .filter_map(|id| Some((AgentId::from(*id), &self.teams.get(id)?.outcomes))),
        )
    }

    /// Teams and learners reachable from `root`.
    fn reachable(&self, root: TeamId) -> (BTreeSet<TeamId>, BTreeSet<LearnerId>) {
        let mut teams = BTreeSet::new();
        let mut learners = BTreeSet::new();
        let mut pending = vec![root];
        while let Some(id) = pending.pop() {
            let Some(team) = self.teams.get(&id) else {
                continue;
            };
            if !teams.insert(id) {
                continue;
            }
            for learner_id in &team.learners {
                learners.insert(*learner_id);
                if let Some(next) = self.learners.get(learner_id).and_then(|l| l.action.team()) {
                    pending.push(next);
                }
            }
        }
        (teams, learners)
    }

    fn policy(&self, root: TeamId) -> TeamPolicy {
        let (team_ids, learner_ids) = self.reachable(root);
        let teams = team_ids
            .into_iter()
            .filter_map(|id| Some((id, self.teams.get(&id)?.learners.clone())))
            .collect();
        let learners = learner_ids
            .into_iter()
            .filter_map(|id| Some((id, self.learners.get(&id)?.clone())))
            .collect();
        TeamPolicy::new(
            root,
            self.params.traversal,
            self.params.shared_memory,
            teams,
            learners,
        )
    }

    fn allocate_team(&mut self) -> TeamId {
        let id = TeamId(self.next_team);
        self.next_team += 1;
        id
    }

    fn insert_learner(&mut self, learner: Learner) -> LearnerId {
        let id = LearnerId(self.next_learner);
        self.next_learner += 1;
        self.learners.insert(id, learner);
        id
    }

    /// Removes unreachable learners and teams until nothing changes.
    ///
    /// Teams in `keep` are never removed.
    fn collect_garbage(&mut self, keep: &BTreeSet<TeamId>) {
        loop {
            let held = self
                .teams
                .values()
                .flat_map(|team| team.learners.iter().copied())
                .collect::<BTreeSet<_>>();
            let learners_before = self.learners.len();
            self.learners.retain(|id, _| held.contains(id));

            let referenced = self.referenced_teams();
            let teams_before = self.teams.len();
            self.teams
                .retain(|id, _| keep.contains(id) || referenced.contains(id));

            if self.learners.len() == learners_before && self.teams.len() == teams_before {
                break;
            }
        }
    }

    fn random_action(&mut self, allow_team: bool) -> LearnerAction {
        if allow_team && !self.teams.is_empty() && self.rng.random_bool(self.params.team_pointer) {
            let index = self.rng.random_range(0..self.teams.len());
            if let Some(id) = self.teams.keys().nth(index) {
                return LearnerAction::Team(*id);
            }
        }
        LearnerAction::Atomic(self.rng.random_range(0..self.params.action_count))
    }

    fn has_atomic(&self, learners: &[LearnerId], except: Option<usize>) -> bool {
        learners.iter().enumerate().any(|(i, id)| {
            Some(i) != except && self.learners.get(id).is_some_and(|l| l.action.is_atomic())
        })
    }

    /// Clones `parent` into a new root team and mutates the clone.
    fn add_offspring(&mut self, parent: TeamId) {
        let mut learners = self
            .teams
            .get(&parent)
            .map(|team| team.learners.clone())
            .unwrap_or_default();

        while learners.len() > 1 && self.rng.random_bool(self.params.learner_delete) {
            let index = self.rng.random_range(0..learners.len());
            if self.has_atomic(&learners, Some(index)) {
                learners.remove(index);
            }
        }

        while learners.len() < self.params.max_team_size
            && self.rng.random_bool(self.params.learner_add)
        {
            let outside = self
                .learners
                .keys()
                .copied()
                .filter(|id| !learners.contains(id))
                .collect::<Vec<_>>();
            let Some(&id) = outside.choose(&mut self.rng) else {
                break;
            };
            learners.push(id);
        }

        for index in 0..learners.len() {
            if !self.rng.random_bool(self.params.learner_mutate) {
                continue;
            }
            let Some(mut learner) = self.learners.get(&learners[index]).cloned() else {
                continue;
            };
            learner.program.mutate(&mut self.rng, &self.params.program);
            if self.rng.random_bool(self.params.action_change) {
                let allow_team = self.has_atomic(&learners, Some(index));
                learner.action = self.random_action(allow_team);
            }
            learners[index] = self.insert_learner(learner);
        }

        if !self.has_atomic(&learners, None) {
            let action = self.random_action(false);
            let program = Program::random(&mut self.rng, self.params.initial_program_len);
            learners.push(self.insert_learner(Learner { program, action }));
        }

        let id = self.allocate_team();
        self.teams.insert(
            id,
            Team {
                learners,
                outcomes: BTreeMap::new(),
            },
        );
    }
}

impl PopulationManager for Trainer {
    type Policy = TeamPolicy;
    type Candidate = TeamPolicy;

    fn agents(&self) -> Vec<AgentHandle<TeamPolicy>> {
        self.root_ids()
            .into_iter()
            .filter_map(|id| {
                let team = self.teams.get(&id)?;
                Some(AgentHandle::new(
                    id.into(),
                    self.policy(id),
                    team.outcomes.clone(),
                ))
            })
            .collect()
    }

    fn apply_scores(&mut self, task: &str, records: Vec<ScoreRecord>) -> Ranking {
        for record in records {
            match self.teams.get_mut(&TeamId::from(record.id)) {
                Some(team) => team.outcomes = record.outcomes,
                None => warn!(agent = %record.id, "score for unknown team ignored"),
            }
        }
        self.ranking(task)
    }

    fn evolve(&mut self, task: &str) {
        let ranking = self.ranking(task);
        if ranking.is_empty() {
            warn!("no root teams left to evolve");
            return;
        }
        let keep = (ranking.len() / 2).max(1);
        let (survivors, dropped) = ranking.entries().split_at(keep);
        let survivors = survivors
            .iter()
            .map(|entry| (TeamId::from(entry.id), entry.fitness))
            .collect::<Vec<_>>();
        for entry in dropped {
            self.teams.remove(&TeamId::from(entry.id));
        }
        let kept = survivors.iter().map(|(id, _)| *id).collect();
        self.collect_garbage(&kept);

        let target = self.params.population_size;
        let max_attempts = target.saturating_mul(10).max(10);
        let mut attempts = 0;
        let mut roots = self.root_ids().len();
        while roots < target && attempts < max_attempts {
            let parent = tournament_select(&survivors, self.params.tournament_size, &mut self.rng);
            self.add_offspring(parent);
            roots = self.root_ids().len();
            attempts += 1;
        }
        if roots < target {
            warn!(roots, target, attempts, "population could not be refilled");
        }

        self.generation += 1;
        debug!(
            generation = self.generation,
            roots,
            teams = self.teams.len(),
            learners = self.learners.len(),
            "population evolved"
        );
    }

    fn candidate(&self, id: AgentId) -> Option<TeamPolicy> {
        let id = TeamId::from(id);
        self.teams.contains_key(&id).then(|| self.policy(id))
    }

    fn structure(&self, id: AgentId) -> StructureCounts {
        let (teams, learners) = self.reachable(id.into());
        let mut counts = StructureCounts {
            teams: teams.len(),
            learners: learners.len(),
            ..StructureCounts::default()
        };
        for learner in learners.iter().filter_map(|id| self.learners.get(id)) {
            learner.program.tally(&mut counts);
        }
        counts
    }
}

/// Picks `tournament_size` distinct survivors and returns the fittest.
///
/// Unscored survivors lose against any scored one.
fn tournament_select<R>(survivors: &[(TeamId, Option<f64>)], tournament_size: usize, rng: &mut R) -> TeamId
where
    R: Rng + ?Sized,
{
    survivors
        .choose_multiple(rng, tournament_size.max(1))
        .max_by(|a, b| compare_fitness(a.1, b.1))
        .map_or(TeamId(0), |(id, _)| *id)
}

fn compare_fitness(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.total_cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}
