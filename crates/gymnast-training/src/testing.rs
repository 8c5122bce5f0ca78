//! Scripted environments, policies and a small population used by the tests.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use gymnast_env::{
    Action, ActionSpace, EnvError, Environment, EnvironmentFactory, Observation, Step,
};
use serde::{Deserialize, Serialize};

use crate::{
    agent::{AgentHandle, AgentId, Outcomes, Policy, ScoreRecord},
    population::{PopulationManager, Ranking},
    stats::StructureCounts,
};

/// Task served by [`ScriptedEnvironments::echo`]: the reward is the action index.
pub const ECHO_TASK: &str = "echo";
const SCRIPTED_TASK: &str = "scripted";

#[derive(Debug, Clone)]
enum Script {
    Constant(f64),
    TerminalAt(usize),
    EpisodeRewards(Vec<f64>),
    FailingAt(usize),
    Echo,
}

/// Environment factory whose environments follow a fixed script.
///
/// Counts created environments and stepped frames across all instances.
#[derive(Debug, Clone)]
pub struct ScriptedEnvironments {
    script: Script,
    created: Arc<AtomicUsize>,
    steps: Arc<AtomicUsize>,
}

impl ScriptedEnvironments {
    fn new(script: Script) -> Self {
        Self {
            script,
            created: Arc::default(),
            steps: Arc::default(),
        }
    }

    /// Never terminates, pays `reward` every frame.
    pub fn constant(reward: f64) -> Self {
        Self::new(Script::Constant(reward))
    }

    /// Pays `1.0` per frame and reports terminal on frame `frame`.
    pub fn terminal_at(frame: usize) -> Self {
        Self::new(Script::TerminalAt(frame))
    }

    /// Episode `k` pays `rewards[k]` on its terminal frame (frame 100), nothing before.
    pub fn per_episode_rewards(rewards: Vec<f64>) -> Self {
        Self::new(Script::EpisodeRewards(rewards))
    }

    /// Fails when stepping frame `frame`.
    pub fn failing_at(frame: usize) -> Self {
        Self::new(Script::FailingAt(frame))
    }

    /// Task [`ECHO_TASK`]: one frame per episode, reward equals the action.
    pub fn echo() -> Self {
        Self::new(Script::Echo)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }

    fn task(&self) -> &'static str {
        match self.script {
            Script::Echo => ECHO_TASK,
            _ => SCRIPTED_TASK,
        }
    }
}

impl EnvironmentFactory for ScriptedEnvironments {
    fn task_names(&self) -> Vec<&str> {
        vec![self.task()]
    }

    fn make(&self, task: &str, _seed: u64) -> Result<Box<dyn Environment>, EnvError> {
        if task != self.task() {
            return Err(EnvError::UnknownTask {
                task: task.to_owned(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEnvironment {
            script: self.script.clone(),
            steps: Arc::clone(&self.steps),
            episode: None,
            frame: 0,
        }))
    }
}

#[derive(Debug)]
struct ScriptedEnvironment {
    script: Script,
    steps: Arc<AtomicUsize>,
    episode: Option<usize>,
    frame: usize,
}

impl Environment for ScriptedEnvironment {
    fn action_space(&self) -> ActionSpace {
        match self.script {
            Script::Echo => ActionSpace::discrete(100),
            _ => ActionSpace::discrete(2),
        }
    }

    fn reset(&mut self) -> Observation {
        self.episode = Some(self.episode.map_or(0, |e| e + 1));
        self.frame = 0;
        vec![0.0]
    }

    fn step(&mut self, action: Action) -> Result<Step, EnvError> {
        let episode = self.episode.ok_or(EnvError::NotReset)?;
        let frame = self.frame;
        self.frame += 1;
        self.steps.fetch_add(1, Ordering::SeqCst);

        #[expect(clippy::cast_precision_loss)]
        let (reward, terminal) = match &self.script {
            Script::Constant(reward) => (*reward, false),
            Script::TerminalAt(at) => (1.0, frame == *at),
            Script::EpisodeRewards(rewards) => {
                if frame == 100 {
                    (rewards[episode], true)
                } else {
                    (0.0, false)
                }
            }
            Script::FailingAt(at) => {
                if frame == *at {
                    return Err(EnvError::Simulation {
                        message: "scripted failure".to_owned(),
                    });
                }
                (1.0, false)
            }
            Script::Echo => (action as f64, true),
        };
        Ok(Step {
            observation: vec![reward],
            reward,
            terminal,
        })
    }
}

/// Always picks action `0` and counts how often it was asked.
#[derive(Debug, Clone, Default)]
pub struct CountingPolicy {
    calls: usize,
}

impl CountingPolicy {
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Policy for CountingPolicy {
    fn act(&mut self, _observation: &[f64]) -> Action {
        self.calls += 1;
        0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestPolicy {
    Fixed(Action),
    Panic,
    Stall(Duration),
}

impl Policy for TestPolicy {
    fn act(&mut self, _observation: &[f64]) -> Action {
        match self {
            TestPolicy::Fixed(action) => *action,
            TestPolicy::Panic => panic!("policy failure"),
            TestPolicy::Stall(duration) => {
                thread::sleep(*duration);
                0
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockMember {
    pub id: AgentId,
    pub action: Action,
    pub outcomes: Outcomes,
}

/// Deterministic population: keeps the better half, refills with children whose
/// action is derived from their parent's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockPopulation {
    pub members: Vec<MockMember>,
    pub next_id: u64,
    pub evolutions: usize,
}

impl MockPopulation {
    pub fn new(actions: impl IntoIterator<Item = Action>) -> Self {
        let members = actions
            .into_iter()
            .zip(0..)
            .map(|(action, id)| MockMember {
                id: AgentId(id),
                action,
                outcomes: Outcomes::new(),
            })
            .collect::<Vec<_>>();
        Self {
            next_id: members.len() as u64,
            members,
            evolutions: 0,
        }
    }

    fn ranking(&self, task: &str) -> Ranking {
        Ranking::from_outcomes(task, self.members.iter().map(|m| (m.id, &m.outcomes)))
    }
}

impl PopulationManager for MockPopulation {
    type Policy = TestPolicy;
    type Candidate = MockMember;

    fn agents(&self) -> Vec<AgentHandle<TestPolicy>> {
        self.members
            .iter()
            .map(|m| AgentHandle::new(m.id, TestPolicy::Fixed(m.action), m.outcomes.clone()))
            .collect()
    }

    fn apply_scores(&mut self, task: &str, records: Vec<ScoreRecord>) -> Ranking {
        for record in records {
            if let Some(member) = self.members.iter_mut().find(|m| m.id == record.id) {
                member.outcomes.extend(record.outcomes);
            }
        }
        self.ranking(task)
    }

    fn evolve(&mut self, task: &str) {
        let ranking = self.ranking(task);
        let keep = self.members.len().div_ceil(2);
        let survivors = ranking
            .ids()
            .take(keep)
            .filter_map(|id| self.members.iter().find(|m| m.id == id).cloned())
            .collect::<Vec<_>>();
        let mut next = survivors.clone();
        let mut i = 0;
        while next.len() < self.members.len() {
            let parent = &survivors[i % survivors.len()];
            next.push(MockMember {
                id: AgentId(self.next_id),
                action: (parent.action * 7 + 3) % 100,
                outcomes: Outcomes::new(),
            });
            self.next_id += 1;
            i += 1;
        }
        self.members = next;
        self.evolutions += 1;
    }

    fn candidate(&self, id: AgentId) -> Option<MockMember> {
        self.members.iter().find(|m| m.id == id).cloned()
    }

    fn structure(&self, id: AgentId) -> StructureCounts {
        let action = self.candidate(id).map_or(0, |m| m.action);
        StructureCounts {
            learners: action % 5 + 1,
            teams: 1,
            instructions: action,
            ..StructureCounts::default()
        }
    }
}
