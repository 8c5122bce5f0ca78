//! Running one agent through repeated episodes of one task.
//!
//! The runner turns `(agent, task, episodes, frame budget)` into one scalar: the
//! mean per-episode reward. The score is recorded on the agent handle and the
//! handle's full outcome map is emitted as a [`ScoreRecord`].
//!
//! # Episode Structure
//!
//! ```text
//! reset ─→ warm-up frames (random actions, no reward, agent not asked)
//!       ─→ agent frames (agent acts, reward accumulated)
//!       ─→ stop on terminal state or when the frame budget is spent
//! ```
//!
//! The warm-up length is drawn uniformly from `0..=30` frames, but only when more
//! than one episode is requested. A single-episode evaluation never warms up, so
//! it is deterministic for a fixed seed and deterministic agent.
//!
//! Warm-up frames count against the frame budget.

use std::time::Instant;

use gymnast_env::{EnvError, Environment, EnvironmentFactory};
use rand::{Rng, SeedableRng as _};
use rand_pcg::Pcg64;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::{AgentHandle, Policy, ScoreRecord};

/// Upper bound (inclusive) of the random warm-up length.
pub const MAX_WARMUP_FRAMES: usize = 30;

/// What to evaluate: one task, a number of episodes and a per-episode frame budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationSpec {
    pub task: String,
    pub episodes: usize,
    pub max_frames: usize,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum EvaluationError {
    #[display("at least one episode is required")]
    NoEpisodes,
    #[display("failed to create environment for task '{task}'")]
    CreateEnvironment { task: String, source: EnvError },
    #[display("task '{task}' has no valid actions")]
    EmptyActionSpace { task: String },
    #[display("environment step failed in episode {episode} at frame {frame}")]
    Step {
        episode: usize,
        frame: usize,
        source: EnvError,
    },
    #[display("deadline exceeded in episode {episode} at frame {frame}")]
    DeadlineExceeded { episode: usize, frame: usize },
}

/// Drives an agent through the episodes described by an [`EvaluationSpec`].
#[derive(Debug, Clone)]
pub struct EpisodeRunner {
    spec: EvaluationSpec,
    deadline: Option<Instant>,
}

impl EpisodeRunner {
    #[must_use]
    pub fn new(spec: EvaluationSpec) -> Self {
        Self {
            spec,
            deadline: None,
        }
    }

    /// Makes the runner give up with [`EvaluationError::DeadlineExceeded`] once
    /// `deadline` has passed. Checked before every frame.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn spec(&self) -> &EvaluationSpec {
        &self.spec
    }

    /// Evaluates `agent` and returns a snapshot of its outcomes afterwards.
    pub fn evaluate<P>(
        &self,
        agent: &mut AgentHandle<P>,
        factory: &dyn EnvironmentFactory,
        seed: u64,
    ) -> Result<ScoreRecord, EvaluationError>
    where
        P: Policy,
    {
        self.run(agent, factory, seed)?;
        Ok(agent.to_record())
    }

    /// Evaluates `agent` on the task and records the mean episode score on it.
    ///
    /// If the agent already holds a score for the task, that score is returned
    /// and no environment is created.
    pub fn run<P>(
        &self,
        agent: &mut AgentHandle<P>,
        factory: &dyn EnvironmentFactory,
        seed: u64,
    ) -> Result<f64, EvaluationError>
    where
        P: Policy,
    {
        let task = self.spec.task.as_str();
        if let Some(score) = agent.score(task) {
            debug!(agent = %agent.id(), task, "agent can skip");
            return Ok(score);
        }
        if self.spec.episodes == 0 {
            return Err(EvaluationError::NoEpisodes);
        }

        let mut rng = Pcg64::seed_from_u64(seed);
        let mut env = factory
            .make(task, rng.random())
            .map_err(|source| EvaluationError::CreateEnvironment {
                task: task.to_owned(),
                source,
            })?;
        if env.action_space().count() == 0 {
            return Err(EvaluationError::EmptyActionSpace {
                task: task.to_owned(),
            });
        }

        let mut total = 0.0;
        for episode in 0..self.spec.episodes {
            let score = self.run_episode(env.as_mut(), agent, &mut rng, episode)?;
            debug!(agent = %agent.id(), task, episode, score, "episode finished");
            total += score;
        }
        drop(env);

        #[expect(clippy::cast_precision_loss)]
        let mean = total / self.spec.episodes as f64;
        agent.record_reward(task, mean);
        Ok(mean)
    }

    fn run_episode<P, R>(
        &self,
        env: &mut dyn Environment,
        agent: &mut AgentHandle<P>,
        rng: &mut R,
        episode: usize,
    ) -> Result<f64, EvaluationError>
    where
        P: Policy,
        R: Rng + ?Sized,
    {
        let mut observation = env.reset();
        let warmup_frames = if self.spec.episodes > 1 {
            rng.random_range(0..=MAX_WARMUP_FRAMES)
        } else {
            0
        };
        let action_space = env.action_space();

        let mut score = 0.0;
        for frame in 0..self.spec.max_frames {
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(EvaluationError::DeadlineExceeded { episode, frame });
            }

            let warming_up = frame < warmup_frames;
            let action = if warming_up {
                action_space.sample(rng)
            } else {
                agent.act(&observation)
            };
            let step = env
                .step(action)
                .map_err(|source| EvaluationError::Step {
                    episode,
                    frame,
                    source,
                })?;
            if !warming_up {
                score += step.reward;
            }
            observation = step.observation;
            if step.terminal {
                break;
            }
        }
        Ok(score)
    }
}
