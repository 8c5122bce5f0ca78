//! Run configuration.

use std::{path::PathBuf, time::Duration};

use gymnast_env::EnvironmentFactory;
use serde::{Deserialize, Serialize};

use crate::episode::EvaluationSpec;

/// How a candidate's decision graph is walked when it picks an action.
#[derive(
    Default,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    derive_more::FromStr,
    derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum TraversalStrategy {
    /// A team is entered at most once per decision.
    #[default]
    #[display("team")]
    Team,
    /// A learner is followed at most once per decision.
    #[display("learner")]
    Learner,
}

/// Every option recognized by a training run.
///
/// Built once at startup, checked with [`RunConfiguration::validate`] before any
/// worker is spawned, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    /// Name of the task every agent is evaluated on.
    pub task: String,
    /// Number of root candidates per generation.
    pub population_size: usize,
    /// Total number of generations, counted from the start of the original run.
    pub generations: usize,
    pub episodes: usize,
    pub frames_per_episode: usize,
    /// Maximum number of evaluation workers running at once.
    pub pool_size: usize,
    /// Whether learners of a candidate share one memory bank.
    pub shared_memory: bool,
    pub traversal: TraversalStrategy,
    pub results_dir: PathBuf,
    /// Checkpoint to resume from instead of starting a fresh population.
    pub resume_from: Option<PathBuf>,
    /// Wall-clock limit for evaluating a single agent.
    pub job_timeout: Option<Duration>,
    pub seed: u64,
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            task: "cart-pole".to_owned(),
            population_size: 60,
            generations: 100,
            episodes: 1,
            frames_per_episode: 500,
            pool_size: 4,
            shared_memory: false,
            traversal: TraversalStrategy::Team,
            results_dir: PathBuf::from("results"),
            resume_from: None,
            job_timeout: None,
            seed: 0,
        }
    }
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum ConfigError {
    #[display("unknown task '{task}' (available: {available})")]
    UnknownTask { task: String, available: String },
    #[display("worker pool size must be at least 1")]
    ZeroPoolSize,
    #[display("population size must be at least 1")]
    ZeroPopulation,
    #[display("generation count must be at least 1")]
    ZeroGenerations,
    #[display("episode count must be at least 1")]
    ZeroEpisodes,
    #[display("frame budget must be at least 1")]
    ZeroFrames,
    #[display("job timeout must be longer than zero")]
    ZeroTimeout,
    #[display("resume checkpoint '{}' is not a file", path.display())]
    ResumePath { path: PathBuf },
}

impl RunConfiguration {
    /// Checks every option against `factory` and the filesystem.
    pub fn validate(&self, factory: &dyn EnvironmentFactory) -> Result<(), ConfigError> {
        if !factory.has_task(&self.task) {
            return Err(ConfigError::UnknownTask {
                task: self.task.clone(),
                available: factory.task_names().join(", "),
            });
        }
        if self.pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if self.population_size == 0 {
            return Err(ConfigError::ZeroPopulation);
        }
        if self.generations == 0 {
            return Err(ConfigError::ZeroGenerations);
        }
        if self.episodes == 0 {
            return Err(ConfigError::ZeroEpisodes);
        }
        if self.frames_per_episode == 0 {
            return Err(ConfigError::ZeroFrames);
        }
        if self.job_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroTimeout);
        }
        match &self.resume_from {
            Some(path) if !path.is_file() => {
                return Err(ConfigError::ResumePath { path: path.clone() });
            }
            _ => {}
        }
        Ok(())
    }

    #[must_use]
    pub fn evaluation_spec(&self) -> EvaluationSpec {
        EvaluationSpec {
            task: self.task.clone(),
            episodes: self.episodes,
            max_frames: self.frames_per_episode,
        }
    }
}
