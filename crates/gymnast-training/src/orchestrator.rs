//! The generation loop.
//!
//! Each generation runs the same strictly sequential steps:
//!
//! 1. take agent snapshots from the population
//! 2. dispatch them to the worker pool and wait for every record
//! 3. apply the records to the population, obtaining the fitness ranking
//! 4. derive [`GenerationStats`] from the ranking
//! 5. persist the best candidate, the full checkpoint and the statistics row
//! 6. evolve the population
//!
//! Nothing of generation `g + 1` starts before step 6 of generation `g` is done.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use gymnast_env::EnvironmentFactory;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{info, warn};

use crate::{
    agent::AgentId,
    checkpoint::{self, CheckpointError, RunCheckpoint},
    config::{ConfigError, RunConfiguration},
    dispatch::{DispatchError, EvaluationDispatcher, splitmix64},
    population::PopulationManager,
    results::ResultsLayout,
    stats::GenerationStats,
};

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum OrchestratorError {
    #[display("invalid configuration")]
    Config { source: ConfigError },
    #[display("checkpoint was taken for task '{checkpoint}', but the run is configured for '{configured}'")]
    TaskMismatch {
        checkpoint: String,
        configured: String,
    },
    #[display("failed to dispatch generation {generation}")]
    Dispatch {
        generation: usize,
        source: DispatchError,
    },
    #[display("generation {generation} produced no candidate to persist")]
    NoCandidate { generation: usize },
    #[display("failed to persist generation {generation}")]
    Persist {
        generation: usize,
        source: CheckpointError,
    },
    #[display("failed to append statistics of generation {generation}")]
    StatsLog {
        generation: usize,
        source: csv::Error,
    },
}

/// Statistics of every generation run by this process and the final population.
#[derive(Debug)]
pub struct RunSummary<M> {
    pub generations: Vec<GenerationStats>,
    pub population: M,
}

/// Drives the evaluate/apply/persist/evolve loop over generations.
#[derive(Debug)]
pub struct GenerationOrchestrator<M> {
    config: RunConfiguration,
    population: M,
    factory: Arc<dyn EnvironmentFactory>,
    dispatcher: EvaluationDispatcher,
    layout: ResultsLayout,
    next_generation: usize,
    started: DateTime<Utc>,
}

impl<M> GenerationOrchestrator<M>
where
    M: PopulationManager + Serialize + DeserializeOwned,
{
    /// Starts a new run at generation 0 with a freshly initialized population.
    pub fn new(
        config: RunConfiguration,
        population: M,
        factory: Arc<dyn EnvironmentFactory>,
        layout: ResultsLayout,
    ) -> Result<Self, OrchestratorError> {
        config
            .validate(factory.as_ref())
            .map_err(|source| OrchestratorError::Config { source })?;
        let dispatcher = EvaluationDispatcher::new(config.pool_size, config.job_timeout);
        Ok(Self {
            config,
            population,
            factory,
            dispatcher,
            layout,
            next_generation: 0,
            started: Utc::now(),
        })
    }

    /// Continues a run from the checkpoint of generation `g`.
    ///
    /// The checkpoint holds the population with the scores of `g` applied; the
    /// evolve step of `g` is performed here and the run continues at `g + 1`.
    /// Elapsed time keeps counting from the start of the original run.
    pub fn resume(
        config: RunConfiguration,
        checkpoint: RunCheckpoint<M>,
        factory: Arc<dyn EnvironmentFactory>,
        layout: ResultsLayout,
    ) -> Result<Self, OrchestratorError> {
        if checkpoint.task != config.task {
            return Err(OrchestratorError::TaskMismatch {
                checkpoint: checkpoint.task,
                configured: config.task,
            });
        }
        let mut orchestrator = Self::new(config, checkpoint.population, factory, layout)?;
        info!(
            generation = checkpoint.generation,
            saved_at = %checkpoint.saved_at,
            "resuming after checkpoint"
        );
        orchestrator.population.evolve(&orchestrator.config.task);
        orchestrator.next_generation = checkpoint.generation + 1;
        orchestrator.started = checkpoint.run_started;
        Ok(orchestrator)
    }

    #[must_use]
    pub fn population(&self) -> &M {
        &self.population
    }

    #[must_use]
    pub fn layout(&self) -> &ResultsLayout {
        &self.layout
    }

    /// Index of the generation [`GenerationOrchestrator::run_generation`] runs next.
    #[must_use]
    pub fn next_generation(&self) -> usize {
        self.next_generation
    }

    /// Wall-clock time since the run started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.started).to_std().unwrap_or_default()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.next_generation >= self.config.generations
    }

    /// Runs all remaining generations.
    pub fn run(mut self) -> Result<RunSummary<M>, OrchestratorError> {
        let mut generations = vec![];
        while !self.is_finished() {
            generations.push(self.run_generation()?);
        }
        info!(
            generations = generations.len(),
            elapsed_hours = self.elapsed().as_secs_f64() / 3600.0,
            "run complete"
        );
        Ok(RunSummary {
            generations,
            population: self.population,
        })
    }

    /// Runs one full generation.
    pub fn run_generation(&mut self) -> Result<GenerationStats, OrchestratorError> {
        let generation = self.next_generation;
        let task = self.config.task.clone();

        let agents = self.population.agents();
        info!(generation, agents = agents.len(), task = %task, "evaluating generation");
        let report = self
            .dispatcher
            .dispatch(
                agents,
                &self.config.evaluation_spec(),
                &self.factory,
                generation_seed(self.config.seed, generation),
            )
            .map_err(|source| OrchestratorError::Dispatch { generation, source })?;
        let failures = report.failure_count();
        if failures > 0 {
            warn!(generation, failures, "some agents failed evaluation");
        }

        let ranking = self.population.apply_scores(&task, report.records);
        let best = ranking
            .best()
            .ok_or(OrchestratorError::NoCandidate { generation })?
            .id;
        let structure = self.population.structure(best);
        let stats = GenerationStats::new(
            generation,
            self.elapsed(),
            &ranking,
            structure,
            failures,
        );

        self.persist(generation, best, &stats)?;
        info!(
            generation,
            min = stats.min_fitness,
            max = stats.max_fitness,
            avg = stats.avg_fitness,
            best = %best,
            skipped = report.skipped,
            elapsed_hours = stats.elapsed_hours,
            "generation complete"
        );

        self.population.evolve(&task);
        self.next_generation += 1;
        Ok(stats)
    }

    fn persist(
        &self,
        generation: usize,
        best: AgentId,
        stats: &GenerationStats,
    ) -> Result<(), OrchestratorError> {
        let persist_err = |source| OrchestratorError::Persist { generation, source };

        let candidate = self
            .population
            .candidate(best)
            .ok_or(OrchestratorError::NoCandidate { generation })?;
        checkpoint::write_json(&self.layout.candidate_path(generation), &candidate)
            .map_err(persist_err)?;

        RunCheckpoint {
            generation,
            task: self.config.task.clone(),
            run_started: self.started,
            saved_at: Utc::now(),
            population: &self.population,
        }
        .save(&self.layout.checkpoint_path(generation))
        .map_err(persist_err)?;

        self.layout
            .append_stats(stats)
            .map_err(|source| OrchestratorError::StatsLog { generation, source })
    }
}

fn generation_seed(seed: u64, generation: usize) -> u64 {
    splitmix64(seed ^ splitmix64(generation as u64))
}
