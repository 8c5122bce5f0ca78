use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use gymnast_env::{BuiltinEnvironments, EnvironmentFactory};
use gymnast_tpg::trainer::{Trainer, TrainerParams};
use gymnast_training::{
    checkpoint::{self, RunCheckpoint},
    config::{RunConfiguration, TraversalStrategy},
    orchestrator::{GenerationOrchestrator, RunSummary},
    results::{ResultsLayout, RunInfo},
};
use serde::Serialize;
use tracing::info;

use crate::util;

#[derive(Debug, Clone, clap::Args)]
pub(crate) struct TrainArg {
    /// Task every agent is evaluated on
    #[arg(long, default_value = "cart-pole")]
    task: String,
    /// Number of root candidates per generation
    #[arg(long, default_value_t = 60)]
    population: usize,
    /// Total number of generations, including those before a resume
    #[arg(long, default_value_t = 100)]
    generations: usize,
    /// Episodes per evaluation
    #[arg(long, default_value_t = 1)]
    episodes: usize,
    /// Frame budget per episode
    #[arg(long, default_value_t = 500)]
    frames: usize,
    /// Maximum number of concurrent evaluation workers
    #[arg(long, default_value_t = 4)]
    threads: usize,
    /// Let all learners of a candidate share one memory bank
    #[arg(long)]
    shared_memory: bool,
    /// Graph traversal strategy (`team` or `learner`)
    #[arg(long, default_value = "team")]
    traversal: TraversalStrategy,
    /// Results directory, suffixed with `_1`, `_2`, ... if it exists
    #[arg(long, default_value = "results")]
    results: PathBuf,
    /// Checkpoint file to resume from
    #[arg(long)]
    resume: Option<PathBuf>,
    /// Wall-clock limit for evaluating a single agent
    #[arg(long)]
    job_timeout_secs: Option<u64>,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Where to write the run summary (stdout if omitted or `-`)
    #[arg(long)]
    summary: Option<PathBuf>,
}

impl TrainArg {
    fn to_config(&self) -> RunConfiguration {
        RunConfiguration {
            task: self.task.clone(),
            population_size: self.population,
            generations: self.generations,
            episodes: self.episodes,
            frames_per_episode: self.frames,
            pool_size: self.threads,
            shared_memory: self.shared_memory,
            traversal: self.traversal,
            results_dir: self.results.clone(),
            resume_from: self.resume.clone(),
            job_timeout: self.job_timeout_secs.map(Duration::from_secs),
            seed: self.seed,
        }
    }
}

#[derive(Debug, Serialize)]
struct TrainSummary {
    task: String,
    results_dir: PathBuf,
    finished_at: DateTime<Utc>,
    resumed_after_generation: Option<usize>,
    generations_run: usize,
    last_generation: Option<usize>,
    best_fitness: Option<f64>,
    failed_jobs: usize,
    root_teams: usize,
    teams: usize,
    learners: usize,
}

impl TrainSummary {
    fn new(
        config: &RunConfiguration,
        results_dir: &Path,
        resumed_after_generation: Option<usize>,
        summary: &RunSummary<Trainer>,
    ) -> Self {
        let last = summary.generations.last();
        Self {
            task: config.task.clone(),
            results_dir: results_dir.to_owned(),
            finished_at: Utc::now(),
            resumed_after_generation,
            generations_run: summary.generations.len(),
            last_generation: last.map(|stats| stats.generation),
            best_fitness: last
                .map(|stats| stats.max_fitness)
                .filter(|fitness| fitness.is_finite()),
            failed_jobs: summary.generations.iter().map(|stats| stats.failures).sum(),
            root_teams: summary.population.root_ids().len(),
            teams: summary.population.team_count(),
            learners: summary.population.learner_count(),
        }
    }
}

pub(crate) fn run(arg: &TrainArg) -> anyhow::Result<()> {
    let config = arg.to_config();
    let factory: Arc<dyn EnvironmentFactory> = Arc::new(BuiltinEnvironments::new());
    config
        .validate(factory.as_ref())
        .context("Invalid training configuration")?;

    let layout = ResultsLayout::create_unique(&config.results_dir).with_context(|| {
        format!(
            "Failed to create results directory: {}",
            config.results_dir.display()
        )
    })?;
    let results_dir = layout.root().to_owned();

    let (orchestrator, resumed_after) = match &config.resume_from {
        Some(path) => {
            let checkpoint = RunCheckpoint::<Trainer>::load(path)
                .with_context(|| format!("Failed to load checkpoint: {}", path.display()))?;
            let generation = checkpoint.generation;
            let orchestrator =
                GenerationOrchestrator::resume(config.clone(), checkpoint, factory, layout)?;
            (orchestrator, Some(generation))
        }
        None => {
            let action_count = action_count(factory.as_ref(), &config)?;
            let trainer = Trainer::new(
                TrainerParams::from_config(&config, action_count),
                config.seed,
            )
            .context("Failed to create initial population")?;
            let orchestrator = GenerationOrchestrator::new(config.clone(), trainer, factory, layout)?;
            (orchestrator, None)
        }
    };

    let run_info = RunInfo::new(config.clone(), resumed_after);
    checkpoint::write_json(&orchestrator.layout().run_info_path(), &run_info)
        .context("Failed to write run info")?;
    info!(
        results = %results_dir.display(),
        task = %config.task,
        start_generation = orchestrator.next_generation(),
        generations = config.generations,
        "training started"
    );

    let summary = orchestrator.run()?;

    let report = TrainSummary::new(&config, &results_dir, resumed_after, &summary);
    util::write_json_report(&report, arg.summary.as_deref())
}

/// Asks a throwaway environment of the task for its number of actions.
fn action_count(factory: &dyn EnvironmentFactory, config: &RunConfiguration) -> anyhow::Result<usize> {
    let env = factory
        .make(&config.task, config.seed)
        .with_context(|| format!("Failed to create environment for task '{}'", config.task))?;
    Ok(env.action_space().count())
}
