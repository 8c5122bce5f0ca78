use std::path::PathBuf;

use anyhow::{Context as _, bail};
use chrono::{DateTime, Utc};
use gymnast_env::{BuiltinEnvironments, EnvironmentFactory as _};
use gymnast_tpg::policy::TeamPolicy;
use gymnast_training::{
    agent::{AgentHandle, Outcomes},
    episode::{EpisodeRunner, EvaluationSpec},
};
use serde::Serialize;
use tracing::info;

use crate::util;

#[derive(Debug, Clone, clap::Args)]
pub(crate) struct EvaluateArg {
    /// Best-candidate file written by `train` (`teams/best_gen_<g>.json`)
    candidate: PathBuf,
    #[arg(long, default_value = "cart-pole")]
    task: String,
    #[arg(long, default_value_t = 10)]
    episodes: usize,
    /// Frame budget per episode
    #[arg(long, default_value_t = 500)]
    frames: usize,
    #[arg(long, default_value_t = 0)]
    seed: u64,
    /// Output file path (stdout if omitted or `-`)
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct EvaluationReport {
    candidate: PathBuf,
    task: String,
    episodes: usize,
    frames_per_episode: usize,
    seed: u64,
    mean_score: f64,
    teams: usize,
    learners: usize,
    evaluated_at: DateTime<Utc>,
}

pub(crate) fn run(arg: &EvaluateArg) -> anyhow::Result<()> {
    let factory = BuiltinEnvironments::new();
    if !factory.has_task(&arg.task) {
        bail!(
            "Unknown task '{}' (available: {})",
            arg.task,
            factory.task_names().join(", ")
        );
    }

    let policy: TeamPolicy = util::read_json_file("candidate", &arg.candidate)?;
    let teams = policy.team_count();
    let learners = policy.learner_count();
    let mut agent = AgentHandle::new(policy.root().into(), policy, Outcomes::new());

    let runner = EpisodeRunner::new(EvaluationSpec {
        task: arg.task.clone(),
        episodes: arg.episodes,
        max_frames: arg.frames,
    });
    let mean_score = runner
        .run(&mut agent, &factory, arg.seed)
        .with_context(|| format!("Failed to evaluate {}", arg.candidate.display()))?;
    info!(agent = %agent.id(), task = %arg.task, mean_score, "candidate evaluated");

    let report = EvaluationReport {
        candidate: arg.candidate.clone(),
        task: arg.task.clone(),
        episodes: arg.episodes,
        frames_per_episode: arg.frames,
        seed: arg.seed,
        mean_score,
        teams,
        learners,
        evaluated_at: Utc::now(),
    };
    util::write_json_report(&report, arg.output.as_deref())
}
