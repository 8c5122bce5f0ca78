//! Generational evaluation of agent populations.
//!
//! This crate runs the outer loop of an evolutionary training run: every generation,
//! each agent of a population is evaluated on a task in an isolated worker, the
//! scores are folded back into the population, the results are persisted, and the
//! population is evolved.
//!
//! # How a Generation Works
//!
//! 1. **Snapshot** - The population hands out one [`agent::AgentHandle`] per root candidate
//! 2. **Dispatch** - [`dispatch::EvaluationDispatcher`] runs one job per agent on a bounded
//!    pool of fresh worker threads
//! 3. **Evaluate** - Inside a worker, [`episode::EpisodeRunner`] plays the configured number
//!    of episodes and records the mean episode reward on the handle
//! 4. **Apply** - Every [`agent::ScoreRecord`] is folded back via
//!    [`population::PopulationManager::apply_scores`], producing a [`population::Ranking`]
//! 5. **Persist** - The best candidate, a [`checkpoint::RunCheckpoint`] and a
//!    [`stats::GenerationStats`] row are written to the [`results::ResultsLayout`]
//! 6. **Evolve** - [`population::PopulationManager::evolve`] replaces the weakest candidates
//!
//! [`orchestrator::GenerationOrchestrator`] drives these steps in strict order.
//!
//! # Architecture
//!
//! ```text
//! GenerationOrchestrator
//!     ↓ snapshots
//! PopulationManager ──→ AgentHandle (id, policy, outcomes)
//!     ↓ dispatched by
//! EvaluationDispatcher (≤ pool_size workers, one job each)
//!     ↓ runs
//! EpisodeRunner ──→ Environment (gymnast-env)
//!     ↓ produces
//! ScoreRecord ──→ apply_scores ──→ Ranking ──→ GenerationStats
//! ```
//!
//! # Failure Handling
//!
//! A worker that panics, fails to build its environment, hits an environment error
//! or exceeds the job timeout never takes the run down. Its agent is reported with a
//! [`agent::JobFailure`]: the prior score is re-used if the agent had one, otherwise
//! the agent is left unscored and ranks last. Failing to persist a generation, on
//! the other hand, is fatal: the run stops before the population is evolved, so the
//! last checkpoint on disk is always consistent.
//!
//! # Determinism
//!
//! Every job receives a seed derived from the run seed, the generation index and
//! the agent id. Given the same configuration and a deterministic population, a run
//! that is interrupted and resumed from a checkpoint evolves exactly the same
//! population as an uninterrupted one.

pub mod agent;
pub mod checkpoint;
pub mod config;
pub mod dispatch;
pub mod episode;
pub mod orchestrator;
pub mod population;
pub mod results;
pub mod stats;

#[cfg(test)]
mod testing;
