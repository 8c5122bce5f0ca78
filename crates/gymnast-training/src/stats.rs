//! Per-generation statistics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::population::Ranking;

/// Structural composition of a candidate.
///
/// `learners` and `teams` count the distinct sub-components reachable from the
/// candidate; the remaining fields count instructions by operation.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureCounts {
    pub learners: usize,
    pub teams: usize,
    pub instructions: usize,
    pub add: usize,
    pub subtract: usize,
    pub multiply: usize,
    pub divide: usize,
    pub negate: usize,
    pub mem_read: usize,
    pub mem_write: usize,
}

/// Summary of one completed generation.
///
/// Fitness values are computed over the members holding a score for the ranking
/// task; they are `NaN` if no member does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationStats {
    pub generation: usize,
    pub elapsed_hours: f64,
    pub min_fitness: f64,
    pub max_fitness: f64,
    pub avg_fitness: f64,
    /// Number of members that failed evaluation this generation.
    pub failures: usize,
    /// Composition of the best member.
    pub structure: StructureCounts,
}

impl GenerationStats {
    #[must_use]
    pub fn new(
        generation: usize,
        elapsed: Duration,
        ranking: &Ranking,
        structure: StructureCounts,
        failures: usize,
    ) -> Self {
        let (min_fitness, max_fitness, avg_fitness) = ranking
            .fitness_stats()
            .map_or((f64::NAN, f64::NAN, f64::NAN), |s| (s.min, s.max, s.mean));
        Self {
            generation,
            elapsed_hours: elapsed.as_secs_f64() / 3600.0,
            min_fitness,
            max_fitness,
            avg_fitness,
            failures,
            structure,
        }
    }
}

/// One line of `run_stats.csv`: [`GenerationStats`] with the structure flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRow {
    pub generation: usize,
    pub elapsed_hours: f64,
    pub min_fitness: f64,
    pub max_fitness: f64,
    pub avg_fitness: f64,
    pub failures: usize,
    pub learners: usize,
    pub teams: usize,
    pub instructions: usize,
    pub add: usize,
    pub subtract: usize,
    pub multiply: usize,
    pub divide: usize,
    pub negate: usize,
    pub mem_read: usize,
    pub mem_write: usize,
}

impl From<&GenerationStats> for StatsRow {
    fn from(stats: &GenerationStats) -> Self {
        let s = &stats.structure;
        Self {
            generation: stats.generation,
            elapsed_hours: stats.elapsed_hours,
            min_fitness: stats.min_fitness,
            max_fitness: stats.max_fitness,
            avg_fitness: stats.avg_fitness,
            failures: stats.failures,
            learners: s.learners,
            teams: s.teams,
            instructions: s.instructions,
            add: s.add,
            subtract: s.subtract,
            multiply: s.multiply,
            divide: s.divide,
            negate: s.negate,
            mem_read: s.mem_read,
            mem_write: s.mem_write,
        }
    }
}
