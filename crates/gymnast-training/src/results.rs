//! Layout of a run's results directory and the per-generation statistics log.
//!
//! ```text
//! <results>/
//!   run_info.json           configuration, start time, host
//!   run_stats.csv           header + one row per generation
//!   teams/best_gen_<g>.json best candidate of generation g
//!   checkpoints/gen_<g>.json full population after generation g's scores
//! ```

use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::RunConfiguration,
    stats::{GenerationStats, StatsRow},
};

const TEAMS_DIR: &str = "teams";
const CHECKPOINTS_DIR: &str = "checkpoints";
const STATS_FILE: &str = "run_stats.csv";
const RUN_INFO_FILE: &str = "run_info.json";

/// Paths inside a results directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsLayout {
    root: PathBuf,
}

impl ResultsLayout {
    /// Creates a fresh results directory at `base`, or at `base_1`, `base_2`, ...
    /// if `base` already exists.
    pub fn create_unique(base: &Path) -> io::Result<Self> {
        Self::create(unique_dir(base))
    }

    /// Uses `root` as the results directory, creating it if needed.
    pub fn create(root: PathBuf) -> io::Result<Self> {
        fs::create_dir_all(root.join(TEAMS_DIR))?;
        fs::create_dir_all(root.join(CHECKPOINTS_DIR))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn candidate_path(&self, generation: usize) -> PathBuf {
        self.root
            .join(TEAMS_DIR)
            .join(format!("best_gen_{generation}.json"))
    }

    #[must_use]
    pub fn checkpoint_path(&self, generation: usize) -> PathBuf {
        self.root
            .join(CHECKPOINTS_DIR)
            .join(format!("gen_{generation}.json"))
    }

    #[must_use]
    pub fn stats_path(&self) -> PathBuf {
        self.root.join(STATS_FILE)
    }

    #[must_use]
    pub fn run_info_path(&self) -> PathBuf {
        self.root.join(RUN_INFO_FILE)
    }

    /// Appends one row to the statistics log, writing the header first if the
    /// log is new.
    pub fn append_stats(&self, stats: &GenerationStats) -> Result<(), csv::Error> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.stats_path())?;
        let is_new = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        writer.serialize(StatsRow::from(stats))?;
        writer.flush()?;
        Ok(())
    }
}

/// Returns `base` if it does not exist, otherwise the first free `base_<n>`.
#[must_use]
pub fn unique_dir(base: &Path) -> PathBuf {
    if !base.exists() {
        return base.to_owned();
    }
    let Some(name) = base.file_name() else {
        return base.to_owned();
    };
    (1..)
        .map(|n| {
            let mut candidate = name.to_owned();
            candidate.push(format!("_{n}"));
            base.with_file_name(candidate)
        })
        .find(|path| !path.exists())
        .unwrap_or_else(|| base.to_owned())
}

/// Descriptive record of a run, written once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub host: String,
    pub started_at: DateTime<Utc>,
    /// Generation of the checkpoint this run was resumed from.
    pub resumed_after_generation: Option<usize>,
    pub configuration: RunConfiguration,
}

impl RunInfo {
    #[must_use]
    pub fn new(configuration: RunConfiguration, resumed_after_generation: Option<usize>) -> Self {
        Self {
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            started_at: Utc::now(),
            resumed_after_generation,
            configuration,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        agent::{AgentId, Outcomes},
        population::Ranking,
        stats::StructureCounts,
    };

    use super::*;

    #[test]
    fn test_existing_results_dir_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("results");

        let first = ResultsLayout::create_unique(&base).unwrap();
        let second = ResultsLayout::create_unique(&base).unwrap();
        let third = ResultsLayout::create_unique(&base).unwrap();

        assert_eq!(first.root(), base);
        assert_eq!(second.root(), dir.path().join("results_1"));
        assert_eq!(third.root(), dir.path().join("results_2"));
        assert!(third.root().join("teams").is_dir());
        assert!(third.root().join("checkpoints").is_dir());
    }

    #[test]
    fn test_stats_log_has_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ResultsLayout::create(dir.path().join("run")).unwrap();
        let members = [(AgentId(0), Outcomes::from([("t".to_owned(), 1.0)]))];
        let ranking = Ranking::from_outcomes("t", members.iter().map(|(id, o)| (*id, o)));

        for generation in 0..3 {
            let stats = GenerationStats::new(
                generation,
                Duration::ZERO,
                &ranking,
                StructureCounts::default(),
                generation,
            );
            layout.append_stats(&stats).unwrap();
        }

        let log = fs::read_to_string(layout.stats_path()).unwrap();
        assert_eq!(log.lines().count(), 4);
        assert!(log.lines().skip(1).all(|line| !line.starts_with("generation")));

        let mut reader = csv::Reader::from_path(layout.stats_path()).unwrap();
        let header = reader.headers().unwrap().clone();
        assert_eq!(&header[0], "generation");
        assert_eq!(&header[5], "failures");
        assert_eq!(&header[15], "mem_write");
        let rows = reader
            .deserialize::<StatsRow>()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].generation, 2);
        assert_eq!(rows[2].failures, 2);
        assert_eq!(rows[2].max_fitness, 1.0);
    }

    #[test]
    fn test_run_info_names_host() {
        let info = RunInfo::new(RunConfiguration::default(), None);
        assert!(!info.host.is_empty());
        assert_eq!(info.resumed_after_generation, None);
    }

    #[test]
    fn test_paths_are_generation_indexed() {
        let layout = ResultsLayout {
            root: PathBuf::from("out"),
        };
        assert_eq!(
            layout.candidate_path(7),
            Path::new("out/teams/best_gen_7.json")
        );
        assert_eq!(
            layout.checkpoint_path(7),
            Path::new("out/checkpoints/gen_7.json")
        );
    }
}
