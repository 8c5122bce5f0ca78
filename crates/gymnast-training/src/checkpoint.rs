//! Durable snapshots of the population at generation boundaries.
//!
//! A checkpoint for generation `g` is written after the scores of `g` have been
//! applied and before the population is evolved. Resuming from it performs the
//! pending evolve step and continues with generation `g + 1`.
//!
//! Files are written to a temporary sibling first and renamed into place, so a
//! crash while writing never leaves a truncated checkpoint behind.

use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write as _},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Population state after a generation's scores were applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint<M> {
    /// The last generation whose scores are contained in `population`.
    pub generation: usize,
    /// Task the scores were ranked on.
    pub task: String,
    /// When generation 0 of the run started, kept across resumes.
    pub run_started: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub population: M,
}

#[derive(Debug, derive_more::Display, derive_more::Error)]
pub enum CheckpointError {
    #[display("failed to write '{}'", path.display())]
    Write { path: PathBuf, source: io::Error },
    #[display("failed to serialize '{}'", path.display())]
    Serialize {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[display("failed to read '{}'", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[display("failed to parse '{}'", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl<M> RunCheckpoint<M>
where
    M: Serialize,
{
    pub fn save(&self, path: &Path) -> Result<(), CheckpointError> {
        write_json(path, self)
    }
}

impl<M> RunCheckpoint<M>
where
    M: DeserializeOwned,
{
    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        read_json(path)
    }
}

/// Writes `value` as pretty JSON to `path`, replacing the file atomically.
pub fn write_json<T>(path: &Path, value: &T) -> Result<(), CheckpointError>
where
    T: Serialize + ?Sized,
{
    let write_err = |source| CheckpointError::Write {
        path: path.to_owned(),
        source,
    };
    let tmp_path = tmp_path(path);

    let file = File::create(&tmp_path).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value).map_err(|source| {
        CheckpointError::Serialize {
            path: path.to_owned(),
            source,
        }
    })?;
    writer.write_all(b"\n").map_err(write_err)?;
    let file = writer
        .into_inner()
        .map_err(|err| write_err(err.into_error()))?;
    file.sync_all().map_err(write_err)?;
    drop(file);

    fs::rename(&tmp_path, path).map_err(write_err)
}

pub fn read_json<T>(path: &Path) -> Result<T, CheckpointError>
where
    T: DeserializeOwned,
{
    let file = File::open(path).map_err(|source| CheckpointError::Read {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_reader(BufReader::new(file)).map_err(|source| CheckpointError::Parse {
        path: path.to_owned(),
        source,
    })
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_owned();
    name.push(".tmp");
    path.with_file_name(name)
}
