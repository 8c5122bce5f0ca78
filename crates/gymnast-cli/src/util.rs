use std::{
    fs::File,
    io::{self, BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::Context;
use serde::{Serialize, de::DeserializeOwned};

/// Writes `value` as pretty JSON to `path`, or to stdout when `path` is `None` or `-`.
pub fn write_json_report<T>(value: &T, path: Option<&Path>) -> anyhow::Result<()>
where
    T: Serialize,
{
    let (mut writer, target): (Box<dyn Write>, String) = match path {
        Some(path) if path.as_os_str() != "-" => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create report file: {}", path.display()))?;
            (Box::new(BufWriter::new(file)), path.display().to_string())
        }
        _ => (Box::new(io::stdout().lock()), "stdout".to_owned()),
    };

    serde_json::to_writer_pretty(&mut writer, value)
        .with_context(|| format!("Failed to write JSON to {target}"))?;
    writeln!(writer)
        .and_then(|()| writer.flush())
        .with_context(|| format!("Failed to flush report to {target}"))
}

pub fn read_json_file<T>(file_kind: &str, path: &Path) -> anyhow::Result<T>
where
    T: DeserializeOwned,
{
    let file = File::open(path)
        .with_context(|| format!("Failed to open {file_kind} file: {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {file_kind} JSON file: {}", path.display()))
}
