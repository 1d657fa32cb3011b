//! JSONL state file for the registry, plus the seed keys file reader.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;

use crate::domain::WorkItem;
use crate::error::{ClaimrError, Result};

/// Registry snapshot on disk, one `WorkItem` per line.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted items, or `None` if no state file exists yet.
    pub fn load(&self) -> Result<Option<Vec<WorkItem>>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut items = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let item: WorkItem = serde_json::from_str(&line).map_err(|e| {
                ClaimrError::Storage(format!("{}:{}: {}", self.path.display(), lineno + 1, e))
            })?;
            items.push(item);
        }
        Ok(Some(items))
    }

    /// Rewrite the whole file from `items`.
    ///
    /// Writes a sibling temp file and renames it over the target, so a crash
    /// mid-write leaves the previous snapshot intact.
    pub fn save(&self, items: &[WorkItem]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            for item in items {
                writeln!(writer, "{}", serde_json::to_string(item)?)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("saved {} items to {}", items.len(), self.path.display());
        Ok(())
    }
}

/// Read seed keys, one per line. Blank lines and `#` comments are skipped.
pub fn read_keys_file(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| ClaimrError::Config(format!("Failed to read keys file {}: {}", path.display(), e)))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect())
}
