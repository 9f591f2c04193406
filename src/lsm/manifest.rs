use crate::error::{DbError, Result};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Name of the manifest file within the data directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

/// Append-only log of SSTable lifecycle events, and the authority on
/// which tables are live.
///
/// Each line is `ADD <id>` or `REMOVE <id>`; replaying the file start
/// to end yields the active set. An SSTable file on disk without a
/// live ADD entry is garbage; a live ADD without a file is corruption
/// surfaced at recovery. Every append is flushed and synced before
/// returning.
pub struct Manifest {
    path: PathBuf,
    file: File,
}

impl Manifest {
    /// Opens the manifest at `path`, creating an empty one if missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn add_sstable(&mut self, id: u64) -> Result<()> {
        self.file.write_all(format!("ADD {}\n", id).as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn remove_sstables(&mut self, ids: &[u64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut batch = String::new();
        for id in ids {
            batch.push_str(&format!("REMOVE {}\n", id));
        }
        self.file.write_all(batch.as_bytes())?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Replays the file and returns the sorted set of live ids.
    /// Blank lines are tolerated; unknown tokens fail the replay.
    pub fn get_active_sstables(&self) -> Result<Vec<u64>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut active = BTreeSet::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut parts = trimmed.split_whitespace();
            let verb = parts.next().unwrap_or_default();
            let id: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    DbError::Corruption(format!(
                        "manifest line {}: missing or invalid id: {:?}",
                        line_num + 1,
                        trimmed
                    ))
                })?;
            match verb {
                "ADD" => {
                    active.insert(id);
                }
                "REMOVE" => {
                    active.remove(&id);
                }
                other => {
                    return Err(DbError::Corruption(format!(
                        "manifest line {}: unknown token {:?}",
                        line_num + 1,
                        other
                    )));
                }
            }
        }
        Ok(active.into_iter().collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
