//! Directory layout of the disk store
//!
//! ```text
//! <root>/
//!   session-<uuid>/          one per running cache, removed on shutdown
//!     p000003/               one per partition (record type)
//!       blk-00000000.dat     one per insert batch
//!       blk-00000001.dat
//! ```
//!
//! The store is transient. Opening a layout deletes every `session-*`
//! directory left behind by a previous process before creating its own.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SESSION_PREFIX: &str = "session-";

/// Directory of one partition
pub fn partition_dir_name(partition: u32) -> String {
    format!("p{:06}", partition)
}

/// File name of one block file
pub fn block_file_name(file: u32) -> String {
    format!("blk-{:08}.dat", file)
}

/// Parse a partition id from a directory name
pub fn parse_partition_dir(name: &str) -> Option<u32> {
    name.strip_prefix('p')?.parse().ok()
}

/// Parse a file id from a block file name
pub fn parse_block_file(name: &str) -> Option<u32> {
    name.strip_prefix("blk-")?.strip_suffix(".dat")?.parse().ok()
}

/// Session directory of a running disk store
#[derive(Debug)]
pub struct BlockLayout {
    session_dir: PathBuf,
}

impl BlockLayout {
    /// Clear stale sessions under `root` and create a fresh one
    pub fn open(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let stale = clear_stale_sessions(root)?;
        if stale > 0 {
            tracing::info!(target: "geocache::disk", root = %root.display(), stale, "Cleared stale cache sessions");
        }

        let session_dir = root.join(format!("{}{}", SESSION_PREFIX, Uuid::new_v4()));
        fs::create_dir(&session_dir)?;
        tracing::debug!(target: "geocache::disk", dir = %session_dir.display(), "Created cache session directory");
        Ok(Self { session_dir })
    }

    /// Root of this session
    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Directory of a partition
    pub fn partition_dir(&self, partition: u32) -> PathBuf {
        self.session_dir.join(partition_dir_name(partition))
    }

    /// Path of a block file
    pub fn file_path(&self, partition: u32, file: u32) -> PathBuf {
        self.partition_dir(partition).join(block_file_name(file))
    }

    /// Create a partition directory if missing
    pub fn ensure_partition(&self, partition: u32) -> io::Result<PathBuf> {
        let dir = self.partition_dir(partition);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Delete one block file; missing files are not an error
    pub fn remove_file(&self, partition: u32, file: u32) -> io::Result<()> {
        ignore_missing(fs::remove_file(self.file_path(partition, file)))
    }

    /// Delete a partition directory and all its files
    pub fn remove_partition(&self, partition: u32) -> io::Result<()> {
        ignore_missing(fs::remove_dir_all(self.partition_dir(partition)))
    }

    /// Whether a partition directory exists
    pub fn partition_exists(&self, partition: u32) -> bool {
        self.partition_dir(partition).is_dir()
    }

    /// Partition ids present on disk, sorted
    pub fn list_partitions(&self) -> io::Result<Vec<u32>> {
        let mut partitions = Vec::new();
        for entry in fs::read_dir(&self.session_dir)? {
            let entry = entry?;
            if let Some(p) = parse_partition_dir(&entry.file_name().to_string_lossy()) {
                partitions.push(p);
            }
        }
        partitions.sort_unstable();
        Ok(partitions)
    }

    /// Block file ids of a partition, sorted
    pub fn list_files(&self, partition: u32) -> io::Result<Vec<u32>> {
        let dir = self.partition_dir(partition);
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(f) = parse_block_file(&entry.file_name().to_string_lossy()) {
                files.push(f);
            }
        }
        files.sort_unstable();
        Ok(files)
    }

    /// Delete the whole session directory
    pub fn destroy(&self) -> io::Result<()> {
        ignore_missing(fs::remove_dir_all(&self.session_dir))
    }
}

fn clear_stale_sessions(root: &Path) -> io::Result<usize> {
    let mut cleared = 0;
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(SESSION_PREFIX) && entry.path().is_dir() {
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => cleared += 1,
                Err(e) => {
                    tracing::warn!(target: "geocache::disk", dir = %entry.path().display(), error = %e, "Failed to clear stale session")
                }
            }
        }
    }
    Ok(cleared)
}

fn ignore_missing(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
