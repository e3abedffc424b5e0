//! Crash artifact directory.

use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A flat, append-only directory holding one file per distinct crashing
/// input: name is the hex SHA-256 of the bytes, content is the bytes
/// verbatim. Presence of the file is the deduplication.
#[derive(Debug, Clone)]
pub struct CrashDir {
    dir: PathBuf,
}

impl CrashDir {
    /// Opens the directory, creating it if needed.
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Deterministic file name for a sample.
    pub fn fingerprint(sample: &[u8]) -> String {
        hex::encode(Sha256::digest(sample))
    }

    /// Records a crashing sample. Returns false when an identical sample
    /// was already recorded.
    pub fn save(&self, sample: &[u8]) -> io::Result<bool> {
        let path = self.dir.join(Self::fingerprint(sample));
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e),
        };
        file.write_all(sample)?;
        Ok(true)
    }

    /// Recorded crash files, sorted by name.
    pub fn entries(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
