//! Durable session checkpoints.
//!
//! A state file is a magic tag, a version word and a bincode payload of the
//! canonical `(corpus, coverage)` pair. Writes go to a temporary sibling
//! that is fsynced and renamed into place, so a crash mid-checkpoint never
//! clobbers the previous state.

use krait_core::{corpus::Corpus, coverage::CoverageMap};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const STATE_MAGIC: [u8; 8] = *b"KRAITST\0";
const STATE_VERSION: u32 = 1;

/// The persistable canonical state. Only the orchestrator mutates it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub corpus: Corpus,
    pub coverage: CoverageMap,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("not a krait state file (bad magic)")]
    BadMagic,
    #[error("unsupported state file version {found} (this build reads version {STATE_VERSION})")]
    UnsupportedVersion { found: u32 },
    #[error("corrupt state file: {0}")]
    Corrupt(#[from] bincode::Error),
}

/// Loads a checkpoint. A missing file is a fresh start; a present but
/// unreadable one is an error the user has to resolve, not a corpus to be
/// silently discarded.
pub fn load(path: &Path) -> Result<Option<SessionState>, StateError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut magic = [0u8; 8];
    file.read_exact(&mut magic)?;
    if magic != STATE_MAGIC {
        return Err(StateError::BadMagic);
    }
    let mut version = [0u8; 4];
    file.read_exact(&mut version)?;
    let found = u32::from_le_bytes(version);
    if found != STATE_VERSION {
        return Err(StateError::UnsupportedVersion { found });
    }

    let mut payload = Vec::new();
    file.read_to_end(&mut payload)?;
    Ok(Some(bincode::deserialize(&payload)?))
}

/// Atomically writes a checkpoint: temporary sibling, fsync, rename.
pub fn save(path: &Path, state: &SessionState) -> Result<(), StateError> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&STATE_MAGIC)?;
        file.write_all(&STATE_VERSION.to_le_bytes())?;
        file.write_all(&bincode::serialize(state)?)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}
