//! Worker transport: length-prefixed bincode frames.

use bytes::{Buf, BytesMut};
use krait_core::coverage::CoverageMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Upper bound on a single frame; anything larger means a desynchronized
/// or corrupted channel.
const MAX_FRAME_LEN: u32 = 64 << 20;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    Oversized(u32),
    #[error("unexpected message: {0}")]
    Protocol(&'static str),
}

/// Reports flowing from a worker up to the orchestrator. Reports from one
/// worker arrive in the order they were produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerReport {
    /// The sample produced at least one edge this worker had not seen.
    NewCoverage {
        sample: Vec<u8>,
        new_edges: CoverageMap,
    },
    /// The target panicked on the sample.
    Crash {
        sample: Vec<u8>,
        error: String,
        new_edges: CoverageMap,
    },
    /// Execution count since the last status report.
    Status { executions: u64 },
}

/// Commands flowing from the orchestrator down to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Startup snapshot; always the first frame a worker receives.
    Seed {
        corpus: Vec<Vec<u8>>,
        coverage: CoverageMap,
        settings: WorkerSettings,
    },
    /// A sample another worker found interesting.
    Input { sample: Vec<u8> },
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub close_stdout: bool,
    pub close_stderr: bool,
}

/// Writes one frame: little-endian `u32` length, then the bincode payload.
pub fn write_frame<T: Serialize, W: Write>(mut w: W, msg: &T) -> Result<(), CommError> {
    let payload = bincode::serialize(msg)?;
    let len = payload.len() as u32;
    if len > MAX_FRAME_LEN {
        return Err(CommError::Oversized(len));
    }
    w.write_all(&len.to_le_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

/// Reads one frame, blocking. A closed channel surfaces as
/// `Io(UnexpectedEof)`.
pub fn read_frame<T: DeserializeOwned, R: Read>(mut r: R) -> Result<T, CommError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CommError::Oversized(len));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

/// Reassembles frames from the partial reads a non-blocking pipe delivers.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Feeds bytes read from the channel.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pops the next complete frame, if one has accumulated.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CommError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&self.buf[..4]);
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(CommError::Oversized(len));
        }
        let total = 4 + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(4);
        let payload = self.buf.split_to(len as usize);
        Ok(Some(bincode::deserialize(&payload)?))
    }
}
