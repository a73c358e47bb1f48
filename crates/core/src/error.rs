//! Error type shared by every mempin component.
//!
//! Only setup paths (tool selection, opening the output, loading a trace or
//! an archive) and the replay host return errors. Analysis callbacks sit on
//! the profiled program's hot path and never fail: they log and move on.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by mempin.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// No registered tool accepted the requested id.
    #[error("no tool found for id: {0}")]
    UnknownTool(i32),

    #[error("failed to open output file {path}: {source}")]
    OpenOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("thread {tid} exceeds per-thread storage capacity ({capacity})")]
    ThreadCapacity { tid: u32, capacity: usize },

    #[error("thread {0} already has bound storage")]
    ThreadRebound(u32),

    #[error("thread {0} was started twice")]
    ThreadRestarted(u32),

    #[error("thread {0} was not started")]
    ThreadNotStarted(u32),

    #[error("no loaded routine at address {0:#x}")]
    UnknownRoutine(u64),

    #[error("image {0} is not part of the program")]
    UnknownImage(String),

    #[error("image {0} is not loaded")]
    ImageNotLoaded(String),

    #[error("invalid program trace: {0}")]
    Trace(#[from] serde_json::Error),

    #[error("invalid profile archive: {0}")]
    Archive(String),

    #[error("archive encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ProfileError>;
