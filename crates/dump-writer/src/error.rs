//! Dump Writer Errors

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DumpError {
    /// The dump file could not be created; the pipeline stays stopped
    #[error("Failed to open dump file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The worker thread could not be spawned
    #[error("Failed to spawn dump worker: {0}")]
    Spawn(#[source] std::io::Error),
}
