use std::io;

use thiserror::Error;

/// Errors surfaced at the tapeflow core boundary.
///
/// The recall executor catches per file and event intake catches per event,
/// so a single bad file or event never strands a whole request.
#[derive(Error, Debug)]
pub enum TapeFlowError {
    #[error("{0}")]
    Error(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// The in-flight file copy was aborted by a forced server shutdown.
    #[error("terminated while recalling '{0}'")]
    Terminated(String),
}
