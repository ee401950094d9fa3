use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::entity::EntityKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("error accessing {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid metadata: duplicate {kind} id {id:?}")]
    DuplicateEntity { kind: EntityKind, id: String },

    #[error("the number of tracks exceeds the limit of {limit}")]
    TooManyTracks { limit: usize },

    #[error("training corpus {} contains no records", .0.display())]
    EmptyCorpus(PathBuf),

    /// A dot product came out NaN or infinite; training has diverged.
    #[error("encountered a non-finite dot product at row {row}")]
    NumericDivergence { row: usize },

    #[error("invalid checkpoint {} on line {line}: {reason}", path.display())]
    Checkpoint {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("negative sampling table of {capacity} slots cannot hold {tracks} tracks")]
    SamplingTableTooSmall { capacity: usize, tracks: usize },

    #[error("model never trained")]
    NotTrained,

    #[error("failed to allocate a {rows}x{cols} matrix")]
    Allocation { rows: usize, cols: usize },
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
