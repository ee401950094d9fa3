//! Skip-gram embeddings for tracks, artists and recommendation genres.
//!
//! A track's input representation is the mean of its own row and the rows of
//! its related artists and genres, so all three kinds share one input matrix.
//! Training runs lock-free on many threads; see [`matrix::Matrix`] for what
//! that means for consistency.

#[allow(non_camel_case_types)]
pub type real = f64; // Precision of float numbers

pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod entity;
mod error;
pub mod loss;
pub mod matrix;
pub mod model;
pub mod sampling;
pub mod trainer;
pub mod vector;
pub mod vectors;
pub mod vocab;

pub use config::TrainConfig;
pub use entity::{ArtistEntry, Entity, EntityKind, EntityTable, GenreEntry, TrackEntry};
pub use error::{Error, Result};
pub use matrix::Matrix;
pub use trainer::{Progress, Trainer};
pub use vectors::Vectors;
pub use vocab::{Vocab, VocabBuilder};
