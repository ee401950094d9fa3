//! The update rule: average a track with its artists and genres, score it
//! against the output matrix, and push the gradient back into every input row
//! that contributed.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::TrainConfig;
use crate::entity::TrackEntry;
use crate::error::Result;
use crate::loss::NegativeSamplingLoss;
use crate::matrix::Matrix;
use crate::real;
use crate::sampling::{NegativeTable, NEGATIVE_TABLE_SIZE};
use crate::vector;
use crate::vocab::Vocab;

/// Scratch space owned by one training thread.
pub struct State {
    pub hidden: Vec<real>,
    pub grad: Vec<real>,
    pub rng: StdRng,
    loss_sum: real,
    examples: u64,
}

impl State {
    pub fn new(dim: usize, seed: u64) -> Self {
        State {
            hidden: vec![0.0; dim],
            grad: vec![0.0; dim],
            rng: StdRng::seed_from_u64(seed),
            loss_sum: 0.0,
            examples: 0,
        }
    }

    /// Mean loss per example since the last call, or `None` if no examples
    /// were seen.
    pub fn take_loss(&mut self) -> Option<real> {
        if self.examples == 0 {
            return None;
        }
        let loss = self.loss_sum / self.examples as real;
        self.loss_sum = 0.0;
        self.examples = 0;
        Some(loss)
    }
}

pub struct Model {
    /// One row per entity: tracks, then artists, then genres.
    pub input: Matrix,
    /// One row per track.
    pub output: Matrix,
    loss: NegativeSamplingLoss,
}

impl Model {
    pub fn new(input: Matrix, output: Matrix, loss: NegativeSamplingLoss) -> Self {
        Model {
            input,
            output,
            loss,
        }
    }

    /// Allocates a freshly initialized model for `vocab`: random input rows,
    /// zero output rows, and a negative table built from the track counts.
    pub fn for_vocab(vocab: &Vocab, config: &TrainConfig) -> Result<Self> {
        let input = Matrix::random(vocab.len(), config.dim, config.seed)?;
        let output = Matrix::zeros(vocab.ntracks(), config.dim)?;
        let table = NegativeTable::new(&vocab.track_counts(), NEGATIVE_TABLE_SIZE)?;
        Ok(Model::new(
            input,
            output,
            NegativeSamplingLoss::new(config.negative, table),
        ))
    }

    pub fn dim(&self) -> usize {
        self.input.cols()
    }

    /// Writes into `hidden` the mean of the input rows of `track` and its
    /// related artists and genres.
    pub fn compute_hidden(&self, track: &TrackEntry, hidden: &mut [real]) {
        hidden.fill(0.0);
        self.input.add_row_to_vector(hidden, track.index, 1.0);
        for &i in track.artist_indices().iter().chain(track.genre_indices()) {
            self.input.add_row_to_vector(hidden, i, 1.0);
        }
        let total = 1 + track.artist_indices().len() + track.genre_indices().len();
        vector::scale(hidden, 1.0 / total as real);
    }

    /// One training example: `track` as input, `target` as the positive
    /// output, negatives drawn outside `context`.
    pub fn update(
        &self,
        track: &TrackEntry,
        target: usize,
        context: &BTreeSet<usize>,
        lr: real,
        state: &mut State,
    ) -> Result<()> {
        self.compute_hidden(track, &mut state.hidden);
        state.grad.fill(0.0);
        let loss = self.loss.forward(&self.output, target, context, state, lr)?;
        state.loss_sum += loss;
        state.examples += 1;
        self.backprop(track, &state.grad);
        Ok(())
    }

    /// Adds the whole gradient to each contributing input row. The gradient is
    /// not divided among them.
    fn backprop(&self, track: &TrackEntry, grad: &[real]) {
        self.input.add_vector_to_row(grad, track.index, 1.0);
        for &i in track.artist_indices().iter().chain(track.genre_indices()) {
            self.input.add_vector_to_row(grad, i, 1.0);
        }
    }
}
