//! Binary logistic loss with negative sampling.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::matrix::Matrix;
use crate::model::State;
use crate::real;
use crate::sampling::NegativeTable;

const SIGMOID_TABLE_SIZE: usize = 512;
const MAX_SIGMOID: real = 8.0;
const LOG_TABLE_SIZE: usize = 512;

pub struct NegativeSamplingLoss {
    negative: usize,
    table: NegativeTable,
    sigmoid_table: Vec<real>,
    log_table: Vec<real>,
}

impl NegativeSamplingLoss {
    /// `negative` is the number of negative examples drawn per positive one.
    pub fn new(negative: usize, table: NegativeTable) -> Self {
        let sigmoid_table = (0..=SIGMOID_TABLE_SIZE)
            .map(|i| {
                let x = (i as real * 2.0 * MAX_SIGMOID) / SIGMOID_TABLE_SIZE as real - MAX_SIGMOID;
                1.0 / (1.0 + (-x).exp())
            })
            .collect();
        let log_table = (0..=LOG_TABLE_SIZE)
            .map(|i| ((i as real + 1e-5) / LOG_TABLE_SIZE as real).ln())
            .collect();
        NegativeSamplingLoss {
            negative,
            table,
            sigmoid_table,
            log_table,
        }
    }

    /// Table approximation of `1 / (1 + e^-x)`, exactly 0 below -8 and 1
    /// above 8.
    pub fn sigmoid(&self, x: real) -> real {
        if x < -MAX_SIGMOID {
            0.0
        } else if x > MAX_SIGMOID {
            1.0
        } else {
            let i = ((x + MAX_SIGMOID) * SIGMOID_TABLE_SIZE as real / MAX_SIGMOID / 2.0).round();
            self.sigmoid_table[i as usize]
        }
    }

    /// Table approximation of `ln(x)` for `x` in `[0, 1]`. Returns 0 above 1.
    pub fn log(&self, x: real) -> real {
        if x > 1.0 {
            return 0.0;
        }
        self.log_table[(x * LOG_TABLE_SIZE as real) as usize]
    }

    /// One logistic regression step of the hidden vector against output row
    /// `row`. Accumulates the input gradient in `state.grad`, updates the
    /// output row in place, and returns the loss.
    pub fn binary_logistic(
        &self,
        output: &Matrix,
        row: usize,
        state: &mut State,
        positive: bool,
        lr: real,
    ) -> Result<real> {
        let score = self.sigmoid(output.dot_row(&state.hidden, row)?);
        let label = if positive { 1.0 } else { 0.0 };
        let alpha = lr * (label - score);
        output.add_row_to_vector(&mut state.grad, row, alpha);
        output.add_vector_to_row(&state.hidden, row, alpha);
        if positive {
            Ok(-self.log(score))
        } else {
            Ok(-self.log(1.0 - score))
        }
    }

    /// The positive example `target` followed by `negative` sampled tracks,
    /// none of which are in `context`.
    ///
    /// When `context` holds every track the table can produce there is
    /// nothing left to draw, and only the positive example is used.
    pub fn forward(
        &self,
        output: &Matrix,
        target: usize,
        context: &BTreeSet<usize>,
        state: &mut State,
        lr: real,
    ) -> Result<real> {
        let mut loss = self.binary_logistic(output, target, state, true, lr)?;
        if self.negative == 0 || self.table.covered_by(context) {
            return Ok(loss);
        }
        for _ in 0..self.negative {
            let Some(negative) = self.table.sample_excluding(&mut state.rng, context) else {
                break;
            };
            loss += self.binary_logistic(output, negative, state, false, lr)?;
        }
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loss(negative: usize, counts: &[u64]) -> NegativeSamplingLoss {
        NegativeSamplingLoss::new(negative, NegativeTable::new(counts, 100).unwrap())
    }

    #[test]
    fn sigmoid_table() {
        let l = loss(0, &[1]);
        assert_eq!(l.sigmoid(-8.5), 0.0);
        assert_eq!(l.sigmoid(8.5), 1.0);
        assert!((l.sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(l.sigmoid(-8.0) < 1e-3);
        assert!(l.sigmoid(8.0) > 1.0 - 1e-3);
        for x in [-5.0, -1.3, 0.2, 2.7, 6.1] {
            let exact = 1.0 / (1.0 + (-x as real).exp());
            assert!((l.sigmoid(x) - exact).abs() < 0.01, "{x}");
        }
    }

    #[test]
    fn log_table() {
        let l = loss(0, &[1]);
        assert_eq!(l.log(1.5), 0.0);
        assert!(l.log(1.0).abs() < 1e-6);
        assert!(l.log(0.0) < -10.0);
        assert!((l.log(0.5) - 0.5f64.ln()).abs() < 1e-4);
    }

    #[test]
    fn positive_step_moves_output_toward_hidden() {
        let l = loss(0, &[1, 1]);
        let output = Matrix::zeros(2, 2).unwrap();
        let mut state = State::new(2, 0);
        state.hidden.copy_from_slice(&[1.0, -1.0]);

        // score = sigmoid(0) = 0.5, alpha = 0.1 * 0.5
        let value = l.binary_logistic(&output, 1, &mut state, true, 0.1).unwrap();
        assert!((value - 2f64.ln()).abs() < 1e-3);
        assert_eq!(state.grad, [0.0, 0.0]);
        assert_eq!(output.row(1), [0.05, -0.05]);
        assert_eq!(output.row(0), [0.0, 0.0]);

        // The gradient now picks up the updated output row.
        let before = output.row(1);
        l.binary_logistic(&output, 1, &mut state, false, 0.1).unwrap();
        let alpha = 0.1 * (0.0 - l.sigmoid(0.1));
        assert!((state.grad[0] - alpha * before[0]).abs() < 1e-12);
        assert!(output.row(1)[0] < before[0]);
    }

    #[test]
    fn forward_never_samples_the_context() {
        let l = loss(5, &[10, 10, 10, 10]);
        let output = Matrix::zeros(4, 3).unwrap();
        let mut state = State::new(3, 1);
        state.hidden.copy_from_slice(&[1.0, 1.0, 1.0]);
        let context: BTreeSet<usize> = [0, 1, 2].into_iter().collect();

        l.forward(&output, 0, &context, &mut state, 0.1).unwrap();
        // Only the positive row and the one remaining negative moved.
        assert!(output.row(0).iter().all(|&v| v > 0.0));
        assert!(output.row(3).iter().all(|&v| v < 0.0));
        assert_eq!(output.row(1), [0.0; 3]);
        assert_eq!(output.row(2), [0.0; 3]);
    }

    #[test]
    fn forward_with_whole_catalog_in_context_skips_negatives() {
        let l = loss(5, &[10, 10]);
        let output = Matrix::zeros(2, 1).unwrap();
        let mut state = State::new(1, 1);
        state.hidden[0] = 1.0;
        let context: BTreeSet<usize> = [0, 1].into_iter().collect();

        let value = l.forward(&output, 1, &context, &mut state, 0.1).unwrap();
        assert!((value - 2f64.ln()).abs() < 1e-3);
        assert_eq!(output.row(0), [0.0]);
        assert!(output.row(1)[0] > 0.0);
    }
}
