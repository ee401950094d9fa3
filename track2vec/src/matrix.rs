//! Dense row-major embedding storage shared by all training threads.

use std::sync::atomic::{AtomicU64, Ordering};

use aligned_box::AlignedBox;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Error, Result};
use crate::real;

/// One matrix element.
///
/// Loads and stores are individually atomic, but `add` is a separate load and
/// store, so two threads adding to the same element at once can lose one of
/// the updates.
#[derive(Default)]
#[repr(transparent)]
pub struct Real {
    bits: AtomicU64,
}

impl Real {
    pub fn get(&self) -> real {
        real::from_bits(self.bits.load(Ordering::Relaxed))
    }

    pub fn set(&self, value: real) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, x: real) {
        let a = self.get();
        self.set(a + x);
    }
}

/// A `rows × cols` matrix that any number of threads may read and update at
/// the same time through `&Matrix`.
///
/// There is no locking. Concurrent `add_vector_to_row` calls on the same row
/// interleave element by element and may lose updates, and a reader may see a
/// row halfway through someone else's update. Stochastic gradient descent
/// tolerates this ("Hogwild"); callers must not assume anything stronger.
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: AlignedBox<[Real]>,
}

impl Matrix {
    /// Allocates a zero-filled matrix.
    pub fn zeros(rows: usize, cols: usize) -> Result<Self> {
        let data = AlignedBox::slice_from_default(128, (rows * cols).max(1))
            .map_err(|_| Error::Allocation { rows, cols })?;
        Ok(Matrix { rows, cols, data })
    }

    /// Allocates a matrix filled uniformly from `[-1, 1]`. The same seed
    /// always gives the same values.
    pub fn random(rows: usize, cols: usize, seed: u64) -> Result<Self> {
        let mut m = Matrix::zeros(rows, cols)?;
        m.random_init(seed);
        Ok(m)
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn zero(&mut self) {
        for e in self.data.iter() {
            e.set(0.0);
        }
    }

    pub fn random_init(&mut self, seed: u64) {
        let mut rng = StdRng::seed_from_u64(seed);
        let uniform = Uniform::new_inclusive(-1.0, 1.0);
        for e in &self.data[..self.rows * self.cols] {
            e.set(uniform.sample(&mut rng));
        }
    }

    fn row_cells(&self, i: usize) -> &[Real] {
        assert!(i < self.rows, "row {i} out of range for {} rows", self.rows);
        &self.data[i * self.cols..][..self.cols]
    }

    pub fn get(&self, i: usize, j: usize) -> real {
        assert!(j < self.cols);
        self.row_cells(i)[j].get()
    }

    pub fn set(&self, i: usize, j: usize, value: real) {
        assert!(j < self.cols);
        self.row_cells(i)[j].set(value);
    }

    /// Returns a copy of row `i`.
    pub fn row(&self, i: usize) -> Vec<real> {
        self.row_cells(i).iter().map(Real::get).collect()
    }

    /// `row[i] += a * vec`
    pub fn add_vector_to_row(&self, vec: &[real], i: usize, a: real) {
        assert_eq!(vec.len(), self.cols);
        for (e, &v) in self.row_cells(i).iter().zip(vec) {
            e.add(a * v);
        }
    }

    /// `vec += a * row[i]`
    pub fn add_row_to_vector(&self, vec: &mut [real], i: usize, a: real) {
        assert_eq!(vec.len(), self.cols);
        for (v, e) in vec.iter_mut().zip(self.row_cells(i)) {
            *v += a * e.get();
        }
    }

    /// Dot product of `vec` with row `i`.
    ///
    /// A NaN or infinite result means training has diverged and is reported
    /// as [`Error::NumericDivergence`].
    pub fn dot_row(&self, vec: &[real], i: usize) -> Result<real> {
        assert_eq!(vec.len(), self.cols);
        let d = self
            .row_cells(i)
            .iter()
            .zip(vec)
            .map(|(e, &v)| e.get() * v)
            .sum::<real>();
        if !d.is_finite() {
            return Err(Error::NumericDivergence { row: i });
        }
        Ok(d)
    }
}
