//! Arithmetic on plain embedding vectors.

use crate::real;

pub fn dot(a: &[real], b: &[real]) -> real {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&a, &b)| a * b).sum()
}

pub fn norm(v: &[real]) -> real {
    v.iter().copied().map(|e| e * e).sum::<real>().sqrt()
}

/// Scales `v` to unit length. A zero vector is left alone.
pub fn normalize(v: &mut [real]) {
    let len = norm(v);
    if len > 0.0 {
        scale(v, 1.0 / len);
    }
}

pub fn scale(v: &mut [real], a: real) {
    for e in v {
        *e *= a;
    }
}

/// Element-wise mean of two vectors.
pub fn average(a: &[real], b: &[real]) -> Vec<real> {
    assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&a, &b)| (a + b) / 2.0).collect()
}
