//! Read-only access to exported vectors, for similarity queries.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::Index;
use std::path::Path;

use ordered_float::OrderedFloat;

use crate::checkpoint::parse_vector_line;
use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::real;
use crate::vector::{dot, normalize};

pub struct Vectors {
    kind: EntityKind,
    /// Embedding vector length (number of dimensions).
    size: usize,
    ids: Vec<String>,
    positions: HashMap<String, usize>,
    /// `embeddings[k * size..(k+1) * size]` is the unit-length vector for entry `k`.
    embeddings: Vec<real>,
}

impl Index<usize> for Vectors {
    type Output = [real];

    fn index(&self, i: usize) -> &[real] {
        &self.embeddings[i * self.size..][..self.size]
    }
}

impl Vectors {
    /// Loads a vector file written by training, normalizing every vector.
    pub fn load(path: &Path, kind: EntityKind) -> Result<Self> {
        let f = BufReader::new(File::open(path).map_err(|e| Error::io(path, e))?);
        let mut vectors = Vectors {
            kind,
            size: 0,
            ids: vec![],
            positions: HashMap::new(),
            embeddings: vec![],
        };
        for (line_num, line) in f.lines().enumerate() {
            let line = line.map_err(|e| Error::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let invalid = |reason: String| Error::Checkpoint {
                path: path.to_path_buf(),
                line: line_num + 1,
                reason,
            };
            let (id, mut vector) = parse_vector_line(&line, kind).map_err(invalid)?;
            if vectors.ids.is_empty() {
                vectors.size = vector.len();
            } else if vector.len() != vectors.size {
                return Err(invalid(format!(
                    "expected {} dimensions, found {}",
                    vectors.size,
                    vector.len()
                )));
            }
            normalize(&mut vector);
            vectors.positions.insert(id.clone(), vectors.ids.len());
            vectors.ids.push(id);
            vectors.embeddings.extend(vector);
        }
        Ok(vectors)
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns the vector size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Position of the entry with this id. Exact match only.
    pub fn lookup(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }

    /// Id of entry `i`. Panics if `i` is out of range.
    pub fn id(&self, i: usize) -> &str {
        &self.ids[i]
    }

    /// The `n` entries closest by cosine similarity to the normalized sum of
    /// the `query` entries, best first. Query entries are never returned.
    pub fn nearest(&self, query: &[usize], n: usize) -> Vec<(&str, real)> {
        let mut vec = vec![0.0; self.size];
        for &i in query {
            for (v, r) in vec.iter_mut().zip(&self[i]) {
                *v += r;
            }
        }
        normalize(&mut vec);

        let mut best: Vec<(&str, real)> = (0..self.len())
            .filter(|c| !query.contains(c))
            .map(|c| (self.ids[c].as_str(), dot(&vec, &self[c])))
            .collect();
        best.sort_by_key(|(_id, dist)| Reverse(OrderedFloat(*dist)));
        best.truncate(n);
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::write_vectors;

    fn sample() -> (tempfile::TempDir, Vectors) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genre_vec.json");
        write_vectors(
            &path,
            EntityKind::Genre,
            [
                ("rock", vec![1.0, 0.0]),
                ("metal", vec![2.0, 0.2]),
                ("jazz", vec![0.0, 3.0]),
                ("blues", vec![-1.0, 1.0]),
            ],
        )
        .unwrap();
        let vectors = Vectors::load(&path, EntityKind::Genre).unwrap();
        (dir, vectors)
    }

    #[test]
    fn vectors_are_normalized() {
        let (_dir, vectors) = sample();
        assert_eq!(vectors.len(), 4);
        assert_eq!(vectors.size(), 2);
        let jazz = vectors.lookup("jazz").unwrap();
        assert_eq!(vectors.id(jazz), "jazz");
        assert!((vectors[jazz][1] - 1.0).abs() < 1e-12);
        assert_eq!(vectors.lookup("polka"), None);
    }

    #[test]
    fn nearest_ranks_by_cosine() {
        let (_dir, vectors) = sample();
        let rock = vectors.lookup("rock").unwrap();
        let ranked: Vec<&str> = vectors.nearest(&[rock], 3).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ranked, ["metal", "jazz", "blues"]);

        let top = vectors.nearest(&[rock], 1);
        assert_eq!(top.len(), 1);
        assert!(top[0].1 > 0.9);
    }

    #[test]
    fn inconsistent_dimensions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track_vec.json");
        std::fs::write(
            &path,
            "{\"track_id\": \"1\", \"vector\": [1.0, 0.0]}\n{\"track_id\": \"2\", \"vector\": [1.0]}\n",
        )
        .unwrap();
        assert!(matches!(
            Vectors::load(&path, EntityKind::Track),
            Err(Error::Checkpoint { line: 2, .. })
        ));
    }
}
