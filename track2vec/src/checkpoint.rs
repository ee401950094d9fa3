//! JSON-lines vector files.
//!
//! Every line is `{"<kind>_id": "<id>", "vector": [...]}`. The same format is
//! used for the checkpoint files that a later run blends back in and for the
//! exported vectors.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use tracing::{info, warn};

use crate::entity::EntityKind;
use crate::error::{Error, Result};
use crate::matrix::Matrix;
use crate::real;

pub const OUTPUT_TRACK_FILE: &str = "model_output_track.json";
pub const INPUT_TRACK_FILE: &str = "model_input_track.json";
pub const INPUT_ARTIST_FILE: &str = "model_input_artist.json";
pub const INPUT_GENRE_FILE: &str = "model_input_genre.json";
pub const TRACK_VEC_FILE: &str = "track_vec.json";
pub const ARTIST_VEC_FILE: &str = "artist_vec.json";
pub const GENRE_VEC_FILE: &str = "genre_vec.json";

struct VectorRecord<'a> {
    key: &'static str,
    id: &'a str,
    vector: &'a [real],
}

impl Serialize for VectorRecord<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry(self.key, self.id)?;
        map.serialize_entry("vector", self.vector)?;
        map.end()
    }
}

/// Writes one line per `(id, vector)` pair, in iteration order.
pub fn write_vectors<'a, I>(path: &Path, kind: EntityKind, rows: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, Vec<real>)>,
{
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut out = BufWriter::new(file);
    let mut n = 0;
    for (id, vector) in rows {
        let record = VectorRecord {
            key: kind.id_key(),
            id,
            vector: &vector,
        };
        serde_json::to_writer(&mut out, &record).map_err(|e| Error::io(path, e.into()))?;
        writeln!(out).map_err(|e| Error::io(path, e))?;
        n += 1;
    }
    out.flush().map_err(|e| Error::io(path, e))?;
    info!("wrote {n} {kind} vectors to {}", path.display());
    Ok(())
}

/// Parses one line of a vector file into its id and vector.
pub fn parse_vector_line(line: &str, kind: EntityKind) -> std::result::Result<(String, Vec<real>), String> {
    let value: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    let id = match value.get(kind.id_key()) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(_) => return Err(format!("{} is not a string", kind.id_key())),
        None => return Err(format!("missing {}", kind.id_key())),
    };
    let vector = match value.get("vector") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| format!("non-numeric vector element {v}")))
            .collect::<std::result::Result<Vec<real>, String>>()?,
        _ => return Err("missing vector".to_string()),
    };
    Ok((id, vector))
}

/// Adds every vector in `path` to the matrix row `lookup` returns for its id.
///
/// Ids `lookup` does not know are skipped. A missing file is not an error;
/// nothing is blended. Returns the rows that were blended.
pub fn blend_vectors<F>(path: &Path, kind: EntityKind, matrix: &Matrix, lookup: F) -> Result<Vec<usize>>
where
    F: Fn(&str) -> Option<usize>,
{
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!("no pretrained {kind} vectors at {}", path.display());
            return Ok(vec![]);
        }
        Err(err) => return Err(Error::io(path, err)),
    };

    let mut blended = vec![];
    let mut unknown = 0;
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| Error::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let checkpoint_error = |reason: String| Error::Checkpoint {
            path: path.to_path_buf(),
            line: line_num + 1,
            reason,
        };
        let (id, vector) = parse_vector_line(&line, kind).map_err(checkpoint_error)?;
        if vector.len() != matrix.cols() {
            return Err(checkpoint_error(format!(
                "expected {} dimensions, found {}",
                matrix.cols(),
                vector.len()
            )));
        }
        match lookup(&id) {
            Some(row) => {
                matrix.add_vector_to_row(&vector, row, 1.0);
                blended.push(row);
            }
            None => unknown += 1,
        }
    }
    info!(
        "blended {} pretrained {kind} vectors from {} ({unknown} unknown ids)",
        blended.len(),
        path.display()
    );
    Ok(blended)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_vectors_blend_back_additively() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(ARTIST_VEC_FILE);
        write_vectors(
            &path,
            EntityKind::Artist,
            [("7", vec![1.0, -2.0]), ("8", vec![0.5, 0.25])],
        )
        .unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next().unwrap(), r#"{"artist_id":"7","vector":[1.0,-2.0]}"#);

        let m = Matrix::zeros(3, 2).unwrap();
        let lookup = |id: &str| match id {
            "7" => Some(2),
            "8" => Some(0),
            _ => None,
        };
        assert_eq!(blend_vectors(&path, EntityKind::Artist, &m, lookup).unwrap(), [2, 0]);
        blend_vectors(&path, EntityKind::Artist, &m, lookup).unwrap();
        assert_eq!(m.row(2), [2.0, -4.0]);
        assert_eq!(m.row(0), [1.0, 0.5]);
        assert_eq!(m.row(1), [0.0, 0.0]);
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(INPUT_TRACK_FILE);
        std::fs::write(&path, "{\"track_id\": \"999\", \"vector\": [1.0, 1.0]}\n").unwrap();
        let m = Matrix::zeros(1, 2).unwrap();
        let blended = blend_vectors(&path, EntityKind::Track, &m, |_| None).unwrap();
        assert!(blended.is_empty());
        assert_eq!(m.row(0), [0.0, 0.0]);
    }

    #[test]
    fn missing_file_blends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let m = Matrix::zeros(1, 2).unwrap();
        let blended =
            blend_vectors(&dir.path().join(INPUT_GENRE_FILE), EntityKind::Genre, &m, |_| Some(0))
                .unwrap();
        assert!(blended.is_empty());
    }

    #[test]
    fn malformed_checkpoints_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OUTPUT_TRACK_FILE);
        let m = Matrix::zeros(1, 2).unwrap();

        std::fs::write(&path, "{\"track_id\": \"1\", \"vector\": [1.0, 2.0]}\n\nnope\n").unwrap();
        let err = blend_vectors(&path, EntityKind::Track, &m, |_| Some(0)).unwrap_err();
        assert!(matches!(err, Error::Checkpoint { line: 3, .. }));

        std::fs::write(&path, "{\"track_id\": \"1\", \"vector\": [1.0]}\n").unwrap();
        let err = blend_vectors(&path, EntityKind::Track, &m, |_| Some(0)).unwrap_err();
        assert!(matches!(err, Error::Checkpoint { line: 1, .. }));

        std::fs::write(&path, "{\"genre_id\": \"1\", \"vector\": [1.0, 2.0]}\n").unwrap();
        assert!(blend_vectors(&path, EntityKind::Track, &m, |_| Some(0)).is_err());
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let (id, vector) =
            parse_vector_line(r#"{"track_id": 12, "vector": [0.5]}"#, EntityKind::Track).unwrap();
        assert_eq!(id, "12");
        assert_eq!(vector, [0.5]);
    }
}
