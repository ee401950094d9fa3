//! Reading the training corpus: one JSON session record per line.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::vocab::Vocab;

/// One listening session: `{"t": [track ids], "l": length}`.
#[derive(Debug, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "t")]
    pub tracks: Vec<i64>,
    #[serde(rename = "l", default)]
    pub length: Option<i64>,
}

/// Parses a session record. Malformed records are logged and skipped.
pub fn parse_record(line: &str) -> Option<SessionRecord> {
    match serde_json::from_str(line) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!("invalid json format in training corpus ({err}): {line}");
            None
        }
    }
}

/// Reads the corpus line by line, starting over at the beginning of the file
/// whenever it reaches the end.
pub struct CorpusReader {
    path: PathBuf,
    reader: BufReader<File>,
    line: String,
    passes: u64,
}

impl CorpusReader {
    /// Opens `path` positioned `start_line` lines into the file. Positions
    /// past the end start from the beginning.
    pub fn open(path: &Path, start_line: u64) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut corpus = CorpusReader {
            path: path.to_path_buf(),
            reader: BufReader::new(file),
            line: String::new(),
            passes: 0,
        };
        for _ in 0..start_line {
            corpus.line.clear();
            let n = corpus
                .reader
                .read_line(&mut corpus.line)
                .map_err(|e| Error::io(path, e))?;
            if n == 0 {
                debug!("start line {start_line} is past the end of {}", path.display());
                corpus.rewind()?;
                break;
            }
        }
        Ok(corpus)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of times reading has wrapped around to the top of the file.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    fn rewind(&mut self) -> Result<()> {
        self.reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }

    /// Returns the next non-blank line, wrapping around at end of file.
    pub fn next_line(&mut self) -> Result<&str> {
        let mut wrapped = false;
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| Error::io(&self.path, e))?;
            if n == 0 {
                if wrapped {
                    return Err(Error::EmptyCorpus(self.path.clone()));
                }
                self.rewind()?;
                self.passes += 1;
                wrapped = true;
                continue;
            }
            if !self.line.trim().is_empty() {
                break;
            }
        }
        Ok(self.line.trim_end())
    }
}

/// Loads every usable record of the corpus and splits them into `num_shards`
/// contiguous runs, one per training thread.
///
/// Fewer shards are returned when there are fewer records than threads.
pub fn load_shards(path: &Path, vocab: &Vocab, num_shards: usize) -> Result<Vec<Vec<Vec<usize>>>> {
    let f = BufReader::new(File::open(path).map_err(|e| Error::io(path, e))?);
    let mut sequences: Vec<Vec<usize>> = vec![];
    for line in f.lines() {
        let line = line.map_err(|e| Error::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut tracks = vec![];
        if vocab.read_record(&line, &mut tracks) > 0 {
            sequences.push(tracks);
            if sequences.len() % 100_000 == 0 {
                debug!("loaded {}K sessions into memory", sequences.len() / 1000);
            }
        }
    }
    if sequences.is_empty() {
        return Err(Error::EmptyCorpus(path.to_path_buf()));
    }

    let num_shards = num_shards.clamp(1, sequences.len());
    let mut shards: Vec<Vec<Vec<usize>>> = (0..num_shards)
        .rev()
        .map(|i| {
            let start = sequences.len() * i / num_shards;
            sequences.split_off(start)
        })
        .collect();
    shards.reverse();
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn corpus_file(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f
    }

    #[test]
    fn parses_records_and_ignores_extra_fields() {
        let record = parse_record(r#"{"t": [3, 1, 2], "l": 3, "c": 77}"#).unwrap();
        assert_eq!(record.tracks, vec![3, 1, 2]);
        assert_eq!(record.length, Some(3));

        let record = parse_record(r#"{"t": []}"#).unwrap();
        assert!(record.tracks.is_empty());
        assert_eq!(record.length, None);
    }

    #[test]
    fn malformed_records_are_skipped() {
        assert!(parse_record("not json").is_none());
        assert!(parse_record(r#"{"l": 3}"#).is_none());
        assert!(parse_record(r#"{"t": ["a"]}"#).is_none());
    }

    #[test]
    fn reader_wraps_around_and_skips_blank_lines() {
        let f = corpus_file(&["a", "", "b", "c"]);
        let mut corpus = CorpusReader::open(f.path(), 0).unwrap();
        let lines: Vec<String> = (0..5)
            .map(|_| corpus.next_line().unwrap().to_string())
            .collect();
        assert_eq!(lines, ["a", "b", "c", "a", "b"]);
        assert_eq!(corpus.passes(), 1);
    }

    #[test]
    fn reader_starts_at_the_requested_line() {
        let f = corpus_file(&["a", "b", "c"]);
        let mut corpus = CorpusReader::open(f.path(), 2).unwrap();
        assert_eq!(corpus.next_line().unwrap(), "c");
        assert_eq!(corpus.next_line().unwrap(), "a");

        let mut corpus = CorpusReader::open(f.path(), 10).unwrap();
        assert_eq!(corpus.next_line().unwrap(), "a");
    }

    #[test]
    fn empty_corpus_is_an_error() {
        let f = corpus_file(&["", "   "]);
        let mut corpus = CorpusReader::open(f.path(), 0).unwrap();
        assert!(matches!(corpus.next_line(), Err(Error::EmptyCorpus(_))));
    }
}
