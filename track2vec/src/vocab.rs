//! The index space shared by tracks, artists and genres.
//!
//! Rows `0..ntracks` of the input matrix are tracks, followed by artists, then
//! genres. The output matrix has only the track rows.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rand::Rng;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::corpus::{parse_record, CorpusReader};
use crate::entity::{ArtistEntry, Entity, EntityKind, EntityTable, GenreEntry, TrackEntry};
use crate::error::{Error, Result};
use crate::real;

/// Hard cap on the number of tracks. Bounds the size of the embedding tables.
pub const MAX_TRACKS: usize = 5_000_000;

/// One line of the metadata feed.
#[derive(Debug, Deserialize)]
struct MetadataRecord {
    track_id: i64,
    ntoken: u64,
    #[serde(default)]
    artist_id_list: Vec<i64>,
    #[serde(default)]
    reco_genre_id_list: Vec<String>,
}

struct PendingTrack {
    id: String,
    count: u64,
    artist_ids: Vec<String>,
    genre_ids: Vec<String>,
}

/// Collects tracks before indices are assigned.
pub struct VocabBuilder {
    sample: real,
    track_limit: usize,
    tracks: Vec<PendingTrack>,
    track_ids: HashSet<String>,
    ntokens: u64,
}

impl VocabBuilder {
    /// `sample` is the sub-sampling threshold used to compute keep
    /// probabilities.
    pub fn new(sample: real) -> Self {
        VocabBuilder {
            sample,
            track_limit: MAX_TRACKS,
            tracks: vec![],
            track_ids: HashSet::new(),
            ntokens: 0,
        }
    }

    pub fn add_track(
        &mut self,
        id: impl Into<String>,
        count: u64,
        artist_ids: Vec<String>,
        genre_ids: Vec<String>,
    ) -> Result<()> {
        let id = id.into();
        if self.track_ids.contains(&id) {
            return Err(Error::DuplicateEntity {
                kind: EntityKind::Track,
                id,
            });
        }
        if self.tracks.len() >= self.track_limit {
            return Err(Error::TooManyTracks {
                limit: self.track_limit,
            });
        }
        self.ntokens = self
            .ntokens
            .checked_add(count)
            .ok_or_else(|| Error::Config(format!("token count of track {id} overflows the total")))?;
        self.track_ids.insert(id.clone());
        self.tracks.push(PendingTrack {
            id,
            count,
            artist_ids,
            genre_ids,
        });
        Ok(())
    }

    /// Adds every track in a metadata file. Returns the number of tracks read.
    pub fn read_metadata(&mut self, path: &Path) -> Result<usize> {
        let f = BufReader::new(File::open(path).map_err(|e| Error::io(path, e))?);
        let mut ntracks = 0;
        for (line_num, line) in f.lines().enumerate() {
            let line = line.map_err(|e| Error::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: MetadataRecord = match serde_json::from_str(&line) {
                Ok(record) => record,
                Err(err) => {
                    warn!(
                        "invalid json format in metadata file {} on line {}: {err}",
                        path.display(),
                        line_num + 1
                    );
                    continue;
                }
            };
            self.add_track(
                record.track_id.to_string(),
                record.ntoken,
                record
                    .artist_id_list
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
                record.reco_genre_id_list,
            )?;
            ntracks += 1;
            if ntracks % 100_000 == 0 {
                debug!("read {}K tracks of metadata", ntracks / 1000);
            }
        }
        info!("The total number of tracks is {ntracks}");
        Ok(ntracks)
    }

    /// Assigns every entity its index and computes keep probabilities.
    pub fn index(self) -> Vocab {
        let ntracks = self.tracks.len();

        // Artists and genres are numbered in order of first reference.
        let mut artists: Vec<(String, u64)> = vec![];
        let mut artist_pos: HashMap<String, usize> = HashMap::new();
        let mut genres: Vec<(String, u64)> = vec![];
        let mut genre_pos: HashMap<String, usize> = HashMap::new();
        for track in &self.tracks {
            for id in &track.artist_ids {
                register(&mut artists, &mut artist_pos, id);
            }
            for id in &track.genre_ids {
                register(&mut genres, &mut genre_pos, id);
            }
        }

        let nartists = artists.len();
        let artists = EntityTable::new(
            artists
                .into_iter()
                .enumerate()
                .map(|(i, (id, count))| ArtistEntry {
                    id,
                    index: ntracks + i,
                    count,
                })
                .collect(),
        );
        let genres = EntityTable::new(
            genres
                .into_iter()
                .enumerate()
                .map(|(i, (id, count))| GenreEntry {
                    id,
                    index: ntracks + nartists + i,
                    count,
                })
                .collect(),
        );

        let ntokens = self.ntokens;
        let sample = self.sample;
        let tracks = EntityTable::new(
            self.tracks
                .into_iter()
                .enumerate()
                .map(|(index, track)| {
                    let f = track.count as real / ntokens as real;
                    let ratio = sample / f;
                    let artist_indices = track
                        .artist_ids
                        .iter()
                        .filter_map(|id| artists.index_of(id))
                        .collect();
                    let genre_indices = track
                        .genre_ids
                        .iter()
                        .filter_map(|id| genres.index_of(id))
                        .collect();
                    TrackEntry {
                        id: track.id,
                        index,
                        count: track.count,
                        keep_probability: ratio.sqrt() + ratio,
                        lr_scale: 1.0,
                        artist_ids: track.artist_ids,
                        genre_ids: track.genre_ids,
                        artist_indices,
                        genre_indices,
                    }
                })
                .collect(),
        );

        let vocab = Vocab {
            tracks,
            artists,
            genres,
            ntokens,
        };
        info!("Read {}M tokens", vocab.ntokens / 1_000_000);
        info!("Number of tracks: {}", vocab.ntracks());
        info!("Number of artists: {}", vocab.nartists());
        info!("Number of reco genres: {}", vocab.ngenres());
        vocab
    }
}

fn register(list: &mut Vec<(String, u64)>, positions: &mut HashMap<String, usize>, id: &str) {
    match positions.get(id) {
        Some(&i) => list[i].1 += 1,
        None => {
            positions.insert(id.to_string(), list.len());
            list.push((id.to_string(), 1));
        }
    }
}

/// All indexed entities.
#[derive(Debug, Clone)]
pub struct Vocab {
    tracks: EntityTable<TrackEntry>,
    artists: EntityTable<ArtistEntry>,
    genres: EntityTable<GenreEntry>,
    ntokens: u64,
}

impl Vocab {
    /// Reads and indexes a metadata file.
    pub fn load(metadata: &Path, sample: real) -> Result<Self> {
        let mut builder = VocabBuilder::new(sample);
        builder.read_metadata(metadata)?;
        Ok(builder.index())
    }

    pub fn tracks(&self) -> &EntityTable<TrackEntry> {
        &self.tracks
    }

    pub fn artists(&self) -> &EntityTable<ArtistEntry> {
        &self.artists
    }

    pub fn genres(&self) -> &EntityTable<GenreEntry> {
        &self.genres
    }

    /// The track at global index `index`. Panics if `index` is not a track.
    pub fn track(&self, index: usize) -> &TrackEntry {
        self.tracks.at(index)
    }

    pub(crate) fn set_lr_scale(&mut self, index: usize, scale: real) {
        self.tracks.at_mut(index).lr_scale = scale;
    }

    pub fn ntracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn nartists(&self) -> usize {
        self.artists.len()
    }

    pub fn ngenres(&self) -> usize {
        self.genres.len()
    }

    /// Size of the whole index space.
    pub fn len(&self) -> usize {
        self.ntracks() + self.nartists() + self.ngenres()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of all track counts.
    pub fn ntokens(&self) -> u64 {
        self.ntokens
    }

    /// Track counts in index order.
    pub fn track_counts(&self) -> Vec<u64> {
        self.tracks.iter().map(Entity::count).collect()
    }

    /// Sub-sampling decision for one occurrence of a track, given a uniform
    /// draw from `[0, 1)`. Unknown tracks are always discarded.
    pub fn discard(&self, track_id: &str, draw: real) -> bool {
        self.tracks
            .get(track_id)
            .map_or(true, |track| track.discard(draw))
    }

    /// Reads the next session from `corpus` into `out`, sub-sampled.
    ///
    /// Returns the number of known tracks in the session before sub-sampling.
    /// A malformed line yields an empty sequence.
    pub fn read_sequence<R: Rng>(
        &self,
        corpus: &mut CorpusReader,
        rng: &mut R,
        out: &mut Vec<usize>,
    ) -> Result<u64> {
        out.clear();
        let record = match parse_record(corpus.next_line()?) {
            Some(record) => record,
            None => return Ok(0),
        };

        let mut read = 0;
        for id in record.tracks {
            let track = match self.tracks.get(&id.to_string()) {
                Some(track) => track,
                None => continue,
            };
            read += 1;
            if !track.discard(rng.gen()) {
                out.push(track.index);
            }
        }
        Ok(read)
    }

    /// Parses one session into `out` without sub-sampling, skipping unknown
    /// tracks. Returns the number of tracks appended.
    pub fn read_record(&self, line: &str, out: &mut Vec<usize>) -> usize {
        let record = match parse_record(line) {
            Some(record) => record,
            None => return 0,
        };
        let before = out.len();
        out.extend(
            record
                .tracks
                .iter()
                .filter_map(|id| self.tracks.index_of(&id.to_string())),
        );
        out.len() - before
    }
}
