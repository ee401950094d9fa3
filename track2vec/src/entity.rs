//! Catalog entities and the tables that look them up by id.

use std::collections::HashMap;
use std::fmt;

use crate::real;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Track,
    Artist,
    Genre,
}

impl EntityKind {
    /// Name of the id field in JSON-lines vector files.
    pub fn id_key(self) -> &'static str {
        match self {
            EntityKind::Track => "track_id",
            EntityKind::Artist => "artist_id",
            EntityKind::Genre => "genre_id",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Track => "track",
            EntityKind::Artist => "artist",
            EntityKind::Genre => "genre",
        })
    }
}

/// What every entity has: an id, a row in the input matrix, and a count.
pub trait Entity {
    const KIND: EntityKind;

    fn id(&self) -> &str;

    /// Row of this entity in the global index space.
    fn index(&self) -> usize;

    fn count(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct TrackEntry {
    pub(crate) id: String,
    pub(crate) index: usize,
    pub(crate) count: u64,
    /// Probability of keeping an occurrence during sub-sampling. Values above
    /// 1 mean the track is never dropped.
    pub(crate) keep_probability: real,
    /// Multiplier applied to the learning rate when this track is the center
    /// of a window.
    pub(crate) lr_scale: real,
    pub(crate) artist_ids: Vec<String>,
    pub(crate) genre_ids: Vec<String>,
    pub(crate) artist_indices: Vec<usize>,
    pub(crate) genre_indices: Vec<usize>,
}

impl TrackEntry {
    pub fn keep_probability(&self) -> real {
        self.keep_probability
    }

    /// Sub-sampling decision for one occurrence, given a uniform draw from
    /// `[0, 1)`.
    pub fn discard(&self, draw: real) -> bool {
        draw > self.keep_probability
    }

    pub fn lr_scale(&self) -> real {
        self.lr_scale
    }

    pub fn artist_ids(&self) -> &[String] {
        &self.artist_ids
    }

    pub fn genre_ids(&self) -> &[String] {
        &self.genre_ids
    }

    /// Input-matrix rows of the related artists.
    pub fn artist_indices(&self) -> &[usize] {
        &self.artist_indices
    }

    /// Input-matrix rows of the related genres.
    pub fn genre_indices(&self) -> &[usize] {
        &self.genre_indices
    }
}

impl Entity for TrackEntry {
    const KIND: EntityKind = EntityKind::Track;

    fn id(&self) -> &str {
        &self.id
    }

    fn index(&self) -> usize {
        self.index
    }

    fn count(&self) -> u64 {
        self.count
    }
}

#[derive(Debug, Clone)]
pub struct ArtistEntry {
    pub(crate) id: String,
    pub(crate) index: usize,
    pub(crate) count: u64,
}

impl Entity for ArtistEntry {
    const KIND: EntityKind = EntityKind::Artist;

    fn id(&self) -> &str {
        &self.id
    }

    fn index(&self) -> usize {
        self.index
    }

    fn count(&self) -> u64 {
        self.count
    }
}

#[derive(Debug, Clone)]
pub struct GenreEntry {
    pub(crate) id: String,
    pub(crate) index: usize,
    pub(crate) count: u64,
}

impl Entity for GenreEntry {
    const KIND: EntityKind = EntityKind::Genre;

    fn id(&self) -> &str {
        &self.id
    }

    fn index(&self) -> usize {
        self.index
    }

    fn count(&self) -> u64 {
        self.count
    }
}

/// Entities of one kind, in index order, with a hash lookup by id.
#[derive(Debug, Clone)]
pub struct EntityTable<E> {
    entries: Vec<E>,
    by_id: HashMap<String, usize>,
}

impl<E: Entity> EntityTable<E> {
    /// Builds a table from entries already in index order.
    pub(crate) fn new(entries: Vec<E>) -> Self {
        let by_id = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.id().to_string(), i))
            .collect();
        EntityTable { entries, by_id }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.by_id.get(id).map(|&i| &self.entries[i])
    }

    /// Returns the global index of the entity with this id.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.get(id).map(Entity::index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.entries.iter()
    }

    /// Entry at position `i` within this kind (not the global index).
    pub fn at(&self, i: usize) -> &E {
        &self.entries[i]
    }

    pub(crate) fn at_mut(&mut self, i: usize) -> &mut E {
        &mut self.entries[i]
    }
}

impl<'a, E> IntoIterator for &'a EntityTable<E> {
    type Item = &'a E;
    type IntoIter = std::slice::Iter<'a, E>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
