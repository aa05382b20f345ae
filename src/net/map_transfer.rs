//! Map file transfer
//!
//! The loaded map is served to clients in fixed-size chunks. Clients learn
//! the map's identity (name, SHA-256, CRC32, size) up front and request
//! chunks by index.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use ring::digest::{digest, SHA256};

use crate::game::constants::map::CHUNK_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("map '{0}' not found")]
    NotFound(String),
    #[error("invalid map name '{0}'")]
    InvalidName(String),
    #[error("map '{name}' is too large ({size} bytes)")]
    TooLarge { name: String, size: usize },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Where map files come from
pub trait MapSource: Send {
    fn load(&self, name: &str) -> Result<Vec<u8>, MapError>;
}

/// Reads `<dir>/<name>.map`
#[derive(Debug, Clone)]
pub struct DirectoryMapSource {
    dir: PathBuf,
}

impl DirectoryMapSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl MapSource for DirectoryMapSource {
    fn load(&self, name: &str) -> Result<Vec<u8>, MapError> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') || name.contains('\\') {
            return Err(MapError::InvalidName(name.to_string()));
        }
        let path = self.dir.join(format!("{}.map", name));
        match std::fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(MapError::NotFound(name.to_string())),
            Err(e) => Err(MapError::Io(e)),
        }
    }
}

/// In-memory maps, keyed by name
#[derive(Debug, Clone, Default)]
pub struct MemoryMapSource {
    maps: HashMap<String, Vec<u8>>,
}

impl MemoryMapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_map(mut self, name: &str, data: Vec<u8>) -> Self {
        self.maps.insert(name.to_string(), data);
        self
    }
}

impl MapSource for MemoryMapSource {
    fn load(&self, name: &str) -> Result<Vec<u8>, MapError> {
        self.maps
            .get(name)
            .cloned()
            .ok_or_else(|| MapError::NotFound(name.to_string()))
    }
}

/// One chunk of map data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapChunk<'a> {
    pub index: i32,
    pub last: bool,
    pub data: &'a [u8],
}

/// The currently loaded map
#[derive(Debug, Clone)]
pub struct MapData {
    name: String,
    sha256: [u8; 32],
    crc: u32,
    data: Vec<u8>,
}

impl MapData {
    pub fn load(source: &dyn MapSource, name: &str) -> Result<Self, MapError> {
        let data = source.load(name)?;
        Self::from_bytes(name, data)
    }

    pub fn from_bytes(name: &str, data: Vec<u8>) -> Result<Self, MapError> {
        if u32::try_from(data.len()).is_err() {
            return Err(MapError::TooLarge {
                name: name.to_string(),
                size: data.len(),
            });
        }
        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(digest(&SHA256, &data).as_ref());
        Ok(Self {
            name: name.to_string(),
            sha256,
            crc: crc32fast::hash(&data),
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sha256(&self) -> [u8; 32] {
        self.sha256
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Number of chunks a client downloads. An empty map still has one
    /// (empty, final) chunk.
    pub fn chunk_count(&self) -> i32 {
        self.data.len().div_ceil(CHUNK_SIZE).max(1) as i32
    }

    /// Chunk `index`, or `None` when out of range
    pub fn chunk(&self, index: i32) -> Option<MapChunk<'_>> {
        if index < 0 || index >= self.chunk_count() {
            return None;
        }
        let offset = index as usize * CHUNK_SIZE;
        let end = (offset + CHUNK_SIZE).min(self.data.len());
        Some(MapChunk {
            index,
            last: end == self.data.len(),
            data: &self.data[offset..end],
        })
    }
}
