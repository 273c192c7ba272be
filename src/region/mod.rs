//! Anvil region files.
//!
//! A region file stores up to 32x32 chunks. It starts with two 4 KiB tables
//! of 1024 big-endian entries each, the sector offsets followed by the last
//! save timestamps; chunk payloads fill whole 4 KiB sectors after that.

mod file;
mod folder;
pub mod zlib;

use std::fmt;

use crate::world::ChunkPos;

pub use self::{
    file::{RegionFile, RepairReport},
    folder::WorldFolder,
};

pub const SECTOR_BYTES: usize = 4096;
pub const HEADER_SECTORS: usize = 2;
pub const REGION_SIZE: i32 = 32;
pub const CHUNKS_PER_REGION: usize = 1024;

/// Length prefix plus compression tag.
pub const CHUNK_HEADER_SIZE: usize = 5;
/// A chunk's sector count has to fit in the low byte of its offset entry.
pub const MAX_CHUNK_SECTORS: usize = 255;

pub const VERSION_GZIP: u8 = 1;
pub const VERSION_DEFLATE: u8 = 2;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegionPos {
    pub x: i32,
    pub z: i32,
}

impl RegionPos {
    pub fn new(x: i32, z: i32) -> RegionPos {
        RegionPos { x, z }
    }

    pub fn from_chunk(pos: ChunkPos) -> RegionPos {
        RegionPos::new(pos.x >> 5, pos.z >> 5)
    }

    /// Parses names like `r.0.-1.mca`.
    pub fn from_filename(name: &str) -> Option<RegionPos> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() == 4 && parts[0] == "r" && parts[3] == "mca" {
            let x = parts[1].parse().ok()?;
            let z = parts[2].parse().ok()?;
            Some(RegionPos { x, z })
        } else {
            None
        }
    }

    pub fn filename(&self) -> String {
        format!("r.{}.{}.mca", self.x, self.z)
    }

    /// Chunk coordinate of table slot `index`.
    pub fn chunk_at(&self, index: usize) -> ChunkPos {
        let local_x = (index % REGION_SIZE as usize) as i32;
        let local_z = (index / REGION_SIZE as usize) as i32;
        ChunkPos::new(self.x * REGION_SIZE + local_x, self.z * REGION_SIZE + local_z)
    }

    pub fn contains(&self, pos: ChunkPos) -> bool {
        RegionPos::from_chunk(pos) == *self
    }
}

impl fmt::Display for RegionPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// Table slot of a chunk inside its region.
#[inline]
pub fn slot_index(pos: ChunkPos) -> usize {
    ((pos.z & 31) * REGION_SIZE + (pos.x & 31)) as usize
}
