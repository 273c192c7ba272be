//! Reading, editing, relighting and saving Anvil worlds.
//!
//! A [`World`] owns `level.dat`, the session lock and one [`Dimension`] per
//! chunk space. Chunks live in region files, are decoded on demand into a
//! bounded cache and only reach the region files again on [`World::save`].

pub mod config;
pub mod error;
pub mod nbt;
pub mod region;
pub mod world;

pub use config::WorldConfig;
pub use error::{Result, WorldError};
pub use world::{
    level::LevelInfo, BlockPos, BoundingBox, Chunk, ChunkPos, ChunkRef, Dimension, DimensionKind,
    LightKind, LightingRun, Progress, World,
};
