pub mod cache;
pub mod chunk;
pub mod dimension;
pub mod level;
mod lighting;
pub mod materials;
pub mod players;
pub mod session;

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt, fs, io,
    path::{Path, PathBuf},
    rc::Rc,
};

use log::info;

pub use chunk::{Chunk, ChunkRef, LightKind};
pub use dimension::{Dimension, DimensionKind};
pub use lighting::{LightingRun, Progress};

use crate::{
    config::WorldConfig,
    error::{Result, WorldError},
    nbt::{self, NbtCompound, NbtTag},
};
use level::{LevelInfo, LEVEL_DAT, VERSION_ANVIL};
use materials::Materials;
use players::{PlayerFiles, SINGLE_PLAYER};
use session::SessionLock;

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Default)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(x: i32, y: i32, z: i32) -> BlockPos {
        BlockPos { x, y, z }
    }
}

/// Chunks sort by x, then z.
#[derive(PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy, Debug)]
pub struct ChunkPos {
    pub x: i32,
    pub z: i32,
}

impl ChunkPos {
    pub fn new(x: i32, z: i32) -> ChunkPos {
        ChunkPos { x, z }
    }

    pub fn from_block_pos(x: i32, z: i32) -> ChunkPos {
        ChunkPos::new(x >> 4, z >> 4)
    }
}

impl fmt::Display for ChunkPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// An axis aligned box of blocks, `origin` inclusive, `origin + size`
/// exclusive.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct BoundingBox {
    pub origin: BlockPos,
    pub size: BlockPos,
}

impl BoundingBox {
    pub fn new(origin: BlockPos, size: BlockPos) -> BoundingBox {
        BoundingBox { origin, size }
    }

    pub fn max(&self) -> BlockPos {
        BlockPos::new(
            self.origin.x + self.size.x,
            self.origin.y + self.size.y,
            self.origin.z + self.size.z,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.size.x <= 0 || self.size.y <= 0 || self.size.z <= 0
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        let max = self.max();
        (self.origin.x..max.x).contains(&pos.x)
            && (self.origin.y..max.y).contains(&pos.y)
            && (self.origin.z..max.z).contains(&pos.z)
    }

    /// Every chunk the box touches.
    pub fn chunk_positions(&self) -> impl Iterator<Item = ChunkPos> {
        let (min, max) = (self.origin, self.max());
        let empty = self.is_empty();
        let (x0, x1) = (min.x >> 4, (max.x - 1) >> 4);
        let (z0, z1) = (min.z >> 4, (max.z - 1) >> 4);
        (x0..=x1)
            .flat_map(move |x| (z0..=z1).map(move |z| ChunkPos::new(x, z)))
            .filter(move |_| !empty)
    }
}

/// An Anvil world folder: `level.dat`, the session lock, the overworld and
/// any other dimension folders.
pub struct World {
    root: PathBuf,
    config: WorldConfig,
    materials: Rc<Materials>,
    lock: Option<Rc<SessionLock>>,
    level: LevelInfo,
    players: PlayerFiles,
    overworld: Dimension,
    dimensions: BTreeMap<DimensionKind, Dimension>,
}

impl World {
    /// Opens an existing world for writing and takes its session lock.
    pub fn open(path: &Path, config: WorldConfig) -> Result<World> {
        let (level, restored) = World::load_level(path, &config)?;
        let lock = Rc::new(SessionLock::acquire(path)?);
        if restored {
            level.save()?;
        }
        World::assemble(path, config, level, Some(lock))
    }

    /// Opens an existing world without a session lock. Every write fails with
    /// [`WorldError::ReadOnly`].
    pub fn open_read_only(path: &Path, config: WorldConfig) -> Result<World> {
        let (level, _) = World::load_level(path, &config)?;
        World::assemble(path, config, level, None)
    }

    /// Creates a new, empty world. Fails if the folder already holds one.
    pub fn create(path: &Path, config: WorldConfig, seed: Option<i64>) -> Result<World> {
        config.validate()?;
        fs::create_dir_all(path)?;
        if path.join(LEVEL_DAT).exists() {
            return Err(WorldError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already holds a world", path.display()),
            )));
        }
        let lock = Rc::new(SessionLock::acquire(path)?);
        let level = LevelInfo::create(path, seed);
        level.save()?;
        info!("Created world {} at {}", level.level_name(), path.display());
        World::assemble(path, config, level, Some(lock))
    }

    fn load_level(path: &Path, config: &WorldConfig) -> Result<(LevelInfo, bool)> {
        config.validate()?;
        if !path.is_dir() {
            return Err(WorldError::NotAWorld(path.to_path_buf()));
        }
        let (level, restored) = LevelInfo::load(path)?;
        if level.version() != VERSION_ANVIL {
            return Err(WorldError::UnsupportedVersion(level.version()));
        }
        Ok((level, restored))
    }

    fn assemble(
        path: &Path,
        config: WorldConfig,
        level: LevelInfo,
        lock: Option<Rc<SessionLock>>,
    ) -> Result<World> {
        let materials = Rc::new(config.load_materials()?);
        let overworld = Dimension::open(
            path,
            DimensionKind::Overworld,
            lock.clone(),
            materials.clone(),
            &config,
        )?;

        let mut dimensions = BTreeMap::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let kind = match name.to_str().and_then(DimensionKind::from_folder_name) {
                Some(kind) if kind != DimensionKind::Overworld => kind,
                _ => continue,
            };
            let dim = Dimension::open(&entry.path(), kind, lock.clone(), materials.clone(), &config)?;
            dimensions.insert(kind, dim);
        }

        info!(
            "Opened world {} ({} extra dimensions, {})",
            level.level_name(),
            dimensions.len(),
            if lock.is_some() { "writable" } else { "read only" }
        );
        Ok(World {
            root: path.to_path_buf(),
            config,
            materials,
            lock,
            level,
            players: PlayerFiles::new(path),
            overworld,
            dimensions,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn materials(&self) -> &Materials {
        &self.materials
    }

    pub fn height(&self) -> usize {
        self.config.height
    }

    pub fn is_read_only(&self) -> bool {
        self.lock.is_none()
    }

    pub fn level(&self) -> &LevelInfo {
        &self.level
    }

    pub fn level_mut(&mut self) -> &mut LevelInfo {
        &mut self.level
    }

    pub fn overworld(&mut self) -> &mut Dimension {
        &mut self.overworld
    }

    /// Kinds of every open dimension besides the overworld.
    pub fn dimension_kinds(&self) -> Vec<DimensionKind> {
        self.dimensions.keys().copied().collect()
    }

    /// Opens a dimension, creating its folder if needed.
    pub fn dimension(&mut self, kind: DimensionKind) -> Result<&mut Dimension> {
        let folder = match kind.folder_name() {
            Some(folder) => self.root.join(folder),
            None => return Ok(&mut self.overworld),
        };
        match self.dimensions.entry(kind) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let lock = match &self.lock {
                    Some(lock) => lock.clone(),
                    None => return Err(WorldError::ReadOnly),
                };
                lock.check()?;
                fs::create_dir_all(&folder)?;
                let dim = Dimension::open(
                    &folder,
                    kind,
                    Some(lock),
                    self.materials.clone(),
                    &self.config,
                )?;
                Ok(entry.insert(dim))
            }
        }
    }

    /// Every player with a file in `players/`, then the single player kept in
    /// `level.dat` if there is one.
    pub fn players(&self) -> Result<Vec<String>> {
        let mut names = self.players.names()?;
        if nbt::get_compound(self.level.data(), SINGLE_PLAYER).is_some() {
            names.push(SINGLE_PLAYER.to_string());
        }
        Ok(names)
    }

    /// The tag of a player. Changes are written on the next save.
    pub fn player_tag(&mut self, player: &str) -> Result<&mut NbtCompound> {
        if player == SINGLE_PLAYER {
            return nbt::get_compound_mut(self.level.data_mut(), SINGLE_PLAYER)
                .ok_or_else(|| WorldError::PlayerNotFound(player.to_string()));
        }
        self.players.tag(player)
    }

    /// Adds a player, replacing any existing one of that name.
    pub fn create_player(&mut self, player: &str) -> Result<&mut NbtCompound> {
        match &self.lock {
            Some(lock) => lock.check()?,
            None => return Err(WorldError::ReadOnly),
        }
        if player == SINGLE_PLAYER {
            self.level
                .data_mut()
                .insert(SINGLE_PLAYER, NbtTag::Compound(players::new_player_tag()));
            return self.player_tag(player);
        }
        Ok(self.players.create(player))
    }

    /// The player's bed spawn, or the world spawn for `None` and for players
    /// who have not set one.
    pub fn player_spawn_position(&mut self, player: Option<&str>) -> Result<(i32, i32, i32)> {
        let (x, y, z) = self.level.spawn();
        let tag = match player {
            Some(player) => self.player_tag(player)?,
            None => return Ok((x, y, z)),
        };
        Ok((
            tag.get::<_, i32>("SpawnX").unwrap_or(x),
            tag.get::<_, i32>("SpawnY").unwrap_or(y),
            tag.get::<_, i32>("SpawnZ").unwrap_or(z),
        ))
    }

    pub fn set_player_spawn_position(
        &mut self,
        player: Option<&str>,
        (x, y, z): (i32, i32, i32),
    ) -> Result<()> {
        let tag = match player {
            Some(player) => self.player_tag(player)?,
            None => {
                self.level.set_spawn(x, y, z);
                return Ok(());
            }
        };
        tag.insert("SpawnX", NbtTag::Int(x));
        tag.insert("SpawnY", NbtTag::Int(y));
        tag.insert("SpawnZ", NbtTag::Int(z));
        Ok(())
    }

    pub fn player_dimension(&mut self, player: &str) -> Result<DimensionKind> {
        let tag = self.player_tag(player)?;
        Ok(DimensionKind::from_id(tag.get::<_, i32>("Dimension").unwrap_or(0)))
    }

    pub fn set_player_dimension(&mut self, player: &str, kind: DimensionKind) -> Result<()> {
        self.player_tag(player)?.insert("Dimension", NbtTag::Int(kind.id()));
        Ok(())
    }

    pub fn player_position(&mut self, player: &str) -> Result<Option<[f64; 3]>> {
        Ok(players::read_doubles(self.player_tag(player)?, "Pos"))
    }

    pub fn set_player_position(&mut self, player: &str, pos: [f64; 3]) -> Result<()> {
        self.player_tag(player)?.insert("Pos", players::doubles(pos));
        Ok(())
    }

    pub fn block_at(&mut self, x: i32, y: i32, z: i32) -> Result<u8> {
        self.overworld.block_at(x, y, z)
    }

    pub fn set_block_at(&mut self, x: i32, y: i32, z: i32, block: u8) -> Result<bool> {
        self.overworld.set_block_at(x, y, z, block)
    }

    pub fn block_light_at(&mut self, x: i32, y: i32, z: i32) -> Result<u8> {
        self.overworld.block_light_at(x, y, z)
    }

    pub fn sky_light_at(&mut self, x: i32, y: i32, z: i32) -> Result<u8> {
        self.overworld.sky_light_at(x, y, z)
    }

    pub fn get_chunk(&mut self, pos: ChunkPos) -> Result<ChunkRef> {
        self.overworld.get_chunk(pos)
    }

    pub fn create_chunk(&mut self, pos: ChunkPos) -> Result<ChunkRef> {
        self.overworld.create_chunk(pos)
    }

    pub fn delete_chunk(&mut self, pos: ChunkPos) -> Result<()> {
        self.overworld.delete_chunk(pos)
    }

    pub fn contains_chunk(&mut self, pos: ChunkPos) -> Result<bool> {
        self.overworld.contains_chunk(pos)
    }

    pub fn chunk_count(&mut self) -> Result<usize> {
        self.overworld.chunk_count()
    }

    pub fn bounds(&mut self) -> Result<BoundingBox> {
        self.overworld.bounds()
    }

    pub fn contains_point(&mut self, x: i32, y: i32, z: i32) -> Result<bool> {
        self.overworld.contains_point(x, y, z)
    }

    pub fn create_chunks_in_box(&mut self, bounds: BoundingBox) -> Result<Vec<ChunkPos>> {
        self.overworld.create_chunks_in_box(bounds)
    }

    pub fn delete_chunks_in_box(&mut self, bounds: BoundingBox) -> Result<Vec<ChunkPos>> {
        self.overworld.delete_chunks_in_box(bounds)
    }

    pub fn mark_dirty_box(&mut self, bounds: BoundingBox) -> Result<()> {
        self.overworld.mark_dirty_box(bounds)
    }

    /// Copies an overworld chunk of `source` into this world's overworld.
    /// Other dimensions copy through [`Dimension::copy_chunk_from`].
    pub fn copy_chunk_from(&mut self, source: &mut World, pos: ChunkPos) -> Result<()> {
        self.overworld.copy_chunk_from(&mut source.overworld, pos)
    }

    /// Relights every queued chunk in every open dimension.
    pub fn generate_lights(&mut self) -> Result<()> {
        self.overworld.generate_lights(None)?;
        for dim in self.dimensions.values_mut() {
            dim.generate_lights(None)?;
        }
        Ok(())
    }

    /// Saves every dimension, then `level.dat`.
    pub fn save(&mut self) -> Result<()> {
        match &self.lock {
            Some(lock) => lock.check()?,
            None => return Err(WorldError::ReadOnly),
        }
        let mut saved = self.overworld.save()?;
        for dim in self.dimensions.values_mut() {
            saved += dim.save()?;
        }
        self.players.save()?;
        self.level.set_last_played(level::now_millis());
        self.level.save()?;
        info!("Saved world {} ({} chunks)", self.level.level_name(), saved);
        Ok(())
    }

    /// Drops every loaded chunk. Unsaved changes stay in the overlays.
    pub fn unload(&mut self) -> Result<()> {
        self.overworld.unload()?;
        for dim in self.dimensions.values_mut() {
            dim.unload()?;
        }
        Ok(())
    }

    /// Closes the world, discarding anything not saved.
    pub fn close(mut self) -> Result<()> {
        self.players.discard();
        self.overworld.close()?;
        for dim in self.dimensions.values_mut() {
            dim.close()?;
        }
        info!("Closed world {}", self.root.display());
        Ok(())
    }
}
