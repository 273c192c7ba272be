use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
    rc::Rc,
};

use log::{debug, info};

use super::{
    cache::ChunkCache,
    chunk::{ChunkRef, LightKind},
    lighting::LightingRun,
    materials::Materials,
    session::SessionLock,
    BlockPos, BoundingBox, ChunkPos,
};
use crate::{
    config::WorldConfig,
    error::{Result, WorldError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DimensionKind {
    Overworld,
    Nether,
    End,
    Other(i32),
}

impl DimensionKind {
    pub fn id(&self) -> i32 {
        match *self {
            DimensionKind::Overworld => 0,
            DimensionKind::Nether => -1,
            DimensionKind::End => 1,
            DimensionKind::Other(id) => id,
        }
    }

    pub fn from_id(id: i32) -> DimensionKind {
        match id {
            0 => DimensionKind::Overworld,
            -1 => DimensionKind::Nether,
            1 => DimensionKind::End,
            id => DimensionKind::Other(id),
        }
    }

    pub fn has_sky_light(&self) -> bool {
        !matches!(self, DimensionKind::Nether | DimensionKind::End)
    }

    /// Folder below the world root, `None` for the overworld.
    pub fn folder_name(&self) -> Option<String> {
        match self {
            DimensionKind::Overworld => None,
            kind => Some(format!("DIM{}", kind.id())),
        }
    }

    pub fn from_folder_name(name: &str) -> Option<DimensionKind> {
        let id = name.strip_prefix("DIM")?.parse().ok()?;
        Some(DimensionKind::from_id(id))
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionKind::Overworld => write!(f, "overworld"),
            DimensionKind::Nether => write!(f, "nether"),
            DimensionKind::End => write!(f, "end"),
            DimensionKind::Other(id) => write!(f, "DIM{id}"),
        }
    }
}

/// One chunk space of a world with block and light accessors in world
/// coordinates. Reads outside the world height or in missing chunks return 0;
/// writes there do nothing and return `false`.
pub struct Dimension {
    pub(super) kind: DimensionKind,
    root: PathBuf,
    pub(super) height: usize,
    pub(super) materials: Rc<Materials>,
    pub(super) cache: ChunkCache,
    all_chunks: Option<BTreeSet<ChunkPos>>,
    bounds: Option<BoundingBox>,
}

impl Dimension {
    pub fn open(
        root: &Path,
        kind: DimensionKind,
        lock: Option<Rc<SessionLock>>,
        materials: Rc<Materials>,
        config: &WorldConfig,
    ) -> Result<Dimension> {
        let cache = ChunkCache::new(root, lock, config.chunk_cache_limit, config.height)?;
        info!("Opened {} at {}", kind, root.display());
        Ok(Dimension {
            kind,
            root: root.to_path_buf(),
            height: config.height,
            materials,
            cache,
            all_chunks: None,
            bounds: None,
        })
    }

    pub fn kind(&self) -> DimensionKind {
        self.kind
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn materials(&self) -> &Materials {
        &self.materials
    }

    pub fn cache(&mut self) -> &mut ChunkCache {
        &mut self.cache
    }

    pub fn get_chunk(&mut self, pos: ChunkPos) -> Result<ChunkRef> {
        self.cache.get_chunk(pos)
    }

    /// Chunk and array index for a block, `None` if the block is outside the
    /// world height or its chunk does not exist.
    fn locate(&mut self, x: i32, y: i32, z: i32) -> Result<Option<(ChunkRef, usize)>> {
        if y < 0 || y as usize >= self.height {
            return Ok(None);
        }
        let chunk = match self.cache.get_chunk(ChunkPos::from_block_pos(x, z)) {
            Ok(chunk) => chunk,
            Err(WorldError::ChunkNotPresent(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let idx = chunk
            .borrow()
            .index((x & 15) as usize, (z & 15) as usize, y as usize);
        Ok(Some((chunk, idx)))
    }

    fn read(&mut self, x: i32, y: i32, z: i32, array: impl Fn(&super::Chunk) -> &[u8]) -> Result<u8> {
        Ok(match self.locate(x, y, z)? {
            Some((chunk, idx)) => array(&chunk.borrow())[idx],
            None => 0,
        })
    }

    fn write(
        &mut self,
        x: i32,
        y: i32,
        z: i32,
        relight: bool,
        apply: impl FnOnce(&mut super::Chunk, usize),
    ) -> Result<bool> {
        self.cache.check_session_lock()?;
        let (chunk, idx) = match self.locate(x, y, z)? {
            Some(found) => found,
            None => return Ok(false),
        };
        let pos = {
            let mut chunk = chunk.borrow_mut();
            apply(&mut chunk, idx);
            chunk.dirty = true;
            chunk.pos
        };
        if relight {
            self.cache.set_needs_lighting(pos, true);
        }
        Ok(true)
    }

    pub fn block_at(&mut self, x: i32, y: i32, z: i32) -> Result<u8> {
        self.read(x, y, z, |chunk| chunk.blocks.as_slice())
    }

    pub fn set_block_at(&mut self, x: i32, y: i32, z: i32, block: u8) -> Result<bool> {
        self.write(x, y, z, true, |chunk, idx| chunk.blocks[idx] = block)
    }

    pub fn block_data_at(&mut self, x: i32, y: i32, z: i32) -> Result<u8> {
        self.read(x, y, z, |chunk| chunk.data.as_slice())
    }

    pub fn set_block_data_at(&mut self, x: i32, y: i32, z: i32, data: u8) -> Result<bool> {
        self.write(x, y, z, true, |chunk, idx| chunk.data[idx] = data & 0x0f)
    }

    pub fn block_light_at(&mut self, x: i32, y: i32, z: i32) -> Result<u8> {
        self.read(x, y, z, |chunk| chunk.light(LightKind::Block))
    }

    pub fn set_block_light_at(&mut self, x: i32, y: i32, z: i32, light: u8) -> Result<bool> {
        self.write(x, y, z, false, |chunk, idx| chunk.block_light[idx] = light & 0x0f)
    }

    pub fn sky_light_at(&mut self, x: i32, y: i32, z: i32) -> Result<u8> {
        self.read(x, y, z, |chunk| chunk.light(LightKind::Sky))
    }

    pub fn set_sky_light_at(&mut self, x: i32, y: i32, z: i32, light: u8) -> Result<bool> {
        self.write(x, y, z, false, |chunk, idx| chunk.sky_light[idx] = light & 0x0f)
    }

    pub fn height_map_at(&mut self, x: i32, z: i32) -> Result<u32> {
        Ok(match self.locate(x, 0, z)? {
            Some((chunk, _)) => chunk.borrow().height_map[((z & 15) * 16 + (x & 15)) as usize],
            None => 0,
        })
    }

    pub fn create_chunk(&mut self, pos: ChunkPos) -> Result<ChunkRef> {
        let chunk = self.cache.create_chunk(pos)?;
        if let Some(all_chunks) = &mut self.all_chunks {
            all_chunks.insert(pos);
        }
        self.bounds = None;
        Ok(chunk)
    }

    /// Creates every listed chunk that does not exist yet and returns those.
    pub fn create_chunks(
        &mut self,
        positions: impl IntoIterator<Item = ChunkPos>,
    ) -> Result<Vec<ChunkPos>> {
        let mut created = Vec::new();
        for pos in positions {
            if !self.contains_chunk(pos)? {
                self.create_chunk(pos)?;
                created.push(pos);
            }
        }
        info!("Created {} chunks", created.len());
        Ok(created)
    }

    pub fn delete_chunk(&mut self, pos: ChunkPos) -> Result<()> {
        self.cache.delete_chunk(pos)?;
        if let Some(all_chunks) = &mut self.all_chunks {
            all_chunks.remove(&pos);
        }
        self.bounds = None;
        Ok(())
    }

    pub fn create_chunks_in_box(&mut self, bounds: BoundingBox) -> Result<Vec<ChunkPos>> {
        self.create_chunks(bounds.chunk_positions())
    }

    /// Deletes every existing chunk the box touches and returns those.
    pub fn delete_chunks_in_box(&mut self, bounds: BoundingBox) -> Result<Vec<ChunkPos>> {
        let mut deleted = Vec::new();
        for pos in bounds.chunk_positions() {
            if self.contains_chunk(pos)? {
                self.delete_chunk(pos)?;
                deleted.push(pos);
            }
        }
        info!("Deleted {} chunks", deleted.len());
        Ok(deleted)
    }

    /// Copies a chunk from another dimension, usually of another world, to the
    /// same position here. A chunk loaded here is overwritten block by block
    /// so outstanding handles stay valid; otherwise the copy goes to the
    /// overlay and reaches the region files on the next save.
    pub fn copy_chunk_from(&mut self, source: &mut Dimension, pos: ChunkPos) -> Result<()> {
        self.cache.check_session_lock()?;
        if self.cache.is_loaded(pos) {
            debug!("Chunk {pos} is loaded, copying blocks");
            let from = source.get_chunk(pos)?;
            let into = self.cache.get_chunk(pos)?;
            into.borrow_mut().copy_voxels_from(&from.borrow());
        } else {
            self.cache.import_chunk(&mut source.cache, pos)?;
        }
        if let Some(all_chunks) = &mut self.all_chunks {
            all_chunks.insert(pos);
        }
        self.bounds = None;
        Ok(())
    }

    pub fn contains_chunk(&mut self, pos: ChunkPos) -> Result<bool> {
        match &self.all_chunks {
            Some(all_chunks) => Ok(all_chunks.contains(&pos)),
            None => self.cache.contains_chunk(pos),
        }
    }

    /// Every chunk of the dimension. The first call scans the region files.
    pub fn all_chunks(&mut self) -> Result<&BTreeSet<ChunkPos>> {
        if self.all_chunks.is_none() {
            info!("Scanning for regions in {}", self.root.display());
            self.all_chunks = Some(self.cache.list_chunks()?);
        }
        Ok(self.all_chunks.get_or_insert_with(BTreeSet::new))
    }

    pub fn chunk_count(&mut self) -> Result<usize> {
        Ok(self.all_chunks()?.len())
    }

    /// Block space covered by all chunks, from the lowest to the highest
    /// chunk coordinate on each axis.
    pub fn bounds(&mut self) -> Result<BoundingBox> {
        if let Some(bounds) = self.bounds {
            return Ok(bounds);
        }
        let height = self.height as i32;
        let chunks = self.all_chunks()?;
        let bounds = match (chunks.iter().map(|c| c.x).min(), chunks.iter().map(|c| c.x).max()) {
            (Some(min_x), Some(max_x)) => {
                let min_z = chunks.iter().map(|c| c.z).min().unwrap_or(0);
                let max_z = chunks.iter().map(|c| c.z).max().unwrap_or(0);
                BoundingBox::new(
                    BlockPos::new(min_x << 4, 0, min_z << 4),
                    BlockPos::new((max_x - min_x + 1) << 4, height, (max_z - min_z + 1) << 4),
                )
            }
            _ => BoundingBox::default(),
        };
        self.bounds = Some(bounds);
        Ok(bounds)
    }

    /// Recomputes the height map and sky light of a chunk and queues it for
    /// relighting.
    pub fn mark_dirty_chunk(&mut self, pos: ChunkPos) -> Result<()> {
        self.cache.check_session_lock()?;
        let chunk = self.cache.get_chunk(pos)?;
        chunk
            .borrow_mut()
            .chunk_changed(true, &self.materials, self.kind);
        self.cache.set_needs_lighting(pos, true);
        Ok(())
    }

    /// Marks every existing chunk the box touches. Missing chunks are skipped.
    pub fn mark_dirty_box(&mut self, bounds: BoundingBox) -> Result<()> {
        for pos in bounds.chunk_positions() {
            if self.contains_chunk(pos)? {
                self.mark_dirty_chunk(pos)?;
            }
        }
        Ok(())
    }

    /// Whether the block lies inside the world height and in an existing chunk.
    pub fn contains_point(&mut self, x: i32, y: i32, z: i32) -> Result<bool> {
        if y < 0 || y as usize >= self.height {
            return Ok(false);
        }
        self.contains_chunk(ChunkPos::from_block_pos(x, z))
    }

    pub fn dirty_chunks(&mut self) -> Result<BTreeSet<ChunkPos>> {
        self.cache.dirty_chunks()
    }

    pub fn chunks_needing_lighting(&self) -> &BTreeSet<ChunkPos> {
        self.cache.chunks_needing_lighting()
    }

    /// Starts relighting `positions`, or every chunk queued for relighting.
    /// Each step of the returned iterator does one unit of work.
    pub fn lighting(&mut self, positions: Option<BTreeSet<ChunkPos>>) -> Result<LightingRun<'_>> {
        LightingRun::new(self, positions)
    }

    pub fn generate_lights(&mut self, positions: Option<BTreeSet<ChunkPos>>) -> Result<()> {
        for progress in self.lighting(positions)? {
            progress?;
        }
        Ok(())
    }

    pub fn save(&mut self) -> Result<usize> {
        self.cache.save()
    }

    pub fn unload(&mut self) -> Result<()> {
        self.all_chunks = None;
        self.bounds = None;
        self.cache.unload()
    }

    pub fn close(&mut self) -> Result<()> {
        self.all_chunks = None;
        self.bounds = None;
        self.cache.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::scratch_dir;

    fn open(dir: &Path, kind: DimensionKind) -> Dimension {
        let lock = Rc::new(SessionLock::acquire(dir).unwrap());
        Dimension::open(
            dir,
            kind,
            Some(lock),
            Rc::new(Materials::default()),
            &WorldConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn dimension_ids_and_folders() {
        assert_eq!(DimensionKind::from_id(-1), DimensionKind::Nether);
        assert_eq!(DimensionKind::Other(7).folder_name().as_deref(), Some("DIM7"));
        assert_eq!(DimensionKind::Overworld.folder_name(), None);
        assert_eq!(DimensionKind::from_folder_name("DIM1"), Some(DimensionKind::End));
        assert_eq!(DimensionKind::from_folder_name("DIMx"), None);
        assert!(!DimensionKind::Nether.has_sky_light());
        assert!(DimensionKind::Other(3).has_sky_light());
    }

    #[test]
    fn reads_outside_the_world_are_zero() {
        let dir = scratch_dir("dim-read");
        let mut dim = open(&dir, DimensionKind::Overworld);
        dim.create_chunk(ChunkPos::new(0, 0)).unwrap();

        assert_eq!(dim.sky_light_at(0, 10, 0).unwrap(), 15);
        assert_eq!(dim.sky_light_at(0, -1, 0).unwrap(), 0);
        assert_eq!(dim.sky_light_at(0, 256, 0).unwrap(), 0);
        assert_eq!(dim.block_at(100, 10, 100).unwrap(), 0);
        assert_eq!(dim.height_map_at(100, 100).unwrap(), 0);
    }

    #[test]
    fn writes_outside_the_world_do_nothing() {
        let dir = scratch_dir("dim-write");
        let mut dim = open(&dir, DimensionKind::Overworld);
        dim.create_chunk(ChunkPos::new(0, 0)).unwrap();

        assert!(!dim.set_block_at(0, 256, 0, 1).unwrap());
        assert!(!dim.set_block_at(0, -5, 0, 1).unwrap());
        assert!(!dim.set_block_at(40, 5, 0, 1).unwrap());
        assert!(!dim.contains_chunk(ChunkPos::new(2, 0)).unwrap());
    }

    #[test]
    fn block_writes_queue_relighting() {
        let dir = scratch_dir("dim-relight");
        let mut dim = open(&dir, DimensionKind::Overworld);
        dim.create_chunk(ChunkPos::new(-1, -1)).unwrap();
        dim.create_chunk(ChunkPos::new(0, 0)).unwrap();

        assert!(dim.set_block_at(-3, 64, -12, 89).unwrap());
        assert!(dim.set_block_data_at(-3, 64, -12, 2).unwrap());
        assert_eq!(dim.block_at(-3, 64, -12).unwrap(), 89);
        assert_eq!(dim.block_data_at(-3, 64, -12).unwrap(), 2);
        assert!(dim
            .chunks_needing_lighting()
            .contains(&ChunkPos::new(-1, -1)));

        assert!(dim.set_block_light_at(5, 0, 5, 9).unwrap());
        assert_eq!(dim.block_light_at(5, 0, 5).unwrap(), 9);
        assert!(!dim.chunks_needing_lighting().contains(&ChunkPos::new(0, 0)));
    }

    #[test]
    fn malformed_chunks_are_reported() {
        let dir = scratch_dir("dim-malformed");
        let mut dim = open(&dir, DimensionKind::Overworld);
        dim.cache().folder().save_chunk(ChunkPos::new(0, 0), b"junk").unwrap();
        assert!(matches!(
            dim.block_at(1, 1, 1),
            Err(WorldError::ChunkMalformed { .. })
        ));
    }

    #[test]
    fn bounds_follow_created_and_deleted_chunks() {
        let dir = scratch_dir("dim-bounds");
        let mut dim = open(&dir, DimensionKind::Overworld);
        assert_eq!(dim.bounds().unwrap(), BoundingBox::default());

        let created = dim
            .create_chunks(vec![ChunkPos::new(-1, 2), ChunkPos::new(3, 4), ChunkPos::new(3, 4)])
            .unwrap();
        assert_eq!(created.len(), 2);
        let bounds = dim.bounds().unwrap();
        assert_eq!(bounds.origin, BlockPos::new(-16, 0, 32));
        assert_eq!(bounds.size, BlockPos::new(80, 256, 48));

        dim.delete_chunk(ChunkPos::new(-1, 2)).unwrap();
        assert_eq!(dim.chunk_count().unwrap(), 1);
        assert_eq!(dim.bounds().unwrap().origin, BlockPos::new(48, 0, 64));
    }

    #[test]
    fn box_operations_touch_every_chunk_in_the_box() {
        let dir = scratch_dir("dim-box");
        let mut dim = open(&dir, DimensionKind::Overworld);
        let bounds = BoundingBox::new(BlockPos::new(-8, 0, 0), BlockPos::new(24, 256, 16));

        let created = dim.create_chunks_in_box(bounds).unwrap();
        assert_eq!(created, vec![ChunkPos::new(-1, 0), ChunkPos::new(0, 0)]);
        assert!(dim.create_chunks_in_box(bounds).unwrap().is_empty());
        assert!(dim.contains_point(-8, 0, 15).unwrap());
        assert!(!dim.contains_point(-8, 256, 15).unwrap());
        assert!(!dim.contains_point(16, 10, 0).unwrap());

        dim.mark_dirty_box(BoundingBox::new(BlockPos::new(0, 0, 0), BlockPos::new(64, 1, 1)))
            .unwrap();
        assert_eq!(
            dim.chunks_needing_lighting().iter().copied().collect::<Vec<_>>(),
            vec![ChunkPos::new(0, 0)]
        );

        let deleted = dim
            .delete_chunks_in_box(BoundingBox::new(BlockPos::new(-1, 0, 0), BlockPos::new(1, 1, 1)))
            .unwrap();
        assert_eq!(deleted, vec![ChunkPos::new(-1, 0)]);
        assert_eq!(dim.chunk_count().unwrap(), 1);
    }

    #[test]
    fn copied_chunks_replace_unloaded_ones() {
        let mut source = open(&scratch_dir("dim-copy-source"), DimensionKind::Overworld);
        let mut dest = open(&scratch_dir("dim-copy-dest"), DimensionKind::Overworld);
        let pos = ChunkPos::new(2, -1);
        source.create_chunk(pos).unwrap();
        source.set_block_at(33, 40, -5, 1).unwrap();

        dest.copy_chunk_from(&mut source, pos).unwrap();
        assert!(!dest.cache().is_loaded(pos));
        assert!(dest.contains_chunk(pos).unwrap());
        assert_eq!(dest.block_at(33, 40, -5).unwrap(), 1);
        assert_eq!(dest.dirty_chunks().unwrap().into_iter().collect::<Vec<_>>(), vec![pos]);

        dest.save().unwrap();
        assert!(dest.dirty_chunks().unwrap().is_empty());
        assert!(matches!(
            dest.copy_chunk_from(&mut source, ChunkPos::new(9, 9)),
            Err(WorldError::ChunkNotPresent(_))
        ));
    }

    #[test]
    fn copied_chunks_overwrite_loaded_ones_in_place() {
        let mut source = open(&scratch_dir("dim-copy-loaded-source"), DimensionKind::Overworld);
        let mut dest = open(&scratch_dir("dim-copy-loaded-dest"), DimensionKind::Overworld);
        let pos = ChunkPos::new(0, 0);
        source.create_chunk(pos).unwrap();
        source.set_block_at(1, 2, 3, 4).unwrap();
        let held = dest.create_chunk(pos).unwrap();
        dest.set_block_at(5, 5, 5, 1).unwrap();

        dest.copy_chunk_from(&mut source, pos).unwrap();
        assert_eq!(dest.block_at(1, 2, 3).unwrap(), 4);
        assert_eq!(dest.block_at(5, 5, 5).unwrap(), 0);
        let idx = held.borrow().index(1, 3, 2);
        assert_eq!(held.borrow().blocks[idx], 4);
    }

    #[test]
    fn mark_dirty_reseeds_sky_light() {
        let dir = scratch_dir("dim-mark");
        let mut dim = open(&dir, DimensionKind::Overworld);
        let chunk = dim.create_chunk(ChunkPos::new(0, 0)).unwrap();
        {
            let mut chunk = chunk.borrow_mut();
            let idx = chunk.index(0, 0, 10);
            chunk.blocks[idx] = 1;
        }
        dim.mark_dirty_chunk(ChunkPos::new(0, 0)).unwrap();
        assert_eq!(dim.height_map_at(0, 0).unwrap(), 11);
        assert_eq!(dim.sky_light_at(0, 9, 0).unwrap(), 0);
        assert_eq!(dim.sky_light_at(0, 11, 0).unwrap(), 15);
        assert!(chunk.borrow().needs_lighting);
    }
}
