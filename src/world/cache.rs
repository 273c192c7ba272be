use std::{cell::RefCell, collections::BTreeSet, fs, path::Path, rc::Rc};

use log::{debug, info};
use lru::LruCache;

use super::{
    chunk::{Chunk, ChunkRef},
    session::SessionLock,
    ChunkPos,
};
use crate::{
    error::{Result, WorldError},
    region::WorldFolder,
};

/// Folder inside a dimension that holds chunks evicted before they were saved.
pub const OVERLAY_DIR: &str = "##UNSAVED##";

/// Decoded chunks of one dimension.
///
/// Loaded chunks are kept in least recently used order up to `limit`. A chunk
/// whose handle is still held outside the cache is never evicted; unreferenced
/// chunks are dropped, or written to the overlay folder first if they have
/// unsaved changes. Nothing reaches the primary region files before
/// [`ChunkCache::save`].
pub struct ChunkCache {
    folder: WorldFolder,
    overlay: Option<WorldFolder>,
    lock: Option<Rc<SessionLock>>,
    chunks: LruCache<ChunkPos, ChunkRef>,
    limit: usize,
    height: usize,
    needs_lighting: BTreeSet<ChunkPos>,
}

impl ChunkCache {
    /// Without a session lock the cache is read only and has no overlay.
    /// Otherwise any overlay left over from an earlier session is wiped.
    pub fn new(
        root: &Path,
        lock: Option<Rc<SessionLock>>,
        limit: usize,
        height: usize,
    ) -> Result<ChunkCache> {
        let folder = WorldFolder::new(root)?;
        let overlay = match lock {
            Some(_) => {
                let path = root.join(OVERLAY_DIR);
                if path.exists() {
                    fs::remove_dir_all(&path)?;
                }
                Some(WorldFolder::new(path)?)
            }
            None => None,
        };
        Ok(ChunkCache {
            folder,
            overlay,
            lock,
            chunks: LruCache::unbounded(),
            limit: limit.max(1),
            height,
            needs_lighting: BTreeSet::new(),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_read_only(&self) -> bool {
        self.lock.is_none()
    }

    pub fn folder(&mut self) -> &mut WorldFolder {
        &mut self.folder
    }

    pub fn check_session_lock(&self) -> Result<()> {
        match &self.lock {
            Some(lock) => lock.check(),
            None => Err(WorldError::ReadOnly),
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_loaded(&self, pos: ChunkPos) -> bool {
        self.chunks.contains(&pos)
    }

    /// Whether a handle to the chunk is held outside the cache.
    pub fn is_referenced(&self, pos: ChunkPos) -> bool {
        self.chunks
            .peek(&pos)
            .map_or(false, |chunk| Rc::strong_count(chunk) > 1)
    }

    pub fn get_chunk(&mut self, pos: ChunkPos) -> Result<ChunkRef> {
        if let Some(chunk) = self.chunks.get(&pos) {
            return Ok(chunk.clone());
        }

        let (bytes, from_overlay) = self.chunk_bytes(pos)?;
        let mut chunk = Chunk::from_bytes(pos, self.height, &bytes)?;
        chunk.dirty = from_overlay;
        chunk.needs_lighting = self.needs_lighting.contains(&pos);

        let chunk = Rc::new(RefCell::new(chunk));
        self.store(pos, chunk.clone())?;
        Ok(chunk)
    }

    /// Raw serialized bytes, preferring the overlay copy. The flag is set when
    /// the bytes came from the overlay.
    pub fn chunk_bytes(&mut self, pos: ChunkPos) -> Result<(Vec<u8>, bool)> {
        if let Some(overlay) = &mut self.overlay {
            if overlay.contains_chunk(pos)? {
                return Ok((overlay.read_chunk(pos)?, true));
            }
        }
        Ok((self.folder.read_chunk(pos)?, false))
    }

    fn store(&mut self, pos: ChunkPos, chunk: ChunkRef) -> Result<()> {
        if self.chunks.len() >= self.limit {
            self.evict_one()?;
        }
        self.chunks.push(pos, chunk);
        Ok(())
    }

    /// Drops the least recently used chunk nobody else holds. Returns false
    /// if every loaded chunk is referenced.
    pub fn evict_one(&mut self) -> Result<bool> {
        let victim = self
            .chunks
            .iter()
            .rev()
            .find(|(_, chunk)| Rc::strong_count(chunk) == 1)
            .map(|(pos, chunk)| (*pos, chunk.borrow().dirty));
        let (pos, dirty) = match victim {
            Some(victim) => victim,
            None => return Ok(false),
        };

        if dirty {
            self.check_session_lock()?;
            let data = match self.chunks.peek(&pos) {
                Some(chunk) => chunk.borrow().to_bytes()?,
                None => return Ok(false),
            };
            if let Some(overlay) = &mut self.overlay {
                overlay.save_chunk(pos, &data)?;
            }
            debug!("Evicted dirty chunk {pos} to the overlay");
        } else {
            debug!("Evicted chunk {pos}");
        }
        self.chunks.pop(&pos);
        Ok(true)
    }

    pub fn create_chunk(&mut self, pos: ChunkPos) -> Result<ChunkRef> {
        self.check_session_lock()?;
        if self.contains_chunk(pos)? {
            return Err(WorldError::ChunkAlreadyPresent(pos));
        }
        let chunk = Rc::new(RefCell::new(Chunk::create(pos, self.height)));
        self.store(pos, chunk.clone())?;
        Ok(chunk)
    }

    pub fn delete_chunk(&mut self, pos: ChunkPos) -> Result<()> {
        self.check_session_lock()?;
        self.chunks.pop(&pos);
        if let Some(overlay) = &mut self.overlay {
            overlay.delete_chunk(pos)?;
        }
        self.folder.delete_chunk(pos)?;
        self.needs_lighting.remove(&pos);
        Ok(())
    }

    /// Puts `source`'s copy of a chunk into this cache's overlay, replacing
    /// anything stored here. The chunk must not be loaded in this cache.
    /// A dirty chunk loaded in `source` is encoded, anything else is copied
    /// compressed from `source`'s overlay or primary store.
    pub fn import_chunk(&mut self, source: &mut ChunkCache, pos: ChunkPos) -> Result<()> {
        self.check_session_lock()?;
        let overlay = self.overlay.as_mut().ok_or(WorldError::ReadOnly)?;

        if let Some(chunk) = source.chunks.peek(&pos) {
            let chunk = chunk.borrow();
            if chunk.dirty {
                debug!("Copying unsaved chunk {pos} into the overlay");
                return overlay.save_chunk(pos, &chunk.to_bytes()?);
            }
        }
        if let Some(from) = &mut source.overlay {
            if from.contains_chunk(pos)? {
                return overlay.copy_chunk_from(from, pos);
            }
        }
        if !source.folder.contains_chunk(pos)? {
            return Err(WorldError::ChunkNotPresent(pos));
        }
        overlay.copy_chunk_from(&mut source.folder, pos)
    }

    pub fn contains_chunk(&mut self, pos: ChunkPos) -> Result<bool> {
        if self.chunks.contains(&pos) {
            return Ok(true);
        }
        if let Some(overlay) = &mut self.overlay {
            if overlay.contains_chunk(pos)? {
                return Ok(true);
            }
        }
        self.folder.contains_chunk(pos)
    }

    /// Every chunk on disk, in the overlay or loaded.
    pub fn list_chunks(&mut self) -> Result<BTreeSet<ChunkPos>> {
        let mut chunks = self.folder.list_chunks()?;
        if let Some(overlay) = &mut self.overlay {
            chunks.extend(overlay.list_chunks()?);
        }
        chunks.extend(self.chunks.iter().map(|(pos, _)| *pos));
        Ok(chunks)
    }

    /// Chunks with changes that are not in the primary region files yet.
    pub fn dirty_chunks(&mut self) -> Result<BTreeSet<ChunkPos>> {
        let mut chunks: BTreeSet<ChunkPos> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.borrow().dirty)
            .map(|(pos, _)| *pos)
            .collect();
        if let Some(overlay) = &mut self.overlay {
            chunks.extend(overlay.list_chunks()?);
        }
        Ok(chunks)
    }

    pub fn chunks_needing_lighting(&self) -> &BTreeSet<ChunkPos> {
        &self.needs_lighting
    }

    /// Updates the pending relight set and the loaded chunk's flag.
    pub fn set_needs_lighting(&mut self, pos: ChunkPos, needs_lighting: bool) {
        if needs_lighting {
            self.needs_lighting.insert(pos);
        } else {
            self.needs_lighting.remove(&pos);
        }
        if let Some(chunk) = self.chunks.peek(&pos) {
            chunk.borrow_mut().needs_lighting = needs_lighting;
        }
    }

    /// Writes dirty chunks and the overlay into the primary region files, then
    /// empties the overlay. Returns how many chunks were written.
    pub fn save(&mut self) -> Result<usize> {
        self.check_session_lock()?;

        let mut saved = 0;
        for (pos, chunk) in self.chunks.iter() {
            let mut chunk = chunk.borrow_mut();
            if chunk.dirty {
                self.folder.save_chunk(*pos, &chunk.to_bytes()?)?;
                chunk.dirty = false;
                saved += 1;
            }
        }

        if let Some(overlay) = &mut self.overlay {
            for pos in overlay.list_chunks()? {
                if !self.chunks.contains(&pos) {
                    self.folder.copy_chunk_from(overlay, pos)?;
                    saved += 1;
                }
            }
            overlay.clear()?;
        }

        info!("Saved {} chunks in {}", saved, self.folder.root().display());
        Ok(saved)
    }

    /// Drops every loaded chunk and closes all region files. Unsaved changes
    /// are moved to the overlay first.
    pub fn unload(&mut self) -> Result<()> {
        let dirty: Vec<ChunkPos> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.borrow().dirty)
            .map(|(pos, _)| *pos)
            .collect();
        if !dirty.is_empty() {
            self.check_session_lock()?;
            if let Some(overlay) = &mut self.overlay {
                for pos in dirty {
                    if let Some(chunk) = self.chunks.peek(&pos) {
                        overlay.save_chunk(pos, &chunk.borrow().to_bytes()?)?;
                    }
                }
            }
        }

        self.chunks.clear();
        self.folder.close_regions();
        if let Some(overlay) = &mut self.overlay {
            overlay.close_regions();
        }
        Ok(())
    }

    /// Drops everything that was not saved and removes the overlay folder.
    pub fn close(&mut self) -> Result<()> {
        self.chunks.clear();
        self.needs_lighting.clear();
        self.folder.close_regions();
        if let Some(mut overlay) = self.overlay.take() {
            overlay.close_regions();
            if self.check_session_lock().is_ok() {
                fs::remove_dir_all(overlay.root())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::scratch_dir;

    fn open(dir: &Path, limit: usize) -> ChunkCache {
        let lock = Rc::new(SessionLock::acquire(dir).unwrap());
        ChunkCache::new(dir, Some(lock), limit, 256).unwrap()
    }

    fn fill(cache: &mut ChunkCache, count: i32) {
        for x in 0..count {
            cache.create_chunk(ChunkPos::new(x, 0)).unwrap();
        }
    }

    #[test]
    fn loaded_chunks_stay_within_limit() {
        let dir = scratch_dir("cache-bound");
        let mut cache = open(&dir, 4);
        fill(&mut cache, 10);
        assert!(cache.loaded_count() <= 4);
        assert_eq!(cache.list_chunks().unwrap().len(), 10);
    }

    #[test]
    fn evicted_dirty_chunks_survive_in_overlay() {
        let dir = scratch_dir("cache-overlay");
        let mut cache = open(&dir, 2);
        let first = ChunkPos::new(0, 0);
        {
            let chunk = cache.create_chunk(first).unwrap();
            let mut chunk = chunk.borrow_mut();
            let idx = chunk.index(1, 2, 3);
            chunk.blocks[idx] = 4;
        }
        fill_from(&mut cache, 1, 5);
        assert!(!cache.is_loaded(first));
        assert!(dir.join(OVERLAY_DIR).join("region/r.0.0.mca").exists());
        assert!(!cache.folder().contains_chunk(first).unwrap());

        let chunk = cache.get_chunk(first).unwrap();
        let chunk = chunk.borrow();
        assert_eq!(chunk.blocks[chunk.index(1, 2, 3)], 4);
        assert!(chunk.dirty);
    }

    fn fill_from(cache: &mut ChunkCache, from: i32, to: i32) {
        for x in from..to {
            cache.create_chunk(ChunkPos::new(x, 0)).unwrap();
        }
    }

    #[test]
    fn referenced_chunks_are_never_evicted() {
        let dir = scratch_dir("cache-referenced");
        let mut cache = open(&dir, 2);
        let held = cache.create_chunk(ChunkPos::new(0, 0)).unwrap();
        let also_held = cache.create_chunk(ChunkPos::new(1, 0)).unwrap();
        cache.create_chunk(ChunkPos::new(2, 0)).unwrap();

        assert!(cache.is_loaded(ChunkPos::new(0, 0)));
        assert!(cache.is_referenced(ChunkPos::new(0, 0)));
        assert_eq!(cache.loaded_count(), 3);

        drop(held);
        drop(also_held);
        cache.create_chunk(ChunkPos::new(3, 0)).unwrap();
        assert_eq!(cache.loaded_count(), 3);
        assert!(!cache.is_loaded(ChunkPos::new(0, 0)));
    }

    #[test]
    fn repeated_gets_share_one_payload() {
        let dir = scratch_dir("cache-shared");
        let mut cache = open(&dir, 4);
        let pos = ChunkPos::new(5, 5);
        let a = cache.create_chunk(pos).unwrap();
        let b = cache.get_chunk(pos).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn save_commits_overlay_and_clears_dirty() {
        let dir = scratch_dir("cache-save");
        let mut cache = open(&dir, 2);
        fill(&mut cache, 6);
        assert_eq!(cache.dirty_chunks().unwrap().len(), 6);

        assert_eq!(cache.save().unwrap(), 6);
        assert!(cache.dirty_chunks().unwrap().is_empty());
        for x in 0..6 {
            assert!(cache.folder().contains_chunk(ChunkPos::new(x, 0)).unwrap());
        }
        assert!(!dir.join(OVERLAY_DIR).join("region").exists());
    }

    #[test]
    fn create_twice_fails() {
        let dir = scratch_dir("cache-create");
        let mut cache = open(&dir, 4);
        let pos = ChunkPos::new(0, 0);
        cache.create_chunk(pos).unwrap();
        assert!(matches!(
            cache.create_chunk(pos),
            Err(WorldError::ChunkAlreadyPresent(_))
        ));
    }

    #[test]
    fn delete_removes_every_copy() {
        let dir = scratch_dir("cache-delete");
        let mut cache = open(&dir, 4);
        let pos = ChunkPos::new(0, 0);
        cache.create_chunk(pos).unwrap();
        cache.save().unwrap();
        cache.set_needs_lighting(pos, true);

        cache.delete_chunk(pos).unwrap();
        assert!(!cache.contains_chunk(pos).unwrap());
        assert!(cache.chunks_needing_lighting().is_empty());
    }

    #[test]
    fn imports_land_in_the_overlay() {
        let mut source = open(&scratch_dir("cache-import-source"), 4);
        let mut dest = open(&scratch_dir("cache-import-dest"), 4);
        let (saved, unsaved, missing) = (ChunkPos::new(0, 0), ChunkPos::new(1, 0), ChunkPos::new(2, 0));
        source.create_chunk(saved).unwrap().borrow_mut().blocks[0] = 1;
        source.save().unwrap();
        source.create_chunk(unsaved).unwrap().borrow_mut().blocks[0] = 2;

        dest.import_chunk(&mut source, saved).unwrap();
        dest.import_chunk(&mut source, unsaved).unwrap();
        assert!(matches!(
            dest.import_chunk(&mut source, missing),
            Err(WorldError::ChunkNotPresent(_))
        ));

        assert!(!dest.folder().contains_chunk(saved).unwrap());
        for (pos, block) in [(saved, 1), (unsaved, 2)] {
            let chunk = dest.get_chunk(pos).unwrap();
            assert_eq!(chunk.borrow().blocks[0], block);
            assert!(chunk.borrow().dirty);
        }
        assert_eq!(dest.save().unwrap(), 2);
        assert!(dest.folder().contains_chunk(unsaved).unwrap());
    }

    #[test]
    fn read_only_cache_rejects_writes() {
        let dir = scratch_dir("cache-readonly");
        {
            let mut cache = open(&dir, 4);
            cache.create_chunk(ChunkPos::new(0, 0)).unwrap();
            cache.save().unwrap();
        }
        let mut cache = ChunkCache::new(&dir, None, 4, 256).unwrap();
        assert!(cache.get_chunk(ChunkPos::new(0, 0)).is_ok());
        assert!(matches!(
            cache.create_chunk(ChunkPos::new(1, 0)),
            Err(WorldError::ReadOnly)
        ));
        assert!(matches!(cache.save(), Err(WorldError::ReadOnly)));
    }

    #[test]
    fn unload_keeps_unsaved_changes() {
        let dir = scratch_dir("cache-unload");
        let mut cache = open(&dir, 4);
        let pos = ChunkPos::new(2, 2);
        cache.create_chunk(pos).unwrap();
        cache.unload().unwrap();
        assert_eq!(cache.loaded_count(), 0);
        assert!(cache.get_chunk(pos).unwrap().borrow().dirty);
    }

    #[test]
    fn close_discards_unsaved_work() {
        let dir = scratch_dir("cache-close");
        let mut cache = open(&dir, 1);
        fill(&mut cache, 3);
        cache.close().unwrap();
        assert!(!dir.join(OVERLAY_DIR).exists());
        assert!(!dir.join("region/r.0.0.mca").exists());
    }
}
