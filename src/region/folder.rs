use std::{
    collections::{hash_map::Entry, BTreeSet, HashMap},
    fs,
    path::{Path, PathBuf},
};

use log::{debug, info, warn};

use super::{RegionFile, RegionPos};
use crate::{
    error::{Result, WorldError},
    world::ChunkPos,
};

/// A directory holding a `region/` folder of Anvil region files. Region files
/// are opened on first use and kept open until [`WorldFolder::close_regions`].
pub struct WorldFolder {
    root: PathBuf,
    regions: HashMap<RegionPos, RegionFile>,
    unreadable: usize,
}

impl WorldFolder {
    pub fn new(root: impl Into<PathBuf>) -> Result<WorldFolder> {
        let root = root.into();
        if !root.exists() {
            fs::create_dir_all(&root)?;
        } else if !root.is_dir() {
            return Err(WorldError::NotAWorld(root));
        }
        Ok(WorldFolder {
            root,
            regions: HashMap::new(),
            unreadable: 0,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn file_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    /// Like [`WorldFolder::file_path`] but creates the folder.
    pub fn folder_path(&self, path: &str) -> Result<PathBuf> {
        let path = self.file_path(path);
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    pub fn region_path(&self, pos: RegionPos) -> PathBuf {
        self.root.join("region").join(pos.filename())
    }

    pub fn region_file(&mut self, pos: RegionPos) -> Result<&mut RegionFile> {
        let path = self.folder_path("region")?.join(pos.filename());
        match self.regions.entry(pos) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(RegionFile::open(&path, pos)?)),
        }
    }

    /// Every chunk present in any region file. Only offset tables are read.
    /// Region files without chunks are deleted on the way, ones that cannot be
    /// opened are skipped and counted in [`WorldFolder::unreadable_regions`].
    pub fn list_chunks(&mut self) -> Result<BTreeSet<ChunkPos>> {
        let mut chunks = BTreeSet::new();
        let region_dir = self.file_path("region");
        if !region_dir.is_dir() {
            return Ok(chunks);
        }

        let mut skipped = 0;
        for entry in fs::read_dir(&region_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let pos = match name.to_str().and_then(RegionPos::from_filename) {
                Some(pos) => pos,
                None => continue,
            };

            let region = match self.region_file(pos) {
                Ok(region) => region,
                Err(err) => {
                    warn!("Skipping region file {}: {}", entry.path().display(), err);
                    skipped += 1;
                    continue;
                }
            };

            if region.is_empty() {
                info!("Removing empty region file {}", entry.path().display());
                self.regions.remove(&pos);
                fs::remove_file(entry.path())?;
            } else {
                chunks.extend(region.chunk_positions());
            }
        }

        self.unreadable = skipped;
        if skipped > 0 {
            warn!(
                "Skipped {} unreadable region files in {}",
                skipped,
                region_dir.display()
            );
        }
        Ok(chunks)
    }

    /// Region files the last [`WorldFolder::list_chunks`] could not open.
    pub fn unreadable_regions(&self) -> usize {
        self.unreadable
    }

    pub fn contains_chunk(&mut self, pos: ChunkPos) -> Result<bool> {
        let region = RegionPos::from_chunk(pos);
        if !self.regions.contains_key(&region) && !self.region_path(region).exists() {
            return Ok(false);
        }
        Ok(self.region_file(region)?.contains_chunk(pos))
    }

    pub fn read_chunk(&mut self, pos: ChunkPos) -> Result<Vec<u8>> {
        if !self.contains_chunk(pos)? {
            return Err(WorldError::ChunkNotPresent(pos));
        }
        self.region_file(RegionPos::from_chunk(pos))?.read_chunk(pos)
    }

    pub fn save_chunk(&mut self, pos: ChunkPos, data: &[u8]) -> Result<()> {
        self.region_file(RegionPos::from_chunk(pos))?
            .save_chunk(pos, data)
    }

    /// Removes the chunk, and the whole region file once it holds no chunks.
    pub fn delete_chunk(&mut self, pos: ChunkPos) -> Result<()> {
        if !self.contains_chunk(pos)? {
            return Ok(());
        }
        let region_pos = RegionPos::from_chunk(pos);
        let region = self.region_file(region_pos)?;
        region.delete_chunk(pos)?;
        if region.is_empty() {
            let path = region.path().to_path_buf();
            self.regions.remove(&region_pos);
            debug!("Removing empty region file {}", path.display());
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Copies the compressed chunk from another folder. Does nothing if
    /// `other` does not hold it.
    pub fn copy_chunk_from(&mut self, other: &mut WorldFolder, pos: ChunkPos) -> Result<()> {
        if !other.contains_chunk(pos)? {
            return Ok(());
        }
        let source = other.region_file(RegionPos::from_chunk(pos))?;
        self.region_file(RegionPos::from_chunk(pos))?
            .copy_chunk_from(source, pos)
    }

    pub fn close_regions(&mut self) {
        self.regions.clear();
    }

    /// Closes every region file and empties the folder.
    pub fn clear(&mut self) -> Result<()> {
        self.close_regions();
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::scratch_dir;

    #[test]
    fn chunks_land_in_their_region_files() {
        let dir = scratch_dir("folder-layout");
        let mut folder = WorldFolder::new(&dir).unwrap();
        folder.save_chunk(ChunkPos::new(0, 0), b"a").unwrap();
        folder.save_chunk(ChunkPos::new(-1, 40), b"b").unwrap();

        assert!(dir.join("region/r.0.0.mca").exists());
        assert!(dir.join("region/r.-1.1.mca").exists());
        assert_eq!(folder.read_chunk(ChunkPos::new(-1, 40)).unwrap(), b"b");
    }

    #[test]
    fn lists_chunks_from_offset_tables() {
        let dir = scratch_dir("folder-list");
        let mut folder = WorldFolder::new(&dir).unwrap();
        for pos in [ChunkPos::new(1, 2), ChunkPos::new(33, 2), ChunkPos::new(-5, -5)] {
            folder.save_chunk(pos, b"x").unwrap();
        }
        fs::write(dir.join("region/notes.txt"), "hi").unwrap();
        folder.close_regions();

        let chunks = folder.list_chunks().unwrap();
        assert_eq!(
            chunks.into_iter().collect::<Vec<_>>(),
            vec![ChunkPos::new(-5, -5), ChunkPos::new(1, 2), ChunkPos::new(33, 2)]
        );
    }

    #[test]
    fn listing_skips_unreadable_region_files() {
        let dir = scratch_dir("folder-unreadable");
        let mut folder = WorldFolder::new(&dir).unwrap();
        folder.save_chunk(ChunkPos::new(2, 2), b"x").unwrap();
        folder.close_regions();
        // a directory where a region file should be cannot be opened
        fs::create_dir_all(dir.join("region/r.1.1.mca")).unwrap();

        let chunks = folder.list_chunks().unwrap();
        assert_eq!(chunks.into_iter().collect::<Vec<_>>(), vec![ChunkPos::new(2, 2)]);
        assert_eq!(folder.unreadable_regions(), 1);

        fs::remove_dir(dir.join("region/r.1.1.mca")).unwrap();
        folder.list_chunks().unwrap();
        assert_eq!(folder.unreadable_regions(), 0);
    }

    #[test]
    fn listing_removes_empty_region_files() {
        let dir = scratch_dir("folder-empty");
        let mut folder = WorldFolder::new(&dir).unwrap();
        folder.region_file(RegionPos::new(4, 4)).unwrap();
        assert!(dir.join("region/r.4.4.mca").exists());

        assert!(folder.list_chunks().unwrap().is_empty());
        assert!(!dir.join("region/r.4.4.mca").exists());
    }

    #[test]
    fn deleting_last_chunk_removes_region_file() {
        let dir = scratch_dir("folder-delete");
        let mut folder = WorldFolder::new(&dir).unwrap();
        let pos = ChunkPos::new(3, 3);
        folder.save_chunk(pos, b"x").unwrap();
        folder.delete_chunk(pos).unwrap();
        assert!(!folder.contains_chunk(pos).unwrap());
        assert!(!dir.join("region/r.0.0.mca").exists());
    }

    #[test]
    fn contains_does_not_create_region_files() {
        let dir = scratch_dir("folder-contains");
        let mut folder = WorldFolder::new(&dir).unwrap();
        assert!(!folder.contains_chunk(ChunkPos::new(100, 100)).unwrap());
        assert!(!dir.join("region/r.3.3.mca").exists());
        assert!(matches!(
            folder.read_chunk(ChunkPos::new(100, 100)),
            Err(WorldError::ChunkNotPresent(_))
        ));
    }

    #[test]
    fn copies_between_folders_and_clears() {
        let dir = scratch_dir("folder-copy");
        let mut overlay = WorldFolder::new(dir.join("overlay")).unwrap();
        let mut primary = WorldFolder::new(dir.join("primary")).unwrap();
        let pos = ChunkPos::new(7, -7);
        overlay.save_chunk(pos, b"payload").unwrap();

        primary.copy_chunk_from(&mut overlay, pos).unwrap();
        primary.copy_chunk_from(&mut overlay, ChunkPos::new(0, 0)).unwrap();
        assert_eq!(primary.read_chunk(pos).unwrap(), b"payload");
        assert!(!primary.contains_chunk(ChunkPos::new(0, 0)).unwrap());

        overlay.clear().unwrap();
        assert!(overlay.list_chunks().unwrap().is_empty());
        assert!(dir.join("overlay").is_dir());
    }
}
