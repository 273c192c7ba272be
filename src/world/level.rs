use std::{
    mem,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{info, warn};
use rand::Rng;

use super::players::{new_player_tag, SINGLE_PLAYER};
use crate::{
    error::{Result, WorldError},
    nbt::{self, NbtCompound, NbtTag},
};

pub const VERSION_MCREGION: i32 = 19132;
pub const VERSION_ANVIL: i32 = 19133;

pub const LEVEL_DAT: &str = "level.dat";
pub const LEVEL_DAT_OLD: &str = "level.dat_old";

pub const GAMETYPE_SURVIVAL: i32 = 0;
pub const GAMETYPE_CREATIVE: i32 = 1;

/// World metadata from `level.dat`. Keys this type does not know about are
/// written back unchanged.
#[derive(Debug, Clone)]
pub struct LevelInfo {
    path: PathBuf,
    root: NbtCompound,
    data: NbtCompound,
}

impl LevelInfo {
    pub fn create(world: &Path, seed: Option<i64>) -> LevelInfo {
        let mut info = LevelInfo {
            path: world.join(LEVEL_DAT),
            root: NbtCompound::new(),
            data: NbtCompound::new(),
        };
        info.set_spawn(0, 2, 0);
        info.data.insert("version", NbtTag::Int(VERSION_ANVIL));
        info.set_last_played(now_millis());
        info.set_random_seed(seed.unwrap_or_else(|| rand::thread_rng().gen()));
        info.set_size_on_disk(0);
        info.set_time(1);
        let name = world
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        info.set_level_name(&name);
        info.set_game_type(GAMETYPE_SURVIVAL);
        info.set_map_features(true);
        info.data.insert(SINGLE_PLAYER, NbtTag::Compound(new_player_tag()));
        info
    }

    /// Reads `level.dat`, falling back to `level.dat_old`. The flag tells
    /// whether the backup had to be used.
    pub fn load(world: &Path) -> Result<(LevelInfo, bool)> {
        let path = world.join(LEVEL_DAT);
        match LevelInfo::read(&path) {
            Ok(info) => Ok((info, false)),
            Err(err) => {
                warn!("Error loading {}, trying {} ({})", path.display(), LEVEL_DAT_OLD, err);
                let mut info = LevelInfo::read(&world.join(LEVEL_DAT_OLD))
                    .map_err(|_| WorldError::NotAWorld(world.to_path_buf()))?;
                info!("{} restored from backup", path.display());
                info.path = path;
                Ok((info, true))
            }
        }
    }

    fn read(path: &Path) -> Result<LevelInfo> {
        let (_, mut root) = nbt::read_gzip_file(path)?;
        let data = match nbt::get_compound_mut(&mut root, "Data") {
            Some(data) => mem::replace(data, NbtCompound::new()),
            None => return Err(WorldError::NotAWorld(path.to_path_buf())),
        };
        Ok(LevelInfo {
            path: path.to_path_buf(),
            root,
            data,
        })
    }

    pub fn save(&self) -> Result<()> {
        let mut root = self.root.clone();
        root.insert("Data", NbtTag::Compound(self.data.clone()));
        nbt::write_gzip_file(&self.path, "", &root)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn data(&self) -> &NbtCompound {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut NbtCompound {
        &mut self.data
    }

    pub fn version(&self) -> i32 {
        self.data.get::<_, i32>("version").unwrap_or(0)
    }

    pub fn level_name(&self) -> &str {
        self.data.get::<_, &str>("LevelName").unwrap_or("")
    }

    pub fn set_level_name(&mut self, name: &str) {
        self.data.insert("LevelName", NbtTag::String(name.to_string()));
    }

    pub fn random_seed(&self) -> i64 {
        self.data.get::<_, i64>("RandomSeed").unwrap_or(0)
    }

    pub fn set_random_seed(&mut self, seed: i64) {
        self.data.insert("RandomSeed", NbtTag::Long(seed));
    }

    pub fn last_played(&self) -> i64 {
        self.data.get::<_, i64>("LastPlayed").unwrap_or(0)
    }

    pub fn set_last_played(&mut self, millis: i64) {
        self.data.insert("LastPlayed", NbtTag::Long(millis));
    }

    pub fn time(&self) -> i64 {
        self.data.get::<_, i64>("Time").unwrap_or(0)
    }

    pub fn set_time(&mut self, time: i64) {
        self.data.insert("Time", NbtTag::Long(time));
    }

    pub fn size_on_disk(&self) -> i64 {
        self.data.get::<_, i64>("SizeOnDisk").unwrap_or(0)
    }

    pub fn set_size_on_disk(&mut self, size: i64) {
        self.data.insert("SizeOnDisk", NbtTag::Long(size));
    }

    pub fn spawn(&self) -> (i32, i32, i32) {
        (
            self.data.get::<_, i32>("SpawnX").unwrap_or(0),
            self.data.get::<_, i32>("SpawnY").unwrap_or(0),
            self.data.get::<_, i32>("SpawnZ").unwrap_or(0),
        )
    }

    pub fn set_spawn(&mut self, x: i32, y: i32, z: i32) {
        self.data.insert("SpawnX", NbtTag::Int(x));
        self.data.insert("SpawnY", NbtTag::Int(y));
        self.data.insert("SpawnZ", NbtTag::Int(z));
    }

    pub fn game_type(&self) -> i32 {
        self.data.get::<_, i32>("GameType").unwrap_or(GAMETYPE_SURVIVAL)
    }

    pub fn set_game_type(&mut self, game_type: i32) {
        self.data.insert("GameType", NbtTag::Int(game_type));
    }

    pub fn map_features(&self) -> bool {
        self.data.get::<_, i8>("MapFeatures").map_or(false, |v| v != 0)
    }

    pub fn set_map_features(&mut self, enabled: bool) {
        self.data.insert("MapFeatures", NbtTag::Byte(enabled as i8));
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::scratch_dir;

    #[test]
    fn new_level_has_anvil_defaults() {
        let dir = scratch_dir("level-new");
        let info = LevelInfo::create(&dir, Some(42));
        assert_eq!(info.version(), VERSION_ANVIL);
        assert_eq!(info.random_seed(), 42);
        assert_eq!(info.spawn(), (0, 2, 0));
        assert_eq!(info.time(), 1);
        assert_eq!(info.size_on_disk(), 0);
        assert!(info.map_features());
        assert_eq!(info.level_name(), dir.file_name().unwrap().to_str().unwrap());
        assert!(info.last_played() > 0);
        assert!(nbt::get_compound(info.data(), "Player").is_some());
    }

    #[test]
    fn saves_and_reloads_unknown_keys() {
        let dir = scratch_dir("level-reload");
        let mut info = LevelInfo::create(&dir, None);
        info.data_mut().insert("Raining", NbtTag::Byte(1));
        info.set_level_name("Saved");
        info.save().unwrap();

        let (loaded, restored) = LevelInfo::load(&dir).unwrap();
        assert!(!restored);
        assert_eq!(loaded.level_name(), "Saved");
        assert_eq!(loaded.random_seed(), info.random_seed());
        assert_eq!(loaded.data().get::<_, i8>("Raining").unwrap(), 1);
    }

    #[test]
    fn falls_back_to_backup() {
        let dir = scratch_dir("level-backup");
        LevelInfo::create(&dir, Some(7)).save().unwrap();
        std::fs::rename(dir.join(LEVEL_DAT), dir.join(LEVEL_DAT_OLD)).unwrap();
        std::fs::write(dir.join(LEVEL_DAT), b"not gzip").unwrap();

        let (loaded, restored) = LevelInfo::load(&dir).unwrap();
        assert!(restored);
        assert_eq!(loaded.random_seed(), 7);
        assert_eq!(loaded.path(), dir.join(LEVEL_DAT));
    }

    #[test]
    fn missing_level_is_not_a_world() {
        let dir = scratch_dir("level-missing");
        assert!(matches!(LevelInfo::load(&dir), Err(WorldError::NotAWorld(_))));
    }
}
