use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    error::{Result, WorldError},
    nbt::{self, NbtCompound, NbtList, NbtTag},
};

/// Name of the player stored inside `level.dat` rather than in `players/`.
pub const SINGLE_PLAYER: &str = "Player";
pub const PLAYERS_DIR: &str = "players";

/// Tags of multiplayer players, one gzip file each in `players/`. Files are
/// read on first access and written back by [`PlayerFiles::save`].
#[derive(Debug)]
pub struct PlayerFiles {
    folder: PathBuf,
    loaded: BTreeMap<String, NbtCompound>,
}

impl PlayerFiles {
    pub fn new(world: &Path) -> PlayerFiles {
        PlayerFiles {
            folder: world.join(PLAYERS_DIR),
            loaded: BTreeMap::new(),
        }
    }

    pub fn path(&self, player: &str) -> PathBuf {
        self.folder.join(format!("{player}.dat"))
    }

    /// Names of every player with a file.
    pub fn names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if !self.folder.is_dir() {
            return Ok(names);
        }
        for entry in fs::read_dir(&self.folder)? {
            let name = entry?.file_name();
            if let Some(player) = name.to_str().and_then(|name| name.strip_suffix(".dat")) {
                names.push(player.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn tag(&mut self, player: &str) -> Result<&mut NbtCompound> {
        let path = self.path(player);
        match self.loaded.entry(player.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                if !path.is_file() {
                    return Err(WorldError::PlayerNotFound(player.to_string()));
                }
                let (_, tag) = nbt::read_gzip_file(&path)?;
                debug!("Loaded player {} from {}", player, path.display());
                Ok(entry.insert(tag))
            }
        }
    }

    /// Adds a player with a fresh tag. The file is written on the next save.
    pub fn create(&mut self, player: &str) -> &mut NbtCompound {
        match self.loaded.entry(player.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.insert(new_player_tag());
                entry.into_mut()
            }
            Entry::Vacant(entry) => entry.insert(new_player_tag()),
        }
    }

    /// Writes every player read or created since the last save.
    pub fn save(&mut self) -> Result<usize> {
        if self.loaded.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(&self.folder)?;
        for (player, tag) in &self.loaded {
            nbt::write_gzip_file(&self.path(player), "", tag)?;
        }
        let saved = self.loaded.len();
        self.loaded.clear();
        Ok(saved)
    }

    pub fn discard(&mut self) {
        self.loaded.clear();
    }
}

/// A player standing at the default spawn with full health and an empty
/// inventory.
pub fn new_player_tag() -> NbtCompound {
    let mut tag = NbtCompound::new();
    tag.insert("Air", NbtTag::Short(300));
    tag.insert("AttackTime", NbtTag::Short(0));
    tag.insert("DeathTime", NbtTag::Short(0));
    tag.insert("Fire", NbtTag::Short(-20));
    tag.insert("Health", NbtTag::Short(20));
    tag.insert("HurtTime", NbtTag::Short(0));
    tag.insert("Score", NbtTag::Int(0));
    tag.insert("FallDistance", NbtTag::Float(0.0));
    tag.insert("OnGround", NbtTag::Byte(0));
    tag.insert("Inventory", NbtTag::List(NbtList::new()));
    tag.insert("Motion", doubles([0.0; 3]));
    tag.insert("Pos", doubles([0.5, 2.8, 0.5]));
    tag.insert(
        "Rotation",
        NbtTag::List(NbtList::from(vec![NbtTag::Float(0.0), NbtTag::Float(0.0)])),
    );
    tag
}

pub fn doubles(values: [f64; 3]) -> NbtTag {
    NbtTag::List(NbtList::from(
        values.iter().map(|v| NbtTag::Double(*v)).collect::<Vec<NbtTag>>(),
    ))
}

/// The three doubles of a `Pos` style list.
pub fn read_doubles(tag: &NbtCompound, name: &str) -> Option<[f64; 3]> {
    let list = tag.get::<_, &NbtList>(name).ok()?;
    let mut values = [0.0; 3];
    if list.len() != 3 {
        return None;
    }
    for (dst, src) in values.iter_mut().zip(list.iter()) {
        match src {
            NbtTag::Double(v) => *dst = *v,
            _ => return None,
        }
    }
    Some(values)
}
