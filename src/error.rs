use std::{fmt, io, path::PathBuf};

use crate::{nbt::NbtError, world::ChunkPos};

pub type Result<T> = std::result::Result<T, WorldError>;

#[derive(Debug)]
pub enum WorldError {
    /// The slot for this chunk is empty. Callers may treat it as ungenerated.
    ChunkNotPresent(ChunkPos),
    ChunkMalformed { pos: ChunkPos, reason: String },
    ChunkAlreadyPresent(ChunkPos),
    ChunkTooLarge { pos: ChunkPos, sectors: usize },
    /// Another process took over the world, or the lock file became unreadable.
    SessionLockLost(String),
    ReadOnly,
    UnsupportedVersion(i32),
    NotAWorld(PathBuf),
    PlayerNotFound(String),
    Nbt(NbtError),
    Config(toml::de::Error),
    Io(io::Error),
}

impl WorldError {
    pub fn malformed(pos: ChunkPos, reason: impl fmt::Display) -> WorldError {
        WorldError::ChunkMalformed {
            pos,
            reason: reason.to_string(),
        }
    }

    /// Errors that mean "no usable chunk here" rather than a failure of the
    /// surrounding operation.
    pub fn is_missing_chunk(&self) -> bool {
        matches!(
            self,
            WorldError::ChunkNotPresent(_) | WorldError::ChunkMalformed { .. }
        )
    }
}

impl fmt::Display for WorldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChunkNotPresent(pos) => write!(f, "chunk {pos} is not present"),
            Self::ChunkMalformed { pos, reason } => write!(f, "chunk {pos} is malformed: {reason}"),
            Self::ChunkAlreadyPresent(pos) => write!(f, "chunk {pos} already present"),
            Self::ChunkTooLarge { pos, sectors } => write!(
                f,
                "chunk {pos} needs {sectors} sectors, more than a region entry can address"
            ),
            Self::SessionLockLost(reason) => write!(f, "session lock lost: {reason}"),
            Self::ReadOnly => write!(f, "world is opened read only"),
            Self::UnsupportedVersion(version) => {
                write!(f, "unsupported world version {version}, only Anvil is supported")
            }
            Self::NotAWorld(path) => write!(f, "{} is not a world folder", path.display()),
            Self::PlayerNotFound(player) => write!(f, "player {player} not found"),
            Self::Nbt(err) => write!(f, "tag tree error: {err}"),
            Self::Config(err) => write!(f, "invalid configuration: {err}"),
            Self::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for WorldError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Nbt(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for WorldError {
    fn from(err: io::Error) -> Self {
        WorldError::Io(err)
    }
}

impl From<NbtError> for WorldError {
    fn from(err: NbtError) -> Self {
        WorldError::Nbt(err)
    }
}

impl From<toml::de::Error> for WorldError {
    fn from(err: toml::de::Error) -> Self {
        WorldError::Config(err)
    }
}
