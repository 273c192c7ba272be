use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use super::level::now_millis;
use crate::error::{Result, WorldError};

pub const SESSION_LOCK_FILE: &str = "session.lock";

/// Exclusive writer token. Whoever wrote `session.lock` last owns the world;
/// every write re-reads the file to make sure that is still us.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
    token: i64,
}

impl SessionLock {
    pub fn acquire(world: &Path) -> Result<SessionLock> {
        let path = world.join(SESSION_LOCK_FILE);
        let token = now_millis();
        fs::write(&path, token.to_be_bytes())?;
        debug!("Acquired session lock {} with token {}", path.display(), token);
        Ok(SessionLock { path, token })
    }

    pub fn token(&self) -> i64 {
        self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn check(&self) -> Result<()> {
        let data = fs::read(&self.path).map_err(|err| {
            WorldError::SessionLockLost(format!("cannot read {}: {}", self.path.display(), err))
        })?;
        let found = <[u8; 8]>::try_from(data.as_slice())
            .map(i64::from_be_bytes)
            .map_err(|_| {
                WorldError::SessionLockLost(format!("{} is {} bytes long", self.path.display(), data.len()))
            })?;
        if found != self.token {
            return Err(WorldError::SessionLockLost(format!(
                "{} was taken over (token {} instead of {})",
                self.path.display(),
                found,
                self.token
            )));
        }
        Ok(())
    }
}
