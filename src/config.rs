use std::{fs, path::Path, path::PathBuf};

use serde_derive::Deserialize;

use crate::{
    error::{Result, WorldError},
    world::materials::Materials,
};

pub const DEFAULT_CHUNK_CACHE_LIMIT: usize = 400;
pub const DEFAULT_HEIGHT: usize = 256;

/// Settings shared by every dimension of an opened world.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct WorldConfig {
    /// Decoded chunks kept per dimension before unused ones are evicted.
    pub chunk_cache_limit: usize,
    pub height: usize,
    /// Block table to use instead of the bundled one.
    pub materials: Option<PathBuf>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        WorldConfig {
            chunk_cache_limit: DEFAULT_CHUNK_CACHE_LIMIT,
            height: DEFAULT_HEIGHT,
            materials: None,
        }
    }
}

impl WorldConfig {
    pub fn load(path: &Path) -> Result<WorldConfig> {
        let data = fs::read_to_string(path)?;
        WorldConfig::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<WorldConfig> {
        let config = toml::from_str::<WorldConfig>(data)?;
        config.validate()?;
        Ok(config)
    }

    /// The height has to be a whole number of sections and the cache must
    /// hold at least one chunk.
    pub fn validate(&self) -> Result<()> {
        if self.height == 0 || self.height % 16 != 0 || self.height > 16 * 128 {
            return Err(invalid(format!(
                "height {} is not a positive multiple of 16",
                self.height
            )));
        }
        if self.chunk_cache_limit == 0 {
            return Err(invalid("chunk_cache_limit must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn load_materials(&self) -> Result<Materials> {
        match &self.materials {
            Some(path) => Materials::load(path),
            None => Ok(Materials::default()),
        }
    }
}

fn invalid(msg: String) -> WorldError {
    WorldError::Config(<toml::de::Error as serde::de::Error>::custom(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn empty_config_uses_defaults() {
        assert_eq!(WorldConfig::from_toml_str("").unwrap(), WorldConfig::default());
    }

    #[test]
    fn reads_all_fields() {
        let config = WorldConfig::from_toml_str(indoc! {r#"
            chunk_cache_limit = 16
            height = 128
            materials = "blocks.toml"
        "#})
        .unwrap();
        assert_eq!(config.chunk_cache_limit, 16);
        assert_eq!(config.height, 128);
        assert_eq!(config.materials, Some(PathBuf::from("blocks.toml")));
    }

    #[test]
    fn wrong_types_are_config_errors() {
        let err = WorldConfig::from_toml_str("height = \"tall\"").unwrap_err();
        assert!(matches!(err, WorldError::Config(_)));
    }

    #[test]
    fn height_must_be_whole_sections() {
        assert!(WorldConfig::from_toml_str("height = 100").is_err());
        assert!(WorldConfig::from_toml_str("chunk_cache_limit = 0").is_err());
        assert!(WorldConfig::from_toml_str("height = 64").is_ok());
    }
}
