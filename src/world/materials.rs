use std::{fs, path::Path};

use serde_derive::Deserialize;

use crate::error::Result;

pub const DEFAULT_BRIGHTNESS: u8 = 0;
pub const DEFAULT_OPACITY: u8 = 15;

const ALPHA_MATERIALS: &str = include_str!("materials.toml");

#[derive(Debug, Deserialize)]
struct MaterialTable {
    blocks: Vec<BlockEntry>,
}

#[derive(Debug, Deserialize)]
struct BlockEntry {
    id: u8,
    name: String,
    #[serde(default)]
    brightness: u8,
    #[serde(default = "default_opacity")]
    opacity: u8,
}

fn default_opacity() -> u8 {
    DEFAULT_OPACITY
}

/// Per block id light emission and absorption.
#[derive(Debug, Clone)]
pub struct Materials {
    names: Vec<Option<String>>,
    emission: [u8; 256],
    absorption: [u8; 256],
}

impl Materials {
    pub fn from_toml_str(data: &str) -> Result<Materials> {
        let table = toml::from_str::<MaterialTable>(data)?;
        let mut materials = Materials {
            names: vec![None; 256],
            emission: [DEFAULT_BRIGHTNESS; 256],
            absorption: [DEFAULT_OPACITY; 256],
        };
        for block in table.blocks {
            let id = block.id as usize;
            materials.names[id] = Some(block.name);
            materials.emission[id] = block.brightness.min(15);
            materials.absorption[id] = block.opacity.min(15);
        }
        Ok(materials)
    }

    pub fn load(path: &Path) -> Result<Materials> {
        let data = fs::read_to_string(path)?;
        Materials::from_toml_str(&data)
    }

    pub fn emission(&self, block: u8) -> u8 {
        self.emission[block as usize]
    }

    pub fn absorption(&self, block: u8) -> u8 {
        self.absorption[block as usize]
    }

    /// Absorption as used when light spreads: every step costs at least one level.
    pub fn lighting_absorption(&self, block: u8) -> u8 {
        self.absorption[block as usize].clamp(1, 15)
    }

    pub fn name(&self, block: u8) -> Option<&str> {
        self.names[block as usize].as_deref()
    }

    pub fn id_by_name(&self, name: &str) -> Option<u8> {
        self.names
            .iter()
            .position(|n| n.as_deref().map_or(false, |n| n.eq_ignore_ascii_case(name)))
            .map(|id| id as u8)
    }
}

impl Default for Materials {
    /// The bundled Alpha block table.
    fn default() -> Self {
        Materials::from_toml_str(ALPHA_MATERIALS).expect("bundled materials table is valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn bundled_table_has_light_sources() {
        let materials = Materials::default();
        assert_eq!(materials.absorption(0), 0);
        assert_eq!(materials.lighting_absorption(0), 1);
        assert_eq!(materials.emission(89), 15);
        assert_eq!(materials.emission(50), 14);
        assert_eq!(materials.absorption(9), 3);
        assert_eq!(materials.name(1), Some("Stone"));
        assert_eq!(materials.id_by_name("glowstone"), Some(89));
    }

    #[test]
    fn unlisted_ids_are_opaque_and_dark() {
        let materials = Materials::default();
        assert_eq!(materials.name(250), None);
        assert_eq!(materials.absorption(250), DEFAULT_OPACITY);
        assert_eq!(materials.emission(250), DEFAULT_BRIGHTNESS);
    }

    #[test]
    fn parses_custom_table() {
        let materials = Materials::from_toml_str(indoc! {r#"
            [[blocks]]
            id = 7
            name = "Lamp"
            brightness = 20
            opacity = 0
        "#})
        .unwrap();
        assert_eq!(materials.emission(7), 15);
        assert_eq!(materials.absorption(7), 0);
        assert_eq!(materials.absorption(0), DEFAULT_OPACITY);
    }

    #[test]
    fn rejects_bad_table() {
        assert!(Materials::from_toml_str("blocks = 3").is_err());
    }
}
