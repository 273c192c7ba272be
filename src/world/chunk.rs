use std::{cell::RefCell, mem, rc::Rc};

use log::trace;

use super::{materials::Materials, ChunkPos, DimensionKind};
use crate::{
    error::{Result, WorldError},
    nbt::{self, NbtCompound, NbtList, NbtTag},
};

pub const SECTION_HEIGHT: usize = 16;
const SECTION_VOLUME: usize = 16 * 16 * SECTION_HEIGHT;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightKind {
    Block,
    Sky,
}

/// A decoded 16x16xH column. The four voxel arrays are indexed `[x, z, y]`,
/// the height map `[z, x]`. Everything else from the chunk's tag tree is
/// kept in `root` untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub pos: ChunkPos,
    height: usize,
    pub blocks: Vec<u8>,
    pub data: Vec<u8>,
    pub sky_light: Vec<u8>,
    pub block_light: Vec<u8>,
    pub height_map: [u32; 256],
    root: NbtCompound,
    pub dirty: bool,
    pub needs_lighting: bool,
}

pub type ChunkRef = Rc<RefCell<Chunk>>;

impl Chunk {
    fn blank(pos: ChunkPos, height: usize, root: NbtCompound) -> Chunk {
        let volume = 16 * 16 * height;
        Chunk {
            pos,
            height,
            blocks: vec![0; volume],
            data: vec![0; volume],
            sky_light: vec![15; volume],
            block_light: vec![0; volume],
            height_map: [0; 256],
            root,
            dirty: false,
            needs_lighting: false,
        }
    }

    /// A new empty chunk: air everywhere, full sky light.
    pub fn create(pos: ChunkPos, height: usize) -> Chunk {
        let mut level = NbtCompound::new();
        level.insert("HeightMap", NbtTag::IntArray(vec![0; 256]));
        level.insert("TerrainPopulated", NbtTag::Byte(1));
        level.insert("xPos", NbtTag::Int(pos.x));
        level.insert("zPos", NbtTag::Int(pos.z));
        level.insert("LastUpdate", NbtTag::Long(0));
        level.insert("Entities", NbtTag::List(NbtList::new()));
        level.insert("TileEntities", NbtTag::List(NbtList::new()));
        let mut root = NbtCompound::new();
        root.insert("Level", NbtTag::Compound(level));

        let mut chunk = Chunk::blank(pos, height, root);
        chunk.dirty = true;
        chunk
    }

    /// Stand-in for missing neighbours during lighting. All arrays are zero.
    pub fn sentinel(height: usize) -> Chunk {
        let mut chunk = Chunk::blank(ChunkPos::new(0, 0), height, NbtCompound::new());
        chunk.sky_light.fill(0);
        chunk
    }

    pub fn from_bytes(pos: ChunkPos, height: usize, bytes: &[u8]) -> Result<Chunk> {
        let (_, mut root) = nbt::read_root(bytes).map_err(|err| WorldError::malformed(pos, err))?;
        let level = nbt::get_compound_mut(&mut root, "Level")
            .ok_or_else(|| WorldError::malformed(pos, "missing Level compound"))?;
        // the voxel arrays hold the section data from here on
        let sections = level
            .inner_mut()
            .get_mut("Sections")
            .map(|tag| mem::replace(tag, NbtTag::List(NbtList::new())));

        let mut height_map = [0u32; 256];
        if let Ok(values) = level.get::<_, &[i32]>("HeightMap") {
            if values.len() == 256 {
                for (dst, src) in height_map.iter_mut().zip(values) {
                    *dst = *src as u32;
                }
            }
        }

        let mut chunk = Chunk::blank(pos, height, root);
        chunk.height_map = height_map;

        let sections = match sections {
            Some(NbtTag::List(list)) => list,
            Some(_) => return Err(WorldError::malformed(pos, "Sections is not a list")),
            None => NbtList::new(),
        };
        for section in sections.iter() {
            match section {
                NbtTag::Compound(section) => chunk.load_section(section)?,
                _ => return Err(WorldError::malformed(pos, "section is not a compound")),
            }
        }
        Ok(chunk)
    }

    fn load_section(&mut self, section: &NbtCompound) -> Result<()> {
        let pos = self.pos;
        let sy = section
            .get::<_, i8>("Y")
            .map_err(|_| WorldError::malformed(pos, "section without Y"))?;
        let base = sy as i32 * SECTION_HEIGHT as i32;
        if base < 0 || base as usize + SECTION_HEIGHT > self.height {
            trace!("Chunk {pos} skipping section {sy} outside the world height");
            return Ok(());
        }
        let base = base as usize;

        let blocks = section_array(section, "Blocks", SECTION_VOLUME, pos)?;
        let data = unpack_nibbles(&section_array(section, "Data", SECTION_VOLUME / 2, pos)?);
        let sky_light =
            unpack_nibbles(&section_array(section, "SkyLight", SECTION_VOLUME / 2, pos)?);
        let block_light =
            unpack_nibbles(&section_array(section, "BlockLight", SECTION_VOLUME / 2, pos)?);

        for (i, ((block, data), (sky, light))) in blocks
            .iter()
            .zip(&data)
            .zip(sky_light.iter().zip(&block_light))
            .enumerate()
        {
            let (x, z, y) = (i % 16, (i / 16) % 16, i / 256);
            let idx = self.index(x, z, base + y);
            self.blocks[idx] = *block;
            self.data[idx] = *data;
            self.sky_light[idx] = *sky;
            self.block_light[idx] = *light;
        }
        Ok(())
    }

    /// Serializes the chunk. Sections holding only air, no block light and
    /// full sky light are left out.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut sections = NbtList::new();
        for sy in 0..self.height / SECTION_HEIGHT {
            let mut blocks = vec![0u8; SECTION_VOLUME];
            let mut data = vec![0u8; SECTION_VOLUME];
            let mut sky_light = vec![0u8; SECTION_VOLUME];
            let mut block_light = vec![0u8; SECTION_VOLUME];
            for i in 0..SECTION_VOLUME {
                let (x, z, y) = (i % 16, (i / 16) % 16, i / 256);
                let idx = self.index(x, z, sy * SECTION_HEIGHT + y);
                blocks[i] = self.blocks[idx];
                data[i] = self.data[idx];
                sky_light[i] = self.sky_light[idx];
                block_light[i] = self.block_light[idx];
            }

            let untouched = blocks.iter().all(|v| *v == 0)
                && data.iter().all(|v| *v == 0)
                && block_light.iter().all(|v| *v == 0)
                && sky_light.iter().all(|v| *v == 15);
            if untouched {
                continue;
            }

            let mut section = NbtCompound::new();
            section.insert("Blocks", nbt::byte_array(&blocks));
            section.insert("Data", nbt::byte_array(&pack_nibbles(&data)));
            section.insert("BlockLight", nbt::byte_array(&pack_nibbles(&block_light)));
            section.insert("SkyLight", nbt::byte_array(&pack_nibbles(&sky_light)));
            section.insert("Y", NbtTag::Byte(sy as i8));
            sections.push(NbtTag::Compound(section));
        }

        let mut root = self.root.clone();
        if let Some(level) = nbt::get_compound_mut(&mut root, "Level") {
            level.insert(
                "HeightMap",
                NbtTag::IntArray(self.height_map.iter().map(|h| *h as i32).collect()),
            );
            level.insert("Sections", NbtTag::List(sections));
        }
        nbt::write_root("", &root).map_err(|err| WorldError::malformed(self.pos, err))
    }

    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn index(&self, x: usize, z: usize, y: usize) -> usize {
        (x * 16 + z) * self.height + y
    }

    pub fn light(&self, kind: LightKind) -> &[u8] {
        match kind {
            LightKind::Block => &self.block_light,
            LightKind::Sky => &self.sky_light,
        }
    }

    pub fn light_mut(&mut self, kind: LightKind) -> &mut [u8] {
        match kind {
            LightKind::Block => &mut self.block_light,
            LightKind::Sky => &mut self.sky_light,
        }
    }

    pub(crate) fn light_and_blocks_mut(&mut self, kind: LightKind) -> (&mut [u8], &[u8]) {
        let light = match kind {
            LightKind::Block => &mut self.block_light,
            LightKind::Sky => &mut self.sky_light,
        };
        (light, &self.blocks)
    }

    /// Copies blocks, data, light and the height map of `other` into this
    /// chunk. Columns are cut to the lower of the two heights.
    pub fn copy_voxels_from(&mut self, other: &Chunk) {
        let height = self.height.min(other.height);
        for x in 0..16 {
            for z in 0..16 {
                let dst = self.index(x, z, 0)..self.index(x, z, 0) + height;
                let src = other.index(x, z, 0)..other.index(x, z, 0) + height;
                self.blocks[dst.clone()].copy_from_slice(&other.blocks[src.clone()]);
                self.data[dst.clone()].copy_from_slice(&other.data[src.clone()]);
                self.sky_light[dst.clone()].copy_from_slice(&other.sky_light[src.clone()]);
                self.block_light[dst].copy_from_slice(&other.block_light[src]);
            }
        }
        self.height_map = other.height_map;
        self.dirty = true;
    }

    /// The pass-through tag tree, without sections.
    pub fn root(&self) -> &NbtCompound {
        &self.root
    }

    pub fn level(&self) -> Option<&NbtCompound> {
        nbt::get_compound(&self.root, "Level")
    }

    pub fn level_mut(&mut self) -> Option<&mut NbtCompound> {
        self.dirty = true;
        nbt::get_compound_mut(&mut self.root, "Level")
    }

    pub fn entities(&self) -> Option<&NbtList> {
        self.level()?.get::<_, &NbtList>("Entities").ok()
    }

    pub fn tile_entities(&self) -> Option<&NbtList> {
        self.level()?.get::<_, &NbtList>("TileEntities").ok()
    }

    pub fn terrain_populated(&self) -> bool {
        self.level()
            .and_then(|level| level.get::<_, i8>("TerrainPopulated").ok())
            .map_or(false, |v| v != 0)
    }

    pub fn set_terrain_populated(&mut self, populated: bool) {
        if let Some(level) = self.level_mut() {
            level.insert("TerrainPopulated", NbtTag::Byte(populated as i8));
        }
    }

    /// Highest y with a light-absorbing block, plus one, per column.
    pub fn generate_height_map(&mut self, materials: &Materials, kind: DimensionKind) {
        if kind == DimensionKind::Nether {
            self.height_map = [0; 256];
            return;
        }
        for x in 0..16 {
            for z in 0..16 {
                let base = self.index(x, z, 0);
                let column = &self.blocks[base..base + self.height];
                let top = column
                    .iter()
                    .rposition(|block| materials.absorption(*block) > 0)
                    .map_or(0, |y| y + 1);
                self.height_map[z * 16 + x] = top as u32;
            }
        }
    }

    /// Seeds sky light straight down each column from the height map.
    pub fn gen_fast_lights(&mut self, materials: &Materials, kind: DimensionKind) {
        self.sky_light.fill(0);
        if !kind.has_sky_light() {
            return;
        }
        for x in 0..16 {
            for z in 0..16 {
                let base = self.index(x, z, 0);
                let top = (self.height_map[z * 16 + x] as usize).min(self.height);
                self.sky_light[base + top..base + self.height].fill(15);

                let mut level = 15i32;
                for y in (0..top).rev() {
                    level -= materials.absorption(self.blocks[base + y]).max(1) as i32;
                    if level <= 0 {
                        break;
                    }
                    self.sky_light[base + y] = level as u8;
                }
            }
        }
    }

    /// Marks the chunk modified and refreshes the height map. With
    /// `lighting` set, sky light is reseeded and the chunk queued for a relight.
    pub fn chunk_changed(&mut self, lighting: bool, materials: &Materials, kind: DimensionKind) {
        self.dirty = true;
        self.needs_lighting |= lighting;
        self.generate_height_map(materials, kind);
        if lighting {
            self.gen_fast_lights(materials, kind);
        }
    }
}

fn section_array(section: &NbtCompound, name: &str, len: usize, pos: ChunkPos) -> Result<Vec<u8>> {
    match nbt::get_bytes(section, name) {
        Some(values) if values.len() == len => Ok(values),
        _ => Err(WorldError::malformed(pos, format!("section has a bad {name} array"))),
    }
}

/// Two values per byte, even index in the low nibble.
pub fn pack_nibbles(values: &[u8]) -> Vec<u8> {
    values
        .chunks(2)
        .map(|pair| {
            let high = pair.get(1).copied().unwrap_or(0);
            (high << 4) | (pair[0] & 0x0f)
        })
        .collect()
}

pub fn unpack_nibbles(packed: &[u8]) -> Vec<u8> {
    let mut values = Vec::with_capacity(packed.len() * 2);
    for byte in packed {
        values.push(byte & 0x0f);
        values.push(byte >> 4);
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn materials() -> Materials {
        Materials::default()
    }

    #[test]
    fn nibble_packing_order() {
        assert_eq!(pack_nibbles(&[0x1, 0x2, 0xf, 0x0]), vec![0x21, 0x0f]);
        assert_eq!(unpack_nibbles(&[0x21, 0x0f]), vec![0x1, 0x2, 0xf, 0x0]);
    }

    #[test]
    fn new_chunk_has_expected_tags() {
        let chunk = Chunk::create(ChunkPos::new(4, -2), 256);
        let level = chunk.level().unwrap();
        assert_eq!(level.get::<_, i32>("xPos").unwrap(), 4);
        assert_eq!(level.get::<_, i32>("zPos").unwrap(), -2);
        assert!(chunk.terrain_populated());
        assert!(chunk.entities().unwrap().is_empty());
        assert!(chunk.dirty);
        assert!(chunk.sky_light.iter().all(|v| *v == 15));
    }

    #[test]
    fn encoding_is_lossless() {
        let mut chunk = Chunk::create(ChunkPos::new(1, 1), 256);
        let idx = chunk.index(3, 5, 70);
        chunk.blocks[idx] = 1;
        chunk.data[idx] = 7;
        let i = chunk.index(15, 15, 255);
        chunk.block_light[i] = 9;
        let i = chunk.index(0, 0, 0);
        chunk.sky_light[i] = 3;
        let i = chunk.index(2, 2, 130);
        chunk.data[i] = 4;
        chunk.height_map[17] = 71;
        if let Some(level) = chunk.level_mut() {
            level.insert("Custom", NbtTag::String("kept".into()));
        }

        let decoded = Chunk::from_bytes(chunk.pos, 256, &chunk.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.blocks, chunk.blocks);
        assert_eq!(decoded.data, chunk.data);
        assert_eq!(decoded.sky_light, chunk.sky_light);
        assert_eq!(decoded.block_light, chunk.block_light);
        assert_eq!(decoded.height_map, chunk.height_map);
        assert_eq!(decoded.level().unwrap().get::<_, &str>("Custom").unwrap(), "kept");
        assert!(!decoded.dirty);
    }

    #[test]
    fn untouched_sections_are_not_written() {
        let mut chunk = Chunk::create(ChunkPos::new(0, 0), 256);
        let idx = chunk.index(0, 0, 33);
        chunk.blocks[idx] = 1;

        let (_, root) = nbt::read_root(&chunk.to_bytes().unwrap()).unwrap();
        let sections = nbt::get_compound(&root, "Level")
            .and_then(|level| level.get::<_, &NbtList>("Sections").ok())
            .unwrap();
        assert_eq!(sections.len(), 1);
        let section = match sections.iter().next() {
            Some(NbtTag::Compound(section)) => section,
            other => panic!("unexpected section {other:?}"),
        };
        assert_eq!(section.get::<_, i8>("Y").unwrap(), 2);
        // y = 1 inside the section, stored [y, z, x]
        assert_eq!(nbt::get_bytes(section, "Blocks").unwrap()[256], 1);
    }

    #[test]
    fn short_section_array_is_malformed() {
        let mut section = NbtCompound::new();
        section.insert("Y", NbtTag::Byte(0));
        section.insert("Blocks", nbt::byte_array(&[0; 10]));
        let mut level = NbtCompound::new();
        level.insert("Sections", NbtTag::List(NbtList::from(vec![NbtTag::Compound(section)])));
        let mut root = NbtCompound::new();
        root.insert("Level", NbtTag::Compound(level));

        let bytes = nbt::write_root("", &root).unwrap();
        let err = Chunk::from_bytes(ChunkPos::new(0, 0), 256, &bytes).unwrap_err();
        assert!(matches!(err, WorldError::ChunkMalformed { .. }));
    }

    #[test]
    fn voxel_copy_cuts_to_the_lower_height() {
        let mut tall = Chunk::create(ChunkPos::new(0, 0), 256);
        let top = tall.index(4, 4, 200);
        let low = tall.index(4, 4, 10);
        tall.blocks[top] = 1;
        tall.blocks[low] = 2;
        tall.block_light[low] = 7;
        tall.height_map[4 * 16 + 4] = 201;

        let mut short = Chunk::create(ChunkPos::new(0, 0), 128);
        short.dirty = false;
        short.copy_voxels_from(&tall);
        let idx = short.index(4, 4, 10);
        assert_eq!(short.blocks[idx], 2);
        assert_eq!(short.block_light[idx], 7);
        assert_eq!(short.blocks.iter().filter(|b| **b != 0).count(), 1);
        assert_eq!(short.height_map[4 * 16 + 4], 201);
        assert!(short.dirty);
    }

    #[test]
    fn oversized_strings_fail_to_encode() {
        let mut chunk = Chunk::create(ChunkPos::new(2, 3), 256);
        if let Some(level) = chunk.level_mut() {
            level.insert("Sign", NbtTag::String("\u{1F600}".repeat(11_000)));
        }
        let err = chunk.to_bytes().unwrap_err();
        assert!(matches!(err, WorldError::ChunkMalformed { pos, .. } if pos == ChunkPos::new(2, 3)));

        if let Some(level) = chunk.level_mut() {
            level.insert("Sign", NbtTag::String("\u{1F600}\0".to_string()));
        }
        let decoded = Chunk::from_bytes(chunk.pos, 256, &chunk.to_bytes().unwrap()).unwrap();
        assert_eq!(
            decoded.level().unwrap().get::<_, &str>("Sign").unwrap(),
            "\u{1F600}\0"
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let err = Chunk::from_bytes(ChunkPos::new(0, 0), 256, b"garbage").unwrap_err();
        assert!(err.is_missing_chunk());
    }

    #[test]
    fn height_map_tracks_absorbing_blocks() {
        let materials = materials();
        let mut chunk = Chunk::create(ChunkPos::new(0, 0), 256);
        let stone = chunk.index(2, 3, 40);
        chunk.blocks[stone] = 1;
        chunk.generate_height_map(&materials, DimensionKind::Overworld);
        assert_eq!(chunk.height_map[3 * 16 + 2], 41);
        assert_eq!(chunk.height_map[0], 0);

        chunk.generate_height_map(&materials, DimensionKind::Nether);
        assert!(chunk.height_map.iter().all(|h| *h == 0));
    }

    #[test]
    fn fast_lights_fall_off_below_height_map() {
        let materials = materials();
        let mut chunk = Chunk::create(ChunkPos::new(0, 0), 256);
        // leaves absorb one level, stone blocks everything
        let leaves = chunk.index(0, 0, 50);
        let stone = chunk.index(0, 0, 40);
        chunk.blocks[leaves] = 18;
        chunk.blocks[stone] = 1;
        chunk.chunk_changed(true, &materials, DimensionKind::Overworld);

        assert_eq!(chunk.height_map[0], 51);
        assert_eq!(chunk.sky_light[chunk.index(0, 0, 51)], 15);
        assert_eq!(chunk.sky_light[chunk.index(0, 0, 50)], 14);
        assert_eq!(chunk.sky_light[chunk.index(0, 0, 45)], 9);
        assert_eq!(chunk.sky_light[chunk.index(0, 0, 40)], 0);
        assert!(chunk.needs_lighting);

        chunk.gen_fast_lights(&materials, DimensionKind::End);
        assert!(chunk.sky_light.iter().all(|v| *v == 0));
    }
}
