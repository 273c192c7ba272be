use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::{Buf, BufMut};
use log::{debug, info, warn};

use super::{
    slot_index, zlib, RegionPos, CHUNKS_PER_REGION, CHUNK_HEADER_SIZE, HEADER_SECTORS,
    MAX_CHUNK_SECTORS, SECTOR_BYTES, VERSION_DEFLATE, VERSION_GZIP,
};
use crate::{
    error::{Result, WorldError},
    nbt,
    world::ChunkPos,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairReport {
    pub removed: usize,
    pub recovered: usize,
}

/// One `r.<x>.<z>.mca` file. The offset and timestamp tables are mirrored in
/// memory and every table change is written through to the file immediately.
pub struct RegionFile {
    path: PathBuf,
    pos: RegionPos,
    file: File,
    offsets: Vec<u32>,
    timestamps: Vec<u32>,
    sector_count: usize,
}

impl RegionFile {
    pub fn open(path: &Path, pos: RegionPos) -> Result<RegionFile> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let mut size = file.metadata()?.len() as usize;
        if size % SECTOR_BYTES != 0 {
            size = (size / SECTOR_BYTES + 1) * SECTOR_BYTES;
        }
        size = size.max(HEADER_SECTORS * SECTOR_BYTES);
        file.set_len(size as u64)?;

        let mut header = vec![0u8; HEADER_SECTORS * SECTOR_BYTES];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        let mut buf = &header[..];
        let offsets = (0..CHUNKS_PER_REGION).map(|_| buf.get_u32()).collect();
        let timestamps = (0..CHUNKS_PER_REGION).map(|_| buf.get_u32()).collect();

        let mut region = RegionFile {
            path: path.to_path_buf(),
            pos,
            file,
            offsets,
            timestamps,
            sector_count: size / SECTOR_BYTES,
        };

        if region.needs_repair() {
            region.repair()?;
        }

        debug!(
            "Found region file {} with {}/{} sectors used and {} chunks present",
            region.path.display(),
            region.used_sectors(),
            region.sector_count,
            region.chunk_count()
        );
        Ok(region)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pos(&self) -> RegionPos {
        self.pos
    }

    pub fn sector_count(&self) -> usize {
        self.sector_count
    }

    pub fn used_sectors(&self) -> usize {
        self.sector_map().iter().filter(|used| **used).count()
    }

    pub fn chunk_count(&self) -> usize {
        self.offsets.iter().filter(|o| **o != 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.iter().all(|o| *o == 0)
    }

    pub fn contains_chunk(&self, pos: ChunkPos) -> bool {
        self.offsets[slot_index(pos)] != 0
    }

    /// Seconds since the epoch at which the chunk was last saved, 0 if unknown.
    pub fn timestamp(&self, pos: ChunkPos) -> u32 {
        self.timestamps[slot_index(pos)]
    }

    pub fn chunk_positions(&self) -> impl Iterator<Item = ChunkPos> + '_ {
        self.offsets
            .iter()
            .enumerate()
            .filter(|(_, offset)| **offset != 0)
            .map(move |(idx, _)| self.pos.chunk_at(idx))
    }

    /// Returns the compression tag and the still compressed payload.
    pub fn read_raw(&self, pos: ChunkPos) -> Result<(u8, Vec<u8>)> {
        let offset = self.offsets[slot_index(pos)];
        if offset == 0 {
            return Err(WorldError::ChunkNotPresent(pos));
        }
        let start = (offset >> 8) as usize;
        let count = (offset & 0xff) as usize;
        if count == 0 || start < HEADER_SECTORS || start + count > self.sector_count {
            return Err(WorldError::malformed(
                pos,
                format!("offset entry {start}:{count} points outside the file"),
            ));
        }

        let mut data = vec![0u8; count * SECTOR_BYTES];
        let mut file = &self.file;
        file.seek(SeekFrom::Start((start * SECTOR_BYTES) as u64))?;
        file.read_exact(&mut data)?;

        let mut buf = &data[..];
        let length = buf.get_u32() as usize;
        let format = buf.get_u8();
        if length == 0 || length - 1 > buf.remaining() {
            return Err(WorldError::malformed(
                pos,
                format!("chunk length {length} does not fit in {count} sectors"),
            ));
        }
        Ok((format, buf[..length - 1].to_vec()))
    }

    /// Returns the decompressed serialized tag tree of a chunk.
    pub fn read_chunk(&self, pos: ChunkPos) -> Result<Vec<u8>> {
        let (format, data) = self.read_raw(pos)?;
        inflate(format, &data).map_err(|reason| WorldError::malformed(pos, reason))
    }

    pub fn save_chunk(&mut self, pos: ChunkPos, data: &[u8]) -> Result<()> {
        let compressed = zlib::compress(data)?;
        self.save_raw(pos, VERSION_DEFLATE, &compressed)
    }

    /// Stores an already compressed payload.
    pub fn save_raw(&mut self, pos: ChunkPos, format: u8, data: &[u8]) -> Result<()> {
        let sectors_needed = (data.len() + CHUNK_HEADER_SIZE + SECTOR_BYTES - 1) / SECTOR_BYTES;
        if sectors_needed > MAX_CHUNK_SECTORS {
            return Err(WorldError::ChunkTooLarge {
                pos,
                sectors: sectors_needed,
            });
        }

        let idx = slot_index(pos);
        let offset = self.offsets[idx];
        let current_start = (offset >> 8) as usize;
        let current_count = (offset & 0xff) as usize;

        let sector = if current_start != 0 && current_count >= sectors_needed {
            debug!("Region save {pos} rewriting {} bytes in place", data.len());
            current_start
        } else {
            let mut used = self.sector_map();
            for i in current_start..(current_start + current_count).min(used.len()) {
                if i >= HEADER_SECTORS {
                    used[i] = false;
                }
            }
            match best_fit(&used, sectors_needed) {
                Some(start) => {
                    debug!("Region save {pos} reusing {sectors_needed} sectors at {start}");
                    start
                }
                None => {
                    debug!("Region save {pos} growing file by {sectors_needed} sectors");
                    used.len()
                }
            }
        };

        self.write_sectors(sector, format, data, sectors_needed)?;
        self.set_entry(idx, ((sector as u32) << 8) | sectors_needed as u32, now_seconds())
    }

    /// Clears a slot. The sectors it used become free for later saves.
    pub fn delete_chunk(&mut self, pos: ChunkPos) -> Result<()> {
        let idx = slot_index(pos);
        if self.offsets[idx] == 0 {
            return Ok(());
        }
        self.set_entry(idx, 0, 0)
    }

    /// Copies a compressed payload without decoding it. Does nothing if
    /// `other` does not hold the chunk.
    pub fn copy_chunk_from(&mut self, other: &RegionFile, pos: ChunkPos) -> Result<()> {
        match other.read_raw(pos) {
            Ok((format, data)) => self.save_raw(pos, format, &data),
            Err(WorldError::ChunkNotPresent(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Drops entries that point outside the file, fail to decode, overlap an
    /// earlier entry or hold a chunk for a different slot. Misplaced chunks
    /// that belong to this region are moved to their own slot if it is free.
    pub fn repair(&mut self) -> Result<RepairReport> {
        info!(
            "Beginning repairs on {} ({} chunks)",
            self.path.display(),
            self.chunk_count()
        );

        let mut report = RepairReport::default();
        let mut claimed = vec![false; self.sector_count];
        claimed[..HEADER_SECTORS].fill(true);
        let mut lost_and_found = BTreeMap::new();

        for idx in 0..CHUNKS_PER_REGION {
            let offset = self.offsets[idx];
            if offset == 0 {
                continue;
            }
            let slot = self.pos.chunk_at(idx);
            let start = (offset >> 8) as usize;
            let count = (offset & 0xff) as usize;

            let problem = match self.decode_position(slot) {
                Err(err) => Some(err.to_string()),
                Ok((found, format, data)) => {
                    let mut overlaps = false;
                    for used in &mut claimed[start..start + count] {
                        overlaps |= *used;
                        *used = true;
                    }
                    if found != slot || overlaps {
                        lost_and_found.insert(found, (format, data));
                        if found != slot {
                            Some(format!("chunk {found} found in the slot for {slot}"))
                        } else {
                            Some(format!("chunk {slot} overlaps another chunk"))
                        }
                    } else {
                        None
                    }
                }
            };

            if let Some(reason) = problem {
                info!("Unexpected chunk data at sector {start} ({reason})");
                self.set_entry(idx, 0, 0)?;
                report.removed += 1;
            }
        }

        for (found, (format, data)) in lost_and_found {
            if self.pos.contains(found) && !self.contains_chunk(found) {
                info!("Found chunk {found} and its slot is empty, recovering it");
                self.save_raw(found, format, &data)?;
                report.recovered += 1;
            }
        }

        info!(
            "Repair complete. Removed {} chunks, recovered {} chunks",
            report.removed, report.recovered
        );
        Ok(report)
    }

    fn decode_position(&self, slot: ChunkPos) -> Result<(ChunkPos, u8, Vec<u8>)> {
        let (format, data) = self.read_raw(slot)?;
        let raw = inflate(format, &data).map_err(|reason| WorldError::malformed(slot, reason))?;
        let (_, root) = nbt::read_root(&raw).map_err(|err| WorldError::malformed(slot, err))?;
        let level = nbt::get_compound(&root, "Level")
            .ok_or_else(|| WorldError::malformed(slot, "missing Level compound"))?;
        match (level.get::<_, i32>("xPos"), level.get::<_, i32>("zPos")) {
            (Ok(x), Ok(z)) => Ok((ChunkPos::new(x, z), format, data)),
            _ => Err(WorldError::malformed(slot, "missing xPos/zPos")),
        }
    }

    fn needs_repair(&self) -> bool {
        let mut used = vec![false; self.sector_count];
        for offset in self.offsets.iter().filter(|o| **o != 0) {
            let start = (offset >> 8) as usize;
            let count = (offset & 0xff) as usize;
            if start < HEADER_SECTORS || start + count > self.sector_count {
                warn!(
                    "Region file {} has an entry pointing at sectors {}..{} outside the file",
                    self.path.display(),
                    start,
                    start + count
                );
                return true;
            }
            for flag in &mut used[start..start + count] {
                if *flag {
                    return true;
                }
                *flag = true;
            }
        }
        false
    }

    /// Which sectors are taken by the header or some chunk.
    fn sector_map(&self) -> Vec<bool> {
        let mut used = vec![false; self.sector_count];
        used[..HEADER_SECTORS.min(self.sector_count)].fill(true);
        for offset in self.offsets.iter().filter(|o| **o != 0) {
            let start = (offset >> 8) as usize;
            let end = (start + (offset & 0xff) as usize).min(self.sector_count);
            for flag in used.iter_mut().take(end).skip(start) {
                *flag = true;
            }
        }
        used
    }

    fn write_sectors(&mut self, sector: usize, format: u8, data: &[u8], count: usize) -> Result<()> {
        let mut out = Vec::with_capacity(count * SECTOR_BYTES);
        out.put_u32(data.len() as u32 + 1);
        out.put_u8(format);
        out.put_slice(data);
        out.resize(count * SECTOR_BYTES, 0);

        self.file
            .seek(SeekFrom::Start((sector * SECTOR_BYTES) as u64))?;
        self.file.write_all(&out)?;
        self.sector_count = self.sector_count.max(sector + count);
        Ok(())
    }

    fn set_entry(&mut self, idx: usize, offset: u32, timestamp: u32) -> Result<()> {
        self.offsets[idx] = offset;
        self.timestamps[idx] = timestamp;
        self.file.seek(SeekFrom::Start((idx * 4) as u64))?;
        self.file.write_all(&offset.to_be_bytes())?;
        self.file
            .seek(SeekFrom::Start((SECTOR_BYTES + idx * 4) as u64))?;
        self.file.write_all(&timestamp.to_be_bytes())?;
        Ok(())
    }
}

fn inflate(format: u8, data: &[u8]) -> std::result::Result<Vec<u8>, String> {
    match format {
        VERSION_GZIP => zlib::gunzip(data).map_err(|err| err.to_string()),
        VERSION_DEFLATE => zlib::decompress(data).map_err(|err| err.to_string()),
        other => Err(format!("unknown compression format {other}")),
    }
}

/// Smallest free run that holds `needed` sectors, earliest on ties.
fn best_fit(used: &[bool], needed: usize) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    let mut idx = 0;
    while idx < used.len() {
        if used[idx] {
            idx += 1;
            continue;
        }
        let start = idx;
        while idx < used.len() && !used[idx] {
            idx += 1;
        }
        let len = idx - start;
        if len >= needed && best.map_or(true, |(_, best_len)| len < best_len) {
            best = Some((start, len));
        }
    }
    best.map(|(start, _)| start)
}

fn now_seconds() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
