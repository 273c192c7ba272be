use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, info, trace, warn};

use super::{
    chunk::{Chunk, ChunkRef, LightKind},
    dimension::Dimension,
    ChunkPos,
};
use crate::error::Result;

/// Diffusion passes per light kind. Light fades by at least one level per
/// block, so 14 steps reach every block a level 15 source can light.
const MAX_PASSES: usize = 14;
const WORK_PER_CHUNK: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
    pub message: String,
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            (self.done as f32 / self.total as f32).min(1.0)
        }
    }
}

/// The direction light travels in a horizontal step.
#[derive(Debug, Clone, Copy)]
enum Side {
    MinusX,
    PlusX,
    MinusZ,
    PlusZ,
}

impl Side {
    const ALL: [Side; 4] = [Side::MinusX, Side::PlusX, Side::MinusZ, Side::PlusZ];

    fn opposite(self) -> Side {
        match self {
            Side::MinusX => Side::PlusX,
            Side::PlusX => Side::MinusX,
            Side::MinusZ => Side::PlusZ,
            Side::PlusZ => Side::MinusZ,
        }
    }

    fn neighbour(self, pos: ChunkPos) -> ChunkPos {
        match self {
            Side::MinusX => ChunkPos::new(pos.x - 1, pos.z),
            Side::PlusX => ChunkPos::new(pos.x + 1, pos.z),
            Side::MinusZ => ChunkPos::new(pos.x, pos.z - 1),
            Side::PlusZ => ChunkPos::new(pos.x, pos.z + 1),
        }
    }

    /// Columns of the chunk face on this side. Opposite faces line up index
    /// by index.
    fn face(self) -> [usize; 16] {
        std::array::from_fn(|i| match self {
            Side::MinusX => column(0, i),
            Side::PlusX => column(15, i),
            Side::MinusZ => column(i, 0),
            Side::PlusZ => column(i, 15),
        })
    }
}

#[inline]
fn column(x: usize, z: usize) -> usize {
    x * 16 + z
}

#[inline]
fn raise(dst: &mut u8, src: u8, absorption: u8) -> bool {
    let level = src.saturating_sub(absorption).min(15);
    if level > *dst {
        *dst = level;
        true
    } else {
        false
    }
}

/// Light leaving through the `side` face of `src` into the facing face of
/// `dst`.
fn spread_between(
    src: &[u8],
    side: Side,
    dst: &mut [u8],
    dst_blocks: &[u8],
    height: usize,
    absorption: &[u8; 256],
) -> bool {
    let mut changed = false;
    for (s, d) in side.face().iter().zip(side.opposite().face().iter()) {
        let (s, d) = (s * height, d * height);
        for y in 0..height {
            changed |= raise(&mut dst[d + y], src[s + y], absorption[dst_blocks[d + y] as usize]);
        }
    }
    changed
}

fn spread_column(
    light: &mut [u8],
    blocks: &[u8],
    src: usize,
    dst: usize,
    height: usize,
    absorption: &[u8; 256],
) -> bool {
    let (s, d) = (src * height, dst * height);
    let mut changed = false;
    for y in 0..height {
        let level = light[s + y];
        changed |= raise(&mut light[d + y], level, absorption[blocks[d + y] as usize]);
    }
    changed
}

/// Moves light one block toward `side` everywhere inside the chunk. Every
/// destination reads its source before that source is written.
fn spread_body(chunk: &mut Chunk, side: Side, kind: LightKind, absorption: &[u8; 256]) -> bool {
    let height = chunk.height();
    let (light, blocks) = chunk.light_and_blocks_mut(kind);
    let mut changed = false;
    for step in 1..16 {
        for i in 0..16 {
            let (src, dst) = match side {
                Side::MinusX => (column(step, i), column(step - 1, i)),
                Side::PlusX => (column(15 - step, i), column(16 - step, i)),
                Side::MinusZ => (column(i, step), column(i, step - 1)),
                Side::PlusZ => (column(i, 15 - step), column(i, 16 - step)),
            };
            changed |= spread_column(light, blocks, src, dst, height, absorption);
        }
    }
    changed
}

/// One step up, then one step down, in every column.
fn spread_vertical(chunk: &mut Chunk, kind: LightKind, absorption: &[u8; 256]) -> bool {
    let height = chunk.height();
    let (light, blocks) = chunk.light_and_blocks_mut(kind);
    let mut changed = false;
    for base in (0..256).map(|c| c * height) {
        for y in (base + 1..base + height).rev() {
            let below = light[y - 1];
            changed |= raise(&mut light[y], below, absorption[blocks[y] as usize]);
        }
        for y in base..base + height - 1 {
            let above = light[y + 1];
            changed |= raise(&mut light[y], above, absorption[blocks[y] as usize]);
        }
    }
    changed
}

/// Pushes light out of `chunk` into the neighbour on `side`. Returns whether
/// a real neighbour got brighter.
fn into_neighbour(
    chunk: &Chunk,
    neighbour: Option<&ChunkRef>,
    sentinel: &mut Chunk,
    side: Side,
    kind: LightKind,
    absorption: &[u8; 256],
) -> bool {
    let height = chunk.height();
    let src = chunk.light(kind);
    match neighbour {
        Some(neighbour) => {
            let mut neighbour = neighbour.borrow_mut();
            let (dst, blocks) = neighbour.light_and_blocks_mut(kind);
            spread_between(src, side, dst, blocks, height, absorption)
        }
        None => {
            let (dst, blocks) = sentinel.light_and_blocks_mut(kind);
            spread_between(src, side, dst, blocks, height, absorption);
            false
        }
    }
}

/// Pulls light into `chunk` from the neighbour on `side`.
fn from_neighbour(
    chunk: &mut Chunk,
    neighbour: Option<&ChunkRef>,
    sentinel: &Chunk,
    side: Side,
    kind: LightKind,
    absorption: &[u8; 256],
) -> bool {
    let height = chunk.height();
    let (dst, blocks) = chunk.light_and_blocks_mut(kind);
    match neighbour {
        Some(neighbour) => {
            let neighbour = neighbour.borrow();
            spread_between(neighbour.light(kind), side.opposite(), dst, blocks, height, absorption)
        }
        None => spread_between(sentinel.light(kind), side.opposite(), dst, blocks, height, absorption),
    }
}

/// Splits sorted chunk positions into batches of at most `limit` chunks,
/// halving along X and then along Z until every batch fits.
fn split_batches(mut positions: Vec<ChunkPos>, limit: usize) -> VecDeque<Vec<ChunkPos>> {
    positions.sort();
    let mut batches = vec![positions];
    while batches.iter().any(|batch| batch.len() > limit.max(1)) {
        batches = batches
            .into_iter()
            .flat_map(quarter)
            .filter(|batch| !batch.is_empty())
            .collect();
    }
    batches.retain(|batch| !batch.is_empty());
    batches.into()
}

fn quarter(mut chunks: Vec<ChunkPos>) -> Vec<Vec<ChunkPos>> {
    chunks.sort();
    let east = chunks.split_off(chunks.len() / 2);
    [chunks, east]
        .into_iter()
        .flat_map(|mut half| {
            half.sort_by_key(|pos| (pos.z, pos.x));
            let south = half.split_off(half.len() / 2);
            [half, south]
        })
        .collect()
}

enum Stage {
    Seed(usize),
    Expand,
    Diffuse(Diffusion),
    Complete,
}

struct Diffusion {
    light: usize,
    pass: usize,
    starting: Vec<ChunkPos>,
    queue: Vec<ChunkPos>,
    cursor: usize,
    next: BTreeSet<ChunkPos>,
}

struct Batch {
    seeds: Vec<ChunkPos>,
    /// Seeds that could be loaded. Only these leave the relight queue.
    started: Vec<ChunkPos>,
    /// Handles kept for the whole batch so the cache cannot drop them midway.
    held: BTreeMap<ChunkPos, ChunkRef>,
    stage: Stage,
    work: usize,
    estimate: usize,
    skipped: usize,
}

/// An incremental relight of a set of chunks. Every call to `next` does one
/// unit of work and reports progress. Dropping the run early leaves the
/// unfinished chunks queued for lighting.
pub struct LightingRun<'a> {
    dim: &'a mut Dimension,
    absorption: [u8; 256],
    lights: Vec<LightKind>,
    batches: VecDeque<Vec<ChunkPos>>,
    batch_count: usize,
    batch_index: usize,
    batch: Option<Batch>,
    sentinel: Chunk,
    finished_work: usize,
    pending_estimate: usize,
    finished: bool,
}

impl<'a> LightingRun<'a> {
    pub(super) fn new(
        dim: &'a mut Dimension,
        positions: Option<BTreeSet<ChunkPos>>,
    ) -> Result<LightingRun<'a>> {
        dim.cache.check_session_lock()?;
        let positions: Vec<ChunkPos> = match positions {
            Some(positions) => {
                let mut present = Vec::with_capacity(positions.len());
                for pos in positions {
                    if dim.contains_chunk(pos)? {
                        present.push(pos);
                    }
                }
                present
            }
            None => dim.cache.chunks_needing_lighting().iter().copied().collect(),
        };
        for pos in &positions {
            dim.cache.set_needs_lighting(*pos, true);
        }
        info!("Asked to light {} chunks", positions.len());

        let pending_estimate = positions.len() * WORK_PER_CHUNK;
        let batches = split_batches(positions, dim.cache.limit());
        if batches.len() > 1 {
            info!("Using {} batches to conserve memory", batches.len());
        }

        let materials = &dim.materials;
        let absorption = std::array::from_fn(|block| materials.lighting_absorption(block as u8));
        let lights = if dim.kind.has_sky_light() {
            vec![LightKind::Block, LightKind::Sky]
        } else {
            vec![LightKind::Block]
        };
        let sentinel = Chunk::sentinel(dim.height);

        Ok(LightingRun {
            dim,
            absorption,
            lights,
            batch_count: batches.len(),
            batches,
            batch_index: 0,
            batch: None,
            sentinel,
            finished_work: 0,
            pending_estimate,
            finished: false,
        })
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    fn step(&mut self) -> Result<Option<Progress>> {
        loop {
            let mut batch = match self.batch.take() {
                Some(batch) => batch,
                None => match self.batches.pop_front() {
                    Some(seeds) => self.start_batch(seeds),
                    None => return Ok(None),
                },
            };
            let message = match self.advance(&mut batch)? {
                Some(message) => message,
                None => {
                    self.finish_batch(batch);
                    continue;
                }
            };
            batch.work += 1;
            if batch.work >= batch.estimate {
                batch.estimate = batch.work + 1;
            }
            let progress = Progress {
                done: self.finished_work + batch.work,
                total: self.finished_work + batch.estimate + self.pending_estimate,
                message,
            };
            self.batch = Some(batch);
            return Ok(Some(progress));
        }
    }

    fn start_batch(&mut self, mut seeds: Vec<ChunkPos>) -> Batch {
        seeds.sort();
        self.batch_index += 1;
        let estimate = seeds.len() * WORK_PER_CHUNK;
        self.pending_estimate = self.pending_estimate.saturating_sub(estimate);
        info!(
            "Lighting batch {}/{} of {} chunks",
            self.batch_index,
            self.batch_count,
            seeds.len()
        );
        Batch {
            seeds,
            started: Vec::new(),
            held: BTreeMap::new(),
            stage: Stage::Seed(0),
            work: 0,
            estimate,
            skipped: 0,
        }
    }

    fn finish_batch(&mut self, batch: Batch) {
        for pos in &batch.started {
            self.dim.cache.set_needs_lighting(*pos, false);
        }
        self.finished_work += batch.work;
        info!(
            "Batch {}/{} done: {} chunks lit, {} touched, {} skipped",
            self.batch_index,
            self.batch_count,
            batch.started.len(),
            batch.held.len(),
            batch.skipped
        );
    }

    /// Does one unit of work on the batch. `None` once the batch is done.
    fn advance(&mut self, batch: &mut Batch) -> Result<Option<String>> {
        loop {
            match &mut batch.stage {
                Stage::Seed(i) => {
                    let i = *i;
                    if i == batch.seeds.len() {
                        batch.stage = Stage::Expand;
                        continue;
                    }
                    batch.stage = Stage::Seed(i + 1);
                    let pos = batch.seeds[i];
                    self.seed(batch, pos)?;
                    return Ok(Some(format!("Seeding lights for chunk {pos}")));
                }
                Stage::Expand => {
                    self.expand(batch)?;
                    let starting: Vec<ChunkPos> = batch.held.keys().copied().collect();
                    let message = format!("Spreading into {} chunks", starting.len());
                    batch.stage = Stage::Diffuse(Diffusion {
                        light: 0,
                        pass: 0,
                        queue: starting.clone(),
                        starting,
                        cursor: 0,
                        next: BTreeSet::new(),
                    });
                    return Ok(Some(message));
                }
                Stage::Diffuse(diffusion) => {
                    match self.diffuse_step(&mut batch.held, diffusion)? {
                        Some(message) => return Ok(Some(message)),
                        None => batch.stage = Stage::Complete,
                    }
                }
                Stage::Complete => return Ok(None),
            }
        }
    }

    fn fetch(
        &mut self,
        held: &BTreeMap<ChunkPos, ChunkRef>,
        pos: ChunkPos,
    ) -> Result<Option<ChunkRef>> {
        if let Some(chunk) = held.get(&pos) {
            return Ok(Some(chunk.clone()));
        }
        match self.dim.cache.get_chunk(pos) {
            Ok(chunk) => Ok(Some(chunk)),
            Err(err) if err.is_missing_chunk() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Recomputes the height map and sky light seed of one chunk.
    fn seed(&mut self, batch: &mut Batch, pos: ChunkPos) -> Result<()> {
        let chunk = match self.dim.cache.get_chunk(pos) {
            Ok(chunk) => chunk,
            Err(err) if err.is_missing_chunk() => {
                warn!("Skipping chunk {pos} while lighting: {err}");
                self.dim.cache.set_needs_lighting(pos, false);
                batch.skipped += 1;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        chunk
            .borrow_mut()
            .chunk_changed(true, &self.dim.materials, self.dim.kind);
        self.dim.cache.set_needs_lighting(pos, true);
        batch.started.push(pos);
        batch.held.insert(pos, chunk);
        Ok(())
    }

    /// Pulls in the eight neighbours of every seeded chunk and resets block
    /// light to the emission of each block.
    fn expand(&mut self, batch: &mut Batch) -> Result<()> {
        for pos in batch.started.clone() {
            for dx in -1..=1 {
                for dz in -1..=1 {
                    let near = ChunkPos::new(pos.x + dx, pos.z + dz);
                    if batch.held.contains_key(&near) {
                        continue;
                    }
                    if let Some(chunk) = self.fetch(&batch.held, near)? {
                        batch.held.insert(near, chunk);
                    }
                }
            }
        }

        let materials = &self.dim.materials;
        for chunk in batch.held.values() {
            let mut chunk = chunk.borrow_mut();
            let chunk = &mut *chunk;
            for (light, block) in chunk.block_light.iter_mut().zip(&chunk.blocks) {
                *light = materials.emission(*block);
            }
            chunk.dirty = true;
        }
        debug!(
            "Expanded {} seeds to {} chunks",
            batch.started.len(),
            batch.held.len()
        );
        Ok(())
    }

    fn diffuse_step(
        &mut self,
        held: &mut BTreeMap<ChunkPos, ChunkRef>,
        diffusion: &mut Diffusion,
    ) -> Result<Option<String>> {
        loop {
            let kind = match self.lights.get(diffusion.light) {
                Some(kind) => *kind,
                None => return Ok(None),
            };

            if diffusion.cursor < diffusion.queue.len() {
                let pos = diffusion.queue[diffusion.cursor];
                diffusion.cursor += 1;
                self.diffuse_chunk(held, pos, kind, &mut diffusion.next)?;
                return Ok(Some(format!(
                    "{:?} light pass {}: chunk {}",
                    kind,
                    diffusion.pass + 1,
                    pos
                )));
            }

            debug!(
                "{:?} light pass {} over {} chunks, {} changed",
                kind,
                diffusion.pass + 1,
                diffusion.queue.len(),
                diffusion.next.len()
            );
            diffusion.pass += 1;
            diffusion.queue = std::mem::take(&mut diffusion.next).into_iter().collect();
            diffusion.cursor = 0;
            if diffusion.pass == MAX_PASSES || diffusion.queue.is_empty() {
                diffusion.light += 1;
                diffusion.pass = 0;
                diffusion.queue = diffusion.starting.clone();
            }
        }
    }

    /// One diffusion step for one chunk, in all six directions. Chunks that
    /// got brighter are queued for the next pass.
    fn diffuse_chunk(
        &mut self,
        held: &mut BTreeMap<ChunkPos, ChunkRef>,
        pos: ChunkPos,
        kind: LightKind,
        next: &mut BTreeSet<ChunkPos>,
    ) -> Result<()> {
        let chunk = match self.fetch(held, pos)? {
            Some(chunk) => chunk,
            None => return Ok(()),
        };
        let mut neighbours: [Option<ChunkRef>; 4] = Default::default();
        for (slot, side) in neighbours.iter_mut().zip(Side::ALL) {
            *slot = self.fetch(held, side.neighbour(pos))?;
        }

        let absorption = &self.absorption;
        let sentinel = &mut self.sentinel;
        let mut raised = [false; 4];
        let mut changed = false;
        {
            let mut chunk = chunk.borrow_mut();
            for (minus, plus) in [(Side::MinusX, Side::PlusX), (Side::MinusZ, Side::PlusZ)] {
                for side in [minus, plus] {
                    let opposite = side.opposite();
                    raised[side as usize] |= into_neighbour(
                        &chunk,
                        neighbours[side as usize].as_ref(),
                        sentinel,
                        side,
                        kind,
                        absorption,
                    );
                    changed |= spread_body(&mut chunk, side, kind, absorption);
                    changed |= from_neighbour(
                        &mut chunk,
                        neighbours[opposite as usize].as_ref(),
                        sentinel,
                        opposite,
                        kind,
                        absorption,
                    );
                }
                sentinel.light_mut(kind).fill(0);
            }
            changed |= spread_vertical(&mut chunk, kind, absorption);
            if changed {
                chunk.dirty = true;
            }
        }

        if changed {
            next.insert(pos);
        }
        for (side, neighbour) in Side::ALL.iter().zip(neighbours) {
            if let (true, Some(neighbour)) = (raised[*side as usize], neighbour) {
                let near = side.neighbour(pos);
                trace!("Light from {pos} reached {near}");
                neighbour.borrow_mut().dirty = true;
                next.insert(near);
                held.entry(near).or_insert(neighbour);
            }
        }
        Ok(())
    }
}

impl Iterator for LightingRun<'_> {
    type Item = Result<Progress>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.step() {
            Ok(Some(progress)) => Some(Ok(progress)),
            Ok(None) => {
                self.finished = true;
                info!("Lighting finished after {} steps", self.finished_work);
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
