// Copyright 2025 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Archetypes: all chunks sharing one component signature.
//!
//! An archetype owns its chunk list and the column layout every chunk of the
//! signature uses. Layout is solved once at creation: the row capacity is the
//! largest count whose columns fit one allocator block, downgrading to the
//! small size class when usage leaves most of a large block idle. Graph edges
//! to neighboring signatures live here as well.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::block::{ChunkAllocator, SizeClass, LARGE_BLOCK_BYTES, SMALL_BLOCK_BYTES};
use crate::chunk::Chunk;
use crate::component::{ComponentCatalog, ComponentId, ComponentKind, ComponentMeta};
use crate::config::{MAX_COMPONENTS, MAX_ROWS_PER_CHUNK};
use crate::entity::Entity;
use crate::utils::{align_up, hash_combine};

/// Index of an archetype in the world's archetype arena.
pub type ArchetypeId = u32;

/// The empty-signature archetype created at world init; never destroyed.
pub const ROOT_ARCHETYPE: ArchetypeId = 0;

/// Salt distinguishing Unique entries from Generic ones in list hashes, so
/// `{T}` as Generic and `{T}` as Unique intern to different archetypes.
const UNIQUE_HASH_SALT: u64 = 0x6b5f_1d4a_9c83_2e71;

/// Entity relocation across or within chunks of one archetype.
pub(crate) struct EntityPatch {
    pub entity: Entity,
    pub chunk_idx: u32,
    pub row: u32,
}

/// Layout solved at archetype creation.
#[derive(Debug, Clone, Copy)]
pub struct ArchetypeProps {
    /// Rows per chunk.
    pub capacity: u16,
    /// Bytes of block payload the columns actually use.
    pub chunk_data_bytes: u32,
    /// Block size class chunks of this archetype allocate.
    pub size_class: SizeClass,
}

/// Full 64-bit hash over an archetype's two sorted component lists.
/// The fold over two empty lists is 0 — the root archetype's lookup hash.
pub(crate) fn calc_lookup_hash(
    catalog: &ComponentCatalog,
    generic: &[ComponentMeta],
    unique: &[ComponentMeta],
) -> u64 {
    let mut hash = 0u64;
    for meta in generic {
        hash = hash_combine(hash, catalog.get(meta.id()).lookup_hash);
    }
    for meta in unique {
        hash = hash_combine(hash, catalog.get(meta.id()).lookup_hash ^ UNIQUE_HASH_SALT);
    }
    hash
}

fn calc_matcher(catalog: &ComponentCatalog, metas: &[ComponentMeta]) -> u64 {
    metas
        .iter()
        .fold(0u64, |acc, m| acc | catalog.get(m.id()).matcher_hash)
}

/// Bytes consumed by `rows` rows of the given signature, alignment padding
/// included: entity column first, then Generic columns, then one row of each
/// Unique column.
fn bytes_for_rows(
    catalog: &ComponentCatalog,
    generic: &[ComponentMeta],
    unique: &[ComponentMeta],
    rows: usize,
) -> usize {
    let mut cursor = std::mem::size_of::<Entity>() * rows;
    for meta in generic {
        cursor = align_up(cursor, meta.alignment().max(1));
        cursor += catalog.get(meta.id()).column_bytes(rows);
    }
    for meta in unique {
        cursor = align_up(cursor, meta.alignment().max(1));
        cursor += catalog.get(meta.id()).column_bytes(1);
    }
    cursor
}

fn solve_capacity(
    catalog: &ComponentCatalog,
    generic: &[ComponentMeta],
    unique: &[ComponentMeta],
    payload: usize,
) -> (usize, usize) {
    let per_row: usize = std::mem::size_of::<Entity>()
        + generic.iter().map(|m| m.size()).sum::<usize>();
    let mut rows = MAX_ROWS_PER_CHUNK.min(payload / per_row);
    let mut bytes = bytes_for_rows(catalog, generic, unique, rows);
    while rows > 0 && bytes > payload {
        rows -= 1;
        bytes = bytes_for_rows(catalog, generic, unique, rows);
    }
    assert!(
        rows > 0,
        "archetype signature does not fit a single row in the large block class"
    );
    (rows, bytes)
}

/// One archetype: signature, layout, chunks and graph edges.
pub struct Archetype {
    id: ArchetypeId,
    /// Sorted (ascending by component id) lists per kind.
    comps: [SmallVec<[ComponentMeta; 8]>; ComponentKind::COUNT],
    /// Column byte offsets within a chunk block, parallel to `comps`.
    offsets: [SmallVec<[u32; 8]>; ComponentKind::COUNT],
    lookup_hash: u64,
    matcher: [u64; ComponentKind::COUNT],
    props: ArchetypeProps,
    pub(crate) chunks: Vec<Chunk>,
    edges_add: [FxHashMap<ComponentId, ArchetypeId>; ComponentKind::COUNT],
    edges_del: [FxHashMap<ComponentId, ArchetypeId>; ComponentKind::COUNT],
    lifespan: u8,
    dead: bool,
}

impl Archetype {
    pub(crate) fn new(
        id: ArchetypeId,
        generic: SmallVec<[ComponentMeta; 8]>,
        unique: SmallVec<[ComponentMeta; 8]>,
        catalog: &ComponentCatalog,
    ) -> Self {
        for list in [&generic, &unique] {
            assert!(
                list.len() <= MAX_COMPONENTS,
                "archetype exceeds the {MAX_COMPONENTS}-component cap"
            );
            debug_assert!(
                list.windows(2).all(|w| w[0].id() < w[1].id()),
                "component list must be strictly ascending"
            );
        }

        // Solve against the large class first; if usage would leave most of a
        // large block idle, re-solve for the small class.
        let (mut rows, mut bytes) = solve_capacity(catalog, &generic, &unique, LARGE_BLOCK_BYTES);
        let mut size_class = SizeClass::Large;
        if bytes <= (SMALL_BLOCK_BYTES + LARGE_BLOCK_BYTES) / 2 {
            size_class = SizeClass::Small;
            (rows, bytes) = solve_capacity(catalog, &generic, &unique, SMALL_BLOCK_BYTES);
        }
        let props = ArchetypeProps {
            capacity: rows as u16,
            chunk_data_bytes: bytes as u32,
            size_class,
        };

        // Final column placement at the solved capacity.
        let mut offsets: [SmallVec<[u32; 8]>; 2] = [SmallVec::new(), SmallVec::new()];
        let mut cursor = std::mem::size_of::<Entity>() * rows;
        for meta in &generic {
            cursor = align_up(cursor, meta.alignment().max(1));
            offsets[ComponentKind::Generic.index()].push(cursor as u32);
            cursor += catalog.get(meta.id()).column_bytes(rows);
        }
        for meta in &unique {
            cursor = align_up(cursor, meta.alignment().max(1));
            offsets[ComponentKind::Unique.index()].push(cursor as u32);
            cursor += catalog.get(meta.id()).column_bytes(1);
        }

        let matcher = [
            calc_matcher(catalog, &generic),
            calc_matcher(catalog, &unique),
        ];
        let lookup_hash = calc_lookup_hash(catalog, &generic, &unique);

        Self {
            id,
            comps: [generic, unique],
            offsets,
            lookup_hash,
            matcher,
            props,
            chunks: Vec::new(),
            edges_add: [FxHashMap::default(), FxHashMap::default()],
            edges_del: [FxHashMap::default(), FxHashMap::default()],
            lifespan: 0,
            dead: false,
        }
    }

    // ========== Signature accessors ==========

    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    pub fn components(&self, kind: ComponentKind) -> &[ComponentMeta] {
        &self.comps[kind.index()]
    }

    pub fn matcher(&self, kind: ComponentKind) -> u64 {
        self.matcher[kind.index()]
    }

    pub fn lookup_hash(&self) -> u64 {
        self.lookup_hash
    }

    pub fn props(&self) -> ArchetypeProps {
        self.props
    }

    pub fn contains(&self, kind: ComponentKind, id: ComponentId) -> bool {
        self.comps[kind.index()]
            .binary_search_by_key(&id, |m| m.id())
            .is_ok()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn entity_count(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum()
    }

    // ========== Chunk management ==========

    pub(crate) fn create_chunk(&mut self, alloc: &mut ChunkAllocator) -> u32 {
        let data = alloc.alloc(self.props.chunk_data_bytes as usize);
        let idx = self.chunks.len() as u32;
        let generic: SmallVec<[(ComponentMeta, u32); 8]> = self.comps
            [ComponentKind::Generic.index()]
        .iter()
        .copied()
        .zip(self.offsets[ComponentKind::Generic.index()].iter().copied())
        .collect();
        let unique: SmallVec<[(ComponentMeta, u32); 8]> = self.comps
            [ComponentKind::Unique.index()]
        .iter()
        .copied()
        .zip(self.offsets[ComponentKind::Unique.index()].iter().copied())
        .collect();
        self.chunks.push(Chunk::new(
            data,
            self.props.size_class,
            self.props.capacity,
            idx,
            &generic,
            &unique,
        ));
        self.revive();
        idx
    }

    /// First chunk with free capacity accepted by `accept`, preferring
    /// partially-filled chunks; an entirely empty chunk is picked only when no
    /// partially-filled one qualifies.
    pub(crate) fn find_free_chunk<F: Fn(&Chunk) -> bool>(&self, accept: F) -> Option<u32> {
        let mut empty_fallback = None;
        for (idx, chunk) in self.chunks.iter().enumerate() {
            if chunk.is_full() || !accept(chunk) {
                continue;
            }
            if chunk.is_empty() {
                if empty_fallback.is_none() {
                    empty_fallback = Some(idx as u32);
                }
            } else {
                return Some(idx as u32);
            }
        }
        empty_fallback
    }

    /// Drop chunks whose lifespan ran out, compacting the chunk list. Returns
    /// relocations for entities of any chunk that changed index.
    pub(crate) fn sweep_dead_chunks(
        &mut self,
        catalog: &ComponentCatalog,
        alloc: &mut ChunkAllocator,
    ) -> Vec<EntityPatch> {
        let mut patches = Vec::new();
        let mut idx = 0;
        while idx < self.chunks.len() {
            if !self.chunks[idx].is_dead() {
                idx += 1;
                continue;
            }
            let mut chunk = self.chunks.swap_remove(idx);
            debug_assert!(chunk.is_empty());
            chunk.drop_contents(catalog);
            // SAFETY: the block came from this allocator when the chunk was
            // created and is freed exactly once here.
            unsafe { alloc.free(chunk.block_ptr()) };

            if idx < self.chunks.len() {
                let moved = &mut self.chunks[idx];
                moved.set_index_in_archetype(idx as u32);
                for row in 0..moved.len() {
                    patches.push(EntityPatch {
                        entity: moved.entity(row),
                        chunk_idx: idx as u32,
                        row: row as u32,
                    });
                }
            }
        }
        patches
    }

    // ========== Defragmentation ==========

    /// Compact rows toward the front of the chunk list, spending at most
    /// `budget` row moves. With Unique components, rows only move between
    /// chunks whose Unique values compare equal.
    pub(crate) fn defragment(
        &mut self,
        catalog: &ComponentCatalog,
        budget: &mut u32,
        world_version: u32,
    ) -> Vec<EntityPatch> {
        let mut patches = Vec::new();
        if self.chunks.len() < 2 {
            return patches;
        }
        let has_unique = !self.comps[ComponentKind::Unique.index()].is_empty();

        let mut front = 0usize;
        let mut back = self.chunks.len() - 1;
        while front < back && *budget > 0 {
            if self.chunks[front].is_full() {
                front += 1;
                continue;
            }
            if self.chunks[back].is_empty() {
                back -= 1;
                continue;
            }
            if has_unique && !self.chunks[front].unique_values_equal(&self.chunks[back], catalog) {
                front += 1;
                continue;
            }

            let (front_slice, back_slice) = self.chunks.split_at_mut(back);
            let front_chunk = &mut front_slice[front];
            let back_chunk = &mut back_slice[0];

            let src_row = back_chunk.len() - 1;
            // Enable first so the partition stays consistent through the move.
            let was_disabled = src_row < back_chunk.first_enabled();
            if was_disabled {
                for (entity, row) in back_chunk.enable_row(src_row, true, catalog) {
                    patches.push(EntityPatch {
                        entity,
                        chunk_idx: back as u32,
                        row,
                    });
                }
            }

            let entity = back_chunk.entity(src_row);
            let dst_row = front_chunk.add_row(entity, world_version);
            copy_row_between(back_chunk, src_row, front_chunk, dst_row as usize, catalog);
            let removed = back_chunk.remove_row(src_row, catalog, false, world_version);
            debug_assert!(removed.is_empty());

            patches.push(EntityPatch {
                entity,
                chunk_idx: front as u32,
                row: dst_row,
            });
            if was_disabled {
                for (entity, row) in front_chunk.enable_row(dst_row as usize, false, catalog) {
                    patches.push(EntityPatch {
                        entity,
                        chunk_idx: front as u32,
                        row,
                    });
                }
            }
            *budget -= 1;
        }
        patches
    }

    // ========== Graph edges ==========

    pub(crate) fn edge_add(&self, kind: ComponentKind, id: ComponentId) -> Option<ArchetypeId> {
        self.edges_add[kind.index()].get(&id).copied()
    }

    pub(crate) fn edge_del(&self, kind: ComponentKind, id: ComponentId) -> Option<ArchetypeId> {
        self.edges_del[kind.index()].get(&id).copied()
    }

    pub(crate) fn set_edge_add(&mut self, kind: ComponentKind, id: ComponentId, dst: ArchetypeId) {
        self.edges_add[kind.index()].insert(id, dst);
    }

    pub(crate) fn set_edge_del(&mut self, kind: ComponentKind, id: ComponentId, dst: ArchetypeId) {
        self.edges_del[kind.index()].insert(id, dst);
    }

    pub(crate) fn remove_edge_add(&mut self, kind: ComponentKind, id: ComponentId) {
        self.edges_add[kind.index()].remove(&id);
    }

    pub(crate) fn remove_edge_del(&mut self, kind: ComponentKind, id: ComponentId) {
        self.edges_del[kind.index()].remove(&id);
    }

    pub(crate) fn edges_add_entries(&self, kind: ComponentKind) -> Vec<(ComponentId, ArchetypeId)> {
        self.edges_add[kind.index()]
            .iter()
            .map(|(&c, &a)| (c, a))
            .collect()
    }

    pub(crate) fn edges_del_entries(&self, kind: ComponentKind) -> Vec<(ComponentId, ArchetypeId)> {
        self.edges_del[kind.index()]
            .iter()
            .map(|(&c, &a)| (c, a))
            .collect()
    }

    // ========== Lifecycle ==========

    pub(crate) fn start_dying(&mut self, lifespan: u8) {
        debug_assert!(self.chunks.is_empty());
        self.lifespan = lifespan;
        self.dead = false;
    }

    pub(crate) fn tick_lifespan(&mut self) -> bool {
        if self.lifespan > 0 {
            self.lifespan -= 1;
            if self.lifespan == 0 {
                self.dead = true;
            }
        }
        self.dead
    }

    fn revive(&mut self) {
        self.lifespan = 0;
        self.dead = false;
    }

    pub fn is_dying(&self) -> bool {
        self.lifespan > 0
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }
}

/// Byte-move one row between two chunks of the same archetype. Shared columns
/// only; the destination row's extra columns stay uninitialized for the
/// caller to fill.
pub(crate) fn copy_row_between(
    src: &Chunk,
    src_row: usize,
    dst: &mut Chunk,
    dst_row: usize,
    catalog: &ComponentCatalog,
) {
    let cols = src.columns(ComponentKind::Generic);
    for column in 0..cols.len() {
        let record = cols.record(column);
        debug_assert!(dst.has(ComponentKind::Generic, record.meta.id()));
        if record.meta.soa_arity() == 0 {
            // SAFETY: both pointers address distinct chunks' column storage.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.value_ptr(ComponentKind::Generic, column, src_row),
                    dst.value_ptr(ComponentKind::Generic, column, dst_row),
                    record.meta.size(),
                );
            }
        } else {
            let desc = catalog.get(record.meta.id());
            for member in 0..record.meta.soa_arity() {
                let member_size = desc.member_sizes.as_slice()[member] as usize;
                // SAFETY: as above, per sub-array.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.soa_member_ptr(catalog, column, member, src_row),
                        dst.soa_member_ptr(catalog, column, member, dst_row),
                        member_size,
                    );
                }
            }
        }
    }
}
