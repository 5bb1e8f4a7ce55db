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

//! The chunk: one fixed-size table of entity rows.
//!
//! A chunk owns one allocator block laid out as `[entity column | generic
//! columns | unique columns]`, with column offsets computed once by the owning
//! archetype. Rows `[0, first_enabled)` are disabled, `[first_enabled, count)`
//! are enabled. Each column has a version number stamped by mutable views and
//! structural changes; queries compare it against their last-run version.

use smallvec::SmallVec;

use crate::block::SizeClass;
use crate::component::{
    ComponentCatalog, ComponentId, ComponentKind, ComponentMeta, INVALID_COMPONENT,
};
use crate::config::MAX_COMPONENTS;
use crate::entity::Entity;
use crate::utils::version_changed;
use std::ptr::NonNull;

/// Row relocation performed by a structural chunk operation: the entity now
/// lives at the given row. The caller patches the directory.
pub(crate) type RowPatch = (Entity, u32);

#[derive(Clone, Copy)]
pub(crate) struct ColumnRecord {
    pub meta: ComponentMeta,
    pub offset: u32,
}

const EMPTY_RECORD: ColumnRecord = ColumnRecord {
    meta: ComponentMeta::empty(),
    offset: 0,
};

/// Per-kind column bookkeeping: a padded component-id array for bounded linear
/// search, per-column versions, and the column records.
pub(crate) struct KindColumns {
    len: u8,
    ids: [ComponentId; MAX_COMPONENTS],
    versions: [u32; MAX_COMPONENTS],
    records: [ColumnRecord; MAX_COMPONENTS],
}

impl KindColumns {
    fn new(columns: &[(ComponentMeta, u32)]) -> Self {
        assert!(columns.len() <= MAX_COMPONENTS);
        let mut ids = [INVALID_COMPONENT; MAX_COMPONENTS];
        let mut records = [EMPTY_RECORD; MAX_COMPONENTS];
        for (i, &(meta, offset)) in columns.iter().enumerate() {
            ids[i] = meta.id();
            records[i] = ColumnRecord { meta, offset };
        }
        Self {
            len: columns.len() as u8,
            ids,
            versions: [0; MAX_COMPONENTS],
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Padding never equals a live id, so the whole array can be scanned
    /// without a length branch.
    pub fn column_index(&self, id: ComponentId) -> Option<usize> {
        self.ids.iter().position(|&candidate| candidate == id)
    }

    pub fn record(&self, column: usize) -> &ColumnRecord {
        debug_assert!(column < self.len());
        &self.records[column]
    }
}

/// One fixed-capacity table of rows belonging to a single archetype.
pub struct Chunk {
    data: NonNull<u8>,
    size_class: SizeClass,
    capacity: u16,
    count: u16,
    first_enabled: u16,
    index_in_archetype: u32,
    lifespan: u8,
    dead: bool,
    lock_depth: u8,
    unique_init: bool,
    cols: [KindColumns; ComponentKind::COUNT],
}

// SAFETY: all stored component values are `Send + Sync` by the `Component`
// bound; the raw block pointer is uniquely owned by this chunk.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        data: NonNull<u8>,
        size_class: SizeClass,
        capacity: u16,
        index_in_archetype: u32,
        generic: &[(ComponentMeta, u32)],
        unique: &[(ComponentMeta, u32)],
    ) -> Self {
        Self {
            data,
            size_class,
            capacity,
            count: 0,
            first_enabled: 0,
            index_in_archetype,
            lifespan: 0,
            dead: false,
            lock_depth: 0,
            unique_init: false,
            cols: [KindColumns::new(generic), KindColumns::new(unique)],
        }
    }

    // ========== Header accessors ==========

    pub fn len(&self) -> usize {
        self.count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    pub fn enabled_count(&self) -> usize {
        (self.count - self.first_enabled) as usize
    }

    pub fn disabled_count(&self) -> usize {
        self.first_enabled as usize
    }

    pub fn first_enabled(&self) -> usize {
        self.first_enabled as usize
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    pub(crate) fn index_in_archetype(&self) -> u32 {
        self.index_in_archetype
    }

    pub(crate) fn set_index_in_archetype(&mut self, index: u32) {
        self.index_in_archetype = index;
    }

    pub(crate) fn block_ptr(&self) -> NonNull<u8> {
        self.data
    }

    pub(crate) fn data_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }

    // ========== Column lookup ==========

    pub(crate) fn columns(&self, kind: ComponentKind) -> &KindColumns {
        &self.cols[kind.index()]
    }

    pub fn has(&self, kind: ComponentKind, id: ComponentId) -> bool {
        self.cols[kind.index()].column_index(id).is_some()
    }

    pub fn column_index(&self, kind: ComponentKind, id: ComponentId) -> Option<usize> {
        self.cols[kind.index()].column_index(id)
    }

    pub fn version(&self, kind: ComponentKind, column: usize) -> u32 {
        self.cols[kind.index()].versions[column]
    }

    pub(crate) fn set_version(&mut self, kind: ComponentKind, column: usize, version: u32) {
        self.cols[kind.index()].versions[column] = version;
    }

    /// Wrap-aware change test for one column.
    pub fn changed(&self, kind: ComponentKind, column: usize, since: u32) -> bool {
        version_changed(self.version(kind, column), since)
    }

    fn stamp_generic_versions(&mut self, version: u32) {
        let cols = &mut self.cols[ComponentKind::Generic.index()];
        for v in cols.versions[..cols.len as usize].iter_mut() {
            *v = version;
        }
    }

    // ========== Raw column access ==========

    pub(crate) fn column_base(&self, kind: ComponentKind, column: usize) -> *mut u8 {
        let record = self.cols[kind.index()].record(column);
        // SAFETY: the offset was computed to lie inside this chunk's block.
        unsafe { self.data.as_ptr().add(record.offset as usize) }
    }

    /// Pointer to one AoS value. For Unique columns `row` must be 0.
    pub(crate) fn value_ptr(&self, kind: ComponentKind, column: usize, row: usize) -> *mut u8 {
        let record = self.cols[kind.index()].record(column);
        debug_assert_eq!(record.meta.soa_arity(), 0);
        debug_assert!(kind == ComponentKind::Generic || row == 0);
        // SAFETY: row is bounded by capacity and the column fits the block.
        unsafe {
            self.column_base(kind, column)
                .add(record.meta.size() * row)
        }
    }

    /// Pointer to one element of an SoA sub-array.
    pub(crate) fn soa_member_ptr(
        &self,
        catalog: &ComponentCatalog,
        column: usize,
        member: usize,
        row: usize,
    ) -> *mut u8 {
        let record = self.cols[ComponentKind::Generic.index()].record(column);
        let desc = catalog.get(record.meta.id());
        let member_size = desc.member_sizes.as_slice()[member] as usize;
        // SAFETY: member offsets were solved against this chunk's capacity.
        unsafe {
            self.column_base(ComponentKind::Generic, column)
                .add(desc.soa_member_offset(member, self.capacity as usize) + member_size * row)
        }
    }

    fn entity_ptr(&self, row: usize) -> *mut Entity {
        // SAFETY: the entity column occupies the block's first
        // `size_of::<Entity>() * capacity` bytes.
        unsafe { (self.data.as_ptr() as *mut Entity).add(row) }
    }

    pub fn entities(&self) -> &[Entity] {
        // SAFETY: rows [0, count) hold initialized entity handles.
        unsafe { std::slice::from_raw_parts(self.entity_ptr(0), self.count as usize) }
    }

    pub fn entity(&self, row: usize) -> Entity {
        debug_assert!(row < self.len());
        // SAFETY: bounds checked above.
        unsafe { *self.entity_ptr(row) }
    }

    // ========== Row operations ==========

    /// Append a row for `entity`. The caller writes the component values
    /// through the returned row's column pointers.
    pub(crate) fn add_row(&mut self, entity: Entity, world_version: u32) -> u32 {
        assert!(
            self.lock_depth == 0,
            "structural change on a locked chunk; use a command buffer"
        );
        debug_assert!(!self.is_full(), "add_row on a full chunk");
        let row = self.count as usize;
        // SAFETY: row < capacity, slot is unused.
        unsafe { self.entity_ptr(row).write(entity) };
        self.count += 1;
        self.stamp_generic_versions(world_version);
        self.revive();
        row as u32
    }

    /// Remove `row`, keeping the enabled/disabled partition intact by moving
    /// boundary rows into the holes. Returns the relocations performed.
    ///
    /// With `drop_values` unset the row's values are assumed to have been
    /// moved out already.
    pub(crate) fn remove_row(
        &mut self,
        row: usize,
        catalog: &ComponentCatalog,
        drop_values: bool,
        world_version: u32,
    ) -> SmallVec<[RowPatch; 2]> {
        assert!(
            self.lock_depth == 0,
            "structural change on a locked chunk; use a command buffer"
        );
        debug_assert!(row < self.len());

        if drop_values {
            self.drop_row_values(row, catalog);
        }

        let mut patches: SmallVec<[RowPatch; 2]> = SmallVec::new();
        let last = self.count as usize - 1;
        if row < self.first_enabled as usize {
            // Disabled row: pull the last disabled row in, then close the gap
            // at the partition boundary with the overall last row.
            let last_disabled = self.first_enabled as usize - 1;
            if row != last_disabled {
                self.move_row(last_disabled, row, catalog);
                patches.push((self.entity(row), row as u32));
            }
            if last_disabled != last {
                self.move_row(last, last_disabled, catalog);
                patches.push((self.entity(last_disabled), last_disabled as u32));
            }
            self.first_enabled -= 1;
        } else if row != last {
            self.move_row(last, row, catalog);
            patches.push((self.entity(row), row as u32));
        }

        self.count -= 1;
        self.stamp_generic_versions(world_version);
        patches
    }

    /// Swap two rows column by column (entity column included).
    pub(crate) fn swap_rows(
        &mut self,
        a: usize,
        b: usize,
        catalog: &ComponentCatalog,
    ) -> [RowPatch; 2] {
        debug_assert!(a < self.len() && b < self.len());
        if a != b {
            let cols = &self.cols[ComponentKind::Generic.index()];
            for column in 0..cols.len() {
                let record = cols.record(column);
                if record.meta.soa_arity() == 0 {
                    let size = record.meta.size();
                    // SAFETY: distinct rows of the same column never overlap.
                    unsafe {
                        std::ptr::swap_nonoverlapping(
                            self.value_ptr(ComponentKind::Generic, column, a),
                            self.value_ptr(ComponentKind::Generic, column, b),
                            size,
                        );
                    }
                } else {
                    let desc = catalog.get(record.meta.id());
                    for member in 0..record.meta.soa_arity() {
                        let member_size = desc.member_sizes.as_slice()[member] as usize;
                        // SAFETY: as above, per sub-array.
                        unsafe {
                            std::ptr::swap_nonoverlapping(
                                self.soa_member_ptr(catalog, column, member, a),
                                self.soa_member_ptr(catalog, column, member, b),
                                member_size,
                            );
                        }
                    }
                }
            }
            // SAFETY: both rows are in bounds.
            unsafe { std::ptr::swap(self.entity_ptr(a), self.entity_ptr(b)) };
        }
        [(self.entity(a), a as u32), (self.entity(b), b as u32)]
    }

    /// Move `row` across the enabled/disabled partition boundary. Returns the
    /// relocations performed (both swapped rows).
    pub(crate) fn enable_row(
        &mut self,
        row: usize,
        enabled: bool,
        catalog: &ComponentCatalog,
    ) -> [RowPatch; 2] {
        let patches = if enabled {
            debug_assert!(row < self.first_enabled as usize, "row already enabled");
            let target = self.first_enabled as usize - 1;
            let patches = self.swap_rows(row, target, catalog);
            self.first_enabled -= 1;
            patches
        } else {
            debug_assert!(row >= self.first_enabled as usize, "row already disabled");
            let target = self.first_enabled as usize;
            let patches = self.swap_rows(row, target, catalog);
            self.first_enabled += 1;
            patches
        };
        patches
    }

    /// Byte-move one row into another slot (destination holds no live values).
    fn move_row(&mut self, src: usize, dst: usize, catalog: &ComponentCatalog) {
        debug_assert!(src != dst);
        let cols = &self.cols[ComponentKind::Generic.index()];
        for column in 0..cols.len() {
            let record = cols.record(column);
            if record.meta.soa_arity() == 0 {
                // SAFETY: distinct rows never overlap; a Rust move is a byte
                // copy that leaves the source slot logically uninitialized.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.value_ptr(ComponentKind::Generic, column, src),
                        self.value_ptr(ComponentKind::Generic, column, dst),
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
                            self.soa_member_ptr(catalog, column, member, src),
                            self.soa_member_ptr(catalog, column, member, dst),
                            member_size,
                        );
                    }
                }
            }
        }
        // SAFETY: both rows are in bounds.
        unsafe { self.entity_ptr(dst).write(*self.entity_ptr(src)) };
    }

    fn drop_row_values(&mut self, row: usize, catalog: &ComponentCatalog) {
        let cols = &self.cols[ComponentKind::Generic.index()];
        // Destructors run in reverse column order.
        for column in (0..cols.len()).rev() {
            let record = cols.record(column);
            if let Some(drop_fn) = catalog.get(record.meta.id()).drop_fn {
                // SAFETY: the slot holds a live value; SoA columns never have
                // drop thunks.
                unsafe { drop_fn(self.value_ptr(ComponentKind::Generic, column, row)) };
            }
        }
    }

    // ========== Unique columns ==========

    pub(crate) fn unique_initialized(&self) -> bool {
        self.unique_init
    }

    pub(crate) fn set_unique_initialized(&mut self) {
        self.unique_init = true;
    }

    /// Compare this chunk's Unique values against another chunk's through the
    /// descriptors' equality thunks. Both chunks must belong to the same
    /// archetype.
    pub(crate) fn unique_values_equal(&self, other: &Chunk, catalog: &ComponentCatalog) -> bool {
        let cols = &self.cols[ComponentKind::Unique.index()];
        debug_assert_eq!(cols.len(), other.cols[ComponentKind::Unique.index()].len());
        if !self.unique_init || !other.unique_init {
            return false;
        }
        for column in 0..cols.len() {
            let record = cols.record(column);
            let eq_fn = catalog
                .get(record.meta.id())
                .eq_fn
                .expect("Unique component registered without equality");
            // SAFETY: both unique slots are initialized single values.
            let equal = unsafe {
                eq_fn(
                    self.value_ptr(ComponentKind::Unique, column, 0),
                    other.value_ptr(ComponentKind::Unique, column, 0),
                )
            };
            if !equal {
                return false;
            }
        }
        true
    }

    // ========== Structural lock ==========

    pub(crate) fn lock(&mut self) {
        assert!(self.lock_depth < u8::MAX);
        self.lock_depth += 1;
    }

    pub(crate) fn unlock(&mut self) {
        assert!(self.lock_depth > 0);
        self.lock_depth -= 1;
    }

    pub fn is_locked(&self) -> bool {
        self.lock_depth > 0
    }

    // ========== Lifecycle ==========

    pub(crate) fn start_dying(&mut self, lifespan: u8) {
        debug_assert!(self.is_empty());
        self.lifespan = lifespan;
        self.dead = false;
    }

    /// One world tick of the countdown. Returns true once the chunk dies.
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

    /// Drop all live values. The caller frees the block afterwards.
    pub(crate) fn drop_contents(&mut self, catalog: &ComponentCatalog) {
        for row in 0..self.len() {
            self.drop_row_values(row, catalog);
        }
        if self.unique_init {
            let cols = &self.cols[ComponentKind::Unique.index()];
            for column in (0..cols.len()).rev() {
                let record = cols.record(column);
                if let Some(drop_fn) = catalog.get(record.meta.id()).drop_fn {
                    // SAFETY: the unique slot holds a live value.
                    unsafe { drop_fn(self.value_ptr(ComponentKind::Unique, column, 0)) };
                }
            }
            self.unique_init = false;
        }
        self.count = 0;
        self.first_enabled = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::ChunkAllocator;
    use crate::component::ComponentCatalog;
    use crate::entity::Entity;
    use crate::utils::align_up;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    /// Hand-rolled single-column chunk: entity column then one Pos column.
    fn test_chunk(alloc: &mut ChunkAllocator, catalog: &mut ComponentCatalog) -> Chunk {
        let id = catalog.register::<Pos>();
        let meta = catalog.meta(id);
        let capacity = 8u16;
        let offset = align_up(std::mem::size_of::<Entity>() * capacity as usize, 4) as u32;
        let bytes = offset as usize + meta.size() * capacity as usize;
        let data = alloc.alloc(bytes);
        Chunk::new(
            data,
            SizeClass::Small,
            capacity,
            0,
            &[(meta, offset)],
            &[],
        )
    }

    fn write_pos(chunk: &Chunk, row: usize, value: Pos) {
        // SAFETY: row < capacity, column 0 is the Pos column.
        unsafe {
            (chunk.value_ptr(ComponentKind::Generic, 0, row) as *mut Pos).write(value);
        }
    }

    fn read_pos(chunk: &Chunk, row: usize) -> Pos {
        // SAFETY: the row holds a written Pos.
        unsafe { *(chunk.value_ptr(ComponentKind::Generic, 0, row) as *const Pos) }
    }

    #[test]
    fn test_add_and_remove_rows() {
        let mut alloc = ChunkAllocator::new();
        let mut catalog = ComponentCatalog::new();
        let mut chunk = test_chunk(&mut alloc, &mut catalog);

        for i in 0..4u32 {
            let row = chunk.add_row(Entity::new(i, 0), 1);
            assert_eq!(row, i);
            write_pos(&chunk, row as usize, Pos {
                x: i as f32,
                y: 0.0,
            });
        }
        assert_eq!(chunk.len(), 4);
        assert_eq!(chunk.enabled_count(), 4);

        // Removing row 1 swaps the last row in.
        let patches = chunk.remove_row(1, &catalog, true, 2);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0], (Entity::new(3, 0), 1));
        assert_eq!(chunk.len(), 3);
        assert_eq!(read_pos(&chunk, 1), Pos { x: 3.0, y: 0.0 });

        // Removing the last row needs no patch.
        let patches = chunk.remove_row(2, &catalog, true, 3);
        assert!(patches.is_empty());

        unsafe { alloc.free(chunk.block_ptr()) };
    }

    #[test]
    fn test_enable_disable_partition() {
        let mut alloc = ChunkAllocator::new();
        let mut catalog = ComponentCatalog::new();
        let mut chunk = test_chunk(&mut alloc, &mut catalog);

        for i in 0..6u32 {
            let row = chunk.add_row(Entity::new(i, 0), 1);
            write_pos(&chunk, row as usize, Pos {
                x: i as f32,
                y: 0.0,
            });
        }

        // Disable the rows holding entities 0 and 3.
        chunk.enable_row(0, false, &catalog);
        let row3 = chunk
            .entities()
            .iter()
            .position(|e| e.index() == 3)
            .unwrap();
        chunk.enable_row(row3, false, &catalog);

        assert_eq!(chunk.disabled_count(), 2);
        assert_eq!(chunk.enabled_count(), 4);
        for row in 0..chunk.first_enabled() {
            let e = chunk.entity(row);
            assert!(e.index() == 0 || e.index() == 3);
        }
        // Values traveled with their entities.
        for row in 0..chunk.len() {
            assert_eq!(read_pos(&chunk, row).x, chunk.entity(row).index() as f32);
        }

        // Re-enable everything.
        while chunk.first_enabled() > 0 {
            chunk.enable_row(0, true, &catalog);
        }
        assert_eq!(chunk.enabled_count(), 6);

        unsafe { alloc.free(chunk.block_ptr()) };
    }

    #[test]
    fn test_remove_disabled_row_keeps_partition() {
        let mut alloc = ChunkAllocator::new();
        let mut catalog = ComponentCatalog::new();
        let mut chunk = test_chunk(&mut alloc, &mut catalog);

        for i in 0..5u32 {
            chunk.add_row(Entity::new(i, 0), 1);
            write_pos(&chunk, i as usize, Pos {
                x: i as f32,
                y: 0.0,
            });
        }
        chunk.enable_row(0, false, &catalog);
        chunk.enable_row(1, false, &catalog);
        assert_eq!(chunk.disabled_count(), 2);

        // Remove the first disabled row.
        chunk.remove_row(0, &catalog, true, 2);
        assert_eq!(chunk.len(), 4);
        assert_eq!(chunk.disabled_count(), 1);
        // Partition invariant: disabled rows are a prefix.
        for row in 0..chunk.len() {
            let disabled = row < chunk.first_enabled();
            let e = chunk.entity(row);
            if disabled {
                assert!(e.index() == 0 || e.index() == 1);
            }
            assert_eq!(read_pos(&chunk, row).x, e.index() as f32);
        }

        unsafe { alloc.free(chunk.block_ptr()) };
    }

    #[test]
    fn test_version_stamping_and_changed() {
        let mut alloc = ChunkAllocator::new();
        let mut catalog = ComponentCatalog::new();
        let mut chunk = test_chunk(&mut alloc, &mut catalog);

        assert_eq!(chunk.version(ComponentKind::Generic, 0), 0);
        chunk.add_row(Entity::new(0, 0), 7);
        assert_eq!(chunk.version(ComponentKind::Generic, 0), 7);
        assert!(chunk.changed(ComponentKind::Generic, 0, 6));
        assert!(!chunk.changed(ComponentKind::Generic, 0, 7));
        // since == 0 always reports a change.
        assert!(chunk.changed(ComponentKind::Generic, 0, 0));

        unsafe { alloc.free(chunk.block_ptr()) };
    }

    #[test]
    #[should_panic(expected = "locked chunk")]
    fn test_structural_lock_blocks_add() {
        let mut alloc = ChunkAllocator::new();
        let mut catalog = ComponentCatalog::new();
        let mut chunk = test_chunk(&mut alloc, &mut catalog);
        chunk.lock();
        chunk.add_row(Entity::new(0, 0), 1);
    }

    #[test]
    fn test_dying_and_revive() {
        let mut alloc = ChunkAllocator::new();
        let mut catalog = ComponentCatalog::new();
        let mut chunk = test_chunk(&mut alloc, &mut catalog);

        chunk.start_dying(2);
        assert!(chunk.is_dying());
        assert!(!chunk.tick_lifespan());
        assert!(chunk.tick_lifespan());
        assert!(chunk.is_dead());

        // Adding a row fully resets the countdown.
        chunk.add_row(Entity::new(0, 0), 1);
        assert!(!chunk.is_dying());
        assert!(!chunk.is_dead());

        chunk.drop_contents(&catalog);
        unsafe { alloc.free(chunk.block_ptr()) };
    }

    #[test]
    fn test_drop_contents_runs_destructors() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut alloc = ChunkAllocator::new();
        let mut catalog = ComponentCatalog::new();
        let id = catalog.register::<Counted>();
        let meta = catalog.meta(id);
        let capacity = 4u16;
        let offset = align_up(std::mem::size_of::<Entity>() * capacity as usize, 1) as u32;
        let data = alloc.alloc(offset as usize + capacity as usize);
        let mut chunk = Chunk::new(data, SizeClass::Small, capacity, 0, &[(meta, offset)], &[]);

        for i in 0..3u32 {
            let row = chunk.add_row(Entity::new(i, 0), 1);
            // SAFETY: fresh slot for a ZST-sized-1 value.
            unsafe {
                (chunk.value_ptr(ComponentKind::Generic, 0, row as usize) as *mut Counted)
                    .write(Counted);
            }
        }
        chunk.drop_contents(&catalog);
        assert_eq!(DROPS.load(Ordering::SeqCst), 3);

        unsafe { alloc.free(chunk.block_ptr()) };
    }
}
