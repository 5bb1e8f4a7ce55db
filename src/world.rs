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

//! World: central entity and archetype storage.
//!
//! The world owns the component catalog, the block allocator, the archetype
//! graph, the entity directory, entity names and the query registry. All
//! mutation and iteration happen on the thread that owns the world; deferred
//! command buffers are the escape hatch for structural changes during
//! iteration.

use ahash::AHashMap;
use smallvec::SmallVec;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::{ArchetypeId, ROOT_ARCHETYPE};
use crate::block::ChunkAllocator;
use crate::chunk::Chunk;
use crate::component::{
    Bundle, Component, ComponentCatalog, ComponentId, ComponentKind, ComponentMeta, SoaComponent,
    MAX_BUNDLE_COMPONENTS,
};
use crate::config::{WorldConfig, ITER_BATCH_CHUNKS};
use crate::entity::{Entity, EntityDirectory, EntityName};
use crate::error::{EcsError, Result};
use crate::graph::ArchetypeGraph;
use crate::query::{Constraints, QueryBuilder, QueryCmd, QueryId, QueryRegistry, Rows};
use crate::utils::prefetch_read;

/// Storage totals for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct WorldStats {
    pub entities: usize,
    pub free_slots: usize,
    pub archetypes: usize,
    pub chunks: usize,
    pub allocator_pages: usize,
    pub queries: usize,
}

/// Central ECS world.
pub struct World {
    catalog: ComponentCatalog,
    allocator: ChunkAllocator,
    graph: ArchetypeGraph,
    directory: EntityDirectory,
    names: AHashMap<Box<str>, Entity>,
    queries: QueryRegistry,
    /// Change-detection counter. Starts at 1; 0 means "never observed".
    version: u32,
    config: WorldConfig,
    defrag_cursor: u32,
}

impl World {
    /// Create a new, empty world. The root (empty-signature) archetype exists
    /// from the start.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    pub fn with_config(config: WorldConfig) -> Self {
        let catalog = ComponentCatalog::new();
        let graph = ArchetypeGraph::new(&catalog);
        Self {
            catalog,
            allocator: ChunkAllocator::new(),
            graph,
            directory: EntityDirectory::new(),
            names: AHashMap::new(),
            queries: QueryRegistry::new(),
            version: 1,
            config,
            defrag_cursor: 0,
        }
    }

    pub fn config(&self) -> WorldConfig {
        self.config
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn bump_version(&mut self) -> u32 {
        self.version = self.version.wrapping_add(1);
        if self.version == 0 {
            self.version = 1;
        }
        self.version
    }

    pub fn catalog(&self) -> &ComponentCatalog {
        &self.catalog
    }

    pub(crate) fn catalog_mut(&mut self) -> &mut ComponentCatalog {
        &mut self.catalog
    }

    // ========== Registration passthroughs ==========

    pub fn register_component<T: Component>(&mut self) -> ComponentId {
        self.catalog.register::<T>()
    }

    pub fn register_soa_component<T: SoaComponent>(&mut self) -> ComponentId {
        self.catalog.register_soa::<T>()
    }

    pub fn register_clonable<T: Component + Clone>(&mut self) -> ComponentId {
        self.catalog.register_clonable::<T>()
    }

    pub fn register_default<T: Component + Default>(&mut self) -> ComponentId {
        self.catalog.register_default::<T>()
    }

    // ========== Entity creation ==========

    /// Create an empty entity in the root archetype.
    pub fn add(&mut self) -> Entity {
        let entity = self.directory.alloc();
        let (chunk_idx, row) = self.place_new(entity, ROOT_ARCHETYPE, &[]);
        self.finish_record(entity, ROOT_ARCHETYPE, chunk_idx, row);
        entity
    }

    /// Spawn a new entity with the given bundle of components.
    pub fn spawn<B: Bundle>(&mut self, bundle: B) -> Entity {
        let ids = B::component_ids(&mut self.catalog);
        #[cfg(feature = "profiling")]
        let span = info_span!(
            "world.spawn",
            bundle_components = ids.len(),
            archetype_count = self.graph.live_count()
        );
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let arch_id = self.bundle_archetype(&ids);
        self.spawn_into(arch_id, &ids, bundle)
    }

    /// Spawn many entities sharing one bundle type, amortizing the archetype
    /// lookup over the batch.
    pub fn spawn_batch<B, I>(&mut self, bundles: I) -> Result<Vec<Entity>>
    where
        B: Bundle,
        I: IntoIterator<Item = B>,
        I::IntoIter: ExactSizeIterator,
    {
        let bundles = bundles.into_iter();
        if bundles.len() > 10_000_000 {
            return Err(EcsError::BatchTooLarge);
        }
        let ids = B::component_ids(&mut self.catalog);
        let arch_id = self.bundle_archetype(&ids);
        let mut entities = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            entities.push(self.spawn_into(arch_id, &ids, bundle));
        }
        Ok(entities)
    }

    /// Create an entity in the same archetype as `src`, duplicating its
    /// component values. Non-trivial components must have been registered via
    /// [`Self::register_clonable`].
    pub fn add_from_entity(&mut self, src: Entity) -> Result<Entity> {
        let (src_arch, src_chunk, _src_row) = self.locate(src)?;

        let expected = self.unique_values_of(src_arch, src_chunk);
        let entity = self.directory.alloc();
        let (chunk_idx, row) = self.place_new(entity, src_arch, &expected);

        // Re-resolve the source row: placement may have relocated nothing in
        // the source chunk, but the lookup is cheap and keeps this correct if
        // that ever changes.
        let (_, src_chunk, src_row) = self.locate(src)?;
        let arch = self.graph.expect(src_arch);
        let sc = &arch.chunks[src_chunk as usize];
        let dc = &arch.chunks[chunk_idx as usize];
        duplicate_row(sc, src_row as usize, dc, row as usize, &self.catalog);

        self.finish_record(entity, src_arch, chunk_idx, row);
        Ok(entity)
    }

    /// Create an entity directly in an archetype, default-constructing every
    /// component. Components without a default thunk must be trivial (they
    /// are zero-initialized); the archetype must have no Unique components.
    pub fn add_from_archetype(&mut self, arch_id: ArchetypeId) -> Result<Entity> {
        let arch = self.graph.get(arch_id).ok_or(EcsError::ArchetypeNotFound)?;
        assert!(
            arch.components(ComponentKind::Unique).is_empty(),
            "cannot create from an archetype with Unique components"
        );

        let entity = self.directory.alloc();
        let (chunk_idx, row) = self.place_new(entity, arch_id, &[]);

        let arch = self.graph.expect(arch_id);
        let chunk = &arch.chunks[chunk_idx as usize];
        let cols = chunk.columns(ComponentKind::Generic);
        for column in 0..cols.len() {
            let meta = cols.record(column).meta;
            let desc = self.catalog.get(meta.id());
            if let Some(default_fn) = desc.default_fn {
                debug_assert_eq!(meta.soa_arity(), 0);
                // SAFETY: fresh row slot of the right layout.
                unsafe {
                    default_fn(chunk.value_ptr(ComponentKind::Generic, column, row as usize))
                };
            } else {
                assert!(
                    desc.drop_fn.is_none(),
                    "{} needs register_default to be created from an archetype",
                    desc.name
                );
                zero_column_value(chunk, column, row as usize, &self.catalog);
            }
        }

        self.finish_record(entity, arch_id, chunk_idx, row);
        Ok(entity)
    }

    fn bundle_archetype(&mut self, ids: &[ComponentId]) -> ArchetypeId {
        let mut metas: SmallVec<[ComponentMeta; 8]> =
            ids.iter().map(|&id| self.catalog.meta(id)).collect();
        for meta in &metas {
            assert!(
                meta.soa_arity() == 0,
                "{} is SoA and cannot be written through a bundle; use add_soa_component",
                self.catalog.get(meta.id()).name
            );
        }
        metas.sort_by_key(|m| m.id());
        assert!(
            metas.windows(2).all(|w| w[0].id() != w[1].id()),
            "duplicate component in bundle"
        );
        self.graph.find_or_create(&self.catalog, metas, SmallVec::new())
    }

    fn spawn_into<B: Bundle>(&mut self, arch_id: ArchetypeId, ids: &[ComponentId], bundle: B) -> Entity {
        let entity = self.directory.alloc();
        let (chunk_idx, row) = self.place_new(entity, arch_id, &[]);

        let mut ptrs = [std::ptr::null_mut(); MAX_BUNDLE_COMPONENTS];
        {
            let arch = self.graph.expect(arch_id);
            let chunk = &arch.chunks[chunk_idx as usize];
            for (i, &id) in ids.iter().enumerate() {
                let column = chunk
                    .column_index(ComponentKind::Generic, id)
                    .expect("bundle component has a column");
                ptrs[i] = chunk.value_ptr(ComponentKind::Generic, column, row as usize);
            }
        }
        // SAFETY: each pointer addresses the fresh row's column slot.
        unsafe { bundle.write_components(&ptrs[..ids.len()]) };

        self.finish_record(entity, arch_id, chunk_idx, row);
        entity
    }

    /// Pick or create a chunk and append a row for a brand-new entity.
    fn place_new(
        &mut self,
        entity: Entity,
        arch_id: ArchetypeId,
        expected_uniques: &[(ComponentId, *const u8)],
    ) -> (u32, u32) {
        let version = self.bump_version();
        let chunk_idx = select_chunk(
            &mut self.graph,
            &mut self.allocator,
            &self.catalog,
            arch_id,
            expected_uniques,
        );
        let arch = self.graph.expect_mut(arch_id);
        let row = arch.chunks[chunk_idx as usize].add_row(entity, version);
        (chunk_idx, row)
    }

    fn finish_record(&mut self, entity: Entity, arch: ArchetypeId, chunk_idx: u32, row: u32) {
        let rec = self.directory.record_mut(entity);
        rec.archetype = arch;
        rec.chunk_idx = chunk_idx;
        rec.index_in_chunk = row;
        rec.disabled = false;
    }

    // ========== Entity destruction and liveness ==========

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.directory.is_live(entity)
    }

    /// Destroy an entity, dropping its component values and recycling its
    /// slot with a new generation.
    pub fn despawn(&mut self, entity: Entity) -> Result<()> {
        let (arch_id, chunk_idx, row) = self.locate(entity)?;
        let version = self.bump_version();

        let patches = {
            let arch = self.graph.expect_mut(arch_id);
            let chunk = &mut arch.chunks[chunk_idx as usize];
            let patches = chunk.remove_row(row as usize, &self.catalog, true, version);
            if chunk.is_empty() {
                chunk.start_dying(self.config.chunk_lifespan);
            }
            patches
        };
        for (moved, new_row) in patches {
            self.directory.record_mut(moved).index_in_chunk = new_row;
        }
        if let Some(name) = self.directory.free(entity) {
            self.names.remove(name.as_str());
        }
        Ok(())
    }

    fn locate(&self, entity: Entity) -> Result<(ArchetypeId, u32, u32)> {
        let rec = self
            .directory
            .resolve(entity)
            .ok_or(EcsError::EntityNotFound)?;
        Ok((rec.archetype, rec.chunk_idx, rec.index_in_chunk))
    }

    // ========== Component access ==========

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        let Ok((arch_id, _, _)) = self.locate(entity) else {
            return false;
        };
        self.catalog.lookup_of::<T>().is_some_and(|id| {
            self.graph
                .get(arch_id)
                .is_some_and(|arch| arch.contains(ComponentKind::Generic, id))
        })
    }

    /// Read one component value. SoA components are only reachable through
    /// query views.
    pub fn get_component<T: Component>(&self, entity: Entity) -> Option<&T> {
        let rec = self.directory.resolve(entity)?;
        let id = self.catalog.lookup_of::<T>()?;
        if self.catalog.meta(id).soa_arity() != 0 {
            return None;
        }
        let arch = self.graph.get(rec.archetype)?;
        let chunk = arch.chunks.get(rec.chunk_idx as usize)?;
        let column = chunk.column_index(ComponentKind::Generic, id)?;
        // SAFETY: the directory says this row holds a live value of T.
        unsafe {
            Some(
                &*(chunk.value_ptr(ComponentKind::Generic, column, rec.index_in_chunk as usize)
                    as *const T),
            )
        }
    }

    /// Mutable access to one component value; stamps the column version for
    /// change detection.
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let (arch_id, chunk_idx, row) = self.locate(entity).ok()?;
        let id = self.catalog.lookup_of::<T>()?;
        if self.catalog.meta(id).soa_arity() != 0 {
            return None;
        }
        let version = self.bump_version();
        let arch = self.graph.get_mut(arch_id)?;
        let chunk = arch.chunks.get_mut(chunk_idx as usize)?;
        let column = chunk.column_index(ComponentKind::Generic, id)?;
        chunk.set_version(ComponentKind::Generic, column, version);
        // SAFETY: as in get_component; &mut self gives exclusivity.
        unsafe {
            Some(&mut *(chunk.value_ptr(ComponentKind::Generic, column, row as usize) as *mut T))
        }
    }

    /// Add a component, moving the entity along the archetype graph's add
    /// edge. Adding a component that is already present is a programming
    /// error and panics with the entity's current component list.
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        let id = self.catalog.register::<T>();
        let result = self.add_component_raw(entity, id, &value as *const T as *const u8);
        if result.is_ok() {
            // Ownership moved into the chunk.
            std::mem::forget(value);
        }
        result
    }

    /// Add `T::default()`.
    pub fn add_default<T: Component + Default>(&mut self, entity: Entity) -> Result<()> {
        self.add_component(entity, T::default())
    }

    /// Add a structure-of-arrays component, scattering the value into its
    /// member sub-arrays.
    pub fn add_soa_component<T: SoaComponent>(&mut self, entity: Entity, value: T) -> Result<()> {
        let id = self.catalog.register_soa::<T>();
        self.add_component_raw(entity, id, &value as *const T as *const u8)
        // T: Copy, nothing to forget.
    }

    pub(crate) fn add_component_raw(
        &mut self,
        entity: Entity,
        comp: ComponentId,
        src: *const u8,
    ) -> Result<()> {
        let (src_arch, _, _) = self.locate(entity)?;
        if self.graph.expect(src_arch).contains(ComponentKind::Generic, comp) {
            panic!(
                "component {} is already present on {:?}; current components: [{}]",
                self.catalog.get(comp).name,
                entity,
                self.component_names(src_arch)
            );
        }
        let meta = self.catalog.meta(comp);
        let dst = self
            .graph
            .with_component(&self.catalog, src_arch, ComponentKind::Generic, meta);
        let (chunk_idx, row) = self.move_entity(entity, dst, None)?;

        let version = self.version;
        let arch = self.graph.expect_mut(dst);
        let chunk = &mut arch.chunks[chunk_idx as usize];
        let column = chunk
            .column_index(ComponentKind::Generic, comp)
            .expect("destination has the added column");
        write_value_bytes(chunk, column, row as usize, src, &self.catalog);
        chunk.set_version(ComponentKind::Generic, column, version);
        Ok(())
    }

    pub(crate) fn set_component_raw(
        &mut self,
        entity: Entity,
        comp: ComponentId,
        src: *const u8,
    ) -> Result<()> {
        let (arch_id, chunk_idx, row) = self.locate(entity)?;
        let version = self.bump_version();
        let arch = self.graph.expect_mut(arch_id);
        let chunk = &mut arch.chunks[chunk_idx as usize];
        let column = chunk
            .column_index(ComponentKind::Generic, comp)
            .ok_or(EcsError::ComponentNotFound)?;
        let meta = chunk.columns(ComponentKind::Generic).record(column).meta;
        if meta.soa_arity() == 0 {
            if let Some(drop_fn) = self.catalog.get(comp).drop_fn {
                // SAFETY: the slot holds the value being replaced.
                unsafe { drop_fn(chunk.value_ptr(ComponentKind::Generic, column, row as usize)) };
            }
        }
        write_value_bytes(chunk, column, row as usize, src, &self.catalog);
        chunk.set_version(ComponentKind::Generic, column, version);
        Ok(())
    }

    /// Overwrite an existing component value (drops the old one).
    pub fn set_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        if !self.is_alive(entity) {
            return Err(EcsError::EntityNotFound);
        }
        match self.get_component_mut::<T>(entity) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(EcsError::ComponentNotFound),
        }
    }

    /// Remove a component, moving the entity along the remove edge. The
    /// removed value is dropped.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        let id = self
            .catalog
            .lookup_of::<T>()
            .ok_or(EcsError::ComponentNotFound)?;
        self.remove_component_raw(entity, id)
    }

    pub(crate) fn remove_component_raw(&mut self, entity: Entity, comp: ComponentId) -> Result<()> {
        let (src_arch, _, _) = self.locate(entity)?;
        if !self.graph.expect(src_arch).contains(ComponentKind::Generic, comp) {
            return Err(EcsError::ComponentNotFound);
        }
        let dst =
            self.graph
                .without_component(&self.catalog, src_arch, ComponentKind::Generic, comp);
        self.move_entity(entity, dst, None).map(|_| ())
    }

    fn component_names(&self, arch_id: ArchetypeId) -> String {
        let arch = self.graph.expect(arch_id);
        let mut names: Vec<&str> = Vec::new();
        for kind in [ComponentKind::Generic, ComponentKind::Unique] {
            names.extend(
                arch.components(kind)
                    .iter()
                    .map(|m| self.catalog.get(m.id()).name),
            );
        }
        names.join(", ")
    }

    // ========== Unique (per-chunk) components ==========

    /// Attach a Unique component. The entity moves to the archetype with `T`
    /// in its Unique list and lands in a chunk whose Unique values equal the
    /// provided one.
    pub fn add_unique<T: Component + Clone + PartialEq>(
        &mut self,
        entity: Entity,
        value: T,
    ) -> Result<()> {
        let id = self.catalog.register_unique::<T>();
        let (src_arch, _, _) = self.locate(entity)?;
        if self.graph.expect(src_arch).contains(ComponentKind::Unique, id) {
            panic!(
                "unique component {} is already present on {:?}; current components: [{}]",
                self.catalog.get(id).name,
                entity,
                self.component_names(src_arch)
            );
        }
        let meta = self.catalog.meta(id);
        let dst = self
            .graph
            .with_component(&self.catalog, src_arch, ComponentKind::Unique, meta);
        self.move_entity(entity, dst, Some((id, &value as *const T as *const u8)))?;
        // The chunk holds a clone; `value` drops here.
        Ok(())
    }

    /// Read the Unique value shared by the entity's chunk.
    pub fn get_unique<T: Component>(&self, entity: Entity) -> Option<&T> {
        let rec = self.directory.resolve(entity)?;
        let id = self.catalog.lookup_of::<T>()?;
        let arch = self.graph.get(rec.archetype)?;
        let chunk = arch.chunks.get(rec.chunk_idx as usize)?;
        let column = chunk.column_index(ComponentKind::Unique, id)?;
        if !chunk.unique_initialized() {
            return None;
        }
        // SAFETY: initialized unique slot of type T.
        unsafe { Some(&*(chunk.value_ptr(ComponentKind::Unique, column, 0) as *const T)) }
    }

    /// Detach a Unique component; the chunk-side value stays with the chunk.
    pub fn remove_unique<T: Component>(&mut self, entity: Entity) -> Result<()> {
        let id = self
            .catalog
            .lookup_of::<T>()
            .ok_or(EcsError::ComponentNotFound)?;
        let (src_arch, _, _) = self.locate(entity)?;
        if !self.graph.expect(src_arch).contains(ComponentKind::Unique, id) {
            return Err(EcsError::ComponentNotFound);
        }
        let dst =
            self.graph
                .without_component(&self.catalog, src_arch, ComponentKind::Unique, id);
        self.move_entity(entity, dst, None).map(|_| ())
    }

    // ========== Enable / disable ==========

    pub fn is_enabled(&self, entity: Entity) -> bool {
        self.directory
            .resolve(entity)
            .is_some_and(|rec| !rec.disabled)
    }

    /// Move the entity across its chunk's enabled/disabled partition.
    /// Already being in the requested state is a no-op.
    pub fn enable(&mut self, entity: Entity, enabled: bool) -> Result<()> {
        let rec = self
            .directory
            .resolve(entity)
            .ok_or(EcsError::EntityNotFound)?;
        if rec.disabled == !enabled {
            return Ok(());
        }
        let (arch_id, chunk_idx, row) = (rec.archetype, rec.chunk_idx, rec.index_in_chunk);
        self.bump_version();

        let patches = {
            let arch = self.graph.expect_mut(arch_id);
            arch.chunks[chunk_idx as usize].enable_row(row as usize, enabled, &self.catalog)
        };
        for (moved, new_row) in patches {
            self.directory.record_mut(moved).index_in_chunk = new_row;
        }
        self.directory.record_mut(entity).disabled = !enabled;
        Ok(())
    }

    // ========== Entity names ==========

    /// Assign a world-owned name. Re-assigning an entity its current name is
    /// a no-op; a name held by another entity is rejected.
    pub fn set_name(&mut self, entity: Entity, name: &str) -> Result<()> {
        self.set_name_inner(entity, EntityName::Owned(name.into()))
    }

    /// Assign a caller-owned name with static lifetime.
    pub fn set_name_static(&mut self, entity: Entity, name: &'static str) -> Result<()> {
        self.set_name_inner(entity, EntityName::Static(name))
    }

    fn set_name_inner(&mut self, entity: Entity, name: EntityName) -> Result<()> {
        if !self.directory.is_live(entity) {
            return Err(EcsError::EntityNotFound);
        }
        if let Some(&owner) = self.names.get(name.as_str()) {
            if owner == entity {
                return Ok(());
            }
            return Err(EcsError::NameTaken(name.as_str().to_string()));
        }
        let rec = self.directory.record_mut(entity);
        if let Some(old) = rec.name.take() {
            self.names.remove(old.as_str());
        }
        self.names.insert(name.as_str().into(), entity);
        self.directory.record_mut(entity).name = Some(name);
        Ok(())
    }

    pub fn name(&self, entity: Entity) -> Option<&str> {
        self.directory
            .resolve(entity)?
            .name
            .as_ref()
            .map(EntityName::as_str)
    }

    pub fn entity_by_name(&self, name: &str) -> Option<Entity> {
        self.names.get(name).copied()
    }

    // ========== Queries ==========

    /// Start building a query.
    pub fn query(&mut self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    pub(crate) fn intern_query(&mut self, cmds: Vec<QueryCmd>) -> QueryId {
        self.queries.intern(&cmds, &self.catalog)
    }

    /// Iterate enabled rows of every matching chunk.
    pub fn each<F>(&mut self, query: QueryId, f: F)
    where
        F: FnMut(&mut Rows),
    {
        self.each_with(query, Constraints::EnabledOnly, f);
    }

    /// Iterate matching chunks under an explicit row-range constraint.
    ///
    /// Chunks are visited in archetype-cache order, then chunk-list order, in
    /// prefetch batches; each chunk's structural lock is held around the
    /// callback.
    pub fn each_with<F>(&mut self, query: QueryId, constraints: Constraints, mut f: F)
    where
        F: FnMut(&mut Rows),
    {
        let version = self.bump_version();
        #[cfg(feature = "profiling")]
        let span = info_span!("world.each", query, world_version = version);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let plan = &mut self.queries.plans[query as usize];
        plan.update_matches(&self.graph);

        for m in 0..plan.matched.len() {
            let aid = plan.matched[m];
            let Some(arch) = self.graph.get_mut(aid) else {
                continue;
            };
            for ci in 0..arch.chunks.len() {
                if ci % ITER_BATCH_CHUNKS == 0 {
                    if let Some(next) = arch.chunks.get(ci + ITER_BATCH_CHUNKS) {
                        prefetch_read(next.data_ptr());
                    }
                }
                let chunk = &arch.chunks[ci];
                if chunk.is_empty() || !plan.chunk_passes_filters(chunk) {
                    continue;
                }
                let (start, end) = match constraints {
                    Constraints::EnabledOnly => {
                        (chunk.first_enabled() as u32, chunk.len() as u32)
                    }
                    Constraints::DisabledOnly => (0, chunk.first_enabled() as u32),
                    Constraints::All => (0, chunk.len() as u32),
                };
                if start >= end {
                    continue;
                }

                arch.chunks[ci].lock();
                {
                    let chunk = &mut arch.chunks[ci];
                    let mut rows = Rows::new(chunk, start, end, &self.catalog, version);
                    f(&mut rows);
                }
                arch.chunks[ci].unlock();
            }
        }
        self.queries.plans[query as usize].last_version = version;
    }

    /// Enabled rows currently matched by the query (change filters ignored).
    pub fn count(&mut self, query: QueryId) -> usize {
        let plan = &mut self.queries.plans[query as usize];
        plan.update_matches(&self.graph);
        plan.matched
            .iter()
            .filter_map(|&aid| self.graph.get(aid))
            .map(|arch| arch.chunks.iter().map(Chunk::enabled_count).sum::<usize>())
            .sum()
    }

    pub fn query_is_empty(&mut self, query: QueryId) -> bool {
        self.count(query) == 0
    }

    // ========== World tick ==========

    /// Advance lifespan countdowns, reclaim dead chunks and archetypes, and
    /// run budgeted defragmentation.
    pub fn update(&mut self) {
        #[cfg(feature = "profiling")]
        let span = info_span!("world.update", archetypes = self.graph.live_count());
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let ids = self.graph.live_ids();
        for aid in ids {
            let patches = {
                let arch = self.graph.expect_mut(aid);
                for chunk in &mut arch.chunks {
                    if chunk.is_empty() {
                        if chunk.is_dying() || chunk.is_dead() {
                            chunk.tick_lifespan();
                        } else {
                            chunk.start_dying(self.config.chunk_lifespan);
                        }
                    }
                }
                arch.sweep_dead_chunks(&self.catalog, &mut self.allocator)
            };
            for patch in patches {
                let rec = self.directory.record_mut(patch.entity);
                rec.chunk_idx = patch.chunk_idx;
                rec.index_in_chunk = patch.row;
            }

            let mut destroy = false;
            {
                let arch = self.graph.expect_mut(aid);
                if arch.chunk_count() == 0 && aid != ROOT_ARCHETYPE {
                    if arch.is_dying() || arch.is_dead() {
                        destroy = arch.tick_lifespan();
                    } else {
                        arch.start_dying(self.config.archetype_lifespan);
                    }
                }
            }
            if destroy {
                let removals = self.graph.destroy(aid);
                self.queries.on_archetype_destroyed(aid, &removals);
            }
        }

        self.run_defrag();
    }

    /// Budgeted two-cursor compaction, resuming from the archetype where the
    /// previous tick ran out.
    fn run_defrag(&mut self) {
        let arena_len = self.graph.arena_len() as u32;
        if arena_len == 0 {
            return;
        }
        let mut budget = self.config.defrag_rows_per_tick;
        let version = self.bump_version();
        let mut offset = 0u32;
        while budget > 0 && offset < arena_len {
            let aid = (self.defrag_cursor + offset) % arena_len;
            if let Some(arch) = self.graph.get_mut(aid) {
                let patches = arch.defragment(&self.catalog, &mut budget, version);
                for patch in patches {
                    let rec = self.directory.record_mut(patch.entity);
                    rec.chunk_idx = patch.chunk_idx;
                    rec.index_in_chunk = patch.row;
                }
            }
            offset += 1;
        }
        let advanced = if budget == 0 { offset.saturating_sub(1) } else { offset };
        self.defrag_cursor = (self.defrag_cursor + advanced) % arena_len;
    }

    // ========== Structural moves ==========

    /// Move an entity to another archetype, carrying shared column values and
    /// dropping values whose columns the destination lacks. Returns the new
    /// (chunk, row).
    fn move_entity(
        &mut self,
        entity: Entity,
        dst_arch: ArchetypeId,
        extra_unique: Option<(ComponentId, *const u8)>,
    ) -> Result<(u32, u32)> {
        let rec = self
            .directory
            .resolve(entity)
            .ok_or(EcsError::EntityNotFound)?;
        let (src_arch, src_chunk_idx, src_row, disabled) = (
            rec.archetype,
            rec.chunk_idx,
            rec.index_in_chunk,
            rec.disabled,
        );
        if src_arch == dst_arch {
            return Ok((src_chunk_idx, src_row));
        }
        let version = self.bump_version();

        // Destination chunk: Unique values must match the source chunk's
        // (plus the one being added, if any).
        let dst_chunk_idx = {
            let mut expected: SmallVec<[(ComponentId, *const u8); 8]> = SmallVec::new();
            let dst_unique_ids: SmallVec<[ComponentId; 8]> = self
                .graph
                .expect(dst_arch)
                .components(ComponentKind::Unique)
                .iter()
                .map(|m| m.id())
                .collect();
            if !dst_unique_ids.is_empty() {
                let src = self.graph.expect(src_arch);
                let schunk = &src.chunks[src_chunk_idx as usize];
                for id in dst_unique_ids {
                    let ptr = match extra_unique {
                        Some((xid, xptr)) if xid == id => xptr,
                        _ => {
                            let column = schunk
                                .column_index(ComponentKind::Unique, id)
                                .expect("source chunk carries the unique value");
                            schunk.value_ptr(ComponentKind::Unique, column, 0) as *const u8
                        }
                    };
                    expected.push((id, ptr));
                }
            }
            select_chunk(
                &mut self.graph,
                &mut self.allocator,
                &self.catalog,
                dst_arch,
                &expected,
            )
        };

        let mut final_row;
        let (patches, extra_patches) = {
            let (src_a, dst_a) = self.graph.get_two_mut(src_arch, dst_arch);
            let dst_chunk = &mut dst_a.chunks[dst_chunk_idx as usize];
            let dst_row = dst_chunk.add_row(entity, version);
            final_row = dst_row;

            let src_chunk = &mut src_a.chunks[src_chunk_idx as usize];
            transfer_row(
                src_chunk,
                src_row as usize,
                dst_chunk,
                dst_row as usize,
                &self.catalog,
            );
            let patches = src_chunk.remove_row(src_row as usize, &self.catalog, false, version);
            if src_chunk.is_empty() {
                src_chunk.start_dying(self.config.chunk_lifespan);
            }

            // A disabled entity stays disabled at its destination.
            let mut extra: SmallVec<[(Entity, u32); 2]> = SmallVec::new();
            if disabled {
                for (moved, row) in dst_chunk.enable_row(dst_row as usize, false, &self.catalog) {
                    if moved == entity {
                        final_row = row;
                    }
                    extra.push((moved, row));
                }
            }
            (patches, extra)
        };

        for (moved, new_row) in patches {
            self.directory.record_mut(moved).index_in_chunk = new_row;
        }
        for (moved, new_row) in extra_patches {
            if moved != entity {
                self.directory.record_mut(moved).index_in_chunk = new_row;
            }
        }
        let rec = self.directory.record_mut(entity);
        rec.archetype = dst_arch;
        rec.chunk_idx = dst_chunk_idx;
        rec.index_in_chunk = final_row;
        Ok((dst_chunk_idx, final_row))
    }

    /// Raw pointers to the Unique values of one chunk, in that archetype's
    /// Unique list order.
    fn unique_values_of(
        &self,
        arch_id: ArchetypeId,
        chunk_idx: u32,
    ) -> SmallVec<[(ComponentId, *const u8); 8]> {
        let arch = self.graph.expect(arch_id);
        let chunk = &arch.chunks[chunk_idx as usize];
        arch.components(ComponentKind::Unique)
            .iter()
            .map(|meta| {
                let column = chunk
                    .column_index(ComponentKind::Unique, meta.id())
                    .expect("unique column");
                (
                    meta.id(),
                    chunk.value_ptr(ComponentKind::Unique, column, 0) as *const u8,
                )
            })
            .collect()
    }

    // ========== Diagnostics ==========

    pub fn entity_count(&self) -> usize {
        self.directory.live_count()
    }

    pub fn archetype_count(&self) -> usize {
        self.graph.live_count()
    }

    pub fn chunk_count(&self) -> usize {
        self.graph.iter_live().map(|a| a.chunk_count()).sum()
    }

    pub fn archetype_of(&self, entity: Entity) -> Option<ArchetypeId> {
        Some(self.directory.resolve(entity)?.archetype)
    }

    pub fn graph(&self) -> &ArchetypeGraph {
        &self.graph
    }

    pub fn stats(&self) -> WorldStats {
        WorldStats {
            entities: self.directory.live_count(),
            free_slots: self.directory.free_list_len(),
            archetypes: self.graph.live_count(),
            chunks: self.chunk_count(),
            allocator_pages: self.allocator.page_count(),
            queries: self.queries.len(),
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for World {
    fn drop(&mut self) {
        for aid in self.graph.live_ids() {
            let arch = self.graph.expect_mut(aid);
            for chunk in &mut arch.chunks {
                chunk.drop_contents(&self.catalog);
                // SAFETY: each block was allocated by this world's allocator
                // and is freed exactly once.
                unsafe { self.allocator.free(chunk.block_ptr()) };
            }
            arch.chunks.clear();
        }
        self.allocator.flush();
    }
}

/// Pick or create a chunk in `arch_id` whose Unique values equal `expected`
/// (one entry per Unique column; empty for archetypes without them).
fn select_chunk(
    graph: &mut ArchetypeGraph,
    allocator: &mut ChunkAllocator,
    catalog: &ComponentCatalog,
    arch_id: ArchetypeId,
    expected: &[(ComponentId, *const u8)],
) -> u32 {
    let arch = graph.expect_mut(arch_id);
    debug_assert_eq!(
        expected.len(),
        arch.components(ComponentKind::Unique).len(),
        "expected values must cover every Unique column"
    );

    if expected.is_empty() {
        return match arch.find_free_chunk(|_| true) {
            Some(idx) => idx,
            None => arch.create_chunk(allocator),
        };
    }

    let found = arch.find_free_chunk(|chunk| {
        if !chunk.unique_initialized() {
            return false;
        }
        expected.iter().all(|&(id, ptr)| {
            let column = chunk
                .column_index(ComponentKind::Unique, id)
                .expect("unique column");
            let eq_fn = catalog
                .get(id)
                .eq_fn
                .expect("Unique component registered without equality");
            // SAFETY: both sides are initialized values of the component type.
            unsafe { eq_fn(chunk.value_ptr(ComponentKind::Unique, column, 0), ptr) }
        })
    });
    match found {
        Some(idx) => idx,
        None => {
            let idx = arch.create_chunk(allocator);
            let chunk = &mut arch.chunks[idx as usize];
            for &(id, ptr) in expected {
                let column = chunk
                    .column_index(ComponentKind::Unique, id)
                    .expect("unique column");
                let clone_fn = catalog
                    .get(id)
                    .clone_fn
                    .expect("Unique component registered without clone");
                // SAFETY: source is a live value; destination slot is fresh.
                unsafe { clone_fn(ptr, chunk.value_ptr(ComponentKind::Unique, column, 0)) };
            }
            chunk.set_unique_initialized();
            idx
        }
    }
}

/// Move one row between chunks of neighboring archetypes: shared columns are
/// byte-moved, columns missing from the destination are dropped.
fn transfer_row(
    src: &Chunk,
    src_row: usize,
    dst: &mut Chunk,
    dst_row: usize,
    catalog: &ComponentCatalog,
) {
    let cols = src.columns(ComponentKind::Generic);
    for column in 0..cols.len() {
        let meta = cols.record(column).meta;
        match dst.column_index(ComponentKind::Generic, meta.id()) {
            Some(dst_col) => {
                if meta.soa_arity() == 0 {
                    // SAFETY: distinct chunks; both slots sized for the type.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            src.value_ptr(ComponentKind::Generic, column, src_row),
                            dst.value_ptr(ComponentKind::Generic, dst_col, dst_row),
                            meta.size(),
                        );
                    }
                } else {
                    let desc = catalog.get(meta.id());
                    for member in 0..meta.soa_arity() {
                        let member_size = desc.member_sizes.as_slice()[member] as usize;
                        // SAFETY: as above, per sub-array; offsets are solved
                        // against each chunk's own capacity.
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                src.soa_member_ptr(catalog, column, member, src_row),
                                dst.soa_member_ptr(catalog, dst_col, member, dst_row),
                                member_size,
                            );
                        }
                    }
                }
            }
            None => {
                // Being removed with the move; drop it on the source side.
                if let Some(drop_fn) = catalog.get(meta.id()).drop_fn {
                    // SAFETY: the slot holds a live value that nothing else
                    // will observe again.
                    unsafe { drop_fn(src.value_ptr(ComponentKind::Generic, column, src_row)) };
                }
            }
        }
    }
}

/// Duplicate one row's values into a fresh row (same archetype). Components
/// with a clone thunk are cloned; trivial ones are byte-copied; non-trivial
/// components without a clone thunk are a programming error.
fn duplicate_row(
    src: &Chunk,
    src_row: usize,
    dst: &Chunk,
    dst_row: usize,
    catalog: &ComponentCatalog,
) {
    let cols = src.columns(ComponentKind::Generic);
    for column in 0..cols.len() {
        let meta = cols.record(column).meta;
        let desc = catalog.get(meta.id());
        if meta.soa_arity() != 0 {
            for member in 0..meta.soa_arity() {
                let member_size = desc.member_sizes.as_slice()[member] as usize;
                // SAFETY: SoA components are Copy; plain byte copy per member.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.soa_member_ptr(catalog, column, member, src_row),
                        dst.soa_member_ptr(catalog, column, member, dst_row),
                        member_size,
                    );
                }
            }
            continue;
        }
        let src_ptr = src.value_ptr(ComponentKind::Generic, column, src_row);
        let dst_ptr = dst.value_ptr(ComponentKind::Generic, column, dst_row);
        if let Some(clone_fn) = desc.clone_fn {
            // SAFETY: source holds a live value; destination slot is fresh.
            unsafe { clone_fn(src_ptr, dst_ptr) };
        } else {
            assert!(
                desc.drop_fn.is_none(),
                "{} needs register_clonable to duplicate entities",
                desc.name
            );
            // SAFETY: trivial type; byte copy duplicates it.
            unsafe { std::ptr::copy_nonoverlapping(src_ptr, dst_ptr, meta.size()) };
        }
    }
}

/// Move value bytes into a column slot (AoS write or SoA scatter). Ownership
/// of the value transfers to the chunk.
fn write_value_bytes(
    chunk: &mut Chunk,
    column: usize,
    row: usize,
    src: *const u8,
    catalog: &ComponentCatalog,
) {
    let meta = chunk.columns(ComponentKind::Generic).record(column).meta;
    if meta.soa_arity() == 0 {
        // SAFETY: the slot is sized and aligned for the component.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src,
                chunk.value_ptr(ComponentKind::Generic, column, row),
                meta.size(),
            );
        }
    } else {
        let desc = catalog.get(meta.id());
        let mut offset = 0usize;
        for member in 0..meta.soa_arity() {
            let member_size = desc.member_sizes.as_slice()[member] as usize;
            // SAFETY: members partition the value's bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.add(offset),
                    chunk.soa_member_ptr(catalog, column, member, row),
                    member_size,
                );
            }
            offset += member_size;
        }
    }
}

fn zero_column_value(chunk: &Chunk, column: usize, row: usize, catalog: &ComponentCatalog) {
    let meta = chunk.columns(ComponentKind::Generic).record(column).meta;
    if meta.soa_arity() == 0 {
        // SAFETY: slot is owned by the fresh row.
        unsafe {
            std::ptr::write_bytes(
                chunk.value_ptr(ComponentKind::Generic, column, row),
                0,
                meta.size(),
            );
        }
    } else {
        let desc = catalog.get(meta.id());
        for member in 0..meta.soa_arity() {
            let member_size = desc.member_sizes.as_slice()[member] as usize;
            // SAFETY: as above, per sub-array.
            unsafe {
                std::ptr::write_bytes(
                    chunk.soa_member_ptr(catalog, column, member, row),
                    0,
                    member_size,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(dead_code)]
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Velocity {
        x: f32,
        y: f32,
    }

    struct Frozen;

    #[test]
    fn test_spawn_despawn() {
        let mut world = World::new();
        let entity = world.spawn((Position { x: 1.0, y: 2.0 },));
        assert!(world.is_alive(entity));
        assert_eq!(
            world.get_component::<Position>(entity),
            Some(&Position { x: 1.0, y: 2.0 })
        );

        world.despawn(entity).unwrap();
        assert!(!world.is_alive(entity));
        assert!(world.get_component::<Position>(entity).is_none());
        // Double despawn is an error.
        assert_eq!(world.despawn(entity), Err(EcsError::EntityNotFound));
    }

    #[test]
    fn test_stale_handle_after_recycle() {
        let mut world = World::new();
        let a = world.spawn((Position { x: 0.0, y: 0.0 },));
        world.despawn(a).unwrap();
        let b = world.spawn((Position { x: 9.0, y: 9.0 },));
        assert_eq!(a.index(), b.index());
        assert!(!world.is_alive(a));
        assert!(world.get_component::<Position>(a).is_none());
        assert!(world.is_alive(b));
    }

    #[test]
    fn test_archetype_segregation() {
        let mut world = World::new();
        struct A;
        struct B;
        struct C;

        world.spawn((A,));
        world.spawn((A, B));
        world.spawn((B, C));
        // Root plus three distinct signatures.
        assert_eq!(world.archetype_count(), 4);
    }

    #[test]
    fn test_add_remove_component_round_trip() {
        let mut world = World::new();
        let e = world.spawn((Position { x: 1.0, y: 2.0 },));
        let original_arch = world.archetype_of(e).unwrap();

        world.add_component(e, Velocity { x: 3.0, y: 4.0 }).unwrap();
        assert_ne!(world.archetype_of(e), Some(original_arch));
        assert_eq!(
            world.get_component::<Position>(e),
            Some(&Position { x: 1.0, y: 2.0 })
        );
        assert_eq!(
            world.get_component::<Velocity>(e),
            Some(&Velocity { x: 3.0, y: 4.0 })
        );

        // Removing restores the original archetype with values intact.
        world.remove_component::<Velocity>(e).unwrap();
        assert_eq!(world.archetype_of(e), Some(original_arch));
        assert_eq!(
            world.get_component::<Position>(e),
            Some(&Position { x: 1.0, y: 2.0 })
        );
        assert!(world.get_component::<Velocity>(e).is_none());
    }

    #[test]
    #[should_panic(expected = "already present")]
    fn test_duplicate_add_panics() {
        let mut world = World::new();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },));
        world
            .add_component(e, Position { x: 1.0, y: 1.0 })
            .unwrap();
    }

    #[test]
    fn test_set_component_overwrites() {
        let mut world = World::new();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },));
        world.set_component(e, Position { x: 5.0, y: 6.0 }).unwrap();
        assert_eq!(
            world.get_component::<Position>(e),
            Some(&Position { x: 5.0, y: 6.0 })
        );
        assert_eq!(
            world.set_component(e, Velocity { x: 0.0, y: 0.0 }),
            Err(EcsError::ComponentNotFound)
        );
    }

    #[test]
    fn test_nontrivial_component_dropped_on_despawn() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked(String);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut world = World::new();
        let e = world.spawn((Tracked("payload".into()),));
        world.despawn(e).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enable_disable_round_trip() {
        let mut world = World::new();
        let entities: Vec<_> = (0..10)
            .map(|i| {
                world.spawn((Position {
                    x: i as f32,
                    y: 0.0,
                },))
            })
            .collect();

        world.enable(entities[3], false).unwrap();
        assert!(!world.is_enabled(entities[3]));
        // Other entities keep resolving to their values after the swap.
        for (i, &e) in entities.iter().enumerate() {
            assert_eq!(
                world.get_component::<Position>(e).unwrap().x,
                i as f32
            );
        }

        // Round trip is a no-op on observable state.
        world.enable(entities[3], true).unwrap();
        assert!(world.is_enabled(entities[3]));
        assert_eq!(world.get_component::<Position>(entities[3]).unwrap().x, 3.0);

        // Re-enabling an enabled entity is a no-op.
        world.enable(entities[3], true).unwrap();
        assert!(world.is_enabled(entities[3]));
    }

    #[test]
    fn test_names() {
        let mut world = World::new();
        let a = world.add();
        let b = world.add();

        world.set_name(a, "player").unwrap();
        assert_eq!(world.name(a), Some("player"));
        assert_eq!(world.entity_by_name("player"), Some(a));

        // Same entity, same name: silent no-op.
        world.set_name(a, "player").unwrap();
        // Different entity: rejected.
        assert!(matches!(
            world.set_name(b, "player"),
            Err(EcsError::NameTaken(_))
        ));

        // Renaming releases the old name.
        world.set_name_static(a, "boss").unwrap();
        assert_eq!(world.entity_by_name("player"), None);
        assert_eq!(world.name(a), Some("boss"));

        // Despawn releases the name.
        world.despawn(a).unwrap();
        assert_eq!(world.entity_by_name("boss"), None);
        world.set_name(b, "boss").unwrap();
    }

    #[test]
    fn test_unique_components_partition_chunks() {
        #[derive(Debug, Clone, PartialEq)]
        struct Team(u32);

        let mut world = World::new();
        let a = world.spawn((Position { x: 0.0, y: 0.0 },));
        let b = world.spawn((Position { x: 1.0, y: 0.0 },));
        let c = world.spawn((Position { x: 2.0, y: 0.0 },));

        world.add_unique(a, Team(1)).unwrap();
        world.add_unique(b, Team(1)).unwrap();
        world.add_unique(c, Team(2)).unwrap();

        assert_eq!(world.get_unique::<Team>(a), Some(&Team(1)));
        assert_eq!(world.get_unique::<Team>(c), Some(&Team(2)));

        // Same archetype, different chunks for different Team values.
        let arch = world.archetype_of(a).unwrap();
        assert_eq!(world.archetype_of(c), Some(arch));
        let rec_a = world.locate(a).unwrap();
        let rec_b = world.locate(b).unwrap();
        let rec_c = world.locate(c).unwrap();
        assert_eq!(rec_a.1, rec_b.1);
        assert_ne!(rec_a.1, rec_c.1);

        world.remove_unique::<Team>(b).unwrap();
        assert!(world.get_unique::<Team>(b).is_none());
        assert_eq!(world.get_component::<Position>(b).unwrap().x, 1.0);
    }

    #[test]
    fn test_add_from_entity_copies_values() {
        let mut world = World::new();
        let src = world.spawn((Position { x: 7.0, y: 8.0 },));
        let copy = world.add_from_entity(src).unwrap();
        assert_eq!(world.archetype_of(copy), world.archetype_of(src));
        assert_eq!(
            world.get_component::<Position>(copy),
            Some(&Position { x: 7.0, y: 8.0 })
        );
    }

    #[test]
    fn test_add_from_archetype_defaults() {
        #[derive(Default, Debug, PartialEq, Clone, Copy)]
        struct Counter(u32);

        let mut world = World::new();
        world.register_default::<Counter>();
        let template = world.spawn((Counter(42),));
        let arch = world.archetype_of(template).unwrap();

        let fresh = world.add_from_archetype(arch).unwrap();
        assert_eq!(world.get_component::<Counter>(fresh), Some(&Counter(0)));
    }

    #[test]
    fn test_chunk_and_archetype_lifecycle() {
        let cfg = WorldConfig {
            chunk_lifespan: 2,
            archetype_lifespan: 2,
            defrag_rows_per_tick: 16,
        };
        let mut world = World::with_config(cfg);
        let e = world.spawn((Position { x: 0.0, y: 0.0 },));
        let arch = world.archetype_of(e).unwrap();
        assert_eq!(world.chunk_count(), 1);

        world.despawn(e).unwrap();
        // Chunk dies after its countdown, then the archetype follows.
        for _ in 0..8 {
            world.update();
        }
        assert!(world.graph.get(arch).is_none());
        assert_eq!(world.chunk_count(), 0);

        // Re-creating the signature synthesizes a fresh archetype.
        let e2 = world.spawn((Position { x: 1.0, y: 0.0 },));
        let arch2 = world.archetype_of(e2).unwrap();
        assert_ne!(arch2, arch);
    }

    #[test]
    fn test_reviving_dying_chunk() {
        let cfg = WorldConfig {
            chunk_lifespan: 3,
            archetype_lifespan: 3,
            defrag_rows_per_tick: 16,
        };
        let mut world = World::with_config(cfg);
        let e = world.spawn((Position { x: 0.0, y: 0.0 },));
        let arch = world.archetype_of(e).unwrap();
        world.despawn(e).unwrap();
        world.update(); // countdown running

        // New entity in the same archetype revives the chunk fully.
        let e2 = world.spawn((Position { x: 1.0, y: 0.0 },));
        assert_eq!(world.archetype_of(e2), Some(arch));
        for _ in 0..10 {
            world.update();
        }
        assert!(world.graph.get(arch).is_some());
        assert!(world.is_alive(e2));
    }

    #[test]
    fn test_spawn_batch() {
        let mut world = World::new();
        let entities = world
            .spawn_batch((0..1000).map(|i| {
                (Position {
                    x: i as f32,
                    y: 0.0,
                },)
            }))
            .unwrap();
        assert_eq!(entities.len(), 1000);
        assert_eq!(world.entity_count(), 1000);
        // 512-row chunks: a thousand entities need two.
        assert!(world.chunk_count() >= 2);
        assert_eq!(world.get_component::<Position>(entities[777]).unwrap().x, 777.0);
    }

    #[test]
    fn test_stats() {
        let mut world = World::new();
        let e = world.spawn((Position { x: 0.0, y: 0.0 },));
        world.despawn(e).unwrap();
        let stats = world.stats();
        assert_eq!(stats.entities, 0);
        assert_eq!(stats.free_slots, 1);
        assert!(stats.archetypes >= 1);
    }
}
