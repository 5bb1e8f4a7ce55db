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

//! The query engine.
//!
//! A builder records commands; on `build` they are replayed into a plan:
//! per-kind component lists sorted by id (read-write bits permuted in
//! lockstep), per-rule matcher masks for fast rejection, and a change-filter
//! list. Plans are interned by lookup hash, cache their matched archetypes,
//! and re-evaluate only archetypes that appeared since the last use via
//! per-All-component cursors into the graph's inverted index.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;

use ahash::AHashSet;
use smallvec::SmallVec;

use crate::archetype::{Archetype, ArchetypeId};
use crate::chunk::Chunk;
use crate::component::{
    Component, ComponentCatalog, ComponentId, ComponentKind, ComponentMeta, SoaComponent,
};
use crate::config::{MAX_COMPONENTS, MAX_SOA_MEMBERS};
use crate::entity::Entity;
use crate::graph::{ArchetypeGraph, IndexRemoval};
use crate::utils::hash_combine;
use crate::world::World;

/// Interned query identifier, stable for the world's lifetime.
pub type QueryId = u32;

/// Matching rule for one query term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Archetype must contain every `All` component.
    All,
    /// Archetype must contain at least one `Any` component.
    Any,
    /// Archetype must contain no `None` component.
    None,
}

/// Which rows of each chunk an iteration visits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Constraints {
    #[default]
    EnabledOnly,
    DisabledOnly,
    All,
}

/// One recorded builder command, replayed at compile time.
#[derive(Debug, Clone, Copy)]
pub(crate) enum QueryCmd {
    Term {
        kind: ComponentKind,
        meta: ComponentMeta,
        rule: Rule,
        write: bool,
    },
    ChangeFilter {
        kind: ComponentKind,
        id: ComponentId,
    },
}

/// Declarative query builder. Terms accumulate until [`Self::build`] compiles
/// and interns the plan.
pub struct QueryBuilder<'w> {
    world: &'w mut World,
    cmds: Vec<QueryCmd>,
}

impl<'w> QueryBuilder<'w> {
    pub(crate) fn new(world: &'w mut World) -> Self {
        Self {
            world,
            cmds: Vec::with_capacity(8),
        }
    }

    fn term<T: Component>(mut self, kind: ComponentKind, rule: Rule, write: bool) -> Self {
        let id = self.world.catalog_mut().register::<T>();
        let meta = self.world.catalog().meta(id);
        self.cmds.push(QueryCmd::Term {
            kind,
            meta,
            rule,
            write,
        });
        self
    }

    /// Require `T` on every matched archetype (read access).
    pub fn all<T: Component>(self) -> Self {
        self.term::<T>(ComponentKind::Generic, Rule::All, false)
    }

    /// Require `T` with write access.
    pub fn all_mut<T: Component>(self) -> Self {
        self.term::<T>(ComponentKind::Generic, Rule::All, true)
    }

    /// Require a structure-of-arrays component (read access).
    pub fn all_soa<T: SoaComponent>(mut self) -> Self {
        let id = self.world.catalog_mut().register_soa::<T>();
        let meta = self.world.catalog().meta(id);
        self.cmds.push(QueryCmd::Term {
            kind: ComponentKind::Generic,
            meta,
            rule: Rule::All,
            write: false,
        });
        self
    }

    /// Require a structure-of-arrays component with write access.
    pub fn all_soa_mut<T: SoaComponent>(mut self) -> Self {
        let id = self.world.catalog_mut().register_soa::<T>();
        let meta = self.world.catalog().meta(id);
        self.cmds.push(QueryCmd::Term {
            kind: ComponentKind::Generic,
            meta,
            rule: Rule::All,
            write: true,
        });
        self
    }

    /// Match archetypes containing at least one `Any` component.
    pub fn any<T: Component>(self) -> Self {
        self.term::<T>(ComponentKind::Generic, Rule::Any, false)
    }

    /// Exclude archetypes containing `T`.
    pub fn none<T: Component>(self) -> Self {
        self.term::<T>(ComponentKind::Generic, Rule::None, false)
    }

    /// Require the Unique (per-chunk) component `T`.
    pub fn unique<T: Component + Clone + PartialEq>(mut self) -> Self {
        let id = self.world.catalog_mut().register_unique::<T>();
        let meta = self.world.catalog().meta(id);
        self.cmds.push(QueryCmd::Term {
            kind: ComponentKind::Unique,
            meta,
            rule: Rule::All,
            write: false,
        });
        self
    }

    /// Skip chunks whose `T` column was not written since the query last ran.
    /// `T` must also be an `All` term of the query.
    pub fn changed<T: Component>(mut self) -> Self {
        let id = self.world.catalog_mut().register::<T>();
        self.cmds.push(QueryCmd::ChangeFilter {
            kind: ComponentKind::Generic,
            id,
        });
        self
    }

    /// Change filter over a Unique component.
    pub fn changed_unique<T: Component + Clone + PartialEq>(mut self) -> Self {
        let id = self.world.catalog_mut().register_unique::<T>();
        self.cmds.push(QueryCmd::ChangeFilter {
            kind: ComponentKind::Unique,
            id,
        });
        self
    }

    /// Compile the recorded commands and intern the plan. Equal
    /// specifications collapse to one `QueryId`.
    pub fn build(self) -> QueryId {
        self.world.intern_query(self.cmds)
    }
}

/// Per-kind compiled form: component list sorted ascending, rules parallel to
/// it, write bits permuted in lockstep, and per-rule matcher masks.
#[derive(Default)]
pub(crate) struct KindPlan {
    pub ids: SmallVec<[ComponentId; 8]>,
    pub rules: SmallVec<[Rule; 8]>,
    pub write_mask: u32,
    pub mask_all: u64,
    pub mask_any: u64,
    pub mask_none: u64,
    pub all_count: u8,
}

impl KindPlan {
    fn ids_with_rule(&self, rule: Rule) -> impl Iterator<Item = ComponentId> + '_ {
        self.ids
            .iter()
            .zip(self.rules.iter())
            .filter(move |&(_, &r)| r == rule)
            .map(|(&id, _)| id)
    }

    /// Match one archetype's component list for this kind: matcher-mask fast
    /// rejection first, then verification against the sorted list.
    pub(crate) fn matches(&self, kind: ComponentKind, arch: &Archetype) -> bool {
        let arch_matcher = arch.matcher(kind);

        if self.mask_none != 0
            && arch_matcher & self.mask_none != 0
            && self
                .ids_with_rule(Rule::None)
                .any(|id| arch.contains(kind, id))
        {
            return false;
        }

        if self.mask_any != 0 {
            if arch_matcher & self.mask_any == 0 {
                return false;
            }
            if !self
                .ids_with_rule(Rule::Any)
                .any(|id| arch.contains(kind, id))
            {
                return false;
            }
        }

        if self.all_count > 0 {
            if arch_matcher & self.mask_all != self.mask_all {
                return false;
            }
            let present = self
                .ids_with_rule(Rule::All)
                .filter(|&id| arch.contains(kind, id))
                .count();
            if present != self.all_count as usize {
                return false;
            }
        }

        true
    }
}

/// Cursor into the inverted index of one `All` component: archetypes below
/// `pos` have already been evaluated.
pub(crate) struct QueryCursor {
    pub kind: ComponentKind,
    pub id: ComponentId,
    pub pos: u32,
}

/// Compiled, interned query.
pub(crate) struct QueryPlan {
    pub id: QueryId,
    pub lookup_hash: u64,
    pub kinds: [KindPlan; ComponentKind::COUNT],
    pub filters: SmallVec<[(ComponentKind, ComponentId); 4]>,
    pub matched: Vec<ArchetypeId>,
    matched_set: AHashSet<ArchetypeId>,
    /// One per `All` term; empty plans fall back to `scan_pos`.
    pub cursors: SmallVec<[QueryCursor; 8]>,
    /// Arena prefix already evaluated when the plan has no `All` terms.
    pub scan_pos: u32,
    /// World version when an iteration last completed; 0 = never ran.
    pub last_version: u32,
}

impl QueryPlan {
    pub(crate) fn compile(cmds: &[QueryCmd], catalog: &ComponentCatalog) -> Self {
        let mut kinds: [KindPlan; 2] = [KindPlan::default(), KindPlan::default()];
        let mut filters: SmallVec<[(ComponentKind, ComponentId); 4]> = SmallVec::new();

        // Replay the recorded commands.
        for cmd in cmds {
            match *cmd {
                QueryCmd::Term {
                    kind,
                    meta,
                    rule,
                    write,
                } => {
                    let plan = &mut kinds[kind.index()];
                    assert!(
                        !plan.ids.contains(&meta.id()),
                        "duplicate component {} in query",
                        catalog.get(meta.id()).name
                    );
                    assert!(plan.ids.len() < MAX_COMPONENTS);
                    if write {
                        plan.write_mask |= 1 << plan.ids.len();
                    }
                    plan.ids.push(meta.id());
                    plan.rules.push(rule);
                }
                QueryCmd::ChangeFilter { kind, id } => {
                    if !filters.contains(&(kind, id)) {
                        filters.push((kind, id));
                    }
                }
            }
        }

        // Sort components ascending, permuting rules and write bits in
        // lockstep so they stay aligned.
        for plan in &mut kinds {
            let mut order: SmallVec<[usize; 8]> = (0..plan.ids.len()).collect();
            order.sort_by_key(|&i| plan.ids[i]);

            let ids: SmallVec<[ComponentId; 8]> = order.iter().map(|&i| plan.ids[i]).collect();
            let rules: SmallVec<[Rule; 8]> = order.iter().map(|&i| plan.rules[i]).collect();
            let mut write_mask = 0u32;
            for (new_bit, &old) in order.iter().enumerate() {
                if plan.write_mask & (1 << old) != 0 {
                    write_mask |= 1 << new_bit;
                }
            }
            plan.ids = ids;
            plan.rules = rules;
            plan.write_mask = write_mask;

            for (&id, &rule) in plan.ids.iter().zip(plan.rules.iter()) {
                let matcher = catalog.get(id).matcher_hash;
                match rule {
                    Rule::All => {
                        plan.mask_all |= matcher;
                        plan.all_count += 1;
                    }
                    Rule::Any => plan.mask_any |= matcher,
                    Rule::None => plan.mask_none |= matcher,
                }
            }
        }

        // A change filter only makes sense over a column the query matches.
        filters.sort_by_key(|&(kind, id)| (kind.index(), id));
        for &(kind, id) in &filters {
            let plan = &kinds[kind.index()];
            let is_all = plan
                .ids
                .iter()
                .zip(plan.rules.iter())
                .any(|(&i, &r)| i == id && r == Rule::All);
            assert!(
                is_all,
                "change filter on {} requires it as an All term",
                catalog.get(id).name
            );
        }

        let mut hash = 0u64;
        for (kind_idx, plan) in kinds.iter().enumerate() {
            for (i, (&id, &rule)) in plan.ids.iter().zip(plan.rules.iter()).enumerate() {
                let write = plan.write_mask >> i & 1;
                hash = hash_combine(
                    hash,
                    u64::from(id)
                        | (rule as u64) << 32
                        | u64::from(write) << 34
                        | (kind_idx as u64) << 35,
                );
            }
        }
        for &(kind, id) in &filters {
            hash = hash_combine(hash, u64::from(id) | 1 << 40 | (kind.index() as u64) << 41);
        }

        let mut cursors: SmallVec<[QueryCursor; 8]> = SmallVec::new();
        for (kind_idx, plan) in kinds.iter().enumerate() {
            let kind = if kind_idx == 0 {
                ComponentKind::Generic
            } else {
                ComponentKind::Unique
            };
            for id in plan.ids_with_rule(Rule::All) {
                cursors.push(QueryCursor { kind, id, pos: 0 });
            }
        }

        Self {
            id: 0,
            lookup_hash: hash,
            kinds,
            filters,
            matched: Vec::new(),
            matched_set: AHashSet::new(),
            cursors,
            scan_pos: 0,
            last_version: 0,
        }
    }

    /// Structural equality of the compiled specification; used to confirm
    /// interning hash hits.
    fn same_spec(&self, other: &Self) -> bool {
        self.filters == other.filters
            && self.kinds.iter().zip(other.kinds.iter()).all(|(a, b)| {
                a.ids == b.ids && a.rules == b.rules && a.write_mask == b.write_mask
            })
    }

    pub(crate) fn matches_archetype(&self, arch: &Archetype) -> bool {
        self.kinds[ComponentKind::Generic.index()].matches(ComponentKind::Generic, arch)
            && self.kinds[ComponentKind::Unique.index()].matches(ComponentKind::Unique, arch)
    }

    /// Evaluate archetypes that appeared since the last use and append the
    /// matches to the cache.
    pub(crate) fn update_matches(&mut self, graph: &ArchetypeGraph) {
        if self.cursors.is_empty() {
            let len = graph.arena_len() as u32;
            for id in self.scan_pos..len {
                if let Some(arch) = graph.get(id) {
                    self.try_match(arch);
                }
            }
            self.scan_pos = len;
        } else {
            for c in 0..self.cursors.len() {
                let (kind, comp, pos) = {
                    let cursor = &self.cursors[c];
                    (cursor.kind, cursor.id, cursor.pos)
                };
                let list = graph.index_list(kind, comp);
                for &aid in &list[pos as usize..] {
                    self.try_match(graph.expect(aid));
                }
                self.cursors[c].pos = list.len() as u32;
            }
        }
    }

    fn try_match(&mut self, arch: &Archetype) {
        if self.matched_set.contains(&arch.id()) {
            return;
        }
        if self.matches_archetype(arch) {
            self.matched.push(arch.id());
            self.matched_set.insert(arch.id());
        }
    }

    /// Does this chunk pass the plan's change filters since the last run?
    pub(crate) fn chunk_passes_filters(&self, chunk: &Chunk) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        for &(kind, id) in &self.filters {
            if let Some(column) = chunk.column_index(kind, id) {
                if chunk.changed(kind, column, self.last_version) {
                    return true;
                }
            }
        }
        false
    }

    fn forget_archetype(&mut self, id: ArchetypeId, removals: &[IndexRemoval]) {
        if self.matched_set.remove(&id) {
            self.matched.retain(|&a| a != id);
        }
        for cursor in &mut self.cursors {
            for &(kind, comp, pos) in removals {
                if cursor.kind == kind && cursor.id == comp && cursor.pos > pos as u32 {
                    cursor.pos -= 1;
                }
            }
        }
    }
}

/// Interning cache: every compiled plan, keyed by lookup hash.
pub(crate) struct QueryRegistry {
    pub plans: Vec<QueryPlan>,
    by_hash: ahash::AHashMap<u64, SmallVec<[QueryId; 1]>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self {
            plans: Vec::new(),
            by_hash: ahash::AHashMap::with_capacity(32),
        }
    }

    pub fn intern(&mut self, cmds: &[QueryCmd], catalog: &ComponentCatalog) -> QueryId {
        let mut plan = QueryPlan::compile(cmds, catalog);
        if let Some(candidates) = self.by_hash.get(&plan.lookup_hash) {
            for &qid in candidates {
                if self.plans[qid as usize].same_spec(&plan) {
                    return qid;
                }
            }
        }
        let qid = self.plans.len() as QueryId;
        plan.id = qid;
        self.by_hash
            .entry(plan.lookup_hash)
            .or_default()
            .push(qid);
        self.plans.push(plan);
        qid
    }

    /// Archetype teardown repair: every plan drops the doomed id from its
    /// cache and adjusts cursors past its inverted-index position.
    pub fn on_archetype_destroyed(&mut self, id: ArchetypeId, removals: &[IndexRemoval]) {
        for plan in &mut self.plans {
            plan.forget_archetype(id, removals);
        }
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }
}

// ========== Per-chunk callback views ==========

fn new_borrow_cells() -> [[Cell<i16>; MAX_COMPONENTS]; ComponentKind::COUNT] {
    [
        std::array::from_fn(|_| Cell::new(0)),
        std::array::from_fn(|_| Cell::new(0)),
    ]
}

/// The argument handed to query callbacks: one chunk's rows, sliced to the
/// iteration's row range, with typed column views.
///
/// Views are borrow-counted at runtime: taking a mutable view of a column
/// while any other view of it is live panics.
pub struct Rows<'a> {
    chunk: NonNull<Chunk>,
    start: u32,
    end: u32,
    catalog: &'a ComponentCatalog,
    world_version: u32,
    borrows: [[Cell<i16>; MAX_COMPONENTS]; ComponentKind::COUNT],
    _marker: PhantomData<&'a mut Chunk>,
}

impl<'a> Rows<'a> {
    pub(crate) fn new(
        chunk: &'a mut Chunk,
        start: u32,
        end: u32,
        catalog: &'a ComponentCatalog,
        world_version: u32,
    ) -> Self {
        debug_assert!(start <= end && end as usize <= chunk.len());
        Self {
            chunk: NonNull::from(chunk),
            start,
            end,
            catalog,
            world_version,
            borrows: new_borrow_cells(),
            _marker: PhantomData,
        }
    }

    fn chunk(&self) -> &Chunk {
        // SAFETY: Rows exclusively borrows the chunk for 'a.
        unsafe { self.chunk.as_ref() }
    }

    /// Rows in this slice.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Entity handles of the visited rows; always read-only.
    pub fn entities(&self) -> &[Entity] {
        &self.chunk().entities()[self.start as usize..self.end as usize]
    }

    pub fn entity(&self, i: usize) -> Entity {
        self.entities()[i]
    }

    fn resolve<T: Component>(&self, kind: ComponentKind) -> (usize, ComponentMeta) {
        let id = self
            .catalog
            .lookup_of::<T>()
            .unwrap_or_else(|| panic!("{} was never registered", std::any::type_name::<T>()));
        let column = self.chunk().column_index(kind, id).unwrap_or_else(|| {
            panic!(
                "{} is not a column of this chunk; add it to the query terms",
                std::any::type_name::<T>()
            )
        });
        (column, self.catalog.meta(id))
    }

    pub fn has<T: Component>(&self) -> bool {
        self.catalog
            .lookup_of::<T>()
            .is_some_and(|id| self.chunk().has(ComponentKind::Generic, id))
    }

    fn acquire_shared(&self, kind: ComponentKind, column: usize) -> &Cell<i16> {
        let cell = &self.borrows[kind.index()][column];
        assert!(
            cell.get() >= 0,
            "column is already mutably borrowed by this callback"
        );
        cell.set(cell.get() + 1);
        cell
    }

    fn acquire_exclusive(&self, kind: ComponentKind, column: usize) -> &Cell<i16> {
        let cell = &self.borrows[kind.index()][column];
        assert!(
            cell.get() == 0,
            "column is already borrowed by this callback"
        );
        cell.set(-1);
        cell
    }

    fn slice_ptr<T>(&self, column: usize) -> *mut T {
        if std::mem::size_of::<T>() == 0 {
            NonNull::<T>::dangling().as_ptr()
        } else {
            self.chunk()
                .value_ptr(ComponentKind::Generic, column, self.start as usize) as *mut T
        }
    }

    /// Shared view of a Generic column, sliced to the visited rows.
    pub fn view<T: Component>(&self) -> ColumnRef<'_, T> {
        let (column, meta) = self.resolve::<T>(ComponentKind::Generic);
        assert!(
            meta.soa_arity() == 0,
            "{} is SoA; use view_soa",
            std::any::type_name::<T>()
        );
        let cell = self.acquire_shared(ComponentKind::Generic, column);
        // SAFETY: rows [start, end) hold initialized values and the borrow
        // cell excludes a concurrent exclusive view.
        let slice = unsafe { std::slice::from_raw_parts(self.slice_ptr::<T>(column), self.len()) };
        ColumnRef { slice, cell }
    }

    /// Exclusive view of a Generic column; stamps the column version.
    pub fn view_mut<T: Component>(&self) -> ColumnRefMut<'_, T> {
        let view = self.view_mut_silent::<T>();
        let (column, _) = self.resolve::<T>(ComponentKind::Generic);
        // SAFETY: Rows exclusively borrows the chunk; the version field does
        // not alias column data.
        unsafe {
            (*self.chunk.as_ptr()).set_version(ComponentKind::Generic, column, self.world_version);
        }
        view
    }

    /// Exclusive view that does not mark the column as changed.
    pub fn view_mut_silent<T: Component>(&self) -> ColumnRefMut<'_, T> {
        let (column, meta) = self.resolve::<T>(ComponentKind::Generic);
        assert!(
            meta.soa_arity() == 0,
            "{} is SoA; use view_soa_mut",
            std::any::type_name::<T>()
        );
        let cell = self.acquire_exclusive(ComponentKind::Generic, column);
        // SAFETY: the borrow cell guarantees exclusivity within the callback;
        // Rows owns the chunk borrow.
        let slice =
            unsafe { std::slice::from_raw_parts_mut(self.slice_ptr::<T>(column), self.len()) };
        ColumnRefMut { slice, cell }
    }

    /// The chunk's Unique value for `T`.
    pub fn unique<T: Component>(&self) -> &T {
        let (column, meta) = self.resolve::<T>(ComponentKind::Unique);
        debug_assert_eq!(meta.size(), std::mem::size_of::<T>());
        // SAFETY: unique columns of populated chunks hold one initialized
        // value; no mutable unique view exists during iteration.
        unsafe {
            &*(self
                .chunk()
                .value_ptr(ComponentKind::Unique, column, 0) as *const T)
        }
    }

    /// Struct-of-spans view of an SoA column.
    pub fn view_soa<T: SoaComponent>(&self) -> SoaView<'_, T> {
        let (column, meta) = self.resolve::<T>(ComponentKind::Generic);
        assert!(meta.soa_arity() > 0, "{} is not SoA", std::any::type_name::<T>());
        let cell = self.acquire_shared(ComponentKind::Generic, column);
        SoaView {
            members: self.member_ptrs(column, meta),
            len: self.len(),
            cell,
            _marker: PhantomData,
        }
    }

    /// Mutable struct-of-spans view; stamps the column version.
    pub fn view_soa_mut<T: SoaComponent>(&self) -> SoaViewMut<'_, T> {
        let (column, meta) = self.resolve::<T>(ComponentKind::Generic);
        assert!(meta.soa_arity() > 0, "{} is not SoA", std::any::type_name::<T>());
        let cell = self.acquire_exclusive(ComponentKind::Generic, column);
        // SAFETY: as in view_mut.
        unsafe {
            (*self.chunk.as_ptr()).set_version(ComponentKind::Generic, column, self.world_version);
        }
        SoaViewMut {
            members: self.member_ptrs(column, meta),
            len: self.len(),
            cell,
            _marker: PhantomData,
        }
    }

    fn member_ptrs(
        &self,
        column: usize,
        meta: ComponentMeta,
    ) -> SmallVec<[*mut u8; MAX_SOA_MEMBERS]> {
        (0..meta.soa_arity())
            .map(|member| {
                self.chunk()
                    .soa_member_ptr(self.catalog, column, member, self.start as usize)
            })
            .collect()
    }
}

/// Shared column view. Dereferences to a slice over the visited rows.
pub struct ColumnRef<'a, T> {
    slice: &'a [T],
    cell: &'a Cell<i16>,
}

impl<T> std::ops::Deref for ColumnRef<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.slice
    }
}

impl<T> Drop for ColumnRef<'_, T> {
    fn drop(&mut self) {
        self.cell.set(self.cell.get() - 1);
    }
}

/// Exclusive column view. Dereferences to a mutable slice.
pub struct ColumnRefMut<'a, T> {
    slice: &'a mut [T],
    cell: &'a Cell<i16>,
}

impl<T> std::ops::Deref for ColumnRefMut<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.slice
    }
}

impl<T> std::ops::DerefMut for ColumnRefMut<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.slice
    }
}

impl<T> Drop for ColumnRefMut<'_, T> {
    fn drop(&mut self) {
        self.cell.set(0);
    }
}

/// Read view over an SoA column: one span per member, gathered into `T` on
/// access.
pub struct SoaView<'a, T: SoaComponent> {
    members: SmallVec<[*mut u8; MAX_SOA_MEMBERS]>,
    len: usize,
    cell: &'a Cell<i16>,
    _marker: PhantomData<&'a T>,
}

impl<T: SoaComponent> SoaView<'_, T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gather row `i` from the member sub-arrays.
    pub fn get(&self, i: usize) -> T {
        assert!(i < self.len);
        // SAFETY: each member pointer spans `len` elements of its size.
        unsafe { gather::<T>(&self.members, i) }
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }
}

impl<T: SoaComponent> Drop for SoaView<'_, T> {
    fn drop(&mut self) {
        self.cell.set(self.cell.get() - 1);
    }
}

/// Write view over an SoA column.
pub struct SoaViewMut<'a, T: SoaComponent> {
    members: SmallVec<[*mut u8; MAX_SOA_MEMBERS]>,
    len: usize,
    cell: &'a Cell<i16>,
    _marker: PhantomData<&'a mut T>,
}

impl<T: SoaComponent> SoaViewMut<'_, T> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> T {
        assert!(i < self.len);
        // SAFETY: as in SoaView::get.
        unsafe { gather::<T>(&self.members, i) }
    }

    /// Scatter `value` into the member sub-arrays at row `i`.
    pub fn set(&mut self, i: usize, value: T) {
        assert!(i < self.len);
        let bytes = &value as *const T as *const u8;
        let mut offset = 0usize;
        for (member, &size) in T::MEMBER_SIZES.iter().enumerate() {
            // SAFETY: `value` is `size_of::<T>()` bytes; members partition it.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.add(offset),
                    self.members[member].add(i * size),
                    size,
                );
            }
            offset += size;
        }
    }
}

impl<T: SoaComponent> Drop for SoaViewMut<'_, T> {
    fn drop(&mut self) {
        self.cell.set(0);
    }
}

/// # Safety
/// Each member pointer must span at least `i + 1` elements of its member size.
unsafe fn gather<T: SoaComponent>(members: &[*mut u8], i: usize) -> T {
    let mut out = MaybeUninit::<T>::uninit();
    let dst = out.as_mut_ptr() as *mut u8;
    let mut offset = 0usize;
    for (member, &size) in T::MEMBER_SIZES.iter().enumerate() {
        std::ptr::copy_nonoverlapping(members[member].add(i * size), dst.add(offset), size);
        offset += size;
    }
    out.assume_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct A(u32);
    #[derive(Debug, Clone, Copy)]
    struct B(u32);
    #[derive(Debug, Clone, Copy)]
    struct C(u32);

    fn term(catalog: &mut ComponentCatalog, id: ComponentId, rule: Rule, write: bool) -> QueryCmd {
        QueryCmd::Term {
            kind: ComponentKind::Generic,
            meta: catalog.meta(id),
            rule,
            write,
        }
    }

    #[test]
    fn test_compile_sorts_with_lockstep_permutation() {
        let mut catalog = ComponentCatalog::new();
        let a = catalog.register::<A>();
        let b = catalog.register::<B>();
        let c = catalog.register::<C>();

        // Declared out of id order, with the middle term writable.
        let cmds = [
            term(&mut catalog, c, Rule::All, false),
            term(&mut catalog, a, Rule::All, true),
            term(&mut catalog, b, Rule::None, false),
        ];
        let plan = QueryPlan::compile(&cmds, &catalog);
        let kp = &plan.kinds[ComponentKind::Generic.index()];

        assert_eq!(kp.ids.as_slice(), &[a, b, c]);
        assert_eq!(kp.rules.as_slice(), &[Rule::All, Rule::None, Rule::All]);
        // The write bit followed component A to position 0.
        assert_eq!(kp.write_mask, 0b001);
        assert_eq!(kp.all_count, 2);
        assert_eq!(plan.cursors.len(), 2);
    }

    #[test]
    #[should_panic(expected = "duplicate component")]
    fn test_duplicate_term_rejected() {
        let mut catalog = ComponentCatalog::new();
        let a = catalog.register::<A>();
        let cmds = [
            term(&mut catalog, a, Rule::All, false),
            term(&mut catalog, a, Rule::None, false),
        ];
        QueryPlan::compile(&cmds, &catalog);
    }

    #[test]
    #[should_panic(expected = "requires it as an All term")]
    fn test_change_filter_requires_all_term() {
        let mut catalog = ComponentCatalog::new();
        let a = catalog.register::<A>();
        let cmds = [QueryCmd::ChangeFilter {
            kind: ComponentKind::Generic,
            id: a,
        }];
        QueryPlan::compile(&cmds, &catalog);
    }

    #[test]
    fn test_equal_specs_hash_equal() {
        let mut catalog = ComponentCatalog::new();
        let a = catalog.register::<A>();
        let b = catalog.register::<B>();

        // Declaration order does not matter after canonical sorting.
        let p1 = QueryPlan::compile(
            &[
                term(&mut catalog, a, Rule::All, false),
                term(&mut catalog, b, Rule::All, true),
            ],
            &catalog,
        );
        let p2 = QueryPlan::compile(
            &[
                term(&mut catalog, b, Rule::All, true),
                term(&mut catalog, a, Rule::All, false),
            ],
            &catalog,
        );
        assert_eq!(p1.lookup_hash, p2.lookup_hash);
        assert!(p1.same_spec(&p2));

        // Write access is part of the specification.
        let p3 = QueryPlan::compile(
            &[
                term(&mut catalog, a, Rule::All, true),
                term(&mut catalog, b, Rule::All, true),
            ],
            &catalog,
        );
        assert!(!p1.same_spec(&p3));
    }

    #[test]
    fn test_registry_interns_equal_plans() {
        let mut catalog = ComponentCatalog::new();
        let a = catalog.register::<A>();
        let mut registry = QueryRegistry::new();

        let q1 = registry.intern(&[term(&mut catalog, a, Rule::All, false)], &catalog);
        let q2 = registry.intern(&[term(&mut catalog, a, Rule::All, false)], &catalog);
        assert_eq!(q1, q2);
        assert_eq!(registry.len(), 1);

        let q3 = registry.intern(&[term(&mut catalog, a, Rule::Any, false)], &catalog);
        assert_ne!(q1, q3);
    }

    #[test]
    fn test_matching_rules() {
        use crate::graph::ArchetypeGraph;

        let mut catalog = ComponentCatalog::new();
        let a = catalog.register::<A>();
        let b = catalog.register::<B>();
        let c = catalog.register::<C>();
        let mut graph = ArchetypeGraph::new(&catalog);
        let ga = ComponentKind::Generic;

        let arch_a = graph.with_component(
            &catalog,
            crate::archetype::ROOT_ARCHETYPE,
            ga,
            catalog.meta(a),
        );
        let arch_ab = graph.with_component(&catalog, arch_a, ga, catalog.meta(b));

        // All{A} matches both; All{A} None{B} only the first.
        let plan = QueryPlan::compile(&[term(&mut catalog, a, Rule::All, false)], &catalog);
        assert!(plan.matches_archetype(graph.expect(arch_a)));
        assert!(plan.matches_archetype(graph.expect(arch_ab)));

        let plan = QueryPlan::compile(
            &[
                term(&mut catalog, a, Rule::All, false),
                term(&mut catalog, b, Rule::None, false),
            ],
            &catalog,
        );
        assert!(plan.matches_archetype(graph.expect(arch_a)));
        assert!(!plan.matches_archetype(graph.expect(arch_ab)));

        // Any{B, C} rejects {A}.
        let plan = QueryPlan::compile(
            &[
                term(&mut catalog, b, Rule::Any, false),
                term(&mut catalog, c, Rule::Any, false),
            ],
            &catalog,
        );
        assert!(!plan.matches_archetype(graph.expect(arch_a)));
        assert!(plan.matches_archetype(graph.expect(arch_ab)));
    }

    #[test]
    fn test_incremental_matching_with_cursors() {
        use crate::graph::ArchetypeGraph;

        let mut catalog = ComponentCatalog::new();
        let a = catalog.register::<A>();
        let b = catalog.register::<B>();
        let mut graph = ArchetypeGraph::new(&catalog);
        let ga = ComponentKind::Generic;

        let arch_a = graph.with_component(
            &catalog,
            crate::archetype::ROOT_ARCHETYPE,
            ga,
            catalog.meta(a),
        );

        let mut plan = QueryPlan::compile(&[term(&mut catalog, a, Rule::All, false)], &catalog);
        plan.update_matches(&graph);
        assert_eq!(plan.matched, vec![arch_a]);

        // A new matching archetype appears: only it is evaluated and appended.
        let arch_ab = graph.with_component(&catalog, arch_a, ga, catalog.meta(b));
        plan.update_matches(&graph);
        assert_eq!(plan.matched, vec![arch_a, arch_ab]);
        assert_eq!(plan.cursors[0].pos, 2);

        // Teardown repair removes the archetype and pulls the cursor back.
        let removals = graph.destroy(arch_ab);
        plan.forget_archetype(arch_ab, &removals);
        assert_eq!(plan.matched, vec![arch_a]);
        assert_eq!(plan.cursors[0].pos, 1);
    }
}
