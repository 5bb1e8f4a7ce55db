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

//! The archetype graph: every distinct signature, linked by add/remove edges.
//!
//! Archetypes live in a grow-only arena so ids stay monotonic; query cursors
//! rely on that. Lookup goes hash-first with a full list comparison to
//! confirm. Structural mutations walk precomputed edges after the first
//! traversal synthesizes them.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::archetype::{calc_lookup_hash, Archetype, ArchetypeId, ROOT_ARCHETYPE};
use crate::component::{ComponentCatalog, ComponentId, ComponentKind, ComponentMeta};

/// Index-list position an archetype vacated on teardown, per component.
/// Query cursors past the position are decremented.
pub(crate) type IndexRemoval = (ComponentKind, ComponentId, usize);

pub struct ArchetypeGraph {
    /// Grow-only arena; destroyed archetypes leave a tombstone.
    archetypes: Vec<Option<Archetype>>,
    by_hash: AHashMap<u64, SmallVec<[ArchetypeId; 1]>>,
    /// Per kind: component id -> archetypes containing it, ascending by id.
    by_component: [AHashMap<ComponentId, Vec<ArchetypeId>>; ComponentKind::COUNT],
}

impl ArchetypeGraph {
    /// Create the graph with the root (empty-signature) archetype at id 0.
    pub fn new(catalog: &ComponentCatalog) -> Self {
        let mut graph = Self {
            archetypes: Vec::with_capacity(64),
            by_hash: AHashMap::with_capacity(64),
            by_component: [AHashMap::new(), AHashMap::new()],
        };
        let root = graph.create(catalog, SmallVec::new(), SmallVec::new());
        debug_assert_eq!(root, ROOT_ARCHETYPE);
        graph
    }

    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.archetypes.get(id as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id as usize)?.as_mut()
    }

    pub(crate) fn expect(&self, id: ArchetypeId) -> &Archetype {
        self.get(id).expect("archetype id refers to a live archetype")
    }

    pub(crate) fn expect_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        self.get_mut(id)
            .expect("archetype id refers to a live archetype")
    }

    /// Simultaneous mutable access to two distinct archetypes (row moves).
    pub(crate) fn get_two_mut(
        &mut self,
        a: ArchetypeId,
        b: ArchetypeId,
    ) -> (&mut Archetype, &mut Archetype) {
        assert_ne!(a, b);
        let (lo, hi) = (a.min(b) as usize, a.max(b) as usize);
        let (left, right) = self.archetypes.split_at_mut(hi);
        let first = left[lo].as_mut().expect("live archetype");
        let second = right[0].as_mut().expect("live archetype");
        if a < b {
            (first, second)
        } else {
            (second, first)
        }
    }

    pub fn live_count(&self) -> usize {
        self.archetypes.iter().filter(|a| a.is_some()).count()
    }

    /// Arena length, including tombstones. Ids are always below this bound.
    pub(crate) fn arena_len(&self) -> usize {
        self.archetypes.len()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = &Archetype> {
        self.archetypes.iter().flatten()
    }

    pub(crate) fn live_ids(&self) -> Vec<ArchetypeId> {
        self.archetypes
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|_| id as ArchetypeId))
            .collect()
    }

    pub(crate) fn index_list(&self, kind: ComponentKind, id: ComponentId) -> &[ArchetypeId] {
        self.by_component[kind.index()]
            .get(&id)
            .map_or(&[], Vec::as_slice)
    }

    // ========== Interning ==========

    pub(crate) fn find(
        &self,
        catalog: &ComponentCatalog,
        generic: &[ComponentMeta],
        unique: &[ComponentMeta],
    ) -> Option<ArchetypeId> {
        let hash = calc_lookup_hash(catalog, generic, unique);
        let candidates = self.by_hash.get(&hash)?;
        candidates.iter().copied().find(|&id| {
            let arch = self.expect(id);
            arch.components(ComponentKind::Generic) == generic
                && arch.components(ComponentKind::Unique) == unique
        })
    }

    pub(crate) fn find_or_create(
        &mut self,
        catalog: &ComponentCatalog,
        generic: SmallVec<[ComponentMeta; 8]>,
        unique: SmallVec<[ComponentMeta; 8]>,
    ) -> ArchetypeId {
        if let Some(id) = self.find(catalog, &generic, &unique) {
            return id;
        }
        self.create(catalog, generic, unique)
    }

    fn create(
        &mut self,
        catalog: &ComponentCatalog,
        generic: SmallVec<[ComponentMeta; 8]>,
        unique: SmallVec<[ComponentMeta; 8]>,
    ) -> ArchetypeId {
        let id = self.archetypes.len() as ArchetypeId;
        let arch = Archetype::new(id, generic, unique, catalog);

        self.by_hash.entry(arch.lookup_hash()).or_default().push(id);
        for kind in [ComponentKind::Generic, ComponentKind::Unique] {
            for meta in arch.components(kind) {
                self.by_component[kind.index()]
                    .entry(meta.id())
                    .or_default()
                    .push(id);
            }
        }
        self.archetypes.push(Some(arch));
        id
    }

    // ========== Edge traversal ==========

    /// Archetype reached from `base` by adding one component. Synthesizes the
    /// destination and links both edge directions on the first traversal.
    pub(crate) fn with_component(
        &mut self,
        catalog: &ComponentCatalog,
        base: ArchetypeId,
        kind: ComponentKind,
        meta: ComponentMeta,
    ) -> ArchetypeId {
        if let Some(dst) = self.expect(base).edge_add(kind, meta.id()) {
            return dst;
        }

        let src = self.expect(base);
        debug_assert!(!src.contains(kind, meta.id()));
        let mut generic: SmallVec<[ComponentMeta; 8]> =
            SmallVec::from_slice(src.components(ComponentKind::Generic));
        let mut unique: SmallVec<[ComponentMeta; 8]> =
            SmallVec::from_slice(src.components(ComponentKind::Unique));
        let list = match kind {
            ComponentKind::Generic => &mut generic,
            ComponentKind::Unique => &mut unique,
        };
        let pos = list.partition_point(|m| m.id() < meta.id());
        list.insert(pos, meta);

        let dst = self.find_or_create(catalog, generic, unique);
        self.expect_mut(base).set_edge_add(kind, meta.id(), dst);
        self.expect_mut(dst).set_edge_del(kind, meta.id(), base);
        dst
    }

    /// Archetype reached from `base` by removing one component.
    pub(crate) fn without_component(
        &mut self,
        catalog: &ComponentCatalog,
        base: ArchetypeId,
        kind: ComponentKind,
        id: ComponentId,
    ) -> ArchetypeId {
        if let Some(dst) = self.expect(base).edge_del(kind, id) {
            return dst;
        }

        let src = self.expect(base);
        debug_assert!(src.contains(kind, id));
        let mut generic: SmallVec<[ComponentMeta; 8]> =
            SmallVec::from_slice(src.components(ComponentKind::Generic));
        let mut unique: SmallVec<[ComponentMeta; 8]> =
            SmallVec::from_slice(src.components(ComponentKind::Unique));
        let list = match kind {
            ComponentKind::Generic => &mut generic,
            ComponentKind::Unique => &mut unique,
        };
        list.retain(|m| m.id() != id);

        let dst = self.find_or_create(catalog, generic, unique);
        self.expect_mut(base).set_edge_del(kind, id, dst);
        self.expect_mut(dst).set_edge_add(kind, id, base);
        dst
    }

    // ========== Teardown ==========

    /// Remove a dead archetype from every index and unlink its edges.
    /// Returns the index-list positions it vacated so query cursors can be
    /// repaired.
    pub(crate) fn destroy(&mut self, id: ArchetypeId) -> Vec<IndexRemoval> {
        assert_ne!(id, ROOT_ARCHETYPE, "the root archetype is never destroyed");
        let arch = self.archetypes[id as usize].take().expect("live archetype");
        debug_assert!(arch.chunk_count() == 0);

        if let Some(candidates) = self.by_hash.get_mut(&arch.lookup_hash()) {
            candidates.retain(|a| *a != id);
            if candidates.is_empty() {
                self.by_hash.remove(&arch.lookup_hash());
            }
        }

        let mut removals = Vec::new();
        for kind in [ComponentKind::Generic, ComponentKind::Unique] {
            for meta in arch.components(kind) {
                if let Some(list) = self.by_component[kind.index()].get_mut(&meta.id()) {
                    if let Some(pos) = list.iter().position(|&a| a == id) {
                        list.remove(pos);
                        removals.push((kind, meta.id(), pos));
                    }
                    if list.is_empty() {
                        self.by_component[kind.index()].remove(&meta.id());
                    }
                }
            }

            // edge_add(a, c) = id  <=>  edge_del(id, c) = a, and vice versa.
            for (comp, origin) in arch.edges_del_entries(kind) {
                if let Some(o) = self.get_mut(origin) {
                    o.remove_edge_add(kind, comp);
                }
            }
            for (comp, target) in arch.edges_add_entries(kind) {
                if let Some(t) = self.get_mut(target) {
                    t.remove_edge_del(kind, comp);
                }
            }
        }
        removals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct A(u32);
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct B(u32);

    fn setup() -> (ComponentCatalog, ArchetypeGraph) {
        let catalog = ComponentCatalog::new();
        let graph = ArchetypeGraph::new(&catalog);
        (catalog, graph)
    }

    #[test]
    fn test_root_exists() {
        let (_, graph) = setup();
        let root = graph.expect(ROOT_ARCHETYPE);
        assert!(root.components(ComponentKind::Generic).is_empty());
        assert_eq!(root.lookup_hash(), 0);
    }

    #[test]
    fn test_edges_link_both_directions() {
        let (mut catalog, mut graph) = setup();
        let a = catalog.register::<A>();
        let meta = catalog.meta(a);

        let with_a = graph.with_component(&catalog, ROOT_ARCHETYPE, ComponentKind::Generic, meta);
        assert_ne!(with_a, ROOT_ARCHETYPE);
        assert!(graph.expect(with_a).contains(ComponentKind::Generic, a));

        // Cached edge hit.
        let again = graph.with_component(&catalog, ROOT_ARCHETYPE, ComponentKind::Generic, meta);
        assert_eq!(again, with_a);

        // Reverse edge leads home.
        let back = graph.without_component(&catalog, with_a, ComponentKind::Generic, a);
        assert_eq!(back, ROOT_ARCHETYPE);
    }

    #[test]
    fn test_converging_paths_intern_to_one_archetype() {
        let (mut catalog, mut graph) = setup();
        let a_id = catalog.register::<A>();
        let b_id = catalog.register::<B>();
        let (a, b) = (catalog.meta(a_id), catalog.meta(b_id));
        let ga = ComponentKind::Generic;

        // root -> {A} -> {A,B} and root -> {B} -> {A,B} converge.
        let arch_a = graph.with_component(&catalog, ROOT_ARCHETYPE, ga, a);
        let ab_via_a = graph.with_component(&catalog, arch_a, ga, b);
        let arch_b = graph.with_component(&catalog, ROOT_ARCHETYPE, ga, b);
        let ab_via_b = graph.with_component(&catalog, arch_b, ga, a);
        assert_eq!(ab_via_a, ab_via_b);
        assert_eq!(graph.live_count(), 4);
    }

    #[test]
    fn test_generic_and_unique_signatures_distinct() {
        let (mut catalog, mut graph) = setup();
        let a_id = catalog.register_unique::<A>();
        let a = catalog.meta(a_id);

        let as_generic =
            graph.with_component(&catalog, ROOT_ARCHETYPE, ComponentKind::Generic, a);
        let as_unique = graph.with_component(&catalog, ROOT_ARCHETYPE, ComponentKind::Unique, a);
        assert_ne!(as_generic, as_unique);
    }

    #[test]
    fn test_inverted_index_tracks_membership() {
        let (mut catalog, mut graph) = setup();
        let a_id = catalog.register::<A>();
        let b_id = catalog.register::<B>();
        let (a, b) = (catalog.meta(a_id), catalog.meta(b_id));
        let ga = ComponentKind::Generic;

        let arch_a = graph.with_component(&catalog, ROOT_ARCHETYPE, ga, a);
        let arch_ab = graph.with_component(&catalog, arch_a, ga, b);

        assert_eq!(graph.index_list(ga, a.id()), &[arch_a, arch_ab]);
        assert_eq!(graph.index_list(ga, b.id()), &[arch_ab]);
    }

    #[test]
    fn test_destroy_unlinks_everything() {
        let (mut catalog, mut graph) = setup();
        let a_id = catalog.register::<A>();
        let b_id = catalog.register::<B>();
        let (a, b) = (catalog.meta(a_id), catalog.meta(b_id));
        let ga = ComponentKind::Generic;

        let arch_a = graph.with_component(&catalog, ROOT_ARCHETYPE, ga, a);
        let arch_ab = graph.with_component(&catalog, arch_a, ga, b);

        let removals = graph.destroy(arch_ab);
        assert!(graph.get(arch_ab).is_none());
        assert_eq!(graph.index_list(ga, b.id()), &[] as &[ArchetypeId]);
        assert_eq!(graph.index_list(ga, a.id()), &[arch_a]);
        assert_eq!(removals.len(), 2);

        // The surviving neighbor's edge to the dead archetype is gone; a new
        // traversal synthesizes a fresh archetype.
        let fresh = graph.with_component(&catalog, arch_a, ga, b);
        assert_ne!(fresh, arch_ab);
    }
}
