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

//! Component traits, descriptors and the catalog.
//!
//! The catalog maps Rust types to stable numeric component ids and keeps one
//! descriptor per id: layout metadata packed into 64 bits, lookup and matcher
//! hashes, and the lifecycle thunks the type-erased storage needs. Trivial
//! types carry no thunks; the engine falls back to byte copies.

use std::any::TypeId;

use ahash::AHashMap;
use smallvec::{smallvec, SmallVec};
use tinyvec::ArrayVec;

use crate::config::{
    MAX_COMPONENT_ALIGNMENT, MAX_COMPONENT_SIZE, MAX_PLACED_ALIGNMENT, MAX_SOA_MEMBERS,
};
use crate::entity::Entity;
use crate::utils::{align_up, matcher_bit, type_hash};

/// Maximum number of components supported by Bundle implementations
pub const MAX_BUNDLE_COMPONENTS: usize = 8;

/// Marker trait for components
///
/// Components must be 'static (no borrowed data)
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Structure-of-arrays component: stored as parallel sub-arrays rather than a
/// packed struct array.
///
/// `MEMBER_SIZES` lists the byte size of each sub-array element in declaration
/// order; the sizes must sum to `size_of::<T>()`. SoA components must be
/// `Copy` (no lifecycle thunks).
pub trait SoaComponent: Component + Copy {
    const MEMBER_SIZES: &'static [usize];
}

/// Stable numeric component id, valid for the owning catalog's lifetime.
pub type ComponentId = u32;

/// Padding value for fixed-size component-id arrays.
pub const INVALID_COMPONENT: ComponentId = ComponentId::MAX;

/// Which list of an archetype a component lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// One instance per entity row.
    Generic = 0,
    /// One instance per chunk, shared by all rows; doubles as the chunk's
    /// partition key during defragmentation.
    Unique = 1,
}

impl ComponentKind {
    pub const COUNT: usize = 2;

    pub fn index(self) -> usize {
        self as usize
    }
}

const META_SIZE_SHIFT: u32 = 32;
const META_ALIGN_SHIFT: u32 = 40;
const META_ARITY_SHIFT: u32 = 50;

/// Component id plus layout metadata packed into 64 bits: 32-bit id, element
/// size (8 bits), alignment (10 bits), SoA arity (5 bits, 0 = AoS).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentMeta(u64);

impl ComponentMeta {
    pub(crate) fn new(id: ComponentId, size: usize, alignment: usize, soa_arity: usize) -> Self {
        assert!(
            size <= MAX_COMPONENT_SIZE,
            "component size {size} exceeds {MAX_COMPONENT_SIZE} bytes"
        );
        assert!(
            alignment <= MAX_COMPONENT_ALIGNMENT,
            "component alignment {alignment} exceeds {MAX_COMPONENT_ALIGNMENT}"
        );
        assert!(
            alignment <= MAX_PLACED_ALIGNMENT,
            "component alignment {alignment} exceeds chunk placement alignment {MAX_PLACED_ALIGNMENT}"
        );
        assert!(
            soa_arity <= MAX_SOA_MEMBERS,
            "SoA arity {soa_arity} exceeds {MAX_SOA_MEMBERS}"
        );
        Self(
            u64::from(id)
                | (size as u64) << META_SIZE_SHIFT
                | (alignment as u64) << META_ALIGN_SHIFT
                | (soa_arity as u64) << META_ARITY_SHIFT,
        )
    }

    /// Filler for padded record arrays; never a live column.
    pub(crate) const fn empty() -> Self {
        Self(u64::MAX)
    }

    pub fn id(self) -> ComponentId {
        self.0 as u32
    }

    pub fn size(self) -> usize {
        (self.0 >> META_SIZE_SHIFT & 0xFF) as usize
    }

    pub fn alignment(self) -> usize {
        (self.0 >> META_ALIGN_SHIFT & 0x3FF) as usize
    }

    /// 0 for AoS storage, otherwise the number of SoA sub-arrays.
    pub fn soa_arity(self) -> usize {
        (self.0 >> META_ARITY_SHIFT & 0x1F) as usize
    }
}

impl std::fmt::Debug for ComponentMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentMeta")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("alignment", &self.alignment())
            .field("soa_arity", &self.soa_arity())
            .finish()
    }
}

/// Per-id registration record.
///
/// Thunks are stored as plain function pointers; the set of operations is
/// closed. `drop_fn` is present iff the type needs drop. `clone_fn`/`eq_fn`
/// are captured only through the `PartialEq + Clone`-bounded registration
/// paths and are required before a component may serve as a Unique partition
/// key.
pub struct ComponentDescriptor {
    pub name: &'static str,
    pub type_id: TypeId,
    pub lookup_hash: u64,
    pub matcher_hash: u64,
    pub meta: ComponentMeta,
    pub member_sizes: ArrayVec<[u8; MAX_SOA_MEMBERS]>,
    pub drop_fn: Option<unsafe fn(*mut u8)>,
    pub default_fn: Option<unsafe fn(*mut u8)>,
    pub clone_fn: Option<unsafe fn(*const u8, *mut u8)>,
    pub eq_fn: Option<unsafe fn(*const u8, *const u8) -> bool>,
}

impl ComponentDescriptor {
    /// Handle for this component id in the shared entity/component id space.
    pub fn handle(&self) -> Entity {
        Entity::new_component(self.meta.id())
    }

    /// Bytes one column of this component occupies for `rows` rows.
    ///
    /// SoA columns expand into arity sub-arrays, each padded to the component
    /// alignment, plus one trailing sentinel region so the last element can be
    /// read with a full-width load.
    pub fn column_bytes(&self, rows: usize) -> usize {
        let meta = self.meta;
        if meta.soa_arity() == 0 {
            meta.size() * rows
        } else {
            let align = meta.alignment().max(1);
            let mut bytes = 0usize;
            for &member in self.member_sizes.as_slice() {
                bytes += align_up(member as usize * rows, align);
            }
            bytes + align
        }
    }

    /// Byte offset of SoA sub-array `member` within this component's column.
    pub fn soa_member_offset(&self, member: usize, rows: usize) -> usize {
        debug_assert!(member < self.meta.soa_arity());
        let align = self.meta.alignment().max(1);
        let mut offset = 0usize;
        for &size in &self.member_sizes.as_slice()[..member] {
            offset += align_up(size as usize * rows, align);
        }
        offset
    }
}

unsafe fn drop_thunk<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut T);
}

unsafe fn default_thunk<T: Default>(ptr: *mut u8) {
    std::ptr::write(ptr as *mut T, T::default());
}

unsafe fn clone_thunk<T: Clone>(src: *const u8, dst: *mut u8) {
    std::ptr::write(dst as *mut T, (*(src as *const T)).clone());
}

unsafe fn eq_thunk<T: PartialEq>(a: *const u8, b: *const u8) -> bool {
    *(a as *const T) == *(b as *const T)
}

/// Type descriptor registry.
///
/// Registration is idempotent; ids are handed out monotonically and stay
/// stable for the catalog's lifetime. Ids must not be persisted across runs.
pub struct ComponentCatalog {
    descriptors: Vec<ComponentDescriptor>,
    by_type: AHashMap<TypeId, ComponentId>,
}

impl ComponentCatalog {
    pub fn new() -> Self {
        Self {
            descriptors: Vec::with_capacity(64),
            by_type: AHashMap::with_capacity(64),
        }
    }

    /// Register `T` as a plain (AoS) component, or return its existing id.
    pub fn register<T: Component>(&mut self) -> ComponentId {
        self.register_inner::<T>(0, &[])
    }

    /// Register `T` for use as a Unique (per-chunk) component.
    ///
    /// Captures the clone and equality thunks chunk placement and
    /// defragmentation merging rely on.
    pub fn register_unique<T: Component + Clone + PartialEq>(&mut self) -> ComponentId {
        let id = self.register_inner::<T>(0, &[]);
        assert!(
            self.descriptors[id as usize].meta.soa_arity() == 0,
            "SoA component {} cannot be used as a Unique partition key",
            std::any::type_name::<T>()
        );
        let desc = &mut self.descriptors[id as usize];
        desc.clone_fn.get_or_insert(clone_thunk::<T>);
        desc.eq_fn.get_or_insert(eq_thunk::<T>);
        id
    }

    /// Capture a clone thunk for `T`, enabling value duplication when an
    /// entity is created from an existing one.
    pub fn register_clonable<T: Component + Clone>(&mut self) -> ComponentId {
        let id = self.register::<T>();
        self.descriptors[id as usize]
            .clone_fn
            .get_or_insert(clone_thunk::<T>);
        id
    }

    /// Capture a default-constructor thunk for `T`, enabling entity creation
    /// straight from an archetype id.
    pub fn register_default<T: Component + Default>(&mut self) -> ComponentId {
        let id = self.register::<T>();
        self.descriptors[id as usize]
            .default_fn
            .get_or_insert(default_thunk::<T>);
        id
    }

    /// Register `T` with structure-of-arrays storage.
    pub fn register_soa<T: SoaComponent>(&mut self) -> ComponentId {
        let members = T::MEMBER_SIZES;
        assert!(
            !members.is_empty() && members.len() <= MAX_SOA_MEMBERS,
            "SoA component {} declares {} members (1..={} allowed)",
            std::any::type_name::<T>(),
            members.len(),
            MAX_SOA_MEMBERS
        );
        assert!(
            members.iter().sum::<usize>() == std::mem::size_of::<T>(),
            "SoA member sizes of {} do not sum to the component size",
            std::any::type_name::<T>()
        );
        assert!(
            members.iter().all(|&m| m > 0 && m <= MAX_COMPONENT_SIZE),
            "SoA member size out of range for {}",
            std::any::type_name::<T>()
        );
        let id = self.register_inner::<T>(members.len(), members);
        // Registration is idempotent; a prior AoS registration of the same
        // type is a storage-layout conflict.
        assert_eq!(
            self.get(id).meta.soa_arity(),
            members.len(),
            "{} was already registered with a different storage layout",
            std::any::type_name::<T>()
        );
        id
    }

    fn register_inner<T: Component>(
        &mut self,
        soa_arity: usize,
        member_sizes: &[usize],
    ) -> ComponentId {
        let type_id = TypeId::of::<T>();
        if let Some(&id) = self.by_type.get(&type_id) {
            return id;
        }

        // SoA storage moves sub-arrays independently; only trivially copyable
        // types are eligible, so a drop thunk is a registration error.
        assert!(
            soa_arity == 0 || !std::mem::needs_drop::<T>(),
            "SoA component {} must be trivially copyable",
            std::any::type_name::<T>()
        );

        let id = self.descriptors.len() as ComponentId;
        let lookup_hash = type_hash::<T>();
        let mut sizes: ArrayVec<[u8; MAX_SOA_MEMBERS]> = ArrayVec::new();
        for &member in member_sizes {
            sizes.push(member as u8);
        }

        self.descriptors.push(ComponentDescriptor {
            name: std::any::type_name::<T>(),
            type_id,
            lookup_hash,
            matcher_hash: matcher_bit(lookup_hash),
            meta: ComponentMeta::new(
                id,
                std::mem::size_of::<T>(),
                std::mem::align_of::<T>(),
                soa_arity,
            ),
            member_sizes: sizes,
            drop_fn: std::mem::needs_drop::<T>().then_some(drop_thunk::<T> as unsafe fn(*mut u8)),
            default_fn: None,
            clone_fn: None,
            eq_fn: None,
        });
        self.by_type.insert(type_id, id);
        id
    }

    /// Fast path: id of an already-registered type.
    pub fn lookup(&self, type_id: TypeId) -> Option<ComponentId> {
        self.by_type.get(&type_id).copied()
    }

    pub fn lookup_of<T: Component>(&self) -> Option<ComponentId> {
        self.lookup(TypeId::of::<T>())
    }

    /// Descriptor access. Precondition: `id` came from this catalog.
    pub fn get(&self, id: ComponentId) -> &ComponentDescriptor {
        &self.descriptors[id as usize]
    }

    pub fn meta(&self, id: ComponentId) -> ComponentMeta {
        self.descriptors[id as usize].meta
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

impl Default for ComponentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Bundle of components
///
/// Allows spawning entities with multiple components at once.
pub trait Bundle: Send + Sync + 'static {
    /// Register every component in the bundle and return their ids in
    /// declaration order.
    fn component_ids(catalog: &mut ComponentCatalog) -> SmallVec<[ComponentId; MAX_BUNDLE_COMPONENTS]>
    where
        Self: Sized;

    /// Write components to raw pointers, one per id in declaration order.
    ///
    /// # Safety
    /// Caller must ensure pointers are valid and properly aligned
    unsafe fn write_components(self, ptrs: &[*mut u8]);
}

// Macro for tuple Bundle implementations
macro_rules! impl_bundle {
    ($($T:ident),*) => {
        impl<$($T: Component),*> Bundle for ($($T,)*) {
            fn component_ids(
                catalog: &mut ComponentCatalog,
            ) -> SmallVec<[ComponentId; MAX_BUNDLE_COMPONENTS]> {
                smallvec![$(catalog.register::<$T>()),*]
            }

            #[allow(non_snake_case)]
            unsafe fn write_components(self, ptrs: &[*mut u8]) {
                let ($($T,)*) = self;
                let mut i = 0;
                $(
                    std::ptr::write(ptrs[i] as *mut $T, $T);
                    i += 1;
                )*
                let _ = i; // Suppress unused warning
            }
        }
    };
}

// Implement for tuples of 1-8 components
impl_bundle!(A);
impl_bundle!(A, B);
impl_bundle!(A, B, C);
impl_bundle!(A, B, C, D);
impl_bundle!(A, B, C, D, E);
impl_bundle!(A, B, C, D, E, F);
impl_bundle!(A, B, C, D, E, F, G);
impl_bundle!(A, B, C, D, E, F, G, H);
