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

//! Deferred command buffer.
//!
//! Structural mutations queued during iteration are encoded as a byte stream
//! of `[opcode | fixed payload]` records and replayed in insertion order at
//! commit time. Component values live in a bump arena at their natural
//! alignment until replay moves them into their destination columns; values
//! never replayed are destroyed when the buffer drops.
//!
//! Create commands return a [`TempEntity`] token that later commands in the
//! same buffer may target; the token map is populated as creates execute.

use std::alloc::Layout;

use ahash::AHashMap;
use bumpalo::Bump;

#[cfg(feature = "profiling")]
use tracing::info_span;

use crate::archetype::ArchetypeId;
use crate::component::{Component, ComponentCatalog, ComponentId};
use crate::entity::Entity;
use crate::error::Result;
use crate::world::World;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpCode {
    Create = 0,
    CreateFromEntity = 1,
    CreateFromArchetype = 2,
    Delete = 3,
    AddComponent = 4,
    RemoveComponent = 5,
    SetComponent = 6,
    Enable = 7,
}

impl OpCode {
    fn from_u8(byte: u8) -> Self {
        match byte {
            0 => OpCode::Create,
            1 => OpCode::CreateFromEntity,
            2 => OpCode::CreateFromArchetype,
            3 => OpCode::Delete,
            4 => OpCode::AddComponent,
            5 => OpCode::RemoveComponent,
            6 => OpCode::SetComponent,
            7 => OpCode::Enable,
            other => panic!("corrupt command buffer: opcode {other}"),
        }
    }
}

const TEMP_TARGET_BIT: u64 = 1 << 63;

/// Placeholder for an entity a command buffer will create at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TempEntity(u32);

/// A command target: a live entity or a token from the same buffer.
#[derive(Debug, Clone, Copy)]
pub enum CmdTarget {
    Live(Entity),
    Temp(TempEntity),
}

impl CmdTarget {
    fn encode(self) -> u64 {
        match self {
            // Entity handles never use bit 63, so it can flag tokens.
            CmdTarget::Live(entity) => entity.to_bits(),
            CmdTarget::Temp(TempEntity(token)) => TEMP_TARGET_BIT | u64::from(token),
        }
    }
}

impl From<Entity> for CmdTarget {
    fn from(entity: Entity) -> Self {
        CmdTarget::Live(entity)
    }
}

impl From<TempEntity> for CmdTarget {
    fn from(token: TempEntity) -> Self {
        CmdTarget::Temp(token)
    }
}

type RegisterFn = fn(&mut ComponentCatalog) -> ComponentId;

fn register_thunk<T: Component>(catalog: &mut ComponentCatalog) -> ComponentId {
    catalog.register::<T>()
}

unsafe fn drop_thunk<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut T);
}

/// Append-only buffer of structural mutations, replayed by [`Self::commit`].
#[derive(Default)]
pub struct CommandBuffer {
    buf: Vec<u8>,
    arena: Bump,
    /// Arena values awaiting replay; destroyed on drop if never consumed.
    pending_values: AHashMap<usize, unsafe fn(*mut u8)>,
    /// Component types referenced by queued commands; payloads index here.
    type_regs: Vec<RegisterFn>,
    next_token: u32,
    commands: usize,
}

impl CommandBuffer {
    /// Create new command buffer
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands == 0
    }

    // ========== Queuing ==========

    /// Queue creation of an empty entity.
    pub fn add(&mut self) -> TempEntity {
        let token = self.take_token();
        self.push_op(OpCode::Create);
        self.push_u32(token.0);
        token
    }

    /// Queue creation of an entity duplicating `src`'s archetype and values.
    pub fn add_from_entity(&mut self, src: Entity) -> TempEntity {
        let token = self.take_token();
        self.push_op(OpCode::CreateFromEntity);
        self.push_u32(token.0);
        self.push_u64(src.to_bits());
        token
    }

    /// Queue creation of a default-constructed entity in an archetype.
    pub fn add_from_archetype(&mut self, archetype: ArchetypeId) -> TempEntity {
        let token = self.take_token();
        self.push_op(OpCode::CreateFromArchetype);
        self.push_u32(token.0);
        self.push_u32(archetype);
        token
    }

    /// Queue entity destruction.
    pub fn del(&mut self, target: impl Into<CmdTarget>) {
        self.push_op(OpCode::Delete);
        self.push_u64(target.into().encode());
    }

    /// Queue adding a component with the given value.
    pub fn add_component<T: Component>(&mut self, target: impl Into<CmdTarget>, value: T) {
        let reg = self.type_reg::<T>();
        let ptr = self.push_value(value);
        self.push_op(OpCode::AddComponent);
        self.push_u64(target.into().encode());
        self.push_u32(reg);
        self.push_usize(ptr);
    }

    /// Queue adding `T::default()`.
    pub fn add_default<T: Component + Default>(&mut self, target: impl Into<CmdTarget>) {
        self.add_component(target, T::default());
    }

    /// Queue component removal.
    pub fn remove_component<T: Component>(&mut self, target: impl Into<CmdTarget>) {
        let reg = self.type_reg::<T>();
        self.push_op(OpCode::RemoveComponent);
        self.push_u64(target.into().encode());
        self.push_u32(reg);
    }

    /// Queue overwriting an existing component value.
    pub fn set_component<T: Component>(&mut self, target: impl Into<CmdTarget>, value: T) {
        let reg = self.type_reg::<T>();
        let ptr = self.push_value(value);
        self.push_op(OpCode::SetComponent);
        self.push_u64(target.into().encode());
        self.push_u32(reg);
        self.push_usize(ptr);
    }

    /// Queue enabling or disabling an entity.
    pub fn enable(&mut self, target: impl Into<CmdTarget>, enabled: bool) {
        self.push_op(OpCode::Enable);
        self.push_u64(target.into().encode());
        self.buf.push(enabled as u8);
    }

    // ========== Replay ==========

    /// Replay every queued command against the world in insertion order,
    /// then clear the buffer. Commands targeting a token resolve through the
    /// entities earlier create commands produced.
    pub fn commit(&mut self, world: &mut World) -> Result<()> {
        #[cfg(feature = "profiling")]
        let span = info_span!("command_buffer.commit", queued = self.commands);
        #[cfg(feature = "profiling")]
        let _span_guard = span.enter();

        let mut tokens: Vec<Entity> = Vec::with_capacity(self.next_token as usize);
        let mut cursor = 0usize;
        while cursor < self.buf.len() {
            let op = OpCode::from_u8(self.buf[cursor]);
            cursor += 1;
            match op {
                OpCode::Create => {
                    let token = self.read_u32(&mut cursor);
                    debug_assert_eq!(token as usize, tokens.len());
                    tokens.push(world.add());
                }
                OpCode::CreateFromEntity => {
                    let token = self.read_u32(&mut cursor);
                    debug_assert_eq!(token as usize, tokens.len());
                    let src = Entity::from_bits(self.read_u64(&mut cursor));
                    tokens.push(world.add_from_entity(src)?);
                }
                OpCode::CreateFromArchetype => {
                    let token = self.read_u32(&mut cursor);
                    debug_assert_eq!(token as usize, tokens.len());
                    let archetype = self.read_u32(&mut cursor);
                    tokens.push(world.add_from_archetype(archetype)?);
                }
                OpCode::Delete => {
                    let entity = resolve_target(self.read_u64(&mut cursor), &tokens);
                    world.despawn(entity)?;
                }
                OpCode::AddComponent => {
                    let entity = resolve_target(self.read_u64(&mut cursor), &tokens);
                    let reg = self.read_u32(&mut cursor);
                    let ptr = self.read_usize(&mut cursor);
                    let comp = self.type_regs[reg as usize](world.catalog_mut());
                    world.add_component_raw(entity, comp, ptr as *const u8)?;
                    self.pending_values.remove(&ptr);
                }
                OpCode::RemoveComponent => {
                    let entity = resolve_target(self.read_u64(&mut cursor), &tokens);
                    let reg = self.read_u32(&mut cursor);
                    let comp = self.type_regs[reg as usize](world.catalog_mut());
                    world.remove_component_raw(entity, comp)?;
                }
                OpCode::SetComponent => {
                    let entity = resolve_target(self.read_u64(&mut cursor), &tokens);
                    let reg = self.read_u32(&mut cursor);
                    let ptr = self.read_usize(&mut cursor);
                    let comp = self.type_regs[reg as usize](world.catalog_mut());
                    world.set_component_raw(entity, comp, ptr as *const u8)?;
                    self.pending_values.remove(&ptr);
                }
                OpCode::Enable => {
                    let entity = resolve_target(self.read_u64(&mut cursor), &tokens);
                    let flag = self.buf[cursor] != 0;
                    cursor += 1;
                    world.enable(entity, flag)?;
                }
            }
        }
        self.clear();
        Ok(())
    }

    /// Drop queued commands, destroying any values that were never replayed.
    pub fn clear(&mut self) {
        for (&ptr, &drop_fn) in &self.pending_values {
            // SAFETY: the arena allocation is alive and holds an unconsumed
            // value.
            unsafe { drop_fn(ptr as *mut u8) };
        }
        self.pending_values.clear();
        self.buf.clear();
        self.type_regs.clear();
        self.arena.reset();
        self.next_token = 0;
        self.commands = 0;
    }

    // ========== Encoding helpers ==========

    fn take_token(&mut self) -> TempEntity {
        let token = TempEntity(self.next_token);
        self.next_token += 1;
        token
    }

    fn type_reg<T: Component>(&mut self) -> u32 {
        self.type_regs.push(register_thunk::<T>);
        (self.type_regs.len() - 1) as u32
    }

    fn push_value<T>(&mut self, value: T) -> usize {
        let ptr = self.arena.alloc_layout(Layout::new::<T>()).as_ptr();
        // SAFETY: the arena handed out a properly aligned slot for T.
        unsafe { std::ptr::write(ptr as *mut T, value) };
        if std::mem::needs_drop::<T>() {
            self.pending_values
                .insert(ptr as usize, drop_thunk::<T> as unsafe fn(*mut u8));
        }
        ptr as usize
    }

    fn push_op(&mut self, op: OpCode) {
        self.buf.push(op as u8);
        self.commands += 1;
    }

    fn push_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn push_usize(&mut self, value: usize) {
        self.buf.extend_from_slice(&(value as u64).to_le_bytes());
    }

    fn read_u32(&self, cursor: &mut usize) -> u32 {
        let bytes = self.buf[*cursor..*cursor + 4].try_into().expect("payload");
        *cursor += 4;
        u32::from_le_bytes(bytes)
    }

    fn read_u64(&self, cursor: &mut usize) -> u64 {
        let bytes = self.buf[*cursor..*cursor + 8].try_into().expect("payload");
        *cursor += 8;
        u64::from_le_bytes(bytes)
    }

    fn read_usize(&self, cursor: &mut usize) -> usize {
        self.read_u64(cursor) as usize
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

fn resolve_target(bits: u64, tokens: &[Entity]) -> Entity {
    if bits & TEMP_TARGET_BIT != 0 {
        let token = bits as u32 as usize;
        assert!(token < tokens.len(), "token from a different command buffer");
        tokens[token]
    } else {
        Entity::from_bits(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Health(i32);

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Armor(i32);

    #[test]
    fn test_empty_commit_is_noop() {
        let mut world = World::new();
        let before = world.version();
        let mut buffer = CommandBuffer::new();
        buffer.commit(&mut world).unwrap();
        assert_eq!(world.entity_count(), 0);
        assert_eq!(world.version(), before);
    }

    #[test]
    fn test_create_and_target_token() {
        let mut world = World::new();
        let mut buffer = CommandBuffer::new();

        let token = buffer.add();
        buffer.add_component(token, Health(100));
        buffer.add_component(token, Armor(50));
        assert_eq!(buffer.len(), 3);

        buffer.commit(&mut world).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(world.entity_count(), 1);

        let q = world.query().all::<Health>().all::<Armor>().build();
        let mut seen = 0;
        world.each(q, |rows| {
            let health = rows.view::<Health>();
            let armor = rows.view::<Armor>();
            for i in 0..rows.len() {
                assert_eq!(health[i], Health(100));
                assert_eq!(armor[i], Armor(50));
                seen += 1;
            }
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut world = World::new();
        let entity = world.spawn((Health(1),));

        let mut buffer = CommandBuffer::new();
        buffer.set_component(entity, Health(2));
        buffer.remove_component::<Health>(entity);
        buffer.add_component(entity, Health(3));
        buffer.commit(&mut world).unwrap();

        assert_eq!(world.get_component::<Health>(entity), Some(&Health(3)));
    }

    #[test]
    fn test_delete_by_command() {
        let mut world = World::new();
        let entity = world.spawn((Health(1),));
        let mut buffer = CommandBuffer::new();
        buffer.del(entity);
        buffer.commit(&mut world).unwrap();
        assert!(!world.is_alive(entity));
    }

    #[test]
    fn test_enable_by_command() {
        let mut world = World::new();
        let entity = world.spawn((Health(1),));
        let mut buffer = CommandBuffer::new();
        buffer.enable(entity, false);
        buffer.commit(&mut world).unwrap();
        assert!(!world.is_enabled(entity));
    }

    #[test]
    fn test_unreplayed_values_are_dropped() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Tracked(#[allow(dead_code)] String);
        impl Drop for Tracked {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut world = World::new();
        let entity = world.spawn((Health(1),));
        {
            let mut buffer = CommandBuffer::new();
            buffer.add_component(entity, Tracked("queued".into()));
            // Dropped without commit.
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);

        // A committed value is moved, not dropped, at commit time.
        let mut buffer = CommandBuffer::new();
        buffer.add_component(entity, Tracked("moved".into()));
        buffer.commit(&mut world).unwrap();
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        drop(world);
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_create_from_entity_command() {
        let mut world = World::new();
        let src = world.spawn((Health(7),));

        let mut buffer = CommandBuffer::new();
        let copy = buffer.add_from_entity(src);
        buffer.add_component(copy, Armor(3));
        buffer.commit(&mut world).unwrap();

        assert_eq!(world.entity_count(), 2);
        let q = world.query().all::<Health>().all::<Armor>().build();
        assert_eq!(world.count(q), 1);
    }

    #[test]
    fn test_commit_error_on_dead_target() {
        let mut world = World::new();
        let entity = world.spawn((Health(1),));
        world.despawn(entity).unwrap();

        let mut buffer = CommandBuffer::new();
        buffer.del(entity);
        assert!(buffer.commit(&mut world).is_err());
    }
}
