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

//! Chunked archetype ECS.
//!
//! Entities live as rows of fixed-size chunks grouped by archetype (the set
//! of component types they carry). Queries compile to cached plans that match
//! archetypes incrementally and iterate chunk by chunk, with per-column
//! change detection. Structural changes during iteration go through a
//! deferred command buffer.
//!
//! ```
//! use chunked_ecs::World;
//!
//! #[derive(Debug, Clone, Copy)]
//! struct Position { x: f32 }
//! #[derive(Debug, Clone, Copy)]
//! struct Velocity { x: f32 }
//!
//! let mut world = World::new();
//! for i in 0..64 {
//!     world.spawn((Position { x: i as f32 }, Velocity { x: 1.0 }));
//! }
//!
//! let q = world.query().all_mut::<Position>().all::<Velocity>().build();
//! world.each(q, |rows| {
//!     let mut pos = rows.view_mut::<Position>();
//!     let vel = rows.view::<Velocity>();
//!     for i in 0..rows.len() {
//!         pos[i].x += vel[i].x;
//!     }
//! });
//! ```

pub mod archetype;
pub mod block;
pub mod chunk;
pub mod command;
pub mod component;
pub mod config;
pub mod entity;
pub mod error;
pub mod graph;
pub mod query;
pub mod utils;
pub mod world;

// Re-exports for convenience
pub use archetype::{Archetype, ArchetypeId, ArchetypeProps};
pub use chunk::Chunk;
pub use command::{CmdTarget, CommandBuffer, TempEntity};
pub use component::{
    Bundle, Component, ComponentCatalog, ComponentId, ComponentKind, ComponentMeta, SoaComponent,
};
pub use config::WorldConfig;
pub use entity::Entity;
pub use error::{EcsError, Result};
pub use query::{ColumnRef, ColumnRefMut, Constraints, QueryBuilder, QueryId, Rows, Rule};
pub use world::{World, WorldStats};
