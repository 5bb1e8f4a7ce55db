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

//! Engine constants and per-world tuning knobs.

/// Maximum number of components per kind on a single archetype.
///
/// Chunk records keep fixed arrays of this length so column lookups are a
/// bounded linear scan.
pub const MAX_COMPONENTS: usize = 32;

/// Maximum number of sub-arrays a structure-of-arrays component may declare.
pub const MAX_SOA_MEMBERS: usize = 4;

/// Maximum element size of a registered component, in bytes.
pub const MAX_COMPONENT_SIZE: usize = 255;

/// Maximum declared alignment accepted by the component catalog.
pub const MAX_COMPONENT_ALIGNMENT: usize = 1023;

/// Alignment actually honored by chunk column placement; registration rejects
/// anything above this (chunk payloads are 64-byte aligned).
pub const MAX_PLACED_ALIGNMENT: usize = 64;

/// Hard cap on rows per chunk, independent of how small the rows are.
pub const MAX_ROWS_PER_CHUNK: usize = 512;

/// Chunks handed to the query callback are grouped in batches of this size;
/// the next batch's first chunk is prefetched between batches.
pub const ITER_BATCH_CHUNKS: usize = 4;

/// Per-world tuning knobs.
///
/// All values have conservative defaults; construct a world with
/// [`crate::World::with_config`] to override them.
#[derive(Debug, Clone, Copy)]
pub struct WorldConfig {
    /// Ticks an empty chunk survives before its memory is reclaimed.
    pub chunk_lifespan: u8,
    /// Ticks an empty archetype survives before it is torn down.
    pub archetype_lifespan: u8,
    /// Rows moved per [`crate::World::update`] call while compacting chunks.
    pub defrag_rows_per_tick: u32,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            chunk_lifespan: 8,
            archetype_lifespan: 8,
            defrag_rows_per_tick: 64,
        }
    }
}
