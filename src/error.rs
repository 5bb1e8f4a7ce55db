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

//! Error types
//!
//! Recoverable conditions surface as `Err`; API misuse (structural changes
//! under a chunk lock, catalog limit violations, duplicate component adds)
//! panics with a diagnostic instead.

use std::fmt;

/// ECS error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Entity handle is stale or was never allocated
    EntityNotFound,

    /// Component not present on the entity's archetype
    ComponentNotFound,

    /// Archetype id does not refer to a live archetype
    ArchetypeNotFound,

    /// Entity name already in use by a different entity
    NameTaken(String),

    /// Batch size too large (possible DoS attack)
    BatchTooLarge,
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::EntityNotFound => write!(f, "Entity not found"),
            EcsError::ComponentNotFound => write!(f, "Component not found"),
            EcsError::ArchetypeNotFound => write!(f, "Archetype not found"),
            EcsError::NameTaken(name) => write!(f, "Entity name already taken: {name}"),
            EcsError::BatchTooLarge => write!(f, "Batch size too large (max 10,000,000)"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
