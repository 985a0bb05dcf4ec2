#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::float_cmp)]

//! Paged ECS - per-type component storage on paged arrays
//!
//! Every component type gets its own manager. A manager keeps its values in a
//! gap-free paged array, the owning entities in a second array with the same
//! index space, and a paged sparse map from entity id to dense index.
//!
//! # Key Concepts
//!
//! - **Entity**: Generational id handed out by the [`EntityRegistry`]
//! - **Component**: Any `Send + Sync + 'static` value, registered explicitly
//! - **Manager**: [`ComponentManager`] (one value per entity) or
//!   [`SharedComponentManager`] (de-duplicated values behind instance ids)
//! - **Presence**: Per-entity [`ComponentMask`] that managers flip on create
//!   and delete, used by the world to destroy entities
//! - **Patch**: Created / patched / deleted change sets for replication
//!
//! # Access Patterns
//!
//! Manager entry points lock once per call and return owned values:
//! - `create(e, v)` - attach a value (panics if already attached)
//! - `get(e)` - clone of the value
//! - `set(e, v)` - overwrite in place
//! - `delete(e)` - swap-remove and return the value
//!
//! For reference access, take the lock explicitly:
//! ```ignore
//! let mut guard = health.lock();
//! if let Some(hp) = guard.get_mut(entity) {
//!     hp.0 -= 10;
//! }
//! ```
//!
//! Bulk iteration locks once for the whole scan, and the parallel variants
//! fan out over disjoint page slices:
//! ```ignore
//! health.par_for_each_mut(8, |_, hp| hp.0 = hp.0.min(100));
//! ```

mod component;
mod entity;
mod error;
pub mod fanout;
mod manager;
mod paged_map;
mod paged_vec;
mod patch;
mod presence;
mod registry;
mod shared;
mod world;

pub use component::{Component, ComponentId, ComponentInfo, MAX_COMPONENTS, StorageKind};
pub use entity::{Entity, EntityAllocator, EntityId, Generation};
pub use error::{PatchError, PatchResult};
pub use manager::{ComponentManager, ManagerGuard, ManagerOptions};
pub use paged_map::PagedMap;
pub use paged_vec::{PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PagedVec};
pub use patch::{BincodeCodec, ChangeSet, ChangeTracker, ComponentCodec, Patch, PodCodec};
pub use presence::{ComponentMask, PresenceTable};
pub use registry::{ComponentRegistry, ComponentStore};
pub use shared::{InstanceId, SharedComponentManager};
pub use world::{EntityRegistry, World};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Component, ComponentId, ComponentManager, Entity, ManagerOptions, Patch, PodCodec,
        SharedComponentManager, World,
    };
}
