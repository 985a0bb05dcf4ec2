//! World - entities plus the managers that store their components.
//!
//! The world does not own component data itself. It allocates entity ids,
//! owns the presence table every manager writes to, and uses both to keep
//! managers consistent when an entity is destroyed.

use std::{hash::Hash, sync::Arc};

use smallvec::SmallVec;
use tracing::debug;

use crate::{
    component::{Component, ComponentId},
    entity::{Entity, EntityAllocator},
    error::{PatchError, PatchResult},
    manager::{ComponentManager, ManagerOptions},
    patch::Patch,
    presence::PresenceTable,
    registry::ComponentRegistry,
    shared::SharedComponentManager,
};

/// Entity id allocation and the presence table shared with every manager.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    allocator: EntityAllocator,
    presence: Arc<PresenceTable>,
}

impl EntityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            allocator: EntityAllocator::with_capacity(capacity),
            presence: Arc::new(PresenceTable::new()),
        }
    }

    pub fn spawn(&mut self) -> Entity {
        self.allocator.allocate()
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.allocator.is_alive(entity)
    }

    #[must_use]
    pub const fn alive_count(&self) -> u32 {
        self.allocator.alive_count()
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTable> {
        &self.presence
    }

    /// Ids of every component `entity` currently has, ascending.
    #[must_use]
    pub fn components_of(&self, entity: Entity) -> SmallVec<[ComponentId; 8]> {
        self.presence.mask(entity).ids()
    }

    /// Recycle the id. Returns `false` if `entity` was not alive.
    ///
    /// Components must already be detached; [`World::despawn`] does both.
    fn release(&mut self, entity: Entity) -> bool {
        if !self.allocator.deallocate(entity) {
            return false;
        }
        self.presence.clear_entity(entity);
        true
    }
}

/// Container for entities and their component managers.
#[derive(Debug, Default)]
pub struct World {
    entities: EntityRegistry,
    components: ComponentRegistry,
}

impl World {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(entity_capacity: usize) -> Self {
        Self {
            entities: EntityRegistry::with_capacity(entity_capacity),
            components: ComponentRegistry::new(),
        }
    }

    #[must_use]
    pub const fn entities(&self) -> &EntityRegistry {
        &self.entities
    }

    #[must_use]
    pub const fn components(&self) -> &ComponentRegistry {
        &self.components
    }

    // ==================== Registration ====================

    /// Register `T` with default options (no change tracking, no codec).
    pub fn register<T: Component + Clone>(&mut self) -> Arc<ComponentManager<T>> {
        self.register_with(ManagerOptions::new())
    }

    pub fn register_with<T: Component + Clone>(&mut self, options: ManagerOptions<T>) -> Arc<ComponentManager<T>> {
        self.components.register(&self.entities.presence, options)
    }

    pub fn register_shared<T: Component + Clone + Eq + Hash>(
        &mut self,
        options: ManagerOptions<T>,
    ) -> Arc<SharedComponentManager<T>> {
        self.components.register_shared(&self.entities.presence, options)
    }

    #[must_use]
    pub fn manager<T: Component>(&self) -> Option<Arc<ComponentManager<T>>> {
        self.components.manager::<T>()
    }

    #[must_use]
    pub fn shared<T: Component>(&self) -> Option<Arc<SharedComponentManager<T>>> {
        self.components.shared::<T>()
    }

    // ==================== Entity Operations ====================

    pub fn spawn(&mut self) -> Entity {
        let entity = self.entities.spawn();
        debug!(%entity, "spawned entity");
        entity
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    #[must_use]
    pub fn components_of(&self, entity: Entity) -> SmallVec<[ComponentId; 8]> {
        self.entities.components_of(entity)
    }

    /// Detach `entity` from every manager that holds it, then recycle its id.
    ///
    /// Returns `false` if `entity` was not alive.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        if !self.entities.is_alive(entity) {
            return false;
        }

        let mut removed = 0_usize;
        self.entities.presence.all_set(entity, |id| {
            if let Some(store) = self.components.store(id) {
                removed += usize::from(store.remove_entity(entity));
            }
            true
        });

        debug!(%entity, removed, "despawned entity");
        self.entities.release(entity)
    }

    // ==================== Replication ====================

    /// Harvest every manager's pending changes. Managers with nothing to send
    /// are skipped.
    pub fn collect_patches(&self) -> PatchResult<Vec<Patch>> {
        let mut patches = Vec::new();
        for store in self.components.stores() {
            let patch = store.patch_get()?;
            if !patch.is_empty() {
                patches.push(patch);
            }
        }
        debug!(patches = patches.len(), "collected patches");
        Ok(patches)
    }

    /// Route each patch to the manager registered under its component id.
    ///
    /// Stops at the first failing patch; earlier ones stay applied.
    pub fn apply_patches(&self, patches: &[Patch]) -> PatchResult<()> {
        for patch in patches {
            let store = self
                .components
                .store(patch.component)
                .ok_or(PatchError::UnknownComponent(patch.component))?;
            store.patch_apply(patch)?;
        }
        Ok(())
    }

    pub fn reset_patches(&self) {
        for store in self.components.stores() {
            store.patch_reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{BincodeCodec, PodCodec};

    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    #[repr(C)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
    struct Name(String);

    #[test]
    fn test_despawn_clears_every_manager() {
        let mut world = World::new();
        let positions = world.register::<Position>();
        let names = world.register_shared::<Name>(ManagerOptions::new());

        let a = world.spawn();
        let b = world.spawn();
        positions.create(a, Position { x: 1.0, y: 1.0 });
        positions.create(b, Position { x: 2.0, y: 2.0 });
        names.create(a, Name("a".into()));

        assert_eq!(world.components_of(a).as_slice(), &[positions.id(), names.id()]);

        assert!(world.despawn(a));
        assert!(!world.is_alive(a));
        assert!(!positions.has(a));
        assert!(!names.has(a));
        assert_eq!(names.instance_count(), 0);
        assert!(world.components_of(a).is_empty());

        assert!(positions.has(b));
        assert!(!world.despawn(a));
    }

    #[test]
    fn test_recycled_id_starts_clean() {
        let mut world = World::new();
        let positions = world.register::<Position>();

        let old = world.spawn();
        positions.create(old, Position { x: 0.0, y: 0.0 });
        world.despawn(old);

        let new = world.spawn();
        assert_eq!(new.id(), old.id());
        assert_ne!(new, old);
        assert!(!positions.has(new));

        positions.create(new, Position { x: 5.0, y: 5.0 });
        assert!(!positions.has(old));
    }

    #[test]
    fn test_typed_lookup_through_world() {
        let mut world = World::new();
        let registered = world.register::<Position>();

        let found = world.manager::<Position>().unwrap();
        assert!(Arc::ptr_eq(&registered, &found));
        assert!(world.shared::<Position>().is_none());
    }

    #[test]
    fn test_patches_replicate_between_worlds() {
        let mut source = World::new();
        let positions = source.register_with(ManagerOptions::<Position>::new().track_changes(true).codec(PodCodec));
        let names = source.register_shared(ManagerOptions::<Name>::new().track_changes(true).codec(BincodeCodec));

        let mut replica = World::new();
        let replica_positions = replica.register_with(ManagerOptions::<Position>::new().codec(PodCodec));
        let replica_names = replica.register_shared(ManagerOptions::<Name>::new().codec(BincodeCodec));

        let a = source.spawn();
        let b = source.spawn();
        positions.create(a, Position { x: 1.0, y: 2.0 });
        positions.create(b, Position { x: 3.0, y: 4.0 });
        names.create(a, Name("alpha".into()));

        let patches = source.collect_patches().unwrap();
        assert_eq!(patches.len(), 2);
        replica.apply_patches(&patches).unwrap();
        source.reset_patches();
        assert!(source.collect_patches().unwrap().is_empty());

        assert_eq!(replica_positions.get(b), Some(Position { x: 3.0, y: 4.0 }));
        assert_eq!(replica_names.get(a), Some(Name("alpha".into())));

        source.despawn(a);
        replica.apply_patches(&source.collect_patches().unwrap()).unwrap();
        assert!(!replica_positions.has(a));
        assert!(!replica_names.has(a));
        assert!(replica_positions.has(b));
    }

    #[test]
    fn test_apply_to_unregistered_component_fails() {
        let world = World::new();
        let patch = Patch::empty(ComponentId::from_raw(9));
        assert!(matches!(
            world.apply_patches(&[patch]),
            Err(PatchError::UnknownComponent(_))
        ));
    }
}
