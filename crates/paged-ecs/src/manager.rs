//! Component manager: the canonical per-type store.
//!
//! Three structures move in lock-step:
//!
//! - `components`: dense values, gap-free.
//! - `entities`: the owner of each dense slot, same index space.
//! - `lookup`: sparse `entity id -> dense index`.
//!
//! `len(components) == len(entities) == len(lookup)` is asserted on entry and
//! exit of every structural call. Removal is a swap-remove, so dense order is
//! not stable across deletions.
//!
//! # Access
//!
//! The `&self` entry points (`create`, `get`, `set`, `delete`, ...) each take
//! the manager's lock for one call: readers share it, structural changes and
//! writes take it exclusively. Holding a [`ManagerGuard`] from
//! [`ComponentManager::lock`] gives reference access instead: references
//! borrowed from the guard cannot outlive it and cannot be held across
//! `create`/`delete` on it, which is exactly the window in which storage may
//! relocate.
//!
//! Iteration takes the lock once for the whole scan. The read scans
//! (`for_each`, `par_for_each`) hold it shared and recursively, so a visitor may
//! call `get`/`has` on the same manager from any worker. A visitor that writes
//! to the manager it is visiting deadlocks; use [`ComponentManager::retain`] to
//! delete the visited element and the `_mut` scans to overwrite it.

use std::{fmt, sync::Arc};

use parking_lot::{RwLock, RwLockWriteGuard};
use tracing::trace;

use crate::{
    component::{Component, ComponentId},
    entity::Entity,
    error::{PatchError, PatchResult},
    fanout,
    paged_map::PagedMap,
    paged_vec::PagedVec,
    patch::{ChangeTracker, ComponentCodec, Patch, PatchTarget},
    presence::PresenceTable,
};

/// Construction options shared by both manager variants.
pub struct ManagerOptions<T> {
    pub(crate) track_changes: bool,
    pub(crate) codec: Option<Arc<dyn ComponentCodec<T>>>,
}

impl<T> Default for ManagerOptions<T> {
    fn default() -> Self {
        Self {
            track_changes: false,
            codec: None,
        }
    }
}

impl<T> ManagerOptions<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record created / patched / deleted entities for patch generation.
    #[must_use]
    pub fn track_changes(mut self, enabled: bool) -> Self {
        self.track_changes = enabled;
        self
    }

    #[must_use]
    pub fn codec<C: ComponentCodec<T> + 'static>(mut self, codec: C) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }
}

impl<T> fmt::Debug for ManagerOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("track_changes", &self.track_changes)
            .field("codec", &self.codec.is_some())
            .finish()
    }
}

struct Slots<T> {
    components: PagedVec<T>,
    entities: PagedVec<Entity>,
    lookup: PagedMap<usize>,
    tracker: ChangeTracker,
}

impl<T> Slots<T> {
    /// Dense index of `entity`, rejecting a stale generation on the same id.
    fn index_of(&self, entity: Entity) -> Option<usize> {
        let index = *self.lookup.get(entity.id())?;
        (*self.entities.get(index) == entity).then_some(index)
    }

    fn get(&self, entity: Entity) -> Option<&T> {
        let index = self.index_of(entity)?;
        Some(self.components.get(index))
    }

    /// `(entity, value)` pairs in reverse dense order.
    fn iter(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.entities
            .iter()
            .zip(self.components.iter())
            .map(|((_, &entity), (_, value))| (entity, value))
    }

    fn par_for_each<F>(&self, workers: usize, f: F)
    where
        T: Sync,
        F: Fn(Entity, &T) + Sync,
    {
        let segments = self
            .components
            .segments()
            .zip(self.entities.segments())
            .map(|((start, values), (_, owners))| (start, (values, owners)));

        let parts = fanout::distribute(self.components.len(), workers, segments);
        fanout::run_parts(parts, |_, segments| {
            for (_, (values, owners)) in segments {
                for (value, &entity) in values.iter().zip(owners) {
                    f(entity, value);
                }
            }
        });
    }

    fn check(&self) {
        assert_eq!(
            self.components.len(),
            self.entities.len(),
            "components/entities length mismatch"
        );
        assert_eq!(
            self.components.len(),
            self.lookup.len(),
            "components/lookup length mismatch"
        );
    }
}

/// Per-type store binding one entity to one value of `T`.
pub struct ComponentManager<T> {
    id: ComponentId,
    presence: Arc<PresenceTable>,
    codec: Option<Arc<dyn ComponentCodec<T>>>,
    slots: RwLock<Slots<T>>,
}

impl<T: Component> ComponentManager<T> {
    #[must_use]
    pub fn new(id: ComponentId, presence: Arc<PresenceTable>) -> Self {
        Self::with_options(id, presence, ManagerOptions::default())
    }

    #[must_use]
    pub fn with_options(id: ComponentId, presence: Arc<PresenceTable>, options: ManagerOptions<T>) -> Self {
        Self {
            id,
            presence,
            codec: options.codec,
            slots: RwLock::new(Slots {
                components: PagedVec::new(),
                entities: PagedVec::new(),
                lookup: PagedMap::new(),
                tracker: ChangeTracker::new(options.track_changes),
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ComponentId {
        self.id
    }

    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTable> {
        &self.presence
    }

    /// Take the lock exclusively and hand out reference-level access.
    pub fn lock(&self) -> ManagerGuard<'_, T> {
        ManagerGuard {
            id: self.id,
            presence: &self.presence,
            slots: self.slots.write(),
        }
    }

    /// Attach `value` to `entity`.
    ///
    /// # Panics
    ///
    /// Panics if `entity` already has this component.
    pub fn create(&self, entity: Entity, value: T) {
        self.lock().create(entity, value);
    }

    #[must_use]
    pub fn get(&self, entity: Entity) -> Option<T>
    where
        T: Clone,
    {
        self.slots.read_recursive().get(entity).cloned()
    }

    /// Overwrite in place. Returns `false` if the entity lacks the component.
    pub fn set(&self, entity: Entity, value: T) -> bool {
        self.lock().set(entity, value).is_some()
    }

    /// Detach and return the value.
    ///
    /// # Panics
    ///
    /// Panics if `entity` does not have this component.
    pub fn delete(&self, entity: Entity) -> T {
        self.lock().delete(entity)
    }

    /// Like [`delete`](Self::delete) but absence is not a contract violation.
    pub fn remove(&self, entity: Entity) -> Option<T> {
        self.lock().remove(entity)
    }

    #[must_use]
    pub fn has(&self, entity: Entity) -> bool {
        self.slots.read_recursive().index_of(entity).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read_recursive().components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock-free access when the caller already holds the manager exclusively.
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        let slots = self.slots.get_mut();
        let index = slots.index_of(entity)?;
        Some(slots.components.get_mut(index))
    }

    /// Append every value, in dense order, to `buf`.
    pub fn raw_components(&self, buf: &mut Vec<T>)
    where
        T: Clone,
    {
        self.slots.read_recursive().components.copy_into(buf);
    }

    /// Append every owner, in dense order, to `buf`.
    pub fn raw_entities(&self, buf: &mut Vec<Entity>) {
        self.slots.read_recursive().entities.copy_into(buf);
    }

    /// Visit every `(entity, value)` in reverse dense order.
    pub fn for_each<F: FnMut(Entity, &T)>(&self, mut f: F) {
        for (entity, value) in self.slots.read_recursive().iter() {
            f(entity, value);
        }
    }

    pub fn for_each_mut<F: FnMut(Entity, &mut T)>(&self, f: F) {
        self.lock().for_each_mut(f);
    }

    /// Visit in reverse dense order, deleting every element for which `keep`
    /// returns `false`.
    pub fn retain<F: FnMut(Entity, &mut T) -> bool>(&self, keep: F) {
        self.lock().retain(keep);
    }

    /// Visit every element exactly once from `workers` concurrent workers.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero, or re-raises a worker panic.
    pub fn par_for_each<F>(&self, workers: usize, f: F)
    where
        F: Fn(Entity, &T) + Sync,
    {
        self.slots.read_recursive().par_for_each(workers, f);
    }

    /// # Panics
    ///
    /// Panics if `workers` is zero, or re-raises a worker panic.
    pub fn par_for_each_mut<F>(&self, workers: usize, f: F)
    where
        F: Fn(Entity, &mut T) + Sync,
    {
        self.lock().par_for_each_mut(workers, f);
    }

    pub fn set_tracking(&self, enabled: bool) {
        self.slots.write().tracker.set_enabled(enabled);
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.slots.read_recursive().tracker.is_enabled()
    }

    /// Harvest the tracked changes since the last [`patch_reset`](Self::patch_reset).
    pub fn patch_get(&self) -> PatchResult<Patch>
    where
        T: Clone,
    {
        let slots = self.slots.read_recursive();
        slots.tracker.harvest(self.id, self.codec.as_deref(), |entity| {
            slots
                .index_of(entity)
                .map(|index| slots.components.get_value(index))
        })
    }

    /// Replay a patch produced by a manager of the same component type.
    pub fn patch_apply(&self, patch: &Patch) -> PatchResult<()> {
        let codec = self.codec.as_deref().ok_or(PatchError::MissingCodec(self.id))?;
        patch.replay(self.id, codec, &mut self.lock())
    }

    /// Forget tracked changes. Component data is untouched.
    pub fn patch_reset(&self) {
        self.slots.write().tracker.reset();
    }
}

impl<T> fmt::Debug for ComponentManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentManager")
            .field("id", &self.id)
            .field("type", &std::any::type_name::<T>())
            .field("len", &self.slots.read_recursive().components.len())
            .finish()
    }
}

/// Exclusively locked view of a [`ComponentManager`].
pub struct ManagerGuard<'a, T> {
    id: ComponentId,
    presence: &'a PresenceTable,
    slots: RwLockWriteGuard<'a, Slots<T>>,
}

impl<T> ManagerGuard<'_, T> {
    /// Attach `value` to `entity` and return it at its new dense slot.
    ///
    /// # Panics
    ///
    /// Panics if `entity` (or a stale entity with the same id) already has
    /// this component.
    pub fn create(&mut self, entity: Entity, value: T) -> &mut T {
        let id = self.id;
        let slots = &mut *self.slots;
        slots.check();

        if let Some(&index) = slots.lookup.get(entity.id()) {
            let owner = *slots.entities.get(index);
            panic!("cannot create component {id} for {entity}: slot owned by {owner}");
        }

        let index = slots.components.len();
        slots.components.push(value);
        slots.entities.push(entity);
        slots.lookup.insert(entity.id(), index);
        self.presence.set(entity, id);
        slots.tracker.record_created(entity);

        slots.check();
        slots.components.get_mut(index)
    }

    #[must_use]
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.slots.get(entity)
    }

    /// Reference into dense storage. Borrowing the guard keeps it from
    /// outliving the next structural change.
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        let index = self.slots.index_of(entity)?;
        Some(self.slots.components.get_mut(index))
    }

    /// Overwrite in place and record the entity as patched.
    pub fn set(&mut self, entity: Entity, value: T) -> Option<&mut T> {
        let slots = &mut *self.slots;
        let index = slots.index_of(entity)?;
        slots.components.set(index, value);
        slots.tracker.record_patched(entity);
        Some(slots.components.get_mut(index))
    }

    /// Swap-remove `entity`'s value.
    ///
    /// # Panics
    ///
    /// Panics if `entity` does not have this component.
    pub fn delete(&mut self, entity: Entity) -> T {
        let id = self.id;
        match self.remove(entity) {
            Some(value) => value,
            None => panic!("cannot delete component {id} from {entity}: not present"),
        }
    }

    pub fn remove(&mut self, entity: Entity) -> Option<T> {
        let id = self.id;
        let slots = &mut *self.slots;
        let index = slots.index_of(entity)?;
        slots.check();

        let value = slots.components.swap_remove(index);
        slots.entities.swap_remove(index);
        slots.lookup.remove(entity.id());

        if let Some(&moved) = slots.entities.try_get(index) {
            slots.lookup.insert(moved.id(), index);
            trace!(component = %id, %moved, index, "relocated after swap-remove");
        }

        self.presence.unset(entity, id);
        slots.tracker.record_deleted(entity);

        slots.check();
        Some(value)
    }

    #[must_use]
    pub fn has(&self, entity: Entity) -> bool {
        self.slots.index_of(entity).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dense index currently holding `entity`'s value.
    #[must_use]
    pub fn dense_index(&self, entity: Entity) -> Option<usize> {
        self.slots.index_of(entity)
    }

    /// Owner of dense slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn entity_at(&self, index: usize) -> Entity {
        *self.slots.entities.get(index)
    }

    /// Value in dense slot `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    #[must_use]
    pub fn component_at(&self, index: usize) -> &T {
        self.slots.components.get(index)
    }

    /// `(entity, value)` pairs in reverse dense order.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.slots.iter()
    }

    pub fn for_each<F: FnMut(Entity, &T)>(&self, mut f: F) {
        for (entity, value) in self.iter() {
            f(entity, value);
        }
    }

    pub fn for_each_mut<F: FnMut(Entity, &mut T)>(&mut self, mut f: F) {
        let slots = &mut *self.slots;
        for ((_, &entity), (_, value)) in slots.entities.iter().zip(slots.components.iter_mut()) {
            f(entity, value);
        }
    }

    /// Reverse scan that may delete the element being visited.
    ///
    /// A swap-remove only ever pulls the tail into the hole, and walking from
    /// the tail down means the pulled element has already been visited.
    pub fn retain<F: FnMut(Entity, &mut T) -> bool>(&mut self, mut keep: F) {
        let mut index = self.len();
        while index > 0 {
            index -= 1;
            let entity = self.entity_at(index);
            if !keep(entity, self.slots.components.get_mut(index)) {
                self.delete(entity);
            }
        }
    }

    /// # Panics
    ///
    /// Panics if `workers` is zero, or re-raises a worker panic.
    pub fn par_for_each<F>(&self, workers: usize, f: F)
    where
        T: Sync,
        F: Fn(Entity, &T) + Sync,
    {
        self.slots.par_for_each(workers, f);
    }

    /// # Panics
    ///
    /// Panics if `workers` is zero, or re-raises a worker panic.
    pub fn par_for_each_mut<F>(&mut self, workers: usize, f: F)
    where
        T: Send,
        F: Fn(Entity, &mut T) + Sync,
    {
        let Slots {
            components,
            entities,
            ..
        } = &mut *self.slots;
        let len = components.len();
        let segments = components
            .segments_mut()
            .zip(entities.segments())
            .map(|((start, values), (_, owners))| (start, (values, owners)));

        let parts = fanout::distribute(len, workers, segments);
        fanout::run_parts(parts, |_, segments| {
            for (_, (values, owners)) in segments {
                for (value, &entity) in values.iter_mut().zip(owners) {
                    f(entity, value);
                }
            }
        });
    }

    pub fn raw_components(&self, buf: &mut Vec<T>)
    where
        T: Clone,
    {
        self.slots.components.copy_into(buf);
    }

    pub fn raw_entities(&self, buf: &mut Vec<Entity>) {
        self.slots.entities.copy_into(buf);
    }
}

impl<T> PatchTarget<T> for ManagerGuard<'_, T> {
    fn upsert(&mut self, entity: Entity, value: T) {
        if self.has(entity) {
            self.set(entity, value);
        } else {
            self.create(entity, value);
        }
    }

    fn remove(&mut self, entity: Entity) {
        ManagerGuard::remove(self, entity);
    }
}
