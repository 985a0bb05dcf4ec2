//! Shared-component manager: many entities, few distinct values.
//!
//! Each distinct value is stored once as an *instance*. Entities hold an
//! [`InstanceId`] instead of a copy, and instances are reference-counted so
//! the last detaching entity frees the slot.
//!
//! Both sides use the same dense/sparse layout as
//! [`ComponentManager`](crate::ComponentManager): instance values and their
//! ids in lock-step paged arrays with an id -> slot map, and entity bindings
//! in lock-step paged arrays with an entity -> slot map. Removal on either
//! side is a swap-remove.
//!
//! Locking follows the dense manager: lookups and the read scans share the
//! lock recursively, so visitors may read the manager they are visiting.

use std::{fmt, hash::Hash, sync::Arc};

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
    component::{Component, ComponentId},
    entity::Entity,
    error::{PatchError, PatchResult},
    fanout,
    manager::ManagerOptions,
    paged_map::PagedMap,
    paged_vec::PagedVec,
    patch::{ChangeTracker, ComponentCodec, Patch, PatchTarget},
    presence::PresenceTable,
};

/// Stable handle to one de-duplicated value. Ids are recycled once released.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(u32);

impl InstanceId {
    #[must_use]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InstanceId({})", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct Instances<T> {
    values: PagedVec<T>,
    ids: PagedVec<InstanceId>,
    refcounts: PagedVec<u32>,
    slot_of: PagedMap<usize>,
    dedup: HashMap<T, InstanceId>,
    free: Vec<InstanceId>,
    next: u32,
}

impl<T: Clone + Eq + Hash> Instances<T> {
    fn new() -> Self {
        Self {
            values: PagedVec::new(),
            ids: PagedVec::new(),
            refcounts: PagedVec::new(),
            slot_of: PagedMap::new(),
            dedup: HashMap::new(),
            free: Vec::new(),
            next: 0,
        }
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn intern(&mut self, value: T) -> InstanceId {
        if let Some(&id) = self.dedup.get(&value) {
            return id;
        }

        let id = self.free.pop().unwrap_or_else(|| {
            let id = InstanceId(self.next);
            self.next = self
                .next
                .checked_add(1)
                .unwrap_or_else(|| panic!("instance id space exhausted"));
            id
        });

        let slot = self.values.len();
        self.dedup.insert(value.clone(), id);
        self.values.push(value);
        self.ids.push(id);
        self.refcounts.push(0);
        self.slot_of.insert(id.0, slot);
        id
    }

    fn slot(&self, id: InstanceId) -> Option<usize> {
        self.slot_of.get(id.0).copied()
    }

    fn value(&self, id: InstanceId) -> Option<&T> {
        Some(self.values.get(self.slot(id)?))
    }

    fn refcount(&self, id: InstanceId) -> Option<u32> {
        Some(*self.refcounts.get(self.slot(id)?))
    }

    fn acquire(&mut self, id: InstanceId) {
        let slot = self
            .slot(id)
            .unwrap_or_else(|| panic!("unknown shared instance {id}"));
        *self.refcounts.get_mut(slot) += 1;
    }

    /// Drop one reference; frees the instance at zero and returns its value.
    fn release(&mut self, id: InstanceId) -> Option<T> {
        let slot = self
            .slot(id)
            .unwrap_or_else(|| panic!("unknown shared instance {id}"));
        let count = self.refcounts.get_mut(slot);
        assert!(*count > 0, "shared instance {id} released more often than acquired");
        *count -= 1;
        if *count > 0 {
            return None;
        }

        let value = self.values.swap_remove(slot);
        self.ids.swap_remove(slot);
        self.refcounts.swap_remove(slot);
        self.slot_of.remove(id.0);
        self.dedup.remove(&value);
        self.free.push(id);

        if let Some(&moved) = self.ids.try_get(slot) {
            self.slot_of.insert(moved.0, slot);
        }
        trace!(instance = %id, "released shared instance");
        Some(value)
    }
}

struct Bindings {
    entities: PagedVec<Entity>,
    instances: PagedVec<InstanceId>,
    lookup: PagedMap<usize>,
}

impl Bindings {
    fn index_of(&self, entity: Entity) -> Option<usize> {
        let index = *self.lookup.get(entity.id())?;
        (*self.entities.get(index) == entity).then_some(index)
    }

    fn check(&self) {
        assert_eq!(
            self.entities.len(),
            self.instances.len(),
            "entities/instances length mismatch"
        );
        assert_eq!(
            self.entities.len(),
            self.lookup.len(),
            "entities/lookup length mismatch"
        );
    }
}

struct SharedSlots<T> {
    instances: Instances<T>,
    bindings: Bindings,
    tracker: ChangeTracker,
}

impl<T: Clone + Eq + Hash> SharedSlots<T> {
    fn get(&self, entity: Entity) -> Option<&T> {
        let index = self.bindings.index_of(entity)?;
        self.instances.value(*self.bindings.instances.get(index))
    }
}

/// Per-type store of de-duplicated values.
pub struct SharedComponentManager<T> {
    id: ComponentId,
    presence: Arc<PresenceTable>,
    codec: Option<Arc<dyn ComponentCodec<T>>>,
    slots: RwLock<SharedSlots<T>>,
}

impl<T: Component + Clone + Eq + Hash> SharedComponentManager<T> {
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
            slots: RwLock::new(SharedSlots {
                instances: Instances::new(),
                bindings: Bindings {
                    entities: PagedVec::new(),
                    instances: PagedVec::new(),
                    lookup: PagedMap::new(),
                },
                tracker: ChangeTracker::new(options.track_changes),
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ComponentId {
        self.id
    }

    fn lock(&self) -> Locked<'_, T> {
        Locked {
            id: self.id,
            presence: &self.presence,
            slots: self.slots.write(),
        }
    }

    /// Instance holding `value`, allocating one if no equal value is stored.
    ///
    /// A fresh instance has no references; it is freed the first time its
    /// count drops back to zero.
    pub fn intern(&self, value: T) -> InstanceId {
        self.slots.write().instances.intern(value)
    }

    /// # Panics
    ///
    /// Panics if `entity` already has this component.
    pub fn create(&self, entity: Entity, value: T) -> InstanceId {
        self.lock().create(entity, value)
    }

    /// Bind `entity` to an existing instance.
    ///
    /// # Panics
    ///
    /// Panics if `entity` already has this component or `instance` is unknown.
    pub fn attach(&self, entity: Entity, instance: InstanceId) {
        self.lock().attach(entity, instance);
    }

    #[must_use]
    pub fn get(&self, entity: Entity) -> Option<T> {
        self.slots.read_recursive().get(entity).cloned()
    }

    #[must_use]
    pub fn instance_of(&self, entity: Entity) -> Option<InstanceId> {
        let slots = self.slots.read_recursive();
        let index = slots.bindings.index_of(entity)?;
        Some(*slots.bindings.instances.get(index))
    }

    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<T> {
        self.slots.read_recursive().instances.value(id).cloned()
    }

    /// Re-point `entity` at the instance for `value`.
    pub fn set(&self, entity: Entity, value: T) -> bool {
        self.lock().set(entity, value)
    }

    /// # Panics
    ///
    /// Panics if `entity` does not have this component.
    pub fn delete(&self, entity: Entity) -> T {
        let id = self.id;
        match self.remove(entity) {
            Some(value) => value,
            None => panic!("cannot delete shared component {id} from {entity}: not present"),
        }
    }

    pub fn remove(&self, entity: Entity) -> Option<T> {
        self.lock().remove(entity)
    }

    #[must_use]
    pub fn has(&self, entity: Entity) -> bool {
        self.slots.read_recursive().bindings.index_of(entity).is_some()
    }

    /// Number of bound entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read_recursive().bindings.entities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct live values.
    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.slots.read_recursive().instances.len()
    }

    #[must_use]
    pub fn refcount(&self, id: InstanceId) -> Option<u32> {
        self.slots.read_recursive().instances.refcount(id)
    }

    /// Visit every bound entity in reverse dense order.
    pub fn for_each<F: FnMut(Entity, &T)>(&self, mut f: F) {
        let slots = self.slots.read_recursive();
        let SharedSlots {
            instances, bindings, ..
        } = &*slots;
        for ((_, &entity), (_, &id)) in bindings.entities.iter().zip(bindings.instances.iter()) {
            if let Some(value) = instances.value(id) {
                f(entity, value);
            }
        }
    }

    /// # Panics
    ///
    /// Panics if `workers` is zero, or re-raises a worker panic.
    pub fn par_for_each<F>(&self, workers: usize, f: F)
    where
        F: Fn(Entity, &T) + Sync,
    {
        let slots = self.slots.read_recursive();
        let SharedSlots {
            instances, bindings, ..
        } = &*slots;

        let segments = bindings
            .entities
            .segments()
            .zip(bindings.instances.segments())
            .map(|((start, owners), (_, ids))| (start, (owners, ids)));

        let parts = fanout::distribute(bindings.entities.len(), workers, segments);
        fanout::run_parts(parts, |_, segments| {
            for (_, (owners, ids)) in segments {
                for (&entity, &id) in owners.iter().zip(ids) {
                    if let Some(value) = instances.value(id) {
                        f(entity, value);
                    }
                }
            }
        });
    }

    pub fn set_tracking(&self, enabled: bool) {
        self.slots.write().tracker.set_enabled(enabled);
    }

    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.slots.read_recursive().tracker.is_enabled()
    }

    /// Values are resolved through the instance table, so a replica receives
    /// plain values and re-interns them.
    pub fn patch_get(&self) -> PatchResult<Patch> {
        let slots = self.slots.read_recursive();
        slots
            .tracker
            .harvest(self.id, self.codec.as_deref(), |entity| slots.get(entity).cloned())
    }

    pub fn patch_apply(&self, patch: &Patch) -> PatchResult<()> {
        let codec = self.codec.as_deref().ok_or(PatchError::MissingCodec(self.id))?;
        patch.replay(self.id, codec, &mut self.lock())
    }

    pub fn patch_reset(&self) {
        self.slots.write().tracker.reset();
    }
}

impl<T> fmt::Debug for SharedComponentManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read_recursive();
        f.debug_struct("SharedComponentManager")
            .field("id", &self.id)
            .field("type", &std::any::type_name::<T>())
            .field("entities", &slots.bindings.entities.len())
            .field("instances", &slots.instances.values.len())
            .finish()
    }
}

struct Locked<'a, T> {
    id: ComponentId,
    presence: &'a PresenceTable,
    slots: RwLockWriteGuard<'a, SharedSlots<T>>,
}

impl<T: Clone + Eq + Hash> Locked<'_, T> {
    fn create(&mut self, entity: Entity, value: T) -> InstanceId {
        let instance = self.slots.instances.intern(value);
        self.attach(entity, instance);
        instance
    }

    fn attach(&mut self, entity: Entity, instance: InstanceId) {
        let id = self.id;
        let slots = &mut *self.slots;
        slots.bindings.check();

        if let Some(&index) = slots.bindings.lookup.get(entity.id()) {
            let owner = *slots.bindings.entities.get(index);
            panic!("cannot create shared component {id} for {entity}: slot owned by {owner}");
        }

        slots.instances.acquire(instance);

        let index = slots.bindings.entities.len();
        slots.bindings.entities.push(entity);
        slots.bindings.instances.push(instance);
        slots.bindings.lookup.insert(entity.id(), index);
        self.presence.set(entity, id);
        slots.tracker.record_created(entity);

        slots.bindings.check();
    }

    fn set(&mut self, entity: Entity, value: T) -> bool {
        let slots = &mut *self.slots;
        let Some(index) = slots.bindings.index_of(entity) else {
            return false;
        };

        let old = *slots.bindings.instances.get(index);
        let new = slots.instances.intern(value);
        if new != old {
            slots.instances.acquire(new);
            slots.bindings.instances.set(index, new);
            slots.instances.release(old);
        }
        slots.tracker.record_patched(entity);
        true
    }

    fn remove(&mut self, entity: Entity) -> Option<T> {
        let id = self.id;
        let slots = &mut *self.slots;
        let index = slots.bindings.index_of(entity)?;
        slots.bindings.check();

        slots.bindings.entities.swap_remove(index);
        let instance = slots.bindings.instances.swap_remove(index);
        slots.bindings.lookup.remove(entity.id());
        if let Some(&moved) = slots.bindings.entities.try_get(index) {
            slots.bindings.lookup.insert(moved.id(), index);
        }

        // The last reference takes the value out; otherwise the instance lives on.
        let value = match slots.instances.release(instance) {
            Some(value) => value,
            None => match slots.instances.value(instance) {
                Some(value) => value.clone(),
                None => unreachable!("shared instance {instance} vanished while referenced"),
            },
        };

        self.presence.unset(entity, id);
        slots.tracker.record_deleted(entity);

        slots.bindings.check();
        Some(value)
    }
}

impl<T: Clone + Eq + Hash> PatchTarget<T> for Locked<'_, T> {
    fn upsert(&mut self, entity: Entity, value: T) {
        if self.slots.bindings.index_of(entity).is_some() {
            self.set(entity, value);
        } else {
            self.create(entity, value);
        }
    }

    fn remove(&mut self, entity: Entity) {
        Locked::remove(self, entity);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{entity::Generation, patch::BincodeCodec};

    #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    enum Team {
        Red,
        Blue,
        Green,
    }

    fn manager() -> SharedComponentManager<Team> {
        SharedComponentManager::new(ComponentId::from_raw(3), Arc::new(PresenceTable::new()))
    }

    fn e(id: u32) -> Entity {
        Entity::from_id(id)
    }

    #[test]
    fn test_equal_values_share_one_instance() {
        let teams = manager();
        let a = teams.create(e(1), Team::Red);
        let b = teams.create(e(2), Team::Red);
        teams.create(e(3), Team::Blue);

        assert_eq!(a, b);
        assert_eq!(teams.len(), 3);
        assert_eq!(teams.instance_count(), 2);
        assert_eq!(teams.refcount(a), Some(2));
        assert_eq!(teams.instance_of(e(2)), Some(a));
        assert_eq!(teams.get(e(3)), Some(Team::Blue));
    }

    #[test]
    fn test_last_detach_frees_instance() {
        let teams = manager();
        let red = teams.create(e(1), Team::Red);
        teams.create(e(2), Team::Red);
        let blue = teams.create(e(3), Team::Blue);

        assert_eq!(teams.delete(e(1)), Team::Red);
        assert_eq!(teams.refcount(red), Some(1));

        assert_eq!(teams.delete(e(2)), Team::Red);
        assert_eq!(teams.refcount(red), None);
        assert_eq!(teams.instance(red), None);
        assert_eq!(teams.instance_count(), 1);

        // The surviving instance is still reachable after the swap-remove.
        assert_eq!(teams.instance(blue), Some(Team::Blue));
        assert_eq!(teams.get(e(3)), Some(Team::Blue));
    }

    #[test]
    fn test_released_ids_are_recycled() {
        let teams = manager();
        let red = teams.create(e(1), Team::Red);
        teams.delete(e(1));

        let green = teams.create(e(2), Team::Green);
        assert_eq!(green, red);
        assert_eq!(teams.instance(green), Some(Team::Green));
    }

    #[test]
    fn test_set_repoints_and_releases() {
        let teams = manager();
        let red = teams.create(e(1), Team::Red);

        assert!(teams.set(e(1), Team::Blue));
        assert_eq!(teams.get(e(1)), Some(Team::Blue));
        assert_eq!(teams.refcount(red), None);
        assert_eq!(teams.instance_count(), 1);

        // Same value: no churn.
        let blue = teams.instance_of(e(1)).unwrap();
        assert!(teams.set(e(1), Team::Blue));
        assert_eq!(teams.instance_of(e(1)), Some(blue));
        assert_eq!(teams.refcount(blue), Some(1));

        assert!(!teams.set(e(9), Team::Red));
    }

    #[test]
    fn test_attach_existing_instance() {
        let teams = manager();
        let green = teams.intern(Team::Green);
        assert_eq!(teams.refcount(green), Some(0));

        teams.attach(e(4), green);
        teams.attach(e(5), green);
        assert_eq!(teams.refcount(green), Some(2));
        assert_eq!(teams.get(e(5)), Some(Team::Green));
    }

    #[test]
    #[should_panic(expected = "unknown shared instance")]
    fn test_attach_unknown_instance_panics() {
        let teams = manager();
        let red = teams.create(e(1), Team::Red);
        teams.delete(e(1));
        teams.attach(e(2), red);
    }

    #[test]
    #[should_panic(expected = "cannot create shared component")]
    fn test_double_create_panics() {
        let teams = manager();
        teams.create(e(1), Team::Red);
        teams.create(e(1), Team::Blue);
    }

    #[test]
    fn test_presence_follows_bindings() {
        let presence = Arc::new(PresenceTable::new());
        let teams: SharedComponentManager<Team> =
            SharedComponentManager::new(ComponentId::from_raw(3), Arc::clone(&presence));

        teams.create(e(1), Team::Red);
        assert!(presence.test(e(1), teams.id()));
        teams.remove(e(1));
        assert!(!presence.test(e(1), teams.id()));
        assert_eq!(teams.remove(e(1)), None);
    }

    #[test]
    fn test_iteration_resolves_values() {
        let teams = manager();
        for id in 0..3000 {
            let team = if id % 2 == 0 { Team::Red } else { Team::Blue };
            teams.create(e(id), team);
        }

        let mut reds = 0;
        teams.for_each(|entity, team| {
            assert_eq!(*team == Team::Red, entity.id() % 2 == 0);
            reds += usize::from(*team == Team::Red);
        });
        assert_eq!(reds, 1500);

        let hits = AtomicUsize::new(0);
        teams.par_for_each(8, |_, _| {
            hits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(hits.load(Ordering::Relaxed), 3000);
    }

    #[test]
    fn test_patch_reinterns_on_replica() {
        let options = || ManagerOptions::<Team>::new().track_changes(true).codec(BincodeCodec);
        let source =
            SharedComponentManager::with_options(ComponentId::from_raw(3), Arc::new(PresenceTable::new()), options());
        source.create(e(1), Team::Red);
        source.create(e(2), Team::Red);
        source.create(e(3), Team::Blue);

        let replica =
            SharedComponentManager::with_options(ComponentId::from_raw(3), Arc::new(PresenceTable::new()), options());
        replica.patch_apply(&source.patch_get().unwrap()).unwrap();
        source.patch_reset();

        assert_eq!(replica.len(), 3);
        assert_eq!(replica.instance_count(), 2);
        assert_eq!(replica.get(e(2)), Some(Team::Red));

        source.set(e(1), Team::Green);
        source.delete(e(3));
        replica.patch_apply(&source.patch_get().unwrap()).unwrap();

        assert_eq!(replica.get(e(1)), Some(Team::Green));
        assert!(!replica.has(e(3)));
        assert_eq!(replica.instance_count(), 2);
    }

    #[test]
    fn test_visitors_may_read_the_visited_manager() {
        let teams = manager();
        for id in 0..2000 {
            teams.create(e(id), if id % 3 == 0 { Team::Green } else { Team::Red });
        }

        let checked = AtomicUsize::new(0);
        teams.par_for_each(4, |entity, team| {
            assert_eq!(teams.get(entity).as_ref(), Some(team));
            let instance = teams.instance_of(entity).unwrap();
            assert!(teams.refcount(instance).is_some_and(|count| count > 0));
            checked.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(checked.load(Ordering::Relaxed), 2000);

        teams.for_each(|entity, _| assert!(teams.has(entity)));
    }

    #[test]
    fn test_patch_replays_recycled_id_within_one_window() {
        let options = || ManagerOptions::<Team>::new().track_changes(true).codec(BincodeCodec);
        let source =
            SharedComponentManager::with_options(ComponentId::from_raw(3), Arc::new(PresenceTable::new()), options());
        let replica =
            SharedComponentManager::with_options(ComponentId::from_raw(3), Arc::new(PresenceTable::new()), options());

        let old = Entity::new(4, Generation::new());
        let new = Entity::new(4, Generation::new().next());

        source.create(old, Team::Blue);
        replica.patch_apply(&source.patch_get().unwrap()).unwrap();
        source.patch_reset();
        assert_eq!(replica.get(old), Some(Team::Blue));

        // The old owner's release frees the only instance before the new
        // owner interns the same value again.
        source.delete(old);
        source.create(new, Team::Blue);

        let patch = source.patch_get().unwrap();
        assert_eq!(patch.created.entities, vec![new]);
        assert_eq!(patch.deleted.entities, vec![old]);

        replica.patch_apply(&patch).unwrap();
        assert!(!replica.has(old));
        assert_eq!(replica.get(new), Some(Team::Blue));
        assert_eq!(replica.len(), 1);
        assert_eq!(replica.instance_count(), 1);
        let instance = replica.instance_of(new).unwrap();
        assert_eq!(replica.refcount(instance), Some(1));
    }
}
