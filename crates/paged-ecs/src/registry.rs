//! Component registration.
//!
//! Component types are registered explicitly at startup. Each registration
//! assigns the next sequential [`ComponentId`] and builds the manager that
//! owns the type's storage. Ids belong to the registry that handed them out,
//! so two worlds never share id space.

use std::{
    any::{Any, TypeId},
    fmt,
    hash::Hash,
    sync::Arc,
};

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::{
    component::{Component, ComponentId, ComponentInfo, MAX_COMPONENTS, StorageKind},
    entity::Entity,
    error::PatchResult,
    manager::{ComponentManager, ManagerOptions},
    patch::Patch,
    presence::PresenceTable,
    shared::SharedComponentManager,
};

/// Type-erased view of a manager, used wherever the component type is only
/// known by id (entity destruction, bulk patching).
pub trait ComponentStore: Send + Sync {
    fn component_id(&self) -> ComponentId;

    fn name(&self) -> &'static str;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has(&self, entity: Entity) -> bool;

    /// Detach `entity` if present. Returns whether anything was removed.
    fn remove_entity(&self, entity: Entity) -> bool;

    fn patch_get(&self) -> PatchResult<Patch>;

    fn patch_apply(&self, patch: &Patch) -> PatchResult<()>;

    fn patch_reset(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Component + Clone> ComponentStore for ComponentManager<T> {
    fn component_id(&self) -> ComponentId {
        self.id()
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn len(&self) -> usize {
        ComponentManager::len(self)
    }

    fn has(&self, entity: Entity) -> bool {
        ComponentManager::has(self, entity)
    }

    fn remove_entity(&self, entity: Entity) -> bool {
        self.remove(entity).is_some()
    }

    fn patch_get(&self) -> PatchResult<Patch> {
        ComponentManager::patch_get(self)
    }

    fn patch_apply(&self, patch: &Patch) -> PatchResult<()> {
        ComponentManager::patch_apply(self, patch)
    }

    fn patch_reset(&self) {
        ComponentManager::patch_reset(self);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl<T: Component + Clone + Eq + Hash> ComponentStore for SharedComponentManager<T> {
    fn component_id(&self) -> ComponentId {
        self.id()
    }

    fn name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn len(&self) -> usize {
        SharedComponentManager::len(self)
    }

    fn has(&self, entity: Entity) -> bool {
        SharedComponentManager::has(self, entity)
    }

    fn remove_entity(&self, entity: Entity) -> bool {
        self.remove(entity).is_some()
    }

    fn patch_get(&self) -> PatchResult<Patch> {
        SharedComponentManager::patch_get(self)
    }

    fn patch_apply(&self, patch: &Patch) -> PatchResult<()> {
        SharedComponentManager::patch_apply(self, patch)
    }

    fn patch_reset(&self) {
        SharedComponentManager::patch_reset(self);
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Maps Rust types to component ids and owns one manager per type.
#[derive(Default)]
pub struct ComponentRegistry {
    type_to_id: FxHashMap<TypeId, ComponentId>,
    /// Indexed by `ComponentId`.
    infos: Vec<ComponentInfo>,
    /// Indexed by `ComponentId`.
    stores: Vec<Arc<dyn ComponentStore>>,
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` with one value per entity.
    ///
    /// Registering the same type again returns the existing manager and
    /// ignores `options`.
    ///
    /// # Panics
    ///
    /// Panics if `T` was registered as shared, or if the registry is full.
    pub fn register<T: Component + Clone>(
        &mut self,
        presence: &Arc<PresenceTable>,
        options: ManagerOptions<T>,
    ) -> Arc<ComponentManager<T>> {
        if let Some(existing) = self.existing::<T, ComponentManager<T>>(StorageKind::Dense) {
            return existing;
        }

        let id = self.next_id::<T>();
        let manager = Arc::new(ComponentManager::with_options(id, Arc::clone(presence), options));
        self.insert::<T>(id, StorageKind::Dense, Arc::clone(&manager) as Arc<dyn ComponentStore>);
        manager
    }

    /// Register `T` with de-duplicated values.
    ///
    /// # Panics
    ///
    /// Panics if `T` was registered as dense, or if the registry is full.
    pub fn register_shared<T: Component + Clone + Eq + Hash>(
        &mut self,
        presence: &Arc<PresenceTable>,
        options: ManagerOptions<T>,
    ) -> Arc<SharedComponentManager<T>> {
        if let Some(existing) = self.existing::<T, SharedComponentManager<T>>(StorageKind::Shared) {
            return existing;
        }

        let id = self.next_id::<T>();
        let manager = Arc::new(SharedComponentManager::with_options(id, Arc::clone(presence), options));
        self.insert::<T>(id, StorageKind::Shared, Arc::clone(&manager) as Arc<dyn ComponentStore>);
        manager
    }

    fn existing<T: Component, M: Any + Send + Sync>(&self, kind: StorageKind) -> Option<Arc<M>> {
        let info = self.info(self.id_of::<T>()?)?;
        assert!(
            info.kind() == kind,
            "{} already registered with {:?} storage",
            info.name(),
            info.kind()
        );
        self.typed(info.id())
    }

    fn next_id<T: Component>(&self) -> ComponentId {
        let raw = self.infos.len();
        assert!(
            raw < MAX_COMPONENTS,
            "cannot register {}: all {MAX_COMPONENTS} component ids are taken",
            std::any::type_name::<T>()
        );
        ComponentId::from_raw(raw as u16)
    }

    fn insert<T: Component>(&mut self, id: ComponentId, kind: StorageKind, store: Arc<dyn ComponentStore>) {
        let info = ComponentInfo::of::<T>(id, kind);
        debug!(id = %id, name = info.name(), ?kind, "registered component");

        self.type_to_id.insert(TypeId::of::<T>(), id);
        self.infos.push(info);
        self.stores.push(store);
    }

    #[must_use]
    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.type_to_id.get(&TypeId::of::<T>()).copied()
    }

    #[must_use]
    pub fn info(&self, id: ComponentId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    #[must_use]
    pub fn store(&self, id: ComponentId) -> Option<&Arc<dyn ComponentStore>> {
        self.stores.get(id.index())
    }

    /// Every manager in id order.
    pub fn stores(&self) -> impl Iterator<Item = &Arc<dyn ComponentStore>> + '_ {
        self.stores.iter()
    }

    pub fn infos(&self) -> impl Iterator<Item = &ComponentInfo> + '_ {
        self.infos.iter()
    }

    /// Dense manager for `T`, if `T` was registered with [`register`](Self::register).
    #[must_use]
    pub fn manager<T: Component>(&self) -> Option<Arc<ComponentManager<T>>> {
        self.typed(self.id_of::<T>()?)
    }

    /// Shared manager for `T`, if `T` was registered with
    /// [`register_shared`](Self::register_shared).
    #[must_use]
    pub fn shared<T: Component>(&self) -> Option<Arc<SharedComponentManager<T>>> {
        self.typed(self.id_of::<T>()?)
    }

    fn typed<M: Any + Send + Sync>(&self, id: ComponentId) -> Option<Arc<M>> {
        Arc::clone(self.store(id)?).as_any().downcast::<M>().ok()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("count", &self.len())
            .field("components", &self.infos)
            .finish()
    }
}
