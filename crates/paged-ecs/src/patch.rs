//! Change tracking and replication patches.
//!
//! A manager with tracking enabled records every entity it creates, patches
//! or deletes. Harvesting turns those lists into a [`Patch`]: one
//! [`ChangeSet`] per kind of change, each holding an entity list and the
//! values encoded by the manager's [`ComponentCodec`]. The lists are kept
//! until an explicit reset.
//!
//! Harvest normalises the lists against the current contents of the manager:
//!
//! - `created`: recorded as created and still present, with current values.
//! - `patched`: recorded as patched, still present, and not created in the
//!   same window (the created entry already carries the latest value).
//! - `deleted`: recorded as deleted and no longer present. Carries no values.
//!
//! The three sets are disjoint by entity, but not by id: a window that
//! destroys an entity and hands its id to a new one carries the old owner in
//! `deleted` and the new owner in `created`. Replay therefore removes first,
//! so the recycled slot is free before its new owner arrives.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::debug;

use crate::{
    component::ComponentId,
    entity::Entity,
    error::{PatchError, PatchResult},
};

/// Turns a slice of component values into bytes and back.
pub trait ComponentCodec<T>: Send + Sync {
    fn encode(&self, values: &[T]) -> PatchResult<Vec<u8>>;

    /// Decode exactly `count` values.
    fn decode(&self, bytes: &[u8], count: usize) -> PatchResult<Vec<T>>;
}

/// Raw memory image of plain-old-data components.
#[derive(Debug, Default, Clone, Copy)]
pub struct PodCodec;

impl<T: bytemuck::Pod> ComponentCodec<T> for PodCodec {
    fn encode(&self, values: &[T]) -> PatchResult<Vec<u8>> {
        Ok(bytemuck::cast_slice(values).to_vec())
    }

    fn decode(&self, bytes: &[u8], count: usize) -> PatchResult<Vec<T>> {
        let size = size_of::<T>();
        if bytes.len() != size * count {
            return Err(PatchError::Decode(format!(
                "expected {} bytes for {count} values, got {}",
                size * count,
                bytes.len()
            )));
        }

        if size == 0 {
            return Ok((0..count).map(|_| T::zeroed()).collect());
        }

        // Wire bytes carry no alignment guarantee.
        Ok(bytes
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }
}

/// `serde` + `bincode` encoding for arbitrary serialisable components.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl<T: Serialize + DeserializeOwned> ComponentCodec<T> for BincodeCodec {
    fn encode(&self, values: &[T]) -> PatchResult<Vec<u8>> {
        bincode::serialize(values).map_err(|err| PatchError::Encode(err.to_string()))
    }

    fn decode(&self, bytes: &[u8], count: usize) -> PatchResult<Vec<T>> {
        let values: Vec<T> = bincode::deserialize(bytes).map_err(|err| PatchError::Decode(err.to_string()))?;
        if values.len() != count {
            return Err(PatchError::CountMismatch {
                declared: count,
                actual: values.len(),
            });
        }
        Ok(values)
    }
}

/// One kind of change: how many entries, their encoded values, their owners.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub count: u32,
    pub data: Vec<u8>,
    pub entities: Vec<Entity>,
}

impl ChangeSet {
    fn encode<T>(entities: Vec<Entity>, values: &[T], codec: &dyn ComponentCodec<T>) -> PatchResult<Self> {
        debug_assert_eq!(entities.len(), values.len());
        Ok(Self {
            count: entry_count(entities.len()),
            data: codec.encode(values)?,
            entities,
        })
    }

    fn entities_only(entities: Vec<Entity>) -> Self {
        Self {
            count: entry_count(entities.len()),
            data: Vec::new(),
            entities,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    fn check_count(&self) -> PatchResult<usize> {
        let declared = self.count as usize;
        if declared != self.entities.len() {
            return Err(PatchError::CountMismatch {
                declared,
                actual: self.entities.len(),
            });
        }
        Ok(declared)
    }

    fn decode<T>(&self, codec: &dyn ComponentCodec<T>) -> PatchResult<Vec<T>> {
        let count = self.check_count()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        codec.decode(&self.data, count)
    }
}

fn entry_count(len: usize) -> u32 {
    u32::try_from(len).expect("change set larger than u32::MAX entries")
}

/// Everything that happened to one component type since the last reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub component: ComponentId,
    pub created: ChangeSet,
    pub patched: ChangeSet,
    pub deleted: ChangeSet,
}

impl Patch {
    #[must_use]
    pub fn empty(component: ComponentId) -> Self {
        Self {
            component,
            created: ChangeSet::default(),
            patched: ChangeSet::default(),
            deleted: ChangeSet::default(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.patched.is_empty() && self.deleted.is_empty()
    }

    /// Total entries across the three change sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.created.entities.len() + self.patched.entities.len() + self.deleted.entities.len()
    }

    /// Frame the whole patch for transport.
    pub fn encode(&self) -> PatchResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> PatchResult<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Decode every set up front, then replay it against `target`.
    ///
    /// Nothing reaches the target unless the whole patch decodes, so a
    /// malformed patch leaves it untouched.
    pub(crate) fn replay<T>(
        &self,
        expected: ComponentId,
        codec: &dyn ComponentCodec<T>,
        target: &mut impl PatchTarget<T>,
    ) -> PatchResult<()> {
        if self.component != expected {
            return Err(PatchError::ComponentMismatch {
                expected,
                found: self.component,
            });
        }

        let created = self.created.decode(codec)?;
        let patched = self.patched.decode(codec)?;
        self.deleted.check_count()?;

        debug!(
            component = %self.component,
            created = created.len(),
            patched = patched.len(),
            deleted = self.deleted.entities.len(),
            "applying patch"
        );

        for &entity in &self.deleted.entities {
            target.remove(entity);
        }
        for (&entity, value) in self.created.entities.iter().zip(created) {
            target.upsert(entity, value);
        }
        for (&entity, value) in self.patched.entities.iter().zip(patched) {
            target.upsert(entity, value);
        }
        Ok(())
    }
}

/// Where a replayed patch lands.
pub(crate) trait PatchTarget<T> {
    /// Create or overwrite.
    fn upsert(&mut self, entity: Entity, value: T);

    /// Remove if present.
    fn remove(&mut self, entity: Entity);
}

/// Insertion-ordered entity set.
#[derive(Debug, Default, Clone)]
struct TrackedSet {
    order: Vec<Entity>,
    seen: HashSet<Entity>,
}

impl TrackedSet {
    fn insert(&mut self, entity: Entity) {
        if self.seen.insert(entity) {
            self.order.push(entity);
        }
    }

    fn contains(&self, entity: Entity) -> bool {
        self.seen.contains(&entity)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

/// The created / patched / deleted lists of one manager.
#[derive(Debug, Default, Clone)]
pub struct ChangeTracker {
    enabled: bool,
    created: TrackedSet,
    patched: TrackedSet,
    deleted: TrackedSet,
}

impl ChangeTracker {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Turning tracking off keeps whatever was already recorded.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn record_created(&mut self, entity: Entity) {
        if self.enabled {
            self.created.insert(entity);
        }
    }

    pub fn record_patched(&mut self, entity: Entity) {
        if self.enabled {
            self.patched.insert(entity);
        }
    }

    pub fn record_deleted(&mut self, entity: Entity) {
        if self.enabled {
            self.deleted.insert(entity);
        }
    }

    #[must_use]
    pub fn created(&self) -> &[Entity] {
        &self.created.order
    }

    #[must_use]
    pub fn patched(&self) -> &[Entity] {
        &self.patched.order
    }

    #[must_use]
    pub fn deleted(&self) -> &[Entity] {
        &self.deleted.order
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.order.is_empty() && self.patched.order.is_empty() && self.deleted.order.is_empty()
    }

    pub fn reset(&mut self) {
        self.created.clear();
        self.patched.clear();
        self.deleted.clear();
    }

    /// Build a patch from the recorded lists; `current` reads the live value
    /// of an entity, `None` meaning absent.
    pub fn harvest<T>(
        &self,
        component: ComponentId,
        codec: Option<&dyn ComponentCodec<T>>,
        current: impl Fn(Entity) -> Option<T>,
    ) -> PatchResult<Patch> {
        if self.is_empty() {
            return Ok(Patch::empty(component));
        }

        let codec = codec.ok_or(PatchError::MissingCodec(component))?;

        let mut created_entities = Vec::new();
        let mut created_values = Vec::new();
        for &entity in &self.created.order {
            if let Some(value) = current(entity) {
                created_entities.push(entity);
                created_values.push(value);
            }
        }

        let mut patched_entities = Vec::new();
        let mut patched_values = Vec::new();
        for &entity in &self.patched.order {
            if self.created.contains(entity) {
                continue;
            }
            if let Some(value) = current(entity) {
                patched_entities.push(entity);
                patched_values.push(value);
            }
        }

        let deleted_entities: Vec<Entity> = self
            .deleted
            .order
            .iter()
            .copied()
            .filter(|&entity| current(entity).is_none())
            .collect();

        let patch = Patch {
            component,
            created: ChangeSet::encode(created_entities, &created_values, codec)?,
            patched: ChangeSet::encode(patched_entities, &patched_values, codec)?,
            deleted: ChangeSet::entities_only(deleted_entities),
        };

        debug!(
            component = %component,
            created = patch.created.count,
            patched = patch.patched.count,
            deleted = patch.deleted.count,
            "harvested patch"
        );

        Ok(patch)
    }
}
