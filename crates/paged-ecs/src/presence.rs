//! Presence bitsets: which component types each entity currently owns.
//!
//! The table is owned by the entity registry and shared with every manager.
//! Managers only flip their own bit, as a side effect of create and delete.

use std::fmt;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::{
    component::{ComponentId, MAX_COMPONENTS},
    entity::Entity,
    paged_map::PagedMap,
};

const WORDS: usize = MAX_COMPONENTS / 64;

/// Fixed-width bit vector indexed by [`ComponentId`].
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ComponentMask {
    words: [u64; WORDS],
}

impl ComponentMask {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    pub fn set(&mut self, id: ComponentId) {
        let (word, bit) = locate(id);
        self.words[word] |= bit;
    }

    pub fn unset(&mut self, id: ComponentId) {
        let (word, bit) = locate(id);
        self.words[word] &= !bit;
    }

    #[must_use]
    pub fn test(&self, id: ComponentId) -> bool {
        let (word, bit) = locate(id);
        self.words[word] & bit != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Visit set ids in ascending order until `visitor` returns `false`.
    ///
    /// Returns `false` if the walk was cut short.
    pub fn for_each_set<F: FnMut(ComponentId) -> bool>(&self, mut visitor: F) -> bool {
        for (index, &word) in self.words.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                if !visitor(ComponentId::from_raw((index * 64 + bit) as u16)) {
                    return false;
                }
            }
        }
        true
    }

    /// Set ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> SmallVec<[ComponentId; 8]> {
        let mut ids = SmallVec::new();
        self.for_each_set(|id| {
            ids.push(id);
            true
        });
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = ComponentId> {
        self.ids().into_iter()
    }
}

impl fmt::Debug for ComponentMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.ids()).finish()
    }
}

fn locate(id: ComponentId) -> (usize, u64) {
    let index = id.index();
    (index / 64, 1 << (index % 64))
}

/// Per-entity [`ComponentMask`]s, keyed by entity id.
#[derive(Default)]
pub struct PresenceTable {
    masks: RwLock<PagedMap<ComponentMask>>,
}

impl PresenceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, entity: Entity, id: ComponentId) {
        let mut masks = self.masks.write();
        match masks.get_mut(entity.id()) {
            Some(mask) => mask.set(id),
            None => {
                let mut mask = ComponentMask::new();
                mask.set(id);
                masks.insert(entity.id(), mask);
            }
        }
    }

    /// Clears the bit; the entity's row is dropped once no bit is left.
    pub fn unset(&self, entity: Entity, id: ComponentId) {
        let mut masks = self.masks.write();
        let Some(mask) = masks.get_mut(entity.id()) else {
            return;
        };
        mask.unset(id);
        if mask.is_empty() {
            masks.remove(entity.id());
        }
    }

    #[must_use]
    pub fn test(&self, entity: Entity, id: ComponentId) -> bool {
        self.masks
            .read()
            .get(entity.id())
            .is_some_and(|mask| mask.test(id))
    }

    /// Copy of the entity's mask (empty if it owns nothing).
    #[must_use]
    pub fn mask(&self, entity: Entity) -> ComponentMask {
        self.masks.read().get(entity.id()).copied().unwrap_or_default()
    }

    /// Visit the entity's set ids in ascending order until `visitor` returns
    /// `false`.
    ///
    /// The visitor runs on a snapshot, so it may call back into the table.
    pub fn all_set<F: FnMut(ComponentId) -> bool>(&self, entity: Entity, visitor: F) -> bool {
        self.mask(entity).for_each_set(visitor)
    }

    pub fn clear_entity(&self, entity: Entity) {
        self.masks.write().remove(entity.id());
    }

    /// Number of entities owning at least one component.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.masks.read().len()
    }
}

impl fmt::Debug for PresenceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceTable")
            .field("entities", &self.entity_count())
            .finish()
    }
}
