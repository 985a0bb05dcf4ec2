//! Entity identifiers.
//!
//! An entity is an opaque `(id, generation)` pair. The `id` part is what the
//! sparse lookups are keyed by; the generation lets a manager tell a recycled
//! id apart from the entity that previously owned the slot.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Generation counter, bumped every time an id is recycled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Generation(u32);

impl Generation {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

/// Raw entity index, the key of every sparse lookup.
pub type EntityId = u32;

/// Handle to a stored object. Carries no data of its own.
///
/// On the wire an entity travels as the `u64` produced by [`Entity::to_bits`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u64", from = "u64")]
pub struct Entity {
    id: EntityId,
    generation: Generation,
}

impl Entity {
    #[must_use]
    pub const fn new(id: EntityId, generation: Generation) -> Self {
        Self { id, generation }
    }

    /// Entity with the given id at generation zero.
    #[must_use]
    pub const fn from_id(id: EntityId) -> Self {
        Self::new(id, Generation::new())
    }

    #[must_use]
    pub const fn id(self) -> EntityId {
        self.id
    }

    #[must_use]
    pub const fn generation(self) -> Generation {
        self.generation
    }

    /// Generation in the high 32 bits, id in the low 32 bits.
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation.0 as u64) << 32) | (self.id as u64)
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            id: bits as u32,
            generation: Generation((bits >> 32) as u32),
        }
    }
}

impl From<Entity> for u64 {
    fn from(entity: Entity) -> Self {
        entity.to_bits()
    }
}

impl From<u64> for Entity {
    fn from(bits: u64) -> Self {
        Self::from_bits(bits)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.id, self.generation.0)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.id, self.generation.0)
    }
}

/// Hands out entity ids and recycles them with a bumped generation.
///
/// The storage engine never calls this itself; it is the reference allocator
/// used by [`EntityRegistry`](crate::EntityRegistry).
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<Generation>,
    free_list: Vec<EntityId>,
    alive_count: u32,
}

impl EntityAllocator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            generations: Vec::new(),
            free_list: Vec::new(),
            alive_count: 0,
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            generations: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            alive_count: 0,
        }
    }

    /// Reuse the most recently freed id, or grow the generation table.
    ///
    /// # Panics
    ///
    /// Panics once every `EntityId` has been handed out.
    pub fn allocate(&mut self) -> Entity {
        let entity = match self.free_list.pop() {
            Some(id) => Entity::new(id, self.generations[id as usize]),
            None => {
                let Ok(id) = EntityId::try_from(self.generations.len()) else {
                    panic!("entity id space exhausted after {} ids", self.generations.len());
                };
                self.generations.push(Generation::new());
                Entity::new(id, Generation::new())
            }
        };
        self.alive_count += 1;
        entity
    }

    /// Returns `false` if `entity` is already dead or was never allocated.
    pub fn deallocate(&mut self, entity: Entity) -> bool {
        let Some(current) = self
            .generations
            .get_mut(entity.id() as usize)
            .filter(|current| **current == entity.generation())
        else {
            return false;
        };

        *current = current.next();
        self.free_list.push(entity.id());
        self.alive_count -= 1;
        true
    }

    #[must_use]
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.generations.get(entity.id() as usize) == Some(&entity.generation())
    }

    #[must_use]
    pub const fn alive_count(&self) -> u32 {
        self.alive_count
    }
}
