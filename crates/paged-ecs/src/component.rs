//! Component type tags and per-type metadata.

use std::{any::TypeId, fmt};

/// Upper bound on the number of component types a registry can hold.
///
/// This is also the width of every [`ComponentMask`](crate::ComponentMask).
pub const MAX_COMPONENTS: usize = 256;

/// Marker trait for values that can be stored in a component manager.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

/// Small integer tag identifying a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ComponentId(u16);

impl ComponentId {
    /// # Panics
    ///
    /// Panics if `raw` is not below [`MAX_COMPONENTS`].
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        assert!(
            (raw as usize) < MAX_COMPONENTS,
            "component id {raw} out of range (max {MAX_COMPONENTS})"
        );
        Self(raw)
    }

    #[must_use]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentId({})", self.0)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a component type's values are laid out in its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// One value per entity.
    Dense,
    /// Entities point at de-duplicated instances.
    Shared,
}

/// Runtime information about a registered component type.
#[derive(Clone)]
pub struct ComponentInfo {
    id: ComponentId,
    name: &'static str,
    type_id: TypeId,
    kind: StorageKind,
}

impl ComponentInfo {
    #[must_use]
    pub fn of<T: Component>(id: ComponentId, kind: StorageKind) -> Self {
        Self {
            id,
            name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            kind,
        }
    }

    #[must_use]
    pub const fn id(&self) -> ComponentId {
        self.id
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn kind(&self) -> StorageKind {
        self.kind
    }

    #[must_use]
    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }
}

impl fmt::Debug for ComponentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentInfo")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Position;

    #[test]
    fn test_component_info() {
        let info = ComponentInfo::of::<Position>(ComponentId::from_raw(3), StorageKind::Dense);

        assert_eq!(info.id().index(), 3);
        assert!(info.is::<Position>());
        assert!(!info.is::<u32>());
        assert!(info.name().ends_with("Position"));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_component_id_bounded() {
        let _ = ComponentId::from_raw(MAX_COMPONENTS as u16);
    }
}
