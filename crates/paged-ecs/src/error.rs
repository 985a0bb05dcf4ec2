//! Patch error types.
//!
//! Contract violations (double create, deleting an absent entity, bad
//! indices) panic instead; only data arriving from outside can fail softly.

use thiserror::Error;

use crate::component::ComponentId;

#[derive(Debug, Error)]
pub enum PatchError {
    /// Changes were tracked but the manager has no codec to encode them.
    #[error("component {0} has tracked changes but no codec")]
    MissingCodec(ComponentId),

    /// Patch was produced for a different component type.
    #[error("patch for component {found} applied to component {expected}")]
    ComponentMismatch {
        expected: ComponentId,
        found: ComponentId,
    },

    /// No manager is registered under the patch's component id.
    #[error("no component registered with id {0}")]
    UnknownComponent(ComponentId),

    /// Header count disagrees with the entity list or decoded values.
    #[error("change set declares {declared} entries but carries {actual}")]
    CountMismatch { declared: usize, actual: usize },

    /// Value bytes could not be turned back into components.
    #[error("decode error: {0}")]
    Decode(String),

    /// Values could not be turned into bytes.
    #[error("encode error: {0}")]
    Encode(String),

    /// Wire framing of a whole patch failed.
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
}

pub type PatchResult<T> = Result<T, PatchError>;
