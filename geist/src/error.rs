use std::fmt;

/// Errors surfaced by the reference layer.
///
/// Liveness queries never fail; destruction is routine and reads as `None`.
/// Only construction and finalizer mutation can go wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefError {
    /// The value can not be weakly referenced: an immediate, nil, or an
    /// identity the runtime no longer knows.
    InvalidTarget(&'static str),
    /// The same condition, surfaced through the map's write path.
    InvalidValue(&'static str),
    /// Finalizer mutation through a reference whose target is destroyed.
    DeadObject,
    /// Removal of a finalizer id that is not registered on the target.
    UnknownFinalizer,
}

impl fmt::Display for RefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefError::InvalidTarget(ty) => {
                write!(f, "can not build a weak reference for {}", ty)
            }
            RefError::InvalidValue(ty) => {
                write!(f, "a {} can not be used as a weak map value", ty)
            }
            RefError::DeadObject => write!(f, "object has been destroyed"),
            RefError::UnknownFinalizer => {
                write!(f, "finalizer is not defined on the object")
            }
        }
    }
}

impl std::error::Error for RefError {}
