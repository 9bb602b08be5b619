/// Input rejected before any mutation takes place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("state key must not be empty")]
    EmptyKey,
    #[error("state key {0:?} is reserved for rollback records")]
    ReservedKey(String),
    #[error("region id must not be empty")]
    EmptyRegion,
    #[error("unknown state category: {0:?}")]
    UnknownCategory(String),
}
