use thiserror::Error;

use crate::types::AtomId;

/// Rejected world configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse world config RON: {0}")]
    ParseError(String),

    #[error("Failed to read world config {path}: {message}")]
    IoError { path: String, message: String },

    #[error("Invalid world config: {0}")]
    Invalid(String),
}

/// Transaction invariant violation. Fatal to the frame: nothing is applied.
#[derive(Debug, Error, PartialEq)]
pub enum TransactionError {
    #[error("{category} IDs ({ids}) and atoms ({atoms}) differ in length")]
    LengthMismatch {
        category: &'static str,
        ids: usize,
        atoms: usize,
    },

    #[error("Atom {0} appears more than once in the transaction")]
    DuplicateId(AtomId),

    #[error("Atom {id} is outside the atom address space ({capacity})")]
    IdOutOfRange { id: AtomId, capacity: u32 },

    #[error("Atom {0} was removed or moved but is not occupied")]
    NotOccupied(AtomId),

    #[error("Atom {0} was added but is already occupied")]
    AlreadyOccupied(AtomId),

    #[error("Atom {id} position {position:?} lies outside the world bounds")]
    OutOfBounds { id: AtomId, position: [f32; 3] },

    #[error("Transaction touches {count} atoms, limit is {max}")]
    TooLarge { count: usize, max: u32 },
}
