pub mod config;
pub mod constants;
pub mod element;
pub mod error;
pub mod grid;
pub mod types;

pub use config::WorldConfig;
pub use element::{ElementInfo, ElementTable};
pub use error::{ConfigError, TransactionError};
pub use grid::VoxelGrid;
pub use types::{Atom, AtomId, CrashCode, Transaction, VoxelCoords};
