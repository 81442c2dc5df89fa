pub mod atom_store;

pub use atom_store::AtomStore;
