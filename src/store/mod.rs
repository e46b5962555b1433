//! Local persistence layer

pub mod memory;

pub use memory::LocalStore;
