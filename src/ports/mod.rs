//! Ports module - Trait definitions for hexagonal architecture
//!
//! The generation backend is the only external collaborator the engine
//! calls through a trait; everything else is on-disk state.

mod backend;

pub use backend::CommandBackend;

#[cfg(test)]
pub use backend::mock;
