//! Use Cases module
//!
//! Application use cases that orchestrate the engine's components.

pub mod generate_command;
