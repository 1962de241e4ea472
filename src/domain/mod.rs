//! Domain module - Core business logic
//!
//! The process-safe command cache and the use case that sequences one
//! request through sanitization, admission, generation and validation.

pub mod command_cache;
pub mod use_cases;

pub use command_cache::{CacheLookup, CacheStats, CommandCache, ExportedEntry, MAX_PAYLOAD_CHARS};
pub use use_cases::generate_command::{
    CommandSource, GenerateCommandRequest, GenerateCommandResponse, GenerateCommandUseCase,
};
