mod loader;
mod types;

pub use loader::{default_config_path, load_config, load_or_default, validate_config};
pub use types::*;
