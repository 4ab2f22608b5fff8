pub mod loader;
pub mod schema;

pub use loader::{
    discover, discover_with, load_dir, load_from_path, load_from_str, ConfigError, LoadedConfig,
    CONFIG_ENV, DEFAULT_CONFIG_FILE, DEFAULT_RULES_DIR,
};
pub use schema::{FixerConfig, ValidationError, ValidationIssue};
