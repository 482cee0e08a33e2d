pub mod loader;
pub mod types;

pub use loader::{apply_env_overrides, dump_config, load_config};
pub use types::Config;
