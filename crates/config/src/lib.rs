//! gatehouse-config: Configuration for the gatehouse gateway
//!
//! TOML gateway configuration with validation, the persisted root routing
//! options file, and a file watcher used for hot reload.

pub mod config;
pub mod root_options;
pub mod watcher;

pub use config::*;
pub use root_options::RootRoutingOptions;
pub use watcher::{ConfigWatcher, ReloadManager};
