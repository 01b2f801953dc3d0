pub mod banner;
pub mod catalog;
pub mod consts;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hosterrors;
pub mod input;
pub mod interactions;
pub mod loader;
pub mod logging;
pub mod options;
pub mod output;
pub mod progress;
pub mod ratelimit;
pub mod registry;
pub mod service;
pub mod template;

pub use engine::{Engine, EngineBuilder, ThreadSafeEngine};
pub use error::{ConfigError, ScanError};
pub use options::{ScanOption, ScanOptions};
