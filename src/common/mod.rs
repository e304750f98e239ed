//! Common utilities and types shared across quorumkv

pub mod config;
pub mod error;
pub mod tracing_middleware;
pub mod utils;

pub use config::NodeConfig;
pub use error::{Error, Result};
pub use utils::{encode_segment, key_path, non_empty, timestamp_now_millis};
