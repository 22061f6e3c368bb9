//! Common utilities and types shared across registrar

pub mod config;
pub mod error;
pub mod utils;

pub use config::{FeedConfig, LeaseConfig, RegistrarConfig, StoreConfig};
pub use error::{Error, Result};
pub use utils::{retry_with_backoff, Backoff};
