//! # registrar
//!
//! Instance registry and change-feed synchronization for a container
//! scheduler, backed by an etcd-style coordination store:
//! - Slot locks so that two schedulers never run the same instance
//! - Live-instance announcements kept alive by a short TTL
//! - A change feed that lists once, then watches from the listing's index
//! - An in-memory registry publishing immutable snapshots to consumers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  create-if-absent / set   ┌──────────────────────┐
//! │  SlotClaims  │ ────────────────────────▶ │  Coordination store  │
//! └──────────────┘                           │  (etcd v2 keys API)  │
//!                                            └──────────┬───────────┘
//!                                          list + watch │
//!                                            ┌──────────▼───────────┐
//!                                            │      ChangeFeed      │
//!                                            └──────────┬───────────┘
//!                                       InstanceUpdate  │ (bounded)
//!                                            ┌──────────▼───────────┐
//!                                            │   InstanceRegistry   │
//!                                            └──────────┬───────────┘
//!                                     RegistrySnapshot  │
//!                                   ┌───────────────────┼──────────────┐
//!                              DNS records         hosts file      watchers
//! ```
//!
//! Decode failures, transport failures and task exits go to a bounded error
//! channel instead of stopping the feed.
//!
//! ## Usage
//!
//! ```bash
//! # Follow the registry and keep a hosts file current
//! registrar --endpoint http://127.0.0.1:4001 watch --hosts-file ./hosts
//!
//! # Claim slot 0 of web.prod, then announce it
//! registrar lock --group prod --service web --instance 0
//! registrar announce --group prod --service web --instance 0 \
//!   --addr 10.0.0.5 --port 80:8080
//! ```

pub mod common;
pub mod feed;
pub mod instance;
pub mod registry;
pub mod service;
pub mod slots;
pub mod store;

// Re-export commonly used types
pub use common::{Error, RegistrarConfig, Result};
pub use instance::{Instance, InstanceId, InstanceUpdate, Operation, ServiceConfig};
pub use registry::{RegistryHandle, RegistrySnapshot};
pub use service::{Registrar, RunningRegistrar};
pub use slots::SlotClaims;
pub use store::{CoordinationStore, EtcdStore, MemoryStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
