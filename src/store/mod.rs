//! External state access: config store reads and the shared KV store
//!
//! Both stores are external collaborators reached through traits; this
//! module provides the cached read-through client for configuration and
//! the connection-namespaced KV façade handed to user code.

mod config_store;
mod kv;

pub use config_store::{ConfigLoader, ConfigStore, HttpConfigLoader};
pub use kv::{InMemoryKvStore, KvBinding, SharedKvStore};
