#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Rotor
//!
//! Rotor is an event-processing worker: it consumes analytics events from
//! a durable message bus, resolves the pipeline configured for each
//! event's connection, runs a chain of builtin and user-defined
//! (sandboxed) steps, and forwards the results to downstream delivery.
//!
//! ## Architecture
//!
//! - [`pipeline`]: chain building, execution, and per-message handling
//! - [`cache`]: TTL caches with background sweep and release hooks
//! - [`store`]: config store client and the shared KV binding
//! - [`udf`]: user-function compiler seam and the compiled-wrapper cache
//! - [`bus`]: message source contract and the consumer driver
//! - [`server`]: operator HTTP endpoints (health, metrics, udfrun)
//! - [`config`]: environment-driven worker configuration
//! - [`metrics`]: Prometheus recorder and emission helpers
//! - [`error`]: error types and the retryable/fatal classification
//!
//! ## Processing model
//!
//! Each message is handled in isolation: decode, resolve the connection,
//! build the function chain (builtin transformations, then a single user
//! function pipeline, then destinations), execute with fan-out and drop
//! semantics, then ack or redeliver based on the execution log. Transient
//! failures (downstream 5xx, config store outages, deadline expiry) are
//! redelivered; everything else acks so a poison message can never wedge
//! a partition.
//!
//! ## Library usage
//!
//! ```no_run
//! use rotor::bus::{run_consumer, MessageSource};
//! use rotor::pipeline::{BuiltinRegistry, ChainBuilder, MessageHandler};
//! use rotor::store::{ConfigStore, HttpConfigLoader, InMemoryKvStore};
//! use rotor::udf::{DisabledCompiler, UdfRegistry};
//! use rotor::RotorConfig;
//! use std::sync::Arc;
//!
//! # async fn wire(source: Arc<dyn MessageSource>) -> rotor::Result<()> {
//! let config = RotorConfig::from_env()?;
//! let config_store = Arc::new(ConfigStore::new(
//!     Arc::new(HttpConfigLoader::new("http://config-store")),
//!     config.connection_cache_ttl,
//!     config.function_cache_ttl,
//! ));
//! let udf_registry = Arc::new(UdfRegistry::new(
//!     Arc::new(DisabledCompiler),
//!     config.udf_cache_ttl,
//! ));
//! let builder = ChainBuilder::new(
//!     config_store.clone(),
//!     udf_registry.clone(),
//!     Arc::new(BuiltinRegistry::standard()),
//!     config.bulker_url.clone(),
//!     config.bulker_auth_key.clone(),
//! );
//! let handler = Arc::new(MessageHandler::new(
//!     config_store,
//!     udf_registry,
//!     builder,
//!     Arc::new(InMemoryKvStore::new()),
//!     config.message_deadline,
//! ));
//! let (_tx, rx) = tokio::sync::watch::channel(false);
//! run_consumer(source, handler, rx).await;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod server;
pub mod store;
pub mod udf;

pub use config::{LogFormat, RotorConfig};
pub use error::{Result, RotorError};
