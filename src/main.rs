//! Rotor - analytics event-processing worker
//!
//! Boot sequence: load configuration from the environment, initialise
//! tracing and metrics, assemble the caches and the message handler,
//! serve the operator endpoints, and wait for a shutdown signal. The bus
//! consumer is attached by the deployment through
//! [`rotor::bus::run_consumer`]; this binary runs the worker plane.

use rotor::bus::{run_consumer, MessageSource};
use rotor::cache::CacheSweeper;
use rotor::config::LogFormat;
use rotor::error::{Result, RotorError};
use rotor::pipeline::{BuiltinRegistry, ChainBuilder, MessageHandler};
use rotor::server::{run_server, HttpServerState};
use rotor::store::{ConfigStore, HttpConfigLoader, InMemoryKvStore, SharedKvStore};
use rotor::udf::{DisabledCompiler, UdfCompiler, UdfRegistry};
use rotor::RotorConfig;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match RotorConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("rotor: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "rotor failed");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &RotorConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn run(config: RotorConfig) -> Result<()> {
    info!(
        http_port = config.http_port,
        bulker = %config.bulker_url,
        "starting rotor"
    );
    let metrics_handle = rotor::metrics::init_metrics();

    let config_store_url = std::env::var("CONFIG_STORE_URL").map_err(|_| {
        RotorError::Config("required environment variable CONFIG_STORE_URL is not set".into())
    })?;
    let config_store = Arc::new(ConfigStore::new(
        Arc::new(HttpConfigLoader::new(config_store_url)),
        config.connection_cache_ttl,
        config.function_cache_ttl,
    ));

    // The sandbox runtime and the shared KV store are deployment concerns;
    // the defaults here keep the worker plane bootable without them.
    let compiler: Arc<dyn UdfCompiler> = Arc::new(DisabledCompiler);
    let kv_store: Arc<dyn SharedKvStore> = Arc::new(InMemoryKvStore::new());

    let udf_registry = Arc::new(UdfRegistry::new(compiler.clone(), config.udf_cache_ttl));

    let mut sweep_targets = config_store.sweep_handles();
    sweep_targets.push(udf_registry.sweep_handle());
    let sweeper = CacheSweeper::spawn(sweep_targets, config.cache_sweep_interval);

    let builder = ChainBuilder::new(
        config_store.clone(),
        udf_registry.clone(),
        Arc::new(BuiltinRegistry::standard()),
        config.bulker_url.clone(),
        config.bulker_auth_key.clone(),
    );
    let handler = Arc::new(MessageHandler::new(
        config_store,
        udf_registry.clone(),
        builder,
        kv_store,
        config.message_deadline,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let mut consumer = None;
    match build_source() {
        Some(source) => {
            consumer = Some(tokio::spawn(run_consumer(
                source,
                handler,
                shutdown_rx.clone(),
            )));
        }
        None => {
            info!("no message source linked into this build; operator endpoints only");
        }
    }

    let server = tokio::spawn(run_server(
        HttpServerState {
            metrics_handle,
            compiler,
        },
        config.http_port,
        shutdown_rx,
    ));

    wait_for_signal().await;
    info!("shutdown signal received");

    // The consumer observes the flipped signal first and stops pulling;
    // in-flight handlers get the drain window before sandboxes go away.
    let _ = shutdown_tx.send(true);
    if let Some(consumer) = consumer {
        let drained = tokio::time::timeout(config.shutdown_drain, consumer).await;
        if drained.is_err() {
            warn!("consumer did not drain within the grace period");
        }
    } else {
        tokio::time::sleep(config.shutdown_drain).await;
    }

    sweeper.stop().await;
    let evicted = udf_registry.evict_all();
    info!(evicted, "udf cache evicted");

    match server.await {
        Ok(result) => result?,
        Err(err) => warn!(error = %err, "http server task panicked"),
    }
    info!("rotor stopped");
    Ok(())
}

/// Integration point for the broker consumer. The durable-bus client is a
/// deployment concern; builds that ship one return it here.
fn build_source() -> Option<Arc<dyn MessageSource>> {
    None
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
