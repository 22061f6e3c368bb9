//! Registrar service
//!
//! Wires the store, the error reporter, the change feed and the registry
//! together.

use crate::common::{Error, RegistrarConfig, Result};
use crate::feed::{error_channel, spawn_error_logger, ChangeFeed, FeedSettings};
use crate::registry::{spawn_registry, RegistryHandle};
use crate::slots::SlotClaims;
use crate::store::{CoordinationStore, EtcdStore};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct Registrar {
    config: RegistrarConfig,
    store: Arc<dyn CoordinationStore>,
}

impl Registrar {
    pub fn new(config: RegistrarConfig, store: Arc<dyn CoordinationStore>) -> Self {
        Self { config, store }
    }

    /// Connect to the etcd endpoints named in the configuration
    pub fn connect(config: RegistrarConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(EtcdStore::from_config(&config.store)?);
        Ok(Self::new(config, store))
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Slot lock and announcement entry points on the same store
    pub fn claims(&self) -> SlotClaims {
        SlotClaims::new(self.store.clone(), &self.config)
    }

    /// Start feed and registry, logging reported errors
    pub fn start(&self) -> RunningRegistrar {
        let (running, errors) = self.start_with_errors();
        let logger = spawn_error_logger(errors);
        RunningRegistrar {
            logger: Some(logger),
            ..running
        }
    }

    /// Start feed and registry, handing reported errors to the caller
    pub fn start_with_errors(&self) -> (RunningRegistrar, mpsc::Receiver<Error>) {
        tracing::info!("Starting registrar");
        tracing::info!("  Prefix: {}", self.config.store.prefix);
        tracing::info!("  Domain suffix: {}", self.config.domain_suffix);

        let (reporter, errors) = error_channel(self.config.feed.error_buffer);
        let (stop_tx, stop_rx) = watch::channel(false);

        let feed = ChangeFeed::new(
            self.store.clone(),
            FeedSettings::from_config(&self.config),
            reporter.clone(),
        );
        let (updates, feed_task) = feed.spawn(stop_rx);
        let (registry, registry_task) = spawn_registry(updates, reporter);

        let running = RunningRegistrar {
            registry,
            stop: stop_tx,
            feed_task,
            registry_task,
            logger: None,
        };
        (running, errors)
    }
}

/// Handles of a started registrar
pub struct RunningRegistrar {
    registry: RegistryHandle,
    stop: watch::Sender<bool>,
    feed_task: JoinHandle<()>,
    registry_task: JoinHandle<()>,
    logger: Option<JoinHandle<()>>,
}

impl RunningRegistrar {
    pub fn registry(&self) -> RegistryHandle {
        self.registry.clone()
    }

    /// Stop the feed and wait for every task to finish
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Stopping registrar");
        self.stop.send_replace(true);

        self.feed_task
            .await
            .map_err(|e| Error::Internal(format!("change feed task: {}", e)))?;
        self.registry_task
            .await
            .map_err(|e| Error::Internal(format!("registry task: {}", e)))?;
        if let Some(logger) = self.logger {
            logger
                .await
                .map_err(|e| Error::Internal(format!("error logger task: {}", e)))?;
        }
        Ok(())
    }
}
