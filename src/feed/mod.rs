//! Change-feed reader
//!
//! Turns the coordination store into one ordered stream of
//! [`InstanceUpdate`]s:
//!
//! 1. A recursive listing emits an Add for every live instance and records
//!    the store index it was taken at.
//! 2. A watch loop starts from `listing.index + 1` and translates every
//!    change notification, advancing the continuation index past each
//!    observed event.
//!
//! Undecodable events are reported and dropped. Transport failures are
//! retried from the same index, so nothing is skipped. When the store has
//! compacted the continuation index away, or a whole directory of instances
//! is removed at once, the reader lists again (for as long as it takes) and
//! emits whatever it missed, including Removes for instances that
//! disappeared. Only the first listing gives up after
//! `bootstrap_attempts`.
//!
//! Delivery is at-least-once; the registry suppresses repeats.

pub mod reporter;

pub use reporter::{error_channel, spawn_error_logger, ErrorReporter};

use crate::common::{retry_with_backoff, Backoff, Error, RegistrarConfig, Result};
use crate::instance::{
    classify_action, decode_identity, decode_instance, is_directory_key, InstanceId,
    InstanceUpdate, Operation,
};
use crate::store::{ChangeEvent, CoordinationStore, Listing};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Reader tuning, usually derived from [`RegistrarConfig`]
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub prefix: String,
    pub request_timeout: Duration,
    pub watch_timeout: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub bootstrap_attempts: usize,
    pub update_buffer: usize,
}

impl FeedSettings {
    pub fn from_config(config: &RegistrarConfig) -> Self {
        Self {
            prefix: config.store.prefix.clone(),
            request_timeout: config.store.request_timeout(),
            watch_timeout: config.feed.watch_timeout(),
            retry_initial: config.feed.retry_initial(),
            retry_max: config.feed.retry_max(),
            bootstrap_attempts: config.feed.bootstrap_attempts,
            update_buffer: config.feed.update_buffer,
        }
    }
}

/// Resolves once the stop flag is raised or its sender is gone
pub async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// What a watch event means for the reader
#[derive(Debug)]
enum Translated {
    Update(InstanceUpdate),
    /// Lock placeholder, nothing to emit
    Placeholder,
    /// A directory holding instances went away without per-instance events
    Resync,
}

/// Change-feed reader state
pub struct ChangeFeed {
    store: Arc<dyn CoordinationStore>,
    settings: FeedSettings,
    reporter: ErrorReporter,
    /// Where the next watch call starts
    next_index: u64,
    /// Instances this reader has announced and not yet removed
    live: HashSet<InstanceId>,
}

impl ChangeFeed {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        settings: FeedSettings,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            store,
            settings,
            reporter,
            next_index: 0,
            live: HashSet::new(),
        }
    }

    /// Start the reader. The returned channel closes when the reader exits;
    /// the registry surfaces that as `FeedTerminated`.
    pub fn spawn(
        self,
        stop: watch::Receiver<bool>,
    ) -> (mpsc::Receiver<InstanceUpdate>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(self.settings.update_buffer.max(1));
        let handle = tokio::spawn(self.run(tx, stop));
        (rx, handle)
    }

    async fn run(mut self, tx: mpsc::Sender<InstanceUpdate>, mut stop: watch::Receiver<bool>) {
        match self.follow(&tx, &mut stop).await {
            Ok(()) => tracing::info!("Change feed stopped at index {}", self.next_index),
            Err(e) => {
                tracing::error!("Change feed failed: {}", e);
                self.reporter.report(e);
            }
        }
    }

    /// Bootstrap, then watch until stopped. `Ok` means an orderly stop.
    async fn follow(
        &mut self,
        tx: &mpsc::Sender<InstanceUpdate>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(listing) = self.bootstrap(stop).await? else {
            return Ok(());
        };
        if !self.resync(listing, tx, stop).await {
            return Ok(());
        }

        let mut backoff = Backoff::new(self.settings.retry_initial, self.settings.retry_max);
        loop {
            let outcome = tokio::select! {
                biased;
                _ = stopped(stop) => return Ok(()),
                result = tokio::time::timeout(
                    self.settings.watch_timeout,
                    self.store.watch(&self.settings.prefix, self.next_index),
                ) => result,
            };

            match outcome {
                Err(_elapsed) => {
                    // An idle long poll; re-issue from the same index
                    tracing::debug!("Watch from index {} timed out", self.next_index);
                }
                Ok(Err(Error::IndexCleared { index })) => {
                    tracing::warn!("Watch index {} was compacted away, resynchronizing", index);
                    if !self.relist(tx, stop, &mut backoff).await {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        "Watch from index {} failed: {}, retrying in {:?}",
                        self.next_index,
                        e,
                        delay
                    );
                    self.reporter.report(e);
                    tokio::select! {
                        biased;
                        _ = stopped(stop) => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ok(Ok(event)) => {
                    backoff.reset();
                    self.next_index = event.index + 1;
                    match self.translate(&event) {
                        Ok(Translated::Update(update)) => {
                            if !self.emit(update, tx, stop).await {
                                return Ok(());
                            }
                        }
                        Ok(Translated::Placeholder) => {
                            tracing::debug!("Ignoring lock placeholder {}", event.node.key)
                        }
                        Ok(Translated::Resync) => {
                            tracing::info!(
                                "Directory {} was removed, resynchronizing",
                                event.node.key
                            );
                            if !self.relist(tx, stop, &mut backoff).await {
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            tracing::debug!("Dropping event {}: {}", event.index, e);
                            self.reporter.report(e);
                        }
                    }
                }
            }
        }
    }

    /// List the prefix, retrying transport failures. `None` if stopped first.
    async fn bootstrap(&self, stop: &mut watch::Receiver<bool>) -> Result<Option<Listing>> {
        let store = &self.store;
        let prefix = self.settings.prefix.as_str();
        let timeout = self.settings.request_timeout;
        let mut backoff = Backoff::new(self.settings.retry_initial, self.settings.retry_max);

        let listing = retry_with_backoff(
            move || async move {
                tokio::time::timeout(timeout, store.list(prefix))
                    .await
                    .map_err(|_| Error::Timeout(format!("listing {}", prefix)))?
            },
            self.settings.bootstrap_attempts,
            &mut backoff,
        );

        tokio::select! {
            biased;
            _ = stopped(stop) => Ok(None),
            result = listing => result.map(Some),
        }
    }

    /// List again after the watch lost track of the store and resync.
    /// Retries every failure until a listing succeeds, so `next_index` only
    /// moves once there is a listing to resume from. `false` if stopped.
    async fn relist(
        &mut self,
        tx: &mpsc::Sender<InstanceUpdate>,
        stop: &mut watch::Receiver<bool>,
        backoff: &mut Backoff,
    ) -> bool {
        loop {
            let outcome = tokio::select! {
                biased;
                _ = stopped(stop) => return false,
                result = tokio::time::timeout(
                    self.settings.request_timeout,
                    self.store.list(&self.settings.prefix),
                ) => result,
            };

            let err = match outcome {
                Ok(Ok(listing)) => {
                    backoff.reset();
                    return self.resync(listing, tx, stop).await;
                }
                Ok(Err(e)) => e,
                Err(_elapsed) => Error::Timeout(format!("listing {}", self.settings.prefix)),
            };

            let delay = backoff.next_delay();
            tracing::warn!(
                "Listing {} failed: {}, retrying in {:?}",
                self.settings.prefix,
                err,
                delay
            );
            self.reporter.report(err);
            tokio::select! {
                biased;
                _ = stopped(stop) => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Emit a listing: Adds for what is live now, Removes for what this
    /// reader announced earlier and is gone. Returns `false` if stopped.
    async fn resync(
        &mut self,
        listing: Listing,
        tx: &mpsc::Sender<InstanceUpdate>,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut listed = HashSet::new();
        let mut updates = Vec::new();
        for node in listing.nodes {
            match decode_instance(&self.settings.prefix, &node.key, &node.value) {
                Ok(Some(instance)) => {
                    listed.insert(instance.id());
                    updates.push(InstanceUpdate::add(instance));
                }
                Ok(None) => {}
                Err(e) => {
                    self.reporter.report(e);
                }
            }
        }

        let mut vanished: Vec<InstanceId> = self.live.difference(&listed).cloned().collect();
        vanished.sort();
        updates.extend(vanished.into_iter().map(InstanceUpdate::remove));

        self.next_index = listing.index + 1;
        tracing::info!(
            "Listed {} instances, watching from index {}",
            listed.len(),
            self.next_index
        );

        for update in updates {
            if !self.emit(update, tx, stop).await {
                return false;
            }
        }
        true
    }

    fn translate(&self, event: &ChangeEvent) -> Result<Translated> {
        let prefix = &self.settings.prefix;
        let key = &event.node.key;
        match classify_action(&event.action)? {
            Operation::Add => Ok(match decode_instance(prefix, key, &event.node.value)? {
                Some(instance) => Translated::Update(InstanceUpdate::add(instance)),
                None => Translated::Placeholder,
            }),
            Operation::Remove if is_directory_key(prefix, key) => Ok(Translated::Resync),
            Operation::Remove => Ok(Translated::Update(InstanceUpdate::remove(
                decode_identity(prefix, key)?,
            ))),
        }
    }

    /// Hand an update to the registry. Returns `false` if stopped or the
    /// receiver is gone.
    async fn emit(
        &mut self,
        update: InstanceUpdate,
        tx: &mpsc::Sender<InstanceUpdate>,
        stop: &mut watch::Receiver<bool>,
    ) -> bool {
        let id = update.instance.id();
        match update.operation {
            Operation::Add => self.live.insert(id),
            Operation::Remove => self.live.remove(&id),
        };
        tracing::debug!("Feed {} {}", update.operation, update.instance);

        tokio::select! {
            biased;
            _ = stopped(stop) => false,
            sent = tx.send(update) => {
                if sent.is_err() {
                    tracing::debug!("Update receiver dropped");
                }
                sent.is_ok()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreNode;

    fn feed() -> ChangeFeed {
        let (reporter, _rx) = error_channel(8);
        let settings = FeedSettings::from_config(&RegistrarConfig::default());
        ChangeFeed::new(Arc::new(crate::store::MemoryStore::new()), settings, reporter)
    }

    fn event(action: &str, key: &str, value: &str) -> ChangeEvent {
        ChangeEvent {
            action: action.into(),
            node: StoreNode {
                key: key.into(),
                value: value.into(),
                modified_index: 4,
            },
            index: 4,
        }
    }

    #[test]
    fn test_translate() {
        let feed = feed();

        let add = feed
            .translate(&event("set", "/instances/prod/web/0", r#"{"Addrs":["10.0.0.1"]}"#))
            .unwrap();
        let Translated::Update(add) = add else {
            panic!("expected an update, got {:?}", add);
        };
        assert_eq!(add.operation, Operation::Add);
        assert_eq!(add.instance.addrs.len(), 1);

        let placeholder = feed
            .translate(&event("create", "/instances/prod/web/0", ""))
            .unwrap();
        assert!(matches!(placeholder, Translated::Placeholder));

        let expired = feed
            .translate(&event("expire", "/instances/prod/web/0", ""))
            .unwrap();
        let Translated::Update(expired) = expired else {
            panic!("expected an update, got {:?}", expired);
        };
        assert_eq!(expired.operation, Operation::Remove);
        assert_eq!(expired.instance.qualified_name(), "0.web.prod");

        assert!(matches!(
            feed.translate(&event("get", "/instances/prod/web/0", "")),
            Err(Error::UnknownAction(_))
        ));
        assert!(matches!(
            feed.translate(&event("delete", "/elsewhere/prod/web/0", "")),
            Err(Error::MalformedKey(_))
        ));
        assert!(matches!(
            feed.translate(&event("set", "/instances/prod", "")),
            Err(Error::MalformedKey(_))
        ));
    }

    #[test]
    fn test_directory_removal_requests_resync() {
        let feed = feed();
        for key in ["/instances/prod/web", "/instances/prod", "/instances"] {
            assert!(matches!(
                feed.translate(&event("delete", key, "")).unwrap(),
                Translated::Resync
            ));
        }
        assert!(matches!(
            feed.translate(&event("expire", "/instances/prod/web/", "")).unwrap(),
            Translated::Resync
        ));
    }

    #[tokio::test]
    async fn test_stopped_resolves_on_signal_or_drop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        stopped(&mut rx).await;

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        stopped(&mut rx).await;
    }
}
