//! Instance registry
//!
//! A single folding task owns the mapping from qualified name to
//! [`Instance`]. Every update that changes observable state produces a new
//! [`RegistrySnapshot`]; updates that change nothing produce none. Snapshots
//! share structure with the writer until the writer's next change, at which
//! point the writer copies (`Arc::make_mut`), so a published snapshot never
//! changes underneath its holder.

pub mod projection;

pub use projection::{dns_records, host_entries, publish_hosts_file, write_hosts_file};

use crate::common::Error;
use crate::feed::ErrorReporter;
use crate::instance::{Instance, InstanceUpdate, Operation};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

/// Immutable point-in-time view of the registry
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    generation: u64,
    instances: Arc<BTreeMap<String, Instance>>,
}

impl RegistrySnapshot {
    /// Number of changes folded before this snapshot was taken
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn get(&self, qualified_name: &str) -> Option<&Instance> {
        self.instances.get(qualified_name)
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.instances.contains_key(qualified_name)
    }

    /// Instances ordered by qualified name
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Instance)> {
        self.instances.iter()
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Authoritative instance mapping
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: Arc<BTreeMap<String, Instance>>,
    generation: u64,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one update. Returns the new snapshot if anything changed.
    pub fn apply(&mut self, update: InstanceUpdate) -> Option<RegistrySnapshot> {
        let name = update.instance.qualified_name();
        match update.operation {
            Operation::Add => {
                if let Some(current) = self.instances.get(&name) {
                    if current.same_state(&update.instance) {
                        return None;
                    }
                }
                tracing::info!("[Instances] Adding {}", update.instance);
                Arc::make_mut(&mut self.instances).insert(name, update.instance);
            }
            Operation::Remove => {
                if !self.instances.contains_key(&name) {
                    return None;
                }
                tracing::info!("[Instances] Removing {}", name);
                Arc::make_mut(&mut self.instances).remove(&name);
            }
        }
        self.generation += 1;
        Some(self.snapshot())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            generation: self.generation,
            instances: self.instances.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Read side of a running registry
#[derive(Debug, Clone)]
pub struct RegistryHandle {
    rx: watch::Receiver<RegistrySnapshot>,
}

impl RegistryHandle {
    /// Most recently published snapshot
    pub fn latest(&self) -> RegistrySnapshot {
        self.rx.borrow().clone()
    }

    /// A receiver that is notified on every publish. Slow readers skip
    /// intermediate snapshots and always see the newest one.
    pub fn subscribe(&self) -> watch::Receiver<RegistrySnapshot> {
        self.rx.clone()
    }

    /// Snapshots as a stream, starting with the current one
    pub fn changes(&self) -> WatchStream<RegistrySnapshot> {
        WatchStream::new(self.rx.clone())
    }

    /// Wait for the next publish after the last one this handle observed.
    /// Returns `None` once the registry task has exited.
    pub async fn changed(&mut self) -> Option<RegistrySnapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Start the folding task. It is the only writer of the mapping and exits
/// when the update stream closes.
pub fn spawn_registry(
    mut updates: mpsc::Receiver<InstanceUpdate>,
    reporter: ErrorReporter,
) -> (RegistryHandle, JoinHandle<()>) {
    let (tx, rx) = watch::channel(RegistrySnapshot::default());

    let handle = tokio::spawn(async move {
        let mut registry = InstanceRegistry::new();
        while let Some(update) = updates.recv().await {
            if let Some(snapshot) = registry.apply(update) {
                tracing::debug!(
                    "Publishing snapshot {} ({} instances)",
                    snapshot.generation(),
                    snapshot.len()
                );
                tx.send_replace(snapshot);
            }
        }
        reporter.report(Error::FeedTerminated("instance registry exited".into()));
    });

    (RegistryHandle { rx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::InstanceId;

    fn web(n: u32, addr: &str) -> Instance {
        Instance::new(InstanceId::new("prod", "web", n)).with_addrs([addr.parse().unwrap()])
    }

    #[test]
    fn test_identical_add_is_suppressed() {
        let mut registry = InstanceRegistry::new();
        assert!(registry.apply(InstanceUpdate::add(web(0, "10.0.0.1"))).is_some());
        assert!(registry.apply(InstanceUpdate::add(web(0, "10.0.0.1"))).is_none());
        assert_eq!(registry.snapshot().generation(), 1);
    }

    #[test]
    fn test_changed_add_replaces() {
        let mut registry = InstanceRegistry::new();
        registry.apply(InstanceUpdate::add(web(0, "10.0.0.1")));

        let snapshot = registry
            .apply(InstanceUpdate::add(web(0, "10.0.0.2")))
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get("0.web.prod").unwrap().addrs,
            vec!["10.0.0.2".parse::<std::net::IpAddr>().unwrap()]
        );

        let ports = registry.apply(InstanceUpdate::add(web(0, "10.0.0.2").with_port("80", "8080")));
        assert!(ports.is_some());
    }

    #[test]
    fn test_remove_of_unknown_name_is_noop() {
        let mut registry = InstanceRegistry::new();
        assert!(registry
            .apply(InstanceUpdate::remove(InstanceId::new("prod", "web", 9)))
            .is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.snapshot().generation(), 0);
    }

    #[test]
    fn test_remove_keeps_others() {
        let mut registry = InstanceRegistry::new();
        registry.apply(InstanceUpdate::add(web(0, "10.0.0.1")));
        registry.apply(InstanceUpdate::add(web(1, "10.0.0.2")));

        let snapshot = registry
            .apply(InstanceUpdate::remove(InstanceId::new("prod", "web", 1)))
            .unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains("0.web.prod"));
        assert!(!snapshot.contains("1.web.prod"));
    }

    #[test]
    fn test_published_snapshots_never_change() {
        let mut registry = InstanceRegistry::new();
        let first = registry.apply(InstanceUpdate::add(web(0, "10.0.0.1"))).unwrap();
        registry.apply(InstanceUpdate::add(web(0, "10.0.0.9")));
        registry.apply(InstanceUpdate::add(web(1, "10.0.0.2")));

        assert_eq!(first.len(), 1);
        assert_eq!(first.get("0.web.prod").unwrap().addrs[0].to_string(), "10.0.0.1");
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_one_entry_per_name() {
        let mut registry = InstanceRegistry::new();
        let updates = [
            InstanceUpdate::add(web(0, "10.0.0.1")),
            InstanceUpdate::add(web(0, "10.0.0.2")),
            InstanceUpdate::add(web(1, "10.0.0.3")),
            InstanceUpdate::remove(InstanceId::new("prod", "web", 0)),
            InstanceUpdate::add(web(0, "10.0.0.4")),
            InstanceUpdate::add(web(1, "10.0.0.3")),
        ];
        let mut emitted = 0;
        for update in updates {
            if let Some(snapshot) = registry.apply(update) {
                emitted += 1;
                let names: Vec<_> = snapshot.iter().map(|(name, _)| name.clone()).collect();
                let mut deduped = names.clone();
                deduped.dedup();
                assert_eq!(names, deduped);
                for (name, instance) in snapshot.iter() {
                    assert_eq!(name, &instance.qualified_name());
                }
            }
        }
        assert_eq!(emitted, 5);
    }

    #[tokio::test]
    async fn test_folding_task_publishes_changes() {
        let (reporter, mut errors) = crate::feed::error_channel(4);
        let (tx, rx) = mpsc::channel(10);
        let (mut handle, task) = spawn_registry(rx, reporter);

        tx.send(InstanceUpdate::add(web(0, "10.0.0.1"))).await.unwrap();
        let snapshot = handle.changed().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(handle.latest().generation(), 1);

        drop(tx);
        task.await.unwrap();
        assert!(handle.changed().await.is_none());
        assert!(matches!(errors.recv().await, Some(Error::FeedTerminated(_))));
    }
}
