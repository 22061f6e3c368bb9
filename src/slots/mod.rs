//! Slot claims and instance announcements
//!
//! A scheduler claims `(group, service, instance_number)` by creating the
//! slot's key with an empty value and the lock TTL. Once the workload is up
//! it announces the live instance with [`SlotClaims::update_instance`],
//! which overwrites the key with the shorter update TTL and must be
//! repeated to keep the instance registered.
//!
//! There is no fencing: a claimant that stalls past the lock TTL can lose
//! the slot to another one, and writes after that point are best-effort.

use crate::common::{Error, RegistrarConfig, Result};
use crate::instance::{encode_instance, instance_key, Instance, InstanceId, ServiceConfig};
use crate::store::CoordinationStore;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Mutating entry points into the store for schedulers
pub struct SlotClaims {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    lock_ttl: Duration,
    update_ttl: Duration,
    request_timeout: Duration,
}

impl SlotClaims {
    pub fn new(store: Arc<dyn CoordinationStore>, config: &RegistrarConfig) -> Self {
        Self {
            store,
            prefix: config.store.prefix.clone(),
            lock_ttl: config.leases.lock_ttl(),
            update_ttl: config.leases.update_ttl(),
            request_timeout: config.store.request_timeout(),
        }
    }

    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| Error::Timeout(what.to_string()))?
    }

    /// Claim a slot. Fails with `SlotOccupied` if a lock or a live instance
    /// already holds it; nothing needs cleaning up in that case.
    pub async fn lock_instance(
        &self,
        group: &str,
        service: &str,
        instance_number: u32,
    ) -> Result<()> {
        let slot = InstanceId::new(group, service, instance_number);
        let key = instance_key(&self.prefix, &slot);

        let created = self
            .bounded(
                &format!("locking {}", slot),
                self.store.create_if_absent(&key, "", Some(self.lock_ttl)),
            )
            .await?;
        if !created {
            tracing::debug!("Slot {} is occupied", slot);
            return Err(Error::SlotOccupied {
                slot: slot.qualified_name(),
            });
        }

        tracing::info!("Locked slot {} for {:?}", slot, self.lock_ttl);
        Ok(())
    }

    /// Claim a slot of a configured service
    pub async fn lock_service_slot(
        &self,
        service: &ServiceConfig,
        instance_number: u32,
    ) -> Result<()> {
        self.lock_instance(&service.group, &service.name, instance_number)
            .await
    }

    /// Write (or refresh) a live instance
    pub async fn update_instance(&self, instance: &Instance) -> Result<()> {
        let (key, value) = encode_instance(&self.prefix, instance)?;
        self.bounded(
            &format!("updating {}", instance.qualified_name()),
            self.store.set(&key, &value, Some(self.update_ttl)),
        )
        .await?;
        tracing::debug!("Updated {}", instance);
        Ok(())
    }
}
