//! Applies discovered service change sets to HAProxy.
//!
//! One invocation processes the whole cycle's change set inside a single
//! transaction: backends are created on first sight, every slot is written
//! from scratch (the protocol is idempotent, slots are recomputed rather
//! than patched), and services that disappeared have all their slots parked.
//! Backends are never deleted and never shrink.
//!
//! Version conflicts retry the entire cycle against a fresh transaction,
//! up to [`MAX_VERSION_RETRIES`] retries on top of the initial attempt,
//! reusing the already-discovered instance set.
//!
//! Shutdown is observed between Dataplane calls: a tripped signal stops the
//! cycle at the next call boundary and the open transaction is deleted, not
//! committed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{HaproxyConfig, TagsConfig};
use crate::discovery::models::{Instance, Service, ServiceKey};
use crate::error::{DataplaneError, Error};
use crate::haproxy::dataplane::{DataplaneApi, Server};
use crate::haproxy::slot_allocator::SlotAllocator;
use crate::haproxy::transaction::{TransactionScope, TxnOutcome};

/// Retries after a conflicted commit, on top of the initial attempt.
pub const MAX_VERSION_RETRIES: u32 = 3;

/// Parked slots point at this sentinel, in maintenance with checks off, so
/// the backend keeps its shape without routing anything.
const PARKED_ADDRESS: &str = "127.0.0.1";
const PARKED_PORT: u16 = 80;

const ENABLED: &str = "enabled";
const DISABLED: &str = "disabled";

/// What a successful cycle materialized, fed back into the change detector
/// snapshot.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Slot count per backend actually written this cycle.
    pub slot_counts: BTreeMap<ServiceKey, usize>,
    pub committed: bool,
}

pub struct Reconciler {
    api: Arc<dyn DataplaneApi>,
    haproxy: HaproxyConfig,
    tags: TagsConfig,
    slots: SlotAllocator,
}

impl Reconciler {
    pub fn new(api: Arc<dyn DataplaneApi>, haproxy: HaproxyConfig, tags: TagsConfig) -> Self {
        let slots = SlotAllocator::new(&haproxy.server_slots);
        Self {
            api,
            haproxy,
            tags,
            slots,
        }
    }

    /// Apply the cycle's change set atomically. `shutdown` cancels at the
    /// next call boundary.
    pub async fn reconcile(
        &self,
        changed: &[Service],
        removed: &[ServiceKey],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ReconcileOutcome, Error> {
        if changed.is_empty() && removed.is_empty() {
            debug!("Nothing to reconcile");
            return Ok(ReconcileOutcome::default());
        }

        let mut conflicts = 0;
        loop {
            match self.apply_once(changed, removed, shutdown).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_version_conflict() && conflicts < MAX_VERSION_RETRIES => {
                    conflicts += 1;
                    warn!(
                        attempt = conflicts,
                        max_retries = MAX_VERSION_RETRIES,
                        "Version conflict, retrying cycle"
                    );
                }
                Err(err) => {
                    if err.is_version_conflict() {
                        error!(
                            retries = MAX_VERSION_RETRIES,
                            "Version conflict persisted, giving up on cycle"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }

    async fn apply_once(
        &self,
        changed: &[Service],
        removed: &[ServiceKey],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<ReconcileOutcome, Error> {
        let mut txn = TransactionScope::open(self.api.as_ref()).await?;

        match self.apply_all(&mut txn, changed, removed, shutdown).await {
            Ok(slot_counts) => {
                // A shutdown observed while the transaction is open deletes
                // it; it is never committed.
                if *shutdown.borrow() {
                    txn.abort().await;
                    return Err(Error::Cancelled);
                }
                let outcome = txn.finish().await?;
                Ok(ReconcileOutcome {
                    slot_counts,
                    committed: outcome == TxnOutcome::Committed,
                })
            }
            Err(err) => {
                txn.abort().await;
                Err(err)
            }
        }
    }

    async fn apply_all(
        &self,
        txn: &mut TransactionScope<'_>,
        changed: &[Service],
        removed: &[ServiceKey],
        shutdown: &watch::Receiver<bool>,
    ) -> Result<BTreeMap<ServiceKey, usize>, Error> {
        let mut slot_counts = BTreeMap::new();

        for service in changed {
            ensure_live(shutdown)?;
            let slots = self.reconcile_service(txn, service, shutdown).await?;
            slot_counts.insert(service.key(), slots);
            txn.mark_changed();
        }

        for key in removed {
            ensure_live(shutdown)?;
            let parked = self.quiesce_backend(txn, key, shutdown).await?;
            if parked > 0 {
                slot_counts.insert(key.clone(), parked);
                txn.mark_changed();
            }
        }

        Ok(slot_counts)
    }

    /// Bring one backend in line with its discovered instances. Returns the
    /// slot count materialized.
    async fn reconcile_service(
        &self,
        txn: &mut TransactionScope<'_>,
        service: &Service,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<usize, Error> {
        let backend_name = service.key().backend_name(&self.haproxy.backend);
        info!(
            service = %service.name,
            backend = %backend_name,
            instances = service.instances.len(),
            "Reconciling service"
        );

        self.ensure_backend(txn, &backend_name, &service.name)
            .await?;

        let existing: BTreeMap<String, Server> = self
            .api
            .get_servers(&backend_name, txn.id())
            .await?
            .into_iter()
            .map(|server| (server.name.clone(), server))
            .collect();

        // Grow to the desired size but never below what the backend already
        // has.
        let target = self
            .slots
            .slot_count(service.instances.len())
            .max(existing.len());

        for index in 0..target {
            ensure_live(shutdown)?;
            let name = SlotAllocator::server_name(index);
            let server = match service.instances.get(index) {
                Some(instance) => self.active_server(&name, service, instance),
                None => parked_server(&name),
            };

            if existing.contains_key(&name) {
                self.api
                    .replace_server(&backend_name, &name, &server, txn.id())
                    .await?;
            } else {
                self.api
                    .create_server(&backend_name, &server, txn.id())
                    .await?;
            }
        }

        // Entries outside the slot naming scheme (added by hand or by an
        // older deployment) would otherwise shadow the slot model.
        let managed: BTreeSet<String> = (0..target).map(SlotAllocator::server_name).collect();
        for name in existing.keys() {
            if !managed.contains(name) {
                debug!(backend = %backend_name, server = %name, "Removing unmanaged server");
                self.api
                    .delete_server(&backend_name, name, txn.id())
                    .await?;
            }
        }

        Ok(target)
    }

    /// Park every server of a backend whose service disappeared. The backend
    /// itself is preserved. Returns the number of servers parked.
    async fn quiesce_backend(
        &self,
        txn: &mut TransactionScope<'_>,
        key: &ServiceKey,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<usize, Error> {
        let backend_name = key.backend_name(&self.haproxy.backend);

        if self.api.get_backend(&backend_name, txn.id()).await?.is_none() {
            debug!(backend = %backend_name, "Backend not found, nothing to park");
            return Ok(0);
        }

        let servers = self.api.get_servers(&backend_name, txn.id()).await?;
        if servers.is_empty() {
            debug!(backend = %backend_name, "No servers to park");
            return Ok(0);
        }

        info!(
            service = %key,
            backend = %backend_name,
            servers = servers.len(),
            "Parking all servers in removed backend"
        );
        for server in &servers {
            ensure_live(shutdown)?;
            self.api
                .replace_server(
                    &backend_name,
                    &server.name,
                    &parked_server(&server.name),
                    txn.id(),
                )
                .await?;
        }

        Ok(servers.len())
    }

    /// Create the backend if it does not exist yet. Existing backends are
    /// left untouched; the create payload is the only place service-specific
    /// options are ever written.
    async fn ensure_backend(
        &self,
        txn: &mut TransactionScope<'_>,
        name: &str,
        service_name: &str,
    ) -> Result<(), DataplaneError> {
        if self.api.get_backend(name, txn.id()).await?.is_some() {
            return Ok(());
        }

        info!(backend = %name, "Creating backend");
        let mut payload = serde_json::json!({
            "name": name,
            "mode": self.haproxy.backend.mode,
            "balance": { "algorithm": self.haproxy.backend.balance },
        });
        if let Some(extra) = self.haproxy.backend_options.get(service_name) {
            if let (Some(base), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
                for (key, value) in extra {
                    base.insert(key.clone(), value.clone());
                }
            }
        }

        self.api.create_backend(&payload, txn.id()).await
    }

    fn active_server(&self, name: &str, service: &Service, instance: &Instance) -> Server {
        let mut server = Server {
            name: name.to_string(),
            address: instance.ip.clone(),
            port: service.effective_port(instance, &self.tags),
            maintenance: Some(DISABLED.to_string()),
            check: Some(ENABLED.to_string()),
            cookie: Some(name.to_string()),
            weight: None,
            backup: None,
        };

        if let Some(ha_zone) = &self.haproxy.availability_zone {
            // An instance with no zone counts as local to HAProxy.
            let same_zone = instance.zone.as_deref().map_or(true, |z| z == ha_zone);
            match instance.az_weight(&self.tags) {
                Some(pct) if same_zone => server.weight = Some(100 - u32::from(pct)),
                Some(pct) => server.weight = Some(u32::from(pct)),
                None if !same_zone => server.backup = Some(ENABLED.to_string()),
                None => {}
            }
        }

        server
    }
}

/// Checked between Dataplane calls so cancellation stops the cycle before
/// the next write.
fn ensure_live(shutdown: &watch::Receiver<bool>) -> Result<(), Error> {
    if *shutdown.borrow() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn parked_server(name: &str) -> Server {
    Server {
        name: name.to_string(),
        address: PARKED_ADDRESS.to_string(),
        port: PARKED_PORT,
        maintenance: Some(ENABLED.to_string()),
        check: Some(DISABLED.to_string()),
        cookie: None,
        weight: None,
        backup: None,
    }
}
