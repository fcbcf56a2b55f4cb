//! Cycle-over-cycle change detection for discovered services.
//!
//! The detector holds the only state that survives between polling cycles:
//! for every backend, the set of instances HAProxy last saw and the slot
//! count last materialized. The snapshot is replaced only after a reconcile
//! commits, so a failed cycle leaves the next diff computed against the last
//! state HAProxy actually reached.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::TagsConfig;
use crate::discovery::models::{Service, ServiceKey};

/// One instance as HAProxy will see it. Any difference in this record
/// between cycles makes the owning service "changed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub ip: String,
    /// Effective port (instance override or service port).
    pub port: u16,
    pub zone: Option<String>,
    pub az_weight: Option<u8>,
}

/// Last-known state of one backend.
#[derive(Debug, Clone, Default)]
pub struct BackendState {
    instances: BTreeMap<String, InstanceRecord>,
    slot_count: usize,
}

impl BackendState {
    /// A quiesced backend has no active instances, only parked slots.
    pub fn is_quiesced(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }
}

/// The per-cycle output of change detection.
#[derive(Debug, Default)]
pub struct ChangeSet {
    /// Created or changed services, carrying their full new instance list.
    pub changed: Vec<Service>,
    /// Services present before, absent now. Their backends get quiesced.
    pub removed: Vec<ServiceKey>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

pub struct ChangeDetector {
    tags: TagsConfig,
    previous: BTreeMap<ServiceKey, BackendState>,
}

impl ChangeDetector {
    pub fn new(tags: TagsConfig) -> Self {
        Self {
            tags,
            previous: BTreeMap::new(),
        }
    }

    /// Clear all stored state. The next cycle reconciles everything as new.
    pub fn reset(&mut self) {
        info!("Change detector state reset; next cycle will reconcile everything");
        self.previous.clear();
    }

    /// Classify every service in `current ∪ previous` and return what the
    /// reconciler must act on. Does not modify the snapshot; call
    /// [`commit`](Self::commit) after the reconcile succeeds.
    pub fn detect(&self, current: &BTreeMap<ServiceKey, Service>) -> ChangeSet {
        let mut changes = ChangeSet::default();

        // Services gone from discovery. A backend already quiesced stays
        // quiet: quiesce is emitted once per disappearance.
        for (key, state) in &self.previous {
            if !current.contains_key(key) && !state.is_quiesced() {
                info!(service = %key, "Service removed");
                changes.removed.push(key.clone());
            }
        }

        let mut unchanged = 0usize;
        for (key, service) in current {
            let records = self.records_for(service);
            match self.previous.get(key) {
                None => {
                    info!(
                        service = %key,
                        instances = service.instances.len(),
                        "New service discovered"
                    );
                    changes.changed.push(service.clone());
                }
                Some(prev) if prev.instances != records => {
                    info!(
                        service = %key,
                        before = prev.instances.len(),
                        after = records.len(),
                        "Service instances changed"
                    );
                    changes.changed.push(service.clone());
                }
                Some(_) => unchanged += 1,
            }
        }

        debug!(
            changed = changes.changed.len(),
            removed = changes.removed.len(),
            unchanged,
            "Change detection complete"
        );
        changes
    }

    /// Replace the snapshot after a successful reconcile. Services gone from
    /// discovery are retained in quiesced form so their slot counts survive,
    /// keeping the never-shrink rule effective across restarts of a service.
    pub fn commit(
        &mut self,
        current: &BTreeMap<ServiceKey, Service>,
        slot_counts: &BTreeMap<ServiceKey, usize>,
    ) {
        let mut next: BTreeMap<ServiceKey, BackendState> = BTreeMap::new();

        for (key, service) in current {
            let slot_count = slot_counts
                .get(key)
                .copied()
                .or_else(|| self.previous.get(key).map(BackendState::slot_count))
                .unwrap_or(0);
            next.insert(
                key.clone(),
                BackendState {
                    instances: self.records_for(service),
                    slot_count,
                },
            );
        }

        for (key, prev) in &self.previous {
            if !next.contains_key(key) {
                let slot_count = slot_counts.get(key).copied().unwrap_or(prev.slot_count);
                next.insert(
                    key.clone(),
                    BackendState {
                        instances: BTreeMap::new(),
                        slot_count,
                    },
                );
            }
        }

        self.previous = next;
    }

    fn records_for(&self, service: &Service) -> BTreeMap<String, InstanceRecord> {
        service
            .instances
            .iter()
            .map(|instance| {
                (
                    instance.id.clone(),
                    InstanceRecord {
                        id: instance.id.clone(),
                        ip: instance.ip.clone(),
                        port: service.effective_port(instance, &self.tags),
                        zone: instance.zone.clone(),
                        az_weight: instance.az_weight(&self.tags),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::models::{Instance, InstanceSource};

    fn instance(id: &str, ip: &str) -> Instance {
        Instance {
            id: id.to_string(),
            name: format!("vm-{id}"),
            ip: ip.to_string(),
            region: "eastus".to_string(),
            zone: None,
            source: InstanceSource::Vm,
            tags: BTreeMap::new(),
        }
    }

    fn service(instances: Vec<Instance>) -> Service {
        Service {
            name: "app".to_string(),
            port: 80,
            region: "eastus".to_string(),
            instances,
        }
    }

    fn key() -> ServiceKey {
        ServiceKey {
            name: "app".to_string(),
            port: 80,
            region: "eastus".to_string(),
        }
    }

    fn current(services: Vec<Service>) -> BTreeMap<ServiceKey, Service> {
        services.into_iter().map(|s| (s.key(), s)).collect()
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(TagsConfig::default())
    }

    fn commit_all(det: &mut ChangeDetector, services: &BTreeMap<ServiceKey, Service>) {
        let slots = services.keys().map(|k| (k.clone(), 10usize)).collect();
        det.commit(services, &slots);
    }

    #[test]
    fn test_first_cycle_everything_is_new() {
        let det = detector();
        let services = current(vec![service(vec![instance("a", "10.0.0.1")])]);

        let changes = det.detect(&services);
        assert_eq!(changes.changed.len(), 1);
        assert!(changes.removed.is_empty());
    }

    #[test]
    fn test_no_change_on_identical_cycle() {
        let mut det = detector();
        let services = current(vec![service(vec![instance("a", "10.0.0.1")])]);

        commit_all(&mut det, &services);
        let changes = det.detect(&services);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_detects_removed_service_once() {
        let mut det = detector();
        let services = current(vec![service(vec![instance("a", "10.0.0.1")])]);
        commit_all(&mut det, &services);

        let empty = BTreeMap::new();
        let changes = det.detect(&empty);
        assert!(changes.changed.is_empty());
        assert_eq!(changes.removed, vec![key()]);

        // The quiesced entry is retained, and the disappearance is not
        // re-emitted on the next cycle.
        det.commit(&empty, &BTreeMap::new());
        let changes = det.detect(&empty);
        assert!(changes.is_empty());
        assert_eq!(det.previous.get(&key()).unwrap().slot_count(), 10);
    }

    #[test]
    fn test_detects_instance_set_change() {
        let mut det = detector();
        let one = current(vec![service(vec![instance("a", "10.0.0.1")])]);
        commit_all(&mut det, &one);

        let two = current(vec![service(vec![
            instance("a", "10.0.0.1"),
            instance("b", "10.0.0.2"),
        ])]);
        let changes = det.detect(&two);
        assert_eq!(changes.changed.len(), 1);
        assert_eq!(changes.changed[0].instances.len(), 2);
    }

    #[test]
    fn test_detects_ip_change() {
        let mut det = detector();
        let before = current(vec![service(vec![instance("a", "10.0.0.1")])]);
        commit_all(&mut det, &before);

        let after = current(vec![service(vec![instance("a", "10.0.0.9")])]);
        assert_eq!(det.detect(&after).changed.len(), 1);
    }

    #[test]
    fn test_detects_zone_change() {
        let mut det = detector();
        let mut moved = instance("a", "10.0.0.1");
        moved.zone = Some("1".to_string());

        let before = current(vec![service(vec![instance("a", "10.0.0.1")])]);
        commit_all(&mut det, &before);

        let after = current(vec![service(vec![moved])]);
        assert_eq!(det.detect(&after).changed.len(), 1);
    }

    #[test]
    fn test_detects_az_weight_change() {
        let mut det = detector();
        let before = current(vec![service(vec![instance("a", "10.0.0.1")])]);
        commit_all(&mut det, &before);

        let mut weighted = instance("a", "10.0.0.1");
        weighted.tags.insert(
            "HAProxy:Instance:AZperc".to_string(),
            "30".to_string(),
        );
        let after = current(vec![service(vec![weighted])]);
        assert_eq!(det.detect(&after).changed.len(), 1);
    }

    #[test]
    fn test_snapshot_unchanged_until_commit() {
        let mut det = detector();
        let services = current(vec![service(vec![instance("a", "10.0.0.1")])]);

        // detect() alone must not update state: a failed reconcile leaves
        // the same change emitted next cycle.
        assert_eq!(det.detect(&services).changed.len(), 1);
        assert_eq!(det.detect(&services).changed.len(), 1);

        commit_all(&mut det, &services);
        assert!(det.detect(&services).is_empty());
    }

    #[test]
    fn test_reset_makes_next_cycle_detect_all() {
        let mut det = detector();
        let services = current(vec![service(vec![instance("a", "10.0.0.1")])]);
        commit_all(&mut det, &services);

        det.reset();
        assert_eq!(det.detect(&services).changed.len(), 1);
    }

    #[test]
    fn test_unchanged_service_retains_slot_count() {
        let mut det = detector();
        let services = current(vec![service(vec![instance("a", "10.0.0.1")])]);
        let mut slots = BTreeMap::new();
        slots.insert(key(), 13usize);
        det.commit(&services, &slots);

        // A later commit without the reconciler having touched the service
        // keeps the recorded count.
        det.commit(&services, &BTreeMap::new());
        assert_eq!(det.previous.get(&key()).unwrap().slot_count(), 13);
    }
}
