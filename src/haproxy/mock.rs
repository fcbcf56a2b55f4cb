//! In-memory Dataplane API double.
//!
//! Mirrors the transactional behavior the reconciler depends on: writes are
//! staged per transaction and reach the committed view only on commit, and
//! commit can be made to fail with version conflicts a configurable number
//! of times. Used by the test suite; kept in the library so integration
//! tests can drive the full pipeline without a real HAProxy.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::DataplaneError;
use crate::haproxy::dataplane::{Backend, DataplaneApi, Server};

/// A backend and its servers as the mock stores them.
#[derive(Debug, Clone, Default)]
pub struct BackendRecord {
    pub payload: serde_json::Value,
    pub servers: BTreeMap<String, Server>,
}

/// Operation counters, cumulative across all transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub transactions_created: u32,
    pub transactions_deleted: u32,
    pub commits: u32,
    pub backends_created: u32,
    pub servers_created: u32,
    pub servers_replaced: u32,
    pub servers_deleted: u32,
}

impl Counters {
    /// Total mutating writes issued inside transactions.
    pub fn server_writes(&self) -> u32 {
        self.servers_created + self.servers_replaced + self.servers_deleted
    }
}

#[derive(Debug, Default)]
struct State {
    committed: BTreeMap<String, BackendRecord>,
    staged: BTreeMap<String, BTreeMap<String, BackendRecord>>,
    version: u64,
    next_txn: u64,
    fail_commits: u32,
    counters: Counters,
}

#[derive(Debug, Default)]
pub struct MockDataplane {
    state: Mutex<State>,
}

impl MockDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a backend into the committed view, as if created in an earlier
    /// process lifetime.
    pub fn seed_backend(&self, name: &str, servers: Vec<Server>) {
        let mut state = self.state.lock().unwrap();
        state.committed.insert(
            name.to_string(),
            BackendRecord {
                payload: serde_json::json!({ "name": name }),
                servers: servers.into_iter().map(|s| (s.name.clone(), s)).collect(),
            },
        );
    }

    /// Make the next `n` commits fail with a version conflict.
    pub fn fail_next_commits(&self, n: u32) {
        self.state.lock().unwrap().fail_commits = n;
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().unwrap().counters
    }

    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.state.lock().unwrap().committed.keys().cloned().collect()
    }

    pub fn backend_payload(&self, backend: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(backend)
            .map(|record| record.payload.clone())
    }

    /// Committed servers of a backend, ordered by slot index.
    pub fn servers(&self, backend: &str) -> Vec<Server> {
        let state = self.state.lock().unwrap();
        let Some(record) = state.committed.get(backend) else {
            return Vec::new();
        };
        let mut servers: Vec<Server> = record.servers.values().cloned().collect();
        servers.sort_by_key(|s| {
            s.name
                .strip_prefix("srv")
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(usize::MAX)
        });
        servers
    }

    pub fn server(&self, backend: &str, name: &str) -> Option<Server> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(backend)
            .and_then(|record| record.servers.get(name).cloned())
    }

    fn with_staged<T>(
        &self,
        txn: &str,
        op: &'static str,
        f: impl FnOnce(&mut BTreeMap<String, BackendRecord>, &mut Counters) -> T,
    ) -> Result<T, DataplaneError> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let Some(view) = state.staged.get_mut(txn) else {
            return Err(unknown_transaction(op, txn));
        };
        Ok(f(view, &mut state.counters))
    }
}

fn unknown_transaction(op: &'static str, txn: &str) -> DataplaneError {
    DataplaneError::Api {
        status: 404,
        method: op.to_string(),
        path: format!("transaction/{txn}"),
        body: "unknown transaction".to_string(),
    }
}

#[async_trait]
impl DataplaneApi for MockDataplane {
    async fn configuration_version(&self) -> Result<u64, DataplaneError> {
        Ok(self.state.lock().unwrap().version)
    }

    async fn create_transaction(&self, _version: u64) -> Result<String, DataplaneError> {
        let mut state = self.state.lock().unwrap();
        state.next_txn += 1;
        state.counters.transactions_created += 1;
        let id = format!("txn-{}", state.next_txn);
        let snapshot = state.committed.clone();
        state.staged.insert(id.clone(), snapshot);
        Ok(id)
    }

    async fn commit_transaction(&self, id: &str) -> Result<(), DataplaneError> {
        let mut state = self.state.lock().unwrap();
        if !state.staged.contains_key(id) {
            return Err(unknown_transaction("commit", id));
        }
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(DataplaneError::VersionConflict {
                body: "version mismatch".to_string(),
            });
        }
        if let Some(view) = state.staged.remove(id) {
            state.committed = view;
            state.version += 1;
            state.counters.commits += 1;
        }
        Ok(())
    }

    async fn delete_transaction(&self, id: &str) -> Result<(), DataplaneError> {
        let mut state = self.state.lock().unwrap();
        state.staged.remove(id);
        state.counters.transactions_deleted += 1;
        Ok(())
    }

    async fn get_backend(&self, name: &str, txn: &str) -> Result<Option<Backend>, DataplaneError> {
        self.with_staged(txn, "get_backend", |view, _| {
            view.get(name).map(|_| Backend {
                name: name.to_string(),
            })
        })
    }

    async fn create_backend(
        &self,
        payload: &serde_json::Value,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        let name = payload
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.with_staged(txn, "create_backend", |view, counters| {
            counters.backends_created += 1;
            view.insert(
                name,
                BackendRecord {
                    payload: payload.clone(),
                    servers: BTreeMap::new(),
                },
            );
        })
    }

    async fn get_servers(&self, backend: &str, txn: &str) -> Result<Vec<Server>, DataplaneError> {
        self.with_staged(txn, "get_servers", |view, _| {
            view.get(backend)
                .map(|record| record.servers.values().cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn create_server(
        &self,
        backend: &str,
        server: &Server,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        self.with_staged(txn, "create_server", |view, counters| {
            counters.servers_created += 1;
            view.entry(backend.to_string())
                .or_default()
                .servers
                .insert(server.name.clone(), server.clone());
        })
    }

    async fn replace_server(
        &self,
        backend: &str,
        name: &str,
        server: &Server,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        self.with_staged(txn, "replace_server", |view, counters| {
            counters.servers_replaced += 1;
            view.entry(backend.to_string())
                .or_default()
                .servers
                .insert(name.to_string(), server.clone());
        })
    }

    async fn delete_server(
        &self,
        backend: &str,
        name: &str,
        txn: &str,
    ) -> Result<(), DataplaneError> {
        self.with_staged(txn, "delete_server", |view, counters| {
            counters.servers_deleted += 1;
            if let Some(record) = view.get_mut(backend) {
                record.servers.remove(name);
            }
        })
    }
}
