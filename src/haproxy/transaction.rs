//! Scoped Dataplane transactions.
//!
//! A scope moves from open to exactly one of committed, discarded, or
//! aborted; every path releases the server-side transaction. Committing an
//! empty transaction is never done: the Dataplane would bump the
//! configuration version for nothing.

use tracing::{debug, info, warn};

use crate::error::DataplaneError;
use crate::haproxy::dataplane::DataplaneApi;

/// How a scope ended on the success path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    /// No changes were recorded; the empty transaction was deleted.
    Discarded,
}

pub struct TransactionScope<'a> {
    api: &'a dyn DataplaneApi,
    id: String,
    changed: bool,
}

impl<'a> TransactionScope<'a> {
    /// Fetch the current configuration version and open a transaction
    /// against it.
    pub async fn open(api: &'a dyn DataplaneApi) -> Result<TransactionScope<'a>, DataplaneError> {
        let version = api.configuration_version().await?;
        let id = api.create_transaction(version).await?;
        debug!(transaction_id = %id, version, "Transaction started");
        Ok(Self {
            api,
            id,
            changed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record that a mutating write was issued under this transaction.
    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Close the scope on the success path: commit when changes were
    /// recorded, otherwise discard. A commit rejected with a version
    /// conflict deletes the dead transaction before surfacing the conflict,
    /// so the caller can immediately open a fresh one.
    pub async fn finish(self) -> Result<TxnOutcome, DataplaneError> {
        if !self.changed {
            debug!(transaction_id = %self.id, "No changes recorded, discarding transaction");
            self.safe_delete().await;
            return Ok(TxnOutcome::Discarded);
        }

        info!(transaction_id = %self.id, "Committing transaction");
        match self.api.commit_transaction(&self.id).await {
            Ok(()) => Ok(TxnOutcome::Committed),
            Err(err) => {
                if err.is_version_conflict() {
                    warn!(transaction_id = %self.id, "Commit rejected by version conflict");
                } else {
                    warn!(transaction_id = %self.id, error = %err, "Commit failed");
                }
                self.safe_delete().await;
                Err(err)
            }
        }
    }

    /// Close the scope on the error path.
    pub async fn abort(self) {
        warn!(transaction_id = %self.id, "Aborting transaction");
        self.safe_delete().await;
    }

    async fn safe_delete(&self) {
        if let Err(err) = self.api.delete_transaction(&self.id).await {
            debug!(
                transaction_id = %self.id,
                error = %err,
                "Could not delete transaction (may already be gone)"
            );
        }
    }
}
