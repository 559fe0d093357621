//! Ambient transaction context.
//!
//! Tracks "the current transaction handle, if any" for one logical call
//! chain. Storage is task-local, not process-global: independently scheduled
//! chains never observe each other's handle, and the value follows every
//! `.await` continuation of the chain that set it. Values do not cross
//! `tokio::spawn` boundaries; a spawned task starts with no ambient
//! transaction.

use crate::transaction::TransactionHandle;
use std::future::Future;
use std::sync::Arc;

tokio::task_local! {
    static CURRENT_TRANSACTION: Option<Arc<TransactionHandle>>;
}

/// Chain-scoped access to the active transaction handle.
pub struct TransactionContext;

impl TransactionContext {
    /// Establish `handle` as the ambient transaction for the dynamic extent
    /// of `fut`. The prior ambient value (possibly none) is restored on every
    /// exit path, including errors: scopes nest and unwind with the future.
    pub async fn run<F>(handle: Arc<TransactionHandle>, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_TRANSACTION.scope(Some(handle), fut).await
    }

    /// The ambient transaction handle, or `None` when the current chain is
    /// not inside a transaction scope.
    pub fn current() -> Option<Arc<TransactionHandle>> {
        CURRENT_TRANSACTION
            .try_with(|handle| handle.clone())
            .ok()
            .flatten()
    }

    /// Whether the current chain has an ambient transaction.
    pub fn is_active() -> bool {
        Self::current().is_some()
    }
}
