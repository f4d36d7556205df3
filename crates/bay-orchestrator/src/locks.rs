use std::collections::HashMap;
use std::sync::Arc;

use bay_domain::SandboxId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-sandbox mutex table.
///
/// Every state-changing operation touching one sandbox holds its entry for
/// the duration of the transition; capability calls hold it only while
/// arranging the session. Entries are dropped when the sandbox is
/// destroyed. The table is process-local — cross-process serialization is
/// the metadata store's `version` CAS.
#[derive(Debug, Clone, Default)]
pub struct LockTable {
    inner: Arc<Mutex<HashMap<SandboxId, Arc<Mutex<()>>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, id: &SandboxId) -> OwnedMutexGuard<()> {
        let entry = {
            let mut table = self.inner.lock().await;
            table
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Forget a destroyed sandbox's entry. A holder of the old guard keeps
    /// it alive until drop; new lockers get a fresh entry.
    pub async fn remove(&self, id: &SandboxId) {
        let mut table = self.inner.lock().await;
        table.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
