use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Upstream batch id -> creating credential, kept only so that shutdown can
/// cancel whatever is still running.
#[derive(Debug, Default)]
pub(crate) struct ActiveBatches {
    entries: Mutex<HashMap<String, String>>,
}

impl ActiveBatches {
    pub(crate) fn insert(&self, batch_id: &str, credential: &str) {
        self.lock()
            .insert(batch_id.to_string(), credential.to_string());
    }

    pub(crate) fn remove(&self, batch_id: &str) {
        self.lock().remove(batch_id);
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, String)> {
        self.lock()
            .iter()
            .map(|(batch_id, credential)| (batch_id.clone(), credential.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
