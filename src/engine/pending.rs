use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;

/// Correlation id -> single-shot delivery channel for the waiting caller.
/// `deliver` consumes the entry, so every registered id gets at most one
/// value; the handler removes its own entry on the way out regardless.
#[derive(Debug, Default)]
pub(crate) struct PendingResponses {
    entries: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl PendingResponses {
    pub(crate) fn register(&self, id: &str) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id.to_string(), tx);
        rx
    }

    pub(crate) fn deliver(&self, id: &str, value: Value) -> bool {
        let Some(sender) = self.lock().remove(id) else {
            return false;
        };
        // The send only fails when the caller has already gone away.
        let _ = sender.send(value);
        true
    }

    pub(crate) fn unregister(&self, id: &str) {
        self.lock().remove(id);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Value>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn deliver_sends_exactly_one_value() {
        let pending = PendingResponses::default();
        let receiver = pending.register("req_1");

        assert!(pending.deliver("req_1", json!({"ok": true})));
        assert_eq!(receiver.await.unwrap(), json!({"ok": true}));

        // The entry was consumed by the delivery.
        assert!(!pending.deliver("req_1", json!({"ok": false})));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn deliver_to_unknown_id_is_a_noop() {
        let pending = PendingResponses::default();
        assert!(!pending.deliver("req_missing", json!(null)));
    }

    #[test]
    fn unregister_removes_the_entry() {
        let pending = PendingResponses::default();
        let _receiver = pending.register("req_2");
        assert_eq!(pending.len(), 1);
        pending.unregister("req_2");
        assert_eq!(pending.len(), 0);
        assert!(!pending.deliver("req_2", json!(null)));
    }
}
