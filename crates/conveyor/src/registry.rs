//! Process-scoped queue registry
//!
//! One queue instance per process, acquired explicitly at startup and passed
//! down. Replacing the instance goes through [`reset`], which closes the old
//! queue first; nothing here registers signal handlers or other side effects.

use crate::error::{QueueError, Result};
use crate::queue::Queue;
use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

static REGISTRY: Lazy<Mutex<Option<Arc<Queue>>>> = Lazy::new(|| Mutex::new(None));

/// Install a queue as the process-wide instance.
///
/// Fails with `Conflict` when an instance is already installed; call
/// [`reset`] first to replace it.
pub fn init(queue: Queue) -> Result<Arc<Queue>> {
    let mut slot = REGISTRY.lock().expect("registry lock");
    if slot.is_some() {
        return Err(QueueError::conflict(
            "a queue is already registered for this process",
        ));
    }
    let queue = Arc::new(queue);
    *slot = Some(queue.clone());
    Ok(queue)
}

/// The registered queue, if any
pub fn get() -> Option<Arc<Queue>> {
    REGISTRY.lock().expect("registry lock").clone()
}

/// Remove the registered queue and close it
pub async fn reset() -> Result<()> {
    let previous = REGISTRY.lock().expect("registry lock").take();
    match previous {
        Some(queue) => queue.close().await,
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    // One test covers the whole lifecycle: the registry is process-global, so
    // splitting these assertions across tests would race.
    #[tokio::test]
    async fn test_registry_lifecycle() {
        assert!(reset().await.is_ok());
        assert!(get().is_none());

        let queue = Queue::new(QueueConfig::default()).await.unwrap();
        let handle = init(queue).unwrap();
        assert!(get().is_some());
        assert!(Arc::ptr_eq(&handle, &get().unwrap()));

        // A second init is rejected until reset
        let another = Queue::new(QueueConfig::default()).await.unwrap();
        match init(another) {
            Err(QueueError::Conflict(_)) => {}
            other => panic!("expected conflict, got {:?}", other.map(|_| ())),
        }

        reset().await.unwrap();
        assert!(get().is_none());

        // The old handle is closed once replaced
        let err = handle
            .add("noop", serde_json::json!({}), crate::job::JobOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
