//! Per-layer mutual exclusion inside one process

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Named async locks, one per layer name
///
/// Cloning shares the same lock table.
#[derive(Clone, Default)]
pub struct LayerLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl LayerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `layer`
    pub async fn acquire(&self, layer: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.inner.lock().await;
            // Entries nobody holds or waits on can go.
            table.retain(|_, lock| Arc::strong_count(lock) > 1);
            table.entry(layer.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_layer_is_exclusive() {
        let locks = LayerLocks::new();
        let guard = locks.acquire("barrios").await;

        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _guard = contender.acquire("barrios").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_layers_do_not_block() {
        let locks = LayerLocks::new();
        let _a = locks.acquire("a").await;
        tokio::time::timeout(Duration::from_millis(100), locks.acquire("b"))
            .await
            .unwrap();
    }
}
