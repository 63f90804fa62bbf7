use std::sync::Arc;

use tokio::sync::watch;

/// External gate that holds a submitted job in PENDING until released.
///
/// Clones share the same gate. Releasing is idempotent and sticky: waiters
/// that arrive afterwards pass straight through.
#[derive(Clone, Debug)]
pub struct StartBarrier {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StartBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl StartBarrier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn release(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_released(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on release.
        let _ = rx.wait_for(|released| *released).await;
    }
}
