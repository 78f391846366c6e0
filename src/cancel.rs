//! Cooperative cancellation.
//!
//! A `CancelSource` is held by whoever owns the batch; `CancelToken` clones
//! thread through every blocking operation. Cancellation is level-triggered
//! and sticky.

use tokio::sync::watch;

/// Owning side. Dropping the source without cancelling leaves tokens live.
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// Observing side, cheap to clone.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> (CancelSource, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (CancelSource { tx }, CancelToken { rx })
    }

    /// Signal cancellation to every token.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token that never fires, for callers without a batch context.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        CancelToken { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is signalled. Never resolves if the
    /// source is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Source dropped uncancelled: park forever.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_observed_by_all_clones() {
        let (source, token) = CancelSource::new();
        let other = token.clone();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
        assert!(other.is_cancelled());
        token.cancelled().await; // resolves immediately
    }

    #[tokio::test]
    async fn never_token_stays_live() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            token.cancelled(),
        )
        .await;
        assert!(pending.is_err());
    }
}
