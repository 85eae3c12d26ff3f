//! Cooperative cancellation shared between a caller and in-flight reranks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::Notify;

/// Cancellation token.
///
/// Cloning shares the same underlying flag. `cancelled()` resolves as soon as
/// `cancel()` is called, so it can race a network call inside `tokio::select!`.
/// A token made with [`CancelToken::child_of`] also fires when any of its
/// parents does, while cancelling the child leaves the parents alone.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    flag: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        let children = {
            let mut guard = self.children.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Token that is cancelled as soon as any of `parents` is.
    pub fn child_of(parents: &[&CancelToken]) -> Self {
        let child = Self::new();
        for parent in parents {
            {
                let mut children = parent
                    .inner
                    .children
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&child.inner));
            }
            // Checked after registering so a concurrent parent cancel is not missed.
            if parent.is_cancelled() {
                child.cancel();
            }
        }
        child
    }

    pub fn child(&self) -> Self {
        Self::child_of(&[self])
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            // Register before checking the flag so a concurrent cancel() is not missed.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn child_fires_with_either_parent_but_not_the_reverse() {
        let batch = CancelToken::new();
        let own = CancelToken::new();
        let child = CancelToken::child_of(&[&batch, &own]);
        let sibling = batch.child();

        let waiter = child.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        tokio::task::yield_now().await;

        own.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("child should wake")
            .unwrap();
        assert!(child.is_cancelled());
        assert!(!batch.is_cancelled());
        assert!(!sibling.is_cancelled());

        sibling.cancel();
        assert!(!batch.is_cancelled());

        let late = CancelToken::new();
        batch.cancel();
        assert!(CancelToken::child_of(&[&late, &batch]).is_cancelled());
        assert!(!late.is_cancelled());
    }
}
