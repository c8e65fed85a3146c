//! Callback registration handles.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::broadcast;
use tracing::trace;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Callback handle for unregistering callbacks.
///
/// The callback stays registered for as long as the handle is alive.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed),
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Run `callback` for every value received on `rx` until the handle is dropped.
    pub(crate) fn spawn_listener<T, F>(mut rx: broadcast::Receiver<T>, callback: F) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => callback(value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!("Callback listener lagged by {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Self::new(move || handle.abort())
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_unregister_runs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = CallbackHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        handle.unregister();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = CallbackHandle::new(|| {});
        let b = CallbackHandle::new(|| {});
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_listener_stops_after_drop() {
        let (tx, rx) = broadcast::channel(8);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handle = CallbackHandle::spawn_listener(rx, move |_: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(1).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
