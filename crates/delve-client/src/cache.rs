//! Single-writer state cell with change notification.
//!
//! A [`Cache`] is owned by the router and is the only way to mutate the
//! value it holds. Readers hold a [`CacheView`], which can be cloned freely
//! and handed to other tasks. Each call to [`Cache::update`] publishes at
//! most one change, and only if the value actually changed.

use tokio::sync::watch;

/// Writable end. Only the router owns one.
#[derive(Debug)]
pub struct Cache<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> Cache<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// A new read handle.
    pub fn view(&self) -> CacheView<T> {
        CacheView {
            rx: self.tx.subscribe(),
        }
    }

    /// Run `f` against the current value.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Mutate in place. Subscribers are woken once, and only when the
    /// value differs afterwards. Returns whether it changed.
    pub(crate) fn update(&self, f: impl FnOnce(&mut T)) -> bool {
        self.tx.send_if_modified(|value| {
            let before = value.clone();
            f(value);
            *value != before
        })
    }
}

/// Read handle onto a [`Cache`].
#[derive(Debug, Clone)]
pub struct CacheView<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> CacheView<T> {
    /// Point-in-time copy of the value.
    pub fn snapshot(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Run `f` against the current value without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.rx.borrow())
    }

    /// Wait until the value changes after the last observed version.
    ///
    /// Returns `false` once the owning cache is gone.
    pub async fn changed(&mut self) -> bool {
        let changed = self.rx.changed().await.is_ok();
        self.rx.borrow_and_update();
        changed
    }

    /// Whether a change has been published since the last `changed()`.
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// A raw receiver for callers that want to `select!` on it.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_that_changes_notifies_once() {
        let cache = Cache::new(0u32);
        let view = cache.view();

        let changed = cache.update(|v| {
            *v += 1;
            *v += 1;
        });
        assert!(changed);
        assert!(view.has_changed());
        assert_eq!(view.snapshot(), 2);
    }

    #[tokio::test]
    async fn test_update_without_change_is_silent() {
        let cache = Cache::new(vec![1, 2]);
        let mut view = cache.view();

        assert!(cache.update(|v| v.push(3)));
        assert!(view.changed().await);

        assert!(!cache.update(|v| v.retain(|_| true)));
        assert!(!view.has_changed());
        assert_eq!(cache.read(|v| v.len()), 3);
    }

    #[tokio::test]
    async fn test_view_wakes_on_change() {
        let cache = Cache::new(0u8);
        let mut view = cache.view();

        let waiter = tokio::spawn(async move {
            assert!(view.changed().await);
            view.snapshot()
        });
        tokio::task::yield_now().await;
        cache.update(|v| *v = 7);

        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_view_reports_closed_cache() {
        let cache = Cache::new(0u8);
        let mut view = cache.view();
        drop(cache);
        assert!(!view.changed().await);
    }
}
