//! Slot entries and their teardown

use std::fmt;
use std::sync::Arc;

type Teardown = Box<dyn FnOnce() + Send + 'static>;

/// A built resource plus everything needed to release it.
///
/// Dropping the entry runs the deferred cleanups (newest first) and then the
/// close hook. [`Entry::detach`] runs the cleanups but skips the close hook,
/// handing the live resource to a new owner.
pub struct Entry<T: ?Sized> {
    value: Arc<T>,
    cleanups: Vec<Teardown>,
    close: Option<Teardown>,
}

impl<T: ?Sized> Entry<T> {
    pub fn new(value: Arc<T>) -> Self {
        Self {
            value,
            cleanups: Vec::new(),
            close: None,
        }
    }

    /// Release the resource itself when the entry is torn down
    pub fn on_close(mut self, close: impl FnOnce() + Send + 'static) -> Self {
        self.close = Some(Box::new(close));
        self
    }

    /// Run `cleanup` on teardown and on detach
    pub fn defer(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.cleanups.push(Box::new(cleanup));
        self
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    /// Stop this entry's watchers and take the resource without closing it
    pub fn detach(mut self) -> Arc<T> {
        self.close = None;
        self.value.clone()
    }
}

impl<T: ?Sized> Drop for Entry<T> {
    fn drop(&mut self) {
        while let Some(cleanup) = self.cleanups.pop() {
            cleanup();
        }
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl<T: ?Sized> fmt::Debug for Entry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("cleanups", &self.cleanups.len())
            .field("close", &self.close.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_drop_runs_cleanups_newest_first_then_close() {
        let log = recorder();
        let (a, b, c) = (log.clone(), log.clone(), log.clone());

        let entry = Entry::new(Arc::new(1u8))
            .on_close(move || a.lock().push("close"))
            .defer(move || b.lock().push("first"))
            .defer(move || c.lock().push("second"));
        drop(entry);

        assert_eq!(*log.lock(), vec!["second", "first", "close"]);
    }

    #[test]
    fn test_detach_skips_close() {
        let log = recorder();
        let (a, b) = (log.clone(), log.clone());

        let entry = Entry::new(Arc::new("circuit"))
            .on_close(move || a.lock().push("close"))
            .defer(move || b.lock().push("unwatch"));
        let value = entry.detach();

        assert_eq!(*value, "circuit");
        assert_eq!(*log.lock(), vec!["unwatch"]);
    }
}
