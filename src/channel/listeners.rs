//! Listener registration and fan-out.
//!
//! Dispatch iterates a snapshot of the registered listeners, so a listener
//! added mid-dispatch neither skips nor duplicates delivery to the others.
//! Removal flips the entry's `active` flag, which dispatch checks right
//! before each call: once `remove` returns, that listener is never invoked
//! again, even when removed from inside another listener's callback.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::Envelope;

/// Handle returned by `add_listener`, used to remove the listener later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Callback = Box<dyn Fn(&Envelope) + Send + Sync>;

/// One registered listener.
pub(crate) struct ListenerEntry {
    id: ListenerId,
    active: AtomicBool,
    callback: Callback,
}

impl fmt::Debug for ListenerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("active", &self.active.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// Ordered listener registry owned by a channel connection.
///
/// Ids are monotonic, so map order is registration order.
#[derive(Debug, Default)]
pub(crate) struct ListenerSet {
    next_id: u64,
    entries: BTreeMap<ListenerId, Arc<ListenerEntry>>,
}

impl ListenerSet {
    pub(crate) fn insert<F>(&mut self, callback: F) -> ListenerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.entries.insert(
            id,
            Arc::new(ListenerEntry {
                id,
                active: AtomicBool::new(true),
                callback: Box::new(callback),
            }),
        );
        id
    }

    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                entry.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        for entry in self.entries.values() {
            entry.active.store(false, Ordering::Release);
        }
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<ListenerEntry>> {
        self.entries.values().map(Arc::clone).collect()
    }
}

/// Deliver `envelope` to every still-active entry of `snapshot`, in order.
///
/// A panicking listener is reported through `on_panic` and does not stop
/// delivery to the rest.
pub(crate) fn dispatch<P>(snapshot: &[Arc<ListenerEntry>], envelope: &Envelope, mut on_panic: P)
where
    P: FnMut(ListenerId, String),
{
    for entry in snapshot {
        if !entry.active.load(Ordering::Acquire) {
            continue;
        }
        let result = catch_unwind(AssertUnwindSafe(|| (entry.callback)(envelope)));
        if let Err(payload) = result {
            on_panic(entry.id, panic_message(payload.as_ref()));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn envelope(n: i64) -> Envelope {
        Envelope::new("tick").with_field("n", n)
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_factory = Arc::clone(&log);
        let factory = move |name: &str| -> Callback {
            let log = Arc::clone(&log_for_factory);
            let name = name.to_string();
            Box::new(move |env: &Envelope| {
                log.lock().unwrap().push(format!("{name}:{}", env.fields["n"]));
            })
        };
        (log, factory)
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let (log, make) = recorder();
        let mut set = ListenerSet::default();
        set.insert(make("a"));
        set.insert(make("b"));
        set.insert(make("c"));

        dispatch(&set.snapshot(), &envelope(1), |_, _| {});

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1", "c:1"]);
    }

    #[test]
    fn test_removed_listener_skipped_even_in_taken_snapshot() {
        let (log, make) = recorder();
        let mut set = ListenerSet::default();
        set.insert(make("a"));
        let b = set.insert(make("b"));

        let snapshot = set.snapshot();
        assert!(set.remove(b));
        dispatch(&snapshot, &envelope(1), |_, _| {});

        assert_eq!(*log.lock().unwrap(), vec!["a:1"]);
    }

    #[test]
    fn test_listener_added_after_snapshot_not_called_for_that_envelope() {
        let (log, make) = recorder();
        let mut set = ListenerSet::default();
        set.insert(make("a"));

        let snapshot = set.snapshot();
        set.insert(make("late"));
        dispatch(&snapshot, &envelope(1), |_, _| {});
        dispatch(&set.snapshot(), &envelope(2), |_, _| {});

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "a:2", "late:2"]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let (log, make) = recorder();
        let mut set = ListenerSet::default();
        set.insert(make("a"));
        let bad = set.insert(|_: &Envelope| panic!("boom"));
        set.insert(make("c"));

        let mut panics = Vec::new();
        dispatch(&set.snapshot(), &envelope(1), |id, msg| panics.push((id, msg)));

        assert_eq!(*log.lock().unwrap(), vec!["a:1", "c:1"]);
        assert_eq!(panics, vec![(bad, "boom".to_string())]);
    }

    #[test]
    fn test_remove_unknown_returns_false() {
        let mut set = ListenerSet::default();
        let id = set.insert(|_: &Envelope| {});
        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_clear_deactivates_snapshot() {
        let (log, make) = recorder();
        let mut set = ListenerSet::default();
        set.insert(make("a"));
        let snapshot = set.snapshot();
        set.clear();
        dispatch(&snapshot, &envelope(1), |_, _| {});
        assert!(log.lock().unwrap().is_empty());
    }
}
