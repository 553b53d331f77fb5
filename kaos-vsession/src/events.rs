//! Named event listeners.
//!
//! Sessions and namespaces each own a `Listeners` table. Handlers are cloned out
//! of the table before they run, so a handler may register or remove listeners
//! (or emit) without deadlocking.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Event names a session raises itself; applications may not emit them.
pub const SESSION_RESERVED: &[&str] = &[
    "error",
    "connect",
    "disconnect",
    "newListener",
    "removeListener",
];

/// Event names a namespace raises itself.
pub const NAMESPACE_RESERVED: &[&str] = &["connect", "connection", "newListener"];

pub fn is_reserved(reserved: &[&str], event: &str) -> bool {
    reserved.contains(&event)
}

pub type Listener<A> = Arc<dyn Fn(&A) + Send + Sync>;

pub struct Listeners<A: ?Sized> {
    handlers: RwLock<HashMap<String, Vec<Listener<A>>>>,
}

impl<A: ?Sized> Listeners<A> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn on<F>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Drop every handler for `event`. Returns how many were removed.
    pub fn off(&self, event: &str) -> usize {
        self.handlers
            .write()
            .remove(event)
            .map_or(0, |handlers| handlers.len())
    }

    /// Call every handler for `event` in registration order.
    pub fn fire(&self, event: &str, args: &A) -> usize {
        let snapshot: Vec<Listener<A>> = match self.handlers.read().get(event) {
            Some(handlers) => handlers.clone(),
            None => return 0,
        };
        for handler in &snapshot {
            handler(args);
        }
        snapshot.len()
    }

    pub fn count(&self, event: &str) -> usize {
        self.handlers.read().get(event).map_or(0, Vec::len)
    }
}

impl<A: ?Sized> Default for Listeners<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fire_in_order() {
        let listeners: Listeners<[Value]> = Listeners::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            listeners.on("chat", move |args: &[Value]| {
                seen.lock().push(format!("{tag}:{}", args[0]));
            });
        }
        assert_eq!(listeners.fire("chat", &[json!(1)]), 2);
        assert_eq!(listeners.fire("other", &[]), 0);
        assert_eq!(*seen.lock(), vec!["first:1", "second:1"]);
    }

    #[test]
    fn test_handler_can_register_more() {
        let listeners: Arc<Listeners<[Value]>> = Arc::new(Listeners::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let inner = listeners.clone();
        let counter = calls.clone();
        listeners.on("a", move |_: &[Value]| {
            let counter = counter.clone();
            inner.on("b", move |_: &[Value]| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });
        listeners.fire("a", &[]);
        listeners.fire("b", &[]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(listeners.off("b"), 1);
        assert_eq!(listeners.count("b"), 0);
    }

    #[test]
    fn test_reserved_names() {
        assert!(is_reserved(SESSION_RESERVED, "disconnect"));
        assert!(!is_reserved(SESSION_RESERVED, "connection"));
        assert!(is_reserved(NAMESPACE_RESERVED, "connection"));
        assert!(!is_reserved(NAMESPACE_RESERVED, "chat"));
    }
}
