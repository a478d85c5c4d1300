//! Deferred start values.
//!
//! Host automations often template session parameters (agent id, credential,
//! initial message, timeout) from values that are only known at trigger
//! time. Instead of compile-time templating, voxwire models these as
//! [`Deferred`] values: either a plain value or a closure, resolved exactly
//! once when `start` runs.

use std::fmt;
use std::sync::Arc;

/// A value known up front or produced by a closure at `start` time.
#[derive(Clone)]
pub enum Deferred<T> {
    /// A concrete value.
    Value(T),
    /// A producer evaluated once at resolution time.
    Lazy(Arc<dyn Fn() -> T + Send + Sync>),
}

impl<T: Clone> Deferred<T> {
    /// Wrap a closure to be evaluated at `start`.
    pub fn lazy<F>(producer: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::Lazy(Arc::new(producer))
    }

    /// Produce the value. Closures are invoked here and nowhere else.
    pub fn resolve(&self) -> T {
        match self {
            Self::Value(value) => value.clone(),
            Self::Lazy(producer) => producer(),
        }
    }
}

impl<T> From<T> for Deferred<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

impl From<&str> for Deferred<String> {
    fn from(value: &str) -> Self {
        Self::Value(value.to_string())
    }
}

impl<T: fmt::Debug> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Lazy(_) => f.write_str("Lazy(<closure>)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn value_resolves_to_itself() {
        let deferred: Deferred<String> = "agent-1".into();
        assert_eq!(deferred.resolve(), "agent-1");
    }

    #[test]
    fn lazy_resolves_through_closure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let deferred = Deferred::lazy(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            "computed".to_string()
        });

        assert_eq!(deferred.resolve(), "computed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debug_never_prints_closure_internals() {
        let deferred = Deferred::lazy(|| "secret".to_string());
        assert_eq!(format!("{deferred:?}"), "Lazy(<closure>)");
    }
}
