//! Change notifications.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Added {
        key: Bytes,
        value: Bytes,
    },
    Updated {
        key: Bytes,
        old_value: Option<Bytes>,
        new_value: Bytes,
    },
    Removed {
        key: Bytes,
        old_value: Option<Bytes>,
    },
    /// Every record was removed, or the contents were reset wholesale.
    Cleared,
}

/// Receives committed changes. Errors and panics are logged and dropped.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, event: &ChangeEvent) -> anyhow::Result<()>;
}

impl<F> ChangeObserver for F
where
    F: Fn(&ChangeEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_change(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Registered observers plus the lock that keeps batches from interleaving.
#[derive(Default)]
pub struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn ChangeObserver>>>,
    delivery: Mutex<()>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn ChangeObserver>) {
        self.observers.write().push(observer);
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    /// Deliver `events` in order to every observer, under one lock.
    pub fn publish<I>(&self, events: I)
    where
        I: IntoIterator<Item = ChangeEvent>,
    {
        let observers = self.observers.read().clone();
        if observers.is_empty() {
            return;
        }
        let _delivery = self.delivery.lock();
        for event in events {
            for observer in &observers {
                match catch_unwind(AssertUnwindSafe(|| observer.on_change(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(error = %e, ?event, "change observer failed"),
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_default();
                        tracing::warn!(panic = %message, ?event, "change observer panicked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn failing_observer_does_not_stop_delivery() {
        let set = ObserverSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        set.subscribe(Arc::new(|_: &ChangeEvent| -> anyhow::Result<()> {
            anyhow::bail!("boom")
        }));
        let sink = Arc::clone(&seen);
        set.subscribe(Arc::new(move |e: &ChangeEvent| -> anyhow::Result<()> {
            sink.lock().push(e.clone());
            Ok(())
        }));

        set.publish(vec![
            ChangeEvent::Added {
                key: Bytes::from_static(b"a"),
                value: Bytes::from_static(b"1"),
            },
            ChangeEvent::Cleared,
        ]);
        assert_eq!(seen.lock().len(), 2);
        assert_eq!(seen.lock()[1], ChangeEvent::Cleared);
    }

    #[test]
    fn panicking_observer_is_contained() {
        let set = ObserverSet::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        set.subscribe(Arc::new(|_: &ChangeEvent| -> anyhow::Result<()> {
            panic!("observer bug")
        }));
        let sink = Arc::clone(&seen);
        set.subscribe(Arc::new(move |e: &ChangeEvent| -> anyhow::Result<()> {
            sink.lock().push(e.clone());
            Ok(())
        }));

        set.publish(vec![ChangeEvent::Cleared, ChangeEvent::Cleared]);
        assert_eq!(*seen.lock(), vec![ChangeEvent::Cleared, ChangeEvent::Cleared]);
        set.publish(vec![ChangeEvent::Cleared]);
        assert_eq!(seen.lock().len(), 3);
    }
}
