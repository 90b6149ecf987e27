//! Cancellation signals backed by `watch<bool>`.

use std::sync::{Mutex, MutexGuard};

use tokio::sync::watch;

/// Owner side: flip once to cancel every task holding a matching [`Signal`].
pub(crate) struct Trigger(watch::Sender<bool>);

impl Trigger {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Trigger(tx)
    }

    pub(crate) fn signal(&self) -> Signal {
        Signal(self.0.subscribe())
    }

    pub(crate) fn fire(&self) {
        self.0.send_replace(true);
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.0.borrow()
    }
}

/// Task side of a [`Trigger`].
#[derive(Clone)]
pub(crate) struct Signal(watch::Receiver<bool>);

impl Signal {
    /// Resolves once the trigger fires or is dropped.
    pub(crate) async fn fired(&mut self) {
        while !*self.0.borrow_and_update() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Lock a std mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fired_resolves_after_fire() {
        let trigger = Trigger::new();
        let mut signal = trigger.signal();
        let waiter = tokio::spawn(async move { signal.fired().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn late_subscriber_sees_fired_state() {
        let trigger = Trigger::new();
        trigger.fire();
        assert!(trigger.is_fired());
        let mut signal = trigger.signal();
        tokio::time::timeout(Duration::from_secs(1), signal.fired())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_trigger_counts_as_fired() {
        let trigger = Trigger::new();
        let mut signal = trigger.signal();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), signal.fired())
            .await
            .unwrap();
    }
}
