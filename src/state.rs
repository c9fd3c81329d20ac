//! Latest-snapshot state cells.
//!
//! Services publish immutable snapshots through a [`StateCell`]; UI shells
//! either read the current value or subscribe and get woken on every change.

use tokio::sync::watch;

#[derive(Debug)]
pub struct StateCell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone> StateCell<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replaces the snapshot. Stored even when nobody is subscribed.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        self.tx.send_modify(f);
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone + Default> Default for StateCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_latest() {
        let cell = StateCell::new(1u32);
        cell.set(2);
        assert_eq!(cell.get(), 2);
        cell.update(|v| *v += 1);
        assert_eq!(cell.get(), 3);
    }

    #[tokio::test]
    async fn test_subscriber_notified_on_change() {
        let cell = StateCell::new(String::from("a"));
        let mut rx = cell.subscribe();

        cell.set("b".into());
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), "b");
    }
}
