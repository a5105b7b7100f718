//! Shared connection-state cell

use tokio::sync::watch;

use crate::ConnectionState;

/// Connection state published over a watch channel so waiters are woken on change
/// instead of polling.
#[derive(Debug)]
pub struct StateWatch {
    tx: watch::Sender<ConnectionState>,
}

impl StateWatch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Returns the previous state
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        self.tx.send_replace(state)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state equals `target`
    pub async fn wait_for(&self, target: ConnectionState) {
        let mut rx = self.tx.subscribe();
        // Sender lives as long as self, so this cannot fail
        let _ = rx.wait_for(|state| *state == target).await;
    }
}

impl Default for StateWatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_for_wakes_on_change() {
        let state = Arc::new(StateWatch::new());
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_for(ConnectionState::Connected).await })
        };

        state.set(ConnectionState::Connecting);
        state.set(ConnectionState::Connected);

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[test]
    fn test_set_returns_previous() {
        let state = StateWatch::new();
        assert_eq!(state.set(ConnectionState::Connecting), ConnectionState::Disconnected);
        assert_eq!(state.get(), ConnectionState::Connecting);
    }
}
