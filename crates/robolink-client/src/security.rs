//! Per-device session nonces

use dashmap::DashMap;
use robolink_core::ResponseMessage;
use std::sync::Arc;
use tracing::debug;

use crate::listener::MessageListener;

/// Latest handshake nonce per device
#[derive(Debug, Default)]
pub struct NonceStore {
    nonces: DashMap<String, u64>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the nonce for `duid`. Frames already encoded keep the old one.
    pub fn update(&self, duid: &str, nonce: u64) -> Option<u64> {
        self.nonces.insert(duid.to_string(), nonce)
    }

    pub fn get(&self, duid: &str) -> Option<u64> {
        self.nonces.get(duid).map(|nonce| *nonce)
    }

    pub fn clear(&self, duid: &str) {
        self.nonces.remove(duid);
    }
}

/// Captures the nonce from every handshake answer
pub(crate) struct NonceListener {
    store: Arc<NonceStore>,
}

impl NonceListener {
    pub(crate) fn new(store: Arc<NonceStore>) -> Self {
        Self { store }
    }
}

impl MessageListener for NonceListener {
    fn on_message(&self, message: &ResponseMessage) {
        let Some(nonce) = message.handshake_nonce() else {
            return;
        };

        let previous = self.store.update(&message.duid, nonce);
        debug!(
            duid = %message.duid,
            replaced = previous.is_some(),
            "Session nonce updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use robolink_core::Protocol;
    use serde_json::json;

    #[test]
    fn test_handshake_replaces_nonce() {
        let store = Arc::new(NonceStore::new());
        let listener = NonceListener::new(store.clone());

        let hello = |nonce: u64| {
            ResponseMessage::new("d1", 1)
                .with(Protocol::HelloResponse, json!({"result": {"nonce": nonce}}))
        };

        listener.on_message(&hello(11));
        assert_eq!(store.get("d1"), Some(11));

        listener.on_message(&hello(12));
        assert_eq!(store.get("d1"), Some(12));

        // Non-handshake frames leave it alone
        listener.on_message(&ResponseMessage::new("d1", 102).with(Protocol::Battery, json!(3)));
        assert_eq!(store.get("d1"), Some(12));
        assert_eq!(store.get("d2"), None);
    }
}
