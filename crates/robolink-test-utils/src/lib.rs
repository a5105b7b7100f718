//! Common test helpers for robolink tests
//!
//! This crate provides:
//! - Condition-based waiting (no hardcoded sleeps)
//! - A scripted fake device speaking the local wire protocol ([`FakeDevice`])
//! - Test identities

mod fake_device;

pub use fake_device::{FakeDevice, ReceivedRequest, Reply};

use robolink_core::{DeviceIdentity, ProtocolVersion};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Identities
// ============================================================================

/// Identity with a fixed 16-byte local key
pub fn test_identity(duid: &str) -> DeviceIdentity {
    DeviceIdentity::new(duid, b"qWKYcdQWrbm9hPqe", ProtocolVersion::V1)
}

// ============================================================================
// Port Allocation
// ============================================================================

/// Find a TCP port nothing is listening on
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout - condition-based, not time-based
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}
