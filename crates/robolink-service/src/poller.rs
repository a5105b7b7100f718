//! Periodic status polling
//!
//! Each device gets one task per reachable transport. The local task polls every
//! `refresh` period and the cloud task twice as often. Results flow through the
//! processor's callbacks, so the poller itself only logs failures.

use async_trait::async_trait;
use robolink_client::{DeviceStatus, MessageProcessor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Which status query a poll task issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollKind {
    Local,
    Cloud,
}

impl PollKind {
    /// Poll period for this kind given the configured refresh interval
    pub fn period(self, refresh: Duration) -> Duration {
        match self {
            PollKind::Local => refresh,
            PollKind::Cloud => (refresh / 2).max(Duration::from_millis(1)),
        }
    }
}

/// Anything that can be asked for a device status
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    fn duid(&self) -> &str;

    async fn poll(&self, kind: PollKind) -> robolink_client::Result<Option<DeviceStatus>>;
}

#[async_trait]
impl StatusSource for MessageProcessor {
    fn duid(&self) -> &str {
        MessageProcessor::duid(self)
    }

    async fn poll(&self, kind: PollKind) -> robolink_client::Result<Option<DeviceStatus>> {
        match kind {
            PollKind::Local => self.get_device_status().await,
            PollKind::Cloud => self.get_device_status_over_mqtt().await,
        }
    }
}

/// Running poll tasks for one device
pub struct StatusPoller {
    duid: String,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StatusPoller {
    /// Spawn one task per entry in `kinds`. The first poll happens one period in.
    pub fn start(source: Arc<dyn StatusSource>, refresh: Duration, kinds: &[PollKind]) -> Self {
        let (stop, _) = watch::channel(false);
        let tasks = kinds
            .iter()
            .map(|kind| spawn_poll_task(source.clone(), *kind, kind.period(refresh), stop.subscribe()))
            .collect();

        Self {
            duid: source.duid().to_string(),
            stop,
            tasks,
        }
    }

    pub fn duid(&self) -> &str {
        &self.duid
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop every task and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(duid = %self.duid, "Status poller stopped");
    }
}

fn spawn_poll_task(
    source: Arc<dyn StatusSource>,
    kind: PollKind,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match source.poll(kind).await {
                Ok(Some(_)) => {}
                Ok(None) => debug!(duid = %source.duid(), ?kind, "Status poll got no answer"),
                Err(e) => warn!(duid = %source.duid(), ?kind, "Status poll failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Counting {
        polls: Mutex<Vec<PollKind>>,
    }

    #[async_trait]
    impl StatusSource for Counting {
        fn duid(&self) -> &str {
            "counting"
        }

        async fn poll(&self, kind: PollKind) -> robolink_client::Result<Option<DeviceStatus>> {
            self.polls.lock().push(kind);
            Ok(None)
        }
    }

    fn counts(source: &Counting) -> (usize, usize) {
        let polls = source.polls.lock();
        let local = polls.iter().filter(|k| **k == PollKind::Local).count();
        (local, polls.len() - local)
    }

    #[test]
    fn test_cloud_polls_twice_as_often() {
        let refresh = Duration::from_secs(60);
        assert_eq!(PollKind::Local.period(refresh), refresh);
        assert_eq!(PollKind::Cloud.period(refresh), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence() {
        let source = Arc::new(Counting {
            polls: Mutex::new(Vec::new()),
        });
        let poller = StatusPoller::start(
            source.clone(),
            Duration::from_secs(60),
            &[PollKind::Local, PollKind::Cloud],
        );
        assert_eq!(poller.task_count(), 2);

        // Nothing fires immediately
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(counts(&source), (0, 0));

        tokio::time::sleep(Duration::from_secs(124)).await;
        assert_eq!(counts(&source), (2, 4));

        poller.shutdown().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(counts(&source), (2, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_only() {
        let source = Arc::new(Counting {
            polls: Mutex::new(Vec::new()),
        });
        let poller = StatusPoller::start(source.clone(), Duration::from_secs(10), &[PollKind::Local]);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(counts(&source), (3, 0));
        poller.shutdown().await;
    }
}
