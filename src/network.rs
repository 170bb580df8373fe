//! Connectivity tracking.
//!
//! `NetworkMonitor` holds the current reachability flag in a tokio watch
//! channel. The probe loop samples a [`ReachabilityProbe`] (the admin
//! dashboard health endpoint in production) and flips the flag; the sync
//! engine subscribes to the transitions.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Something that can tell whether the server is currently reachable.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

#[derive(Clone)]
pub struct NetworkMonitor {
    online: Arc<watch::Sender<bool>>,
}

impl NetworkMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        Self {
            online: Arc::new(tx),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Record the latest reachability sample. Returns `true` on a transition.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Network restored");
            } else {
                info!("Network offline; deferring remote sync and keeping queue pending");
            }
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

/// Sample `probe` every `interval` until `cancel` fires.
pub fn spawn_probe(
    monitor: NetworkMonitor,
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Connectivity probe started");
        loop {
            let reachable = probe.is_reachable().await;
            monitor.set_online(reachable);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Connectivity probe stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for FlagProbe {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_set_online_reports_transitions_only() {
        let monitor = NetworkMonitor::new(false);
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        assert!(monitor.is_online());
        assert!(!monitor.set_online(true));
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();
        monitor.set_online(true);
        rx.changed().await.expect("sender alive");
        assert!(*rx.borrow_and_update());
    }

    #[tokio::test]
    async fn test_probe_loop_updates_monitor() {
        let monitor = NetworkMonitor::new(false);
        let probe = Arc::new(FlagProbe(AtomicBool::new(true)));
        let cancel = CancellationToken::new();
        let mut rx = monitor.subscribe();

        let handle = spawn_probe(
            monitor.clone(),
            probe,
            Duration::from_millis(10),
            cancel.clone(),
        );
        rx.changed().await.expect("probe flips the flag");
        assert!(monitor.is_online());

        cancel.cancel();
        handle.await.expect("probe task joins");
    }
}
