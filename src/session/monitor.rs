//! Background session health monitor.
//!
//! Runs as an independent periodic timer concurrently with the blocking
//! wait for the session's terminal event, and may unilaterally request a
//! stop for inactivity or budget exhaustion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use super::boundary::ActivityProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Inactive { idle: Duration },
    RoleBudgetExceeded,
    GlobalBudgetExceeded,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorLimits {
    pub inactivity_timeout: Duration,
    /// Wall-time deadline for the role's budget, if any remains.
    pub role_deadline: Option<Instant>,
    /// Wall-time deadline for the job's global lifetime.
    pub global_deadline: Option<Instant>,
}

pub struct HealthMonitor {
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start the timer task. The returned receiver yields at most one stop
    /// request; the task ends after sending it.
    pub fn spawn(
        probe: Arc<ActivityProbe>,
        limits: MonitorLimits,
        interval: Duration,
    ) -> (Self, oneshot::Receiver<StopReason>) {
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let now = Instant::now();

                let reason = if limits.global_deadline.is_some_and(|d| now >= d) {
                    Some(StopReason::GlobalBudgetExceeded)
                } else if limits.role_deadline.is_some_and(|d| now >= d) {
                    Some(StopReason::RoleBudgetExceeded)
                } else {
                    let idle = probe.idle();
                    if idle >= limits.inactivity_timeout {
                        Some(StopReason::Inactive { idle })
                    } else {
                        None
                    }
                };

                if let Some(reason) = reason {
                    warn!(?reason, "Health monitor requesting session stop");
                    let _ = tx.send(reason);
                    return;
                }
            }
        });

        (Self { handle }, rx)
    }

    pub fn abort(self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn detects_inactivity() {
        let probe = ActivityProbe::new();
        let limits = MonitorLimits {
            inactivity_timeout: Duration::from_secs(60),
            role_deadline: None,
            global_deadline: None,
        };
        let (_monitor, rx) = HealthMonitor::spawn(Arc::clone(&probe), limits, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(61)).await;
        let reason = rx.await.unwrap();
        assert!(matches!(reason, StopReason::Inactive { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_defers_inactivity_stop() {
        let probe = ActivityProbe::new();
        let limits = MonitorLimits {
            inactivity_timeout: Duration::from_secs(60),
            role_deadline: None,
            global_deadline: Some(Instant::now() + Duration::from_secs(120)),
        };
        let (_monitor, rx) = HealthMonitor::spawn(Arc::clone(&probe), limits, Duration::from_secs(5));

        // Keep touching the probe for 90s: inactivity never fires, but the
        // global deadline eventually does.
        for _ in 0..18 {
            tokio::time::advance(Duration::from_secs(5)).await;
            probe.touch();
        }
        tokio::time::advance(Duration::from_secs(40)).await;

        let reason = rx.await.unwrap();
        assert_eq!(reason, StopReason::GlobalBudgetExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn role_deadline_beats_inactivity() {
        let probe = ActivityProbe::new();
        let limits = MonitorLimits {
            inactivity_timeout: Duration::from_secs(600),
            role_deadline: Some(Instant::now() + Duration::from_secs(10)),
            global_deadline: None,
        };
        let (_monitor, rx) = HealthMonitor::spawn(probe, limits, Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(rx.await.unwrap(), StopReason::RoleBudgetExceeded);
    }
}
