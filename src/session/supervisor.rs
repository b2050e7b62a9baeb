//! Session supervision: one external agent session at a time, driven to a
//! single terminal outcome.

use std::sync::Arc;

use tracing::{debug, info};

use super::boundary::{SessionBackend, SpawnRequest};
use super::events::{ExceededBudget, SessionOutcome};
use super::monitor::{HealthMonitor, MonitorLimits, StopReason};
use crate::config::SessionConfig;
use crate::error::Result;
use crate::job::CancelToken;

pub struct SessionSupervisor {
    backend: Arc<dyn SessionBackend>,
    config: SessionConfig,
}

impl SessionSupervisor {
    pub fn new(backend: Arc<dyn SessionBackend>, config: SessionConfig) -> Self {
        Self { backend, config }
    }

    /// Spawn one session, send the compiled prompt, and block until exactly
    /// one terminal outcome: an event, a silent exit, a health-monitor stop,
    /// or cancellation. Expected termination paths never surface as errors.
    pub async fn run(
        &self,
        request: SpawnRequest,
        prompt: &str,
        limits: MonitorLimits,
        cancel: &CancelToken,
    ) -> Result<SessionOutcome> {
        let role_id = request.role_id.clone();
        info!(role_id, workspace = %request.workspace.display(), "Starting agent session");

        let mut handle = self.backend.spawn(request).await?;
        handle.send(prompt).await?;

        let probe = handle.activity();
        let interval = std::time::Duration::from_secs(self.config.monitor_interval_secs);
        let (monitor, mut stop_rx) = HealthMonitor::spawn(probe, limits, interval);

        // The stop receiver completes at most once; after it yields it must
        // not be polled again.
        let mut monitor_alive = true;
        let outcome = loop {
            tokio::select! {
                event = handle.next_event() => {
                    match event? {
                        Some(event) => {
                            debug!(role_id, kind = event.kind(), "Session event received");
                            break SessionOutcome::Event(event);
                        }
                        None => break SessionOutcome::ExitedWithoutEvent,
                    }
                }
                reason = &mut stop_rx, if monitor_alive => {
                    match stop_outcome(reason) {
                        Some(outcome) => break outcome,
                        // Monitor gone without a request; wait on the
                        // session alone from here.
                        None => monitor_alive = false,
                    }
                }
                _ = cancel.cancelled() => {
                    break SessionOutcome::Cancelled;
                }
            }
        };

        monitor.abort();
        handle.stop().await?;

        info!(role_id, outcome = outcome.describe(), "Session finished");
        Ok(outcome)
    }
}

/// Map a monitor stop request to a session outcome. A closed channel is
/// not a stop request.
fn stop_outcome(
    reason: std::result::Result<StopReason, tokio::sync::oneshot::error::RecvError>,
) -> Option<SessionOutcome> {
    match reason {
        Ok(StopReason::Inactive { idle }) => Some(SessionOutcome::Inactive {
            idle_secs: idle.as_secs(),
        }),
        Ok(StopReason::RoleBudgetExceeded) => Some(SessionOutcome::BudgetExceeded {
            budget: ExceededBudget::Role,
        }),
        Ok(StopReason::GlobalBudgetExceeded) => Some(SessionOutcome::BudgetExceeded {
            budget: ExceededBudget::Global,
        }),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::boundary::{ActivityProbe, SessionHandle};
    use crate::session::events::SessionEvent;
    use crate::session::permissions::{PermissionProfile, SessionMode};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedHandle {
        events: Mutex<Vec<SessionEvent>>,
        probe: Arc<ActivityProbe>,
        hang: bool,
    }

    #[async_trait]
    impl SessionHandle for ScriptedHandle {
        async fn send(&mut self, _prompt: &str) -> Result<()> {
            Ok(())
        }

        async fn next_event(&mut self) -> Result<Option<SessionEvent>> {
            if self.hang {
                // Simulates a session that never produces output.
                std::future::pending::<()>().await;
            }
            Ok(self.events.lock().pop())
        }

        fn is_alive(&self) -> bool {
            true
        }

        async fn stop(&mut self) -> Result<()> {
            Ok(())
        }

        fn activity(&self) -> Arc<ActivityProbe> {
            Arc::clone(&self.probe)
        }
    }

    struct ScriptedBackend {
        events: Vec<SessionEvent>,
        hang: bool,
    }

    #[async_trait]
    impl SessionBackend for ScriptedBackend {
        async fn spawn(&self, _request: SpawnRequest) -> Result<Box<dyn SessionHandle>> {
            Ok(Box::new(ScriptedHandle {
                events: Mutex::new(self.events.clone()),
                probe: ActivityProbe::new(),
                hang: self.hang,
            }))
        }
    }

    fn spawn_request() -> SpawnRequest {
        SpawnRequest {
            role_id: "worker".into(),
            workspace: "/tmp".into(),
            env: Default::default(),
            permissions: PermissionProfile {
                mode: SessionMode::Implement,
                allow: vec![],
                deny: vec![],
                allowed_commands: vec![],
            },
            log_path: None,
        }
    }

    fn limits(inactivity_secs: u64) -> MonitorLimits {
        MonitorLimits {
            inactivity_timeout: std::time::Duration::from_secs(inactivity_secs),
            role_deadline: None,
            global_deadline: None,
        }
    }

    #[tokio::test]
    async fn first_event_is_terminal() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![SessionEvent::PhaseComplete {
                summary: "done".into(),
            }],
            hang: false,
        });
        let supervisor = SessionSupervisor::new(backend, SessionConfig::default());

        let outcome = supervisor
            .run(spawn_request(), "go", limits(600), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            SessionOutcome::Event(SessionEvent::PhaseComplete {
                summary: "done".into()
            })
        );
    }

    #[tokio::test]
    async fn exit_without_event_is_an_outcome_not_an_error() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![],
            hang: false,
        });
        let supervisor = SessionSupervisor::new(backend, SessionConfig::default());

        let outcome = supervisor
            .run(spawn_request(), "go", limits(600), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::ExitedWithoutEvent);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_session_stopped_for_inactivity() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![],
            hang: true,
        });
        let config = SessionConfig {
            monitor_interval_secs: 1,
            ..Default::default()
        };
        let supervisor = SessionSupervisor::new(backend, config);

        let outcome = supervisor
            .run(spawn_request(), "go", limits(30), &CancelToken::new())
            .await
            .unwrap();

        assert!(matches!(outcome, SessionOutcome::Inactive { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_the_wait() {
        let backend = Arc::new(ScriptedBackend {
            events: vec![],
            hang: true,
        });
        let supervisor = SessionSupervisor::new(backend, SessionConfig::default());

        let cancel = CancelToken::new();
        cancel.request_stop();

        let outcome = supervisor
            .run(spawn_request(), "go", limits(600), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn closed_monitor_channel_is_not_a_stop() {
        let (tx, rx) = tokio::sync::oneshot::channel::<StopReason>();
        drop(tx);
        let err = rx.await.unwrap_err();

        assert_eq!(stop_outcome(Err(err)), None);
        assert_eq!(
            stop_outcome(Ok(StopReason::RoleBudgetExceeded)),
            Some(SessionOutcome::BudgetExceeded {
                budget: ExceededBudget::Role
            })
        );
    }
}
