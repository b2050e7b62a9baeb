//! Process-spawning session backend.
//!
//! Runs the configured agent command bound to the job workspace and reads
//! its stdout as a line stream; lines that parse as session events feed the
//! supervisor, everything else only refreshes the activity probe.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::boundary::{ActivityProbe, SessionBackend, SessionHandle, SpawnRequest};
use super::events::SessionEvent;
use crate::config::SessionConfig;
use crate::error::{CovenantError, Result};

pub struct ProcessSessionBackend {
    config: SessionConfig,
}

impl ProcessSessionBackend {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionBackend for ProcessSessionBackend {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SessionHandle>> {
        let permissions = serde_json::to_string(&request.permissions)?;

        let mut child = Command::new(&self.config.agent_command)
            .current_dir(&request.workspace)
            .envs(&request.env)
            .env("COVENANT_ROLE", &request.role_id)
            .env("COVENANT_PERMISSIONS", permissions)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CovenantError::SessionBackend(format!(
                    "failed to spawn '{}': {e}",
                    self.config.agent_command
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CovenantError::SessionBackend("no stdout pipe".into()))?;

        let probe = ActivityProbe::new();
        let alive = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let reader_probe = Arc::clone(&probe);
        let reader_alive = Arc::clone(&alive);
        let log_path = request.log_path.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut log = match &log_path {
                Some(path) => tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .ok(),
                None => None,
            };

            while let Ok(Some(line)) = lines.next_line().await {
                reader_probe.touch();
                if let Some(log) = log.as_mut() {
                    let _ = log.write_all(line.as_bytes()).await;
                    let _ = log.write_all(b"\n").await;
                }
                match serde_json::from_str::<SessionEvent>(&line) {
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        debug!(line = %line, "Non-event session output");
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
        });

        Ok(Box::new(ProcessHandle {
            child,
            stdin,
            events: event_rx,
            probe,
            alive,
            stop_grace: Duration::from_secs(self.config.stop_grace_secs),
            stopped: false,
        }))
    }
}

struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    probe: Arc<ActivityProbe>,
    alive: Arc<AtomicBool>,
    stop_grace: Duration,
    stopped: bool,
}

#[async_trait]
impl SessionHandle for ProcessHandle {
    async fn send(&mut self, prompt: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CovenantError::Session("session stdin already closed".into()))?;
        stdin.write_all(prompt.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<SessionEvent>> {
        Ok(self.events.recv().await)
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        // Close stdin first so a well-behaved agent winds down on its own;
        // kill after the grace period.
        self.stdin.take();
        match tokio::time::timeout(self.stop_grace, self.child.wait()).await {
            Ok(status) => {
                debug!(status = ?status.ok(), "Session process exited");
            }
            Err(_) => {
                warn!("Session did not exit within grace period, killing");
                let _ = self.child.kill().await;
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn activity(&self) -> Arc<ActivityProbe> {
        Arc::clone(&self.probe)
    }
}
