//! The external agent-session boundary.
//!
//! The engine owns orchestration; the actual agent process lives behind
//! these traits. Tests script them; the CLI ships a process-spawning
//! implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::events::SessionEvent;
use super::permissions::PermissionProfile;
use crate::error::Result;

/// Everything needed to start one agent session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub role_id: String,
    pub workspace: PathBuf,
    pub env: HashMap<String, String>,
    pub permissions: PermissionProfile,
    /// Session log destination; escalation sessions get an isolated log.
    pub log_path: Option<PathBuf>,
}

/// Tracks when the session last produced output. Shared with the health
/// monitor, which reads it from its own timer task.
#[derive(Debug)]
pub struct ActivityProbe {
    last: Mutex<Instant>,
}

impl ActivityProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last: Mutex::new(Instant::now()),
        })
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SessionHandle>>;
}

#[async_trait]
pub trait SessionHandle: Send {
    /// Deliver the compiled prompt to the session.
    async fn send(&mut self, prompt: &str) -> Result<()>;

    /// Next event from the session, or `None` when the process exits
    /// without emitting one. The first event is terminal for orchestration.
    async fn next_event(&mut self) -> Result<Option<SessionEvent>>;

    fn is_alive(&self) -> bool;

    /// Request the session stop. Idempotent.
    async fn stop(&mut self) -> Result<()>;

    /// Output-activity probe observed by the health monitor.
    fn activity(&self) -> Arc<ActivityProbe>;
}
