//! Scripted collaborators for driving the job manager end to end.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use covenant::contract::{Contract, GateSpec, PhaseSpec, RoleSpec};
use covenant::error::{CovenantError, Result};
use covenant::gate::{ApprovalBoundary, ApprovalResponse, GateDecision, GatePromptModel};
use covenant::git::{ChangeKind, ChangedFile, DiffSummary, WorkspaceVcs};
use covenant::ledger::Ledger;
use covenant::session::{
    ActivityProbe, SessionBackend, SessionEvent, SessionHandle, SpawnRequest,
};

pub type Effect = Box<dyn Fn() + Send + Sync>;

/// One scripted agent session: optional side effect (simulating the agent's
/// work on disk) plus the events it emits. No events means the process
/// exits without a terminal event.
pub struct ScriptedSession {
    pub events: Vec<SessionEvent>,
    pub effect: Option<Effect>,
}

impl ScriptedSession {
    pub fn completes(summary: &str) -> Self {
        Self {
            events: vec![SessionEvent::PhaseComplete {
                summary: summary.to_string(),
            }],
            effect: None,
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }
}

pub struct ScriptedBackend {
    sessions: Mutex<VecDeque<ScriptedSession>>,
    pub spawned: AtomicUsize,
    pub requests: Mutex<Vec<SpawnRequest>>,
}

impl ScriptedBackend {
    pub fn new(sessions: Vec<ScriptedSession>) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(sessions.into()),
            spawned: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionBackend for ScriptedBackend {
    async fn spawn(&self, request: SpawnRequest) -> Result<Box<dyn SessionHandle>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        let session = self
            .sessions
            .lock()
            .unwrap()
            .pop_front()
            .expect("more sessions spawned than scripted");
        Ok(Box::new(ScriptedHandle {
            events: session.events.into(),
            effect: session.effect,
            probe: ActivityProbe::new(),
        }))
    }
}

struct ScriptedHandle {
    events: VecDeque<SessionEvent>,
    effect: Option<Effect>,
    probe: Arc<ActivityProbe>,
}

#[async_trait]
impl SessionHandle for ScriptedHandle {
    async fn send(&mut self, _prompt: &str) -> Result<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<SessionEvent>> {
        if let Some(effect) = self.effect.take() {
            effect();
        }
        Ok(self.events.pop_front())
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

/// In-memory VCS double: diffs are scripted per `diff_since` call, resets
/// and commits are counted.
pub struct FakeVcs {
    diffs: Mutex<VecDeque<DiffSummary>>,
    commit_counter: AtomicUsize,
    pub resets: AtomicUsize,
    pub commits: AtomicUsize,
}

impl FakeVcs {
    pub fn new(diffs: Vec<DiffSummary>) -> Arc<Self> {
        Arc::new(Self {
            diffs: Mutex::new(diffs.into()),
            commit_counter: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
        })
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkspaceVcs for FakeVcs {
    async fn head_commit(&self) -> Result<String> {
        Ok(format!(
            "commit-{}",
            self.commit_counter.fetch_add(1, Ordering::SeqCst)
        ))
    }

    async fn diff_since(&self, commit: &str) -> Result<DiffSummary> {
        let mut diff = self
            .diffs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        diff.base_commit = commit.to_string();
        Ok(diff)
    }

    async fn commit_all(&self, _message: &str) -> Result<bool> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn hard_reset(&self, _commit: &str) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clean_untracked(&self) -> Result<()> {
        Ok(())
    }

    async fn is_clean(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create_branch(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn create_worktree(&self, _name: &str, _branch: &str) -> Result<PathBuf> {
        Ok(PathBuf::from("unused-worktree"))
    }

    async fn merge_back(&self, _branch: &str, _message: &str) -> Result<()> {
        Ok(())
    }
}

pub struct ScriptedApproval {
    decisions: Mutex<VecDeque<GateDecision>>,
    pub presented: AtomicUsize,
}

impl ScriptedApproval {
    pub fn new(decisions: Vec<GateDecision>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            presented: AtomicUsize::new(0),
        })
    }

    pub fn presented_count(&self) -> usize {
        self.presented.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalBoundary for ScriptedApproval {
    async fn present_gate_prompt(
        &self,
        _gate: &GateSpec,
        _model: &GatePromptModel,
    ) -> Result<ApprovalResponse> {
        self.presented.fetch_add(1, Ordering::SeqCst);
        let decision = self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| CovenantError::Gate("unexpected gate presentation".into()))?;
        Ok(ApprovalResponse {
            decision,
            notes: None,
        })
    }
}

pub fn diff_touching(paths: &[&str]) -> DiffSummary {
    DiffSummary {
        base_commit: String::new(),
        files: paths
            .iter()
            .map(|p| ChangedFile {
                path: p.to_string(),
                kind: ChangeKind::Modified,
                lines_added: 3,
                lines_removed: 1,
            })
            .collect(),
        patch: format!("--- scripted diff touching {paths:?}\n"),
    }
}

pub fn worker_role(max_iterations: u32) -> RoleSpec {
    RoleSpec {
        id: "worker".into(),
        scope: vec!["src/**".into()],
        budget: covenant::contract::RoleBudget {
            max_iterations,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// One terminal phase, one worker role.
pub fn single_phase_contract(max_iterations: u32) -> Contract {
    Contract {
        name: "delivery".into(),
        roles: vec![worker_role(max_iterations)],
        phases: vec![PhaseSpec {
            id: "build".into(),
            actors: vec!["worker".into()],
            terminal: true,
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn count_events(ledger: &Ledger, kind: &str) -> usize {
    ledger
        .count_matching(|entry| entry.event.kind() == kind)
        .unwrap()
}
