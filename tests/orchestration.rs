//! End-to-end job runs against scripted sessions, a fake VCS, and a
//! scripted approval boundary.

mod support;

use tempfile::TempDir;

use covenant::config::{EngineConfig, JobPaths};
use covenant::contract::{
    CompletionCriterion, Contract, EscalationStep, GlobalLifetime, PhaseSpec, RoleSpec,
};
use covenant::error::CovenantError;
use covenant::job::{CancelToken, JobManager, JobStatus};
use covenant::ledger::Ledger;
use covenant::session::{SessionEvent, SessionMode};

use support::*;

fn job_ledger(state_dir: &TempDir, job_id: &str) -> Ledger {
    Ledger::open(JobPaths::new(state_dir.path(), job_id).ledger_path).unwrap()
}

#[tokio::test]
async fn advisory_violation_reverts_once_then_succeeds() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    // Attempt 1 strays into README.md; attempt 2 stays in scope.
    let backend = ScriptedBackend::new(vec![
        ScriptedSession::completes("first pass"),
        ScriptedSession::completes("stayed in scope"),
    ]);
    let vcs = FakeVcs::new(vec![
        diff_touching(&["src/main.rs", "README.md"]),
        diff_touching(&["src/main.rs"]),
    ]);

    let mut manager = JobManager::create(
        "job-adv",
        single_phase_contract(2),
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        vcs.clone(),
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&CancelToken::new()).await.unwrap();
    drop(manager);

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(backend.spawn_count(), 2);
    assert_eq!(vcs.reset_count(), 1);

    let ledger = job_ledger(&state_dir, "job-adv");
    assert_eq!(count_events(&ledger, "scope_violation"), 1);
    assert_eq!(count_events(&ledger, "session_reverted"), 1);
    assert_eq!(count_events(&ledger, "role_completed"), 1);
    ledger.verify_integrity().unwrap();
}

#[tokio::test]
async fn foreign_scope_escalates_on_first_occurrence() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let contract = Contract {
        name: "delivery".into(),
        roles: vec![
            RoleSpec {
                id: "backend".into(),
                scope: vec!["server/**".into()],
                ..Default::default()
            },
            RoleSpec {
                id: "frontend".into(),
                scope: vec!["web/**".into()],
                ..Default::default()
            },
        ],
        phases: vec![PhaseSpec {
            id: "build".into(),
            actors: vec!["backend".into()],
            terminal: true,
            ..Default::default()
        }],
        ..Default::default()
    };

    let backend = ScriptedBackend::new(vec![ScriptedSession::completes("crossed the line")]);
    let vcs = FakeVcs::new(vec![diff_touching(&["web/index.html"])]);

    let mut manager = JobManager::create(
        "job-structural",
        contract,
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        vcs.clone(),
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&CancelToken::new()).await.unwrap();
    drop(manager);

    // No escalation chain is declared, so the structural violation is
    // terminal after a single attempt despite the remaining budget.
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.reason, "structural_scope_violation");
    assert_eq!(backend.spawn_count(), 1);
    assert_eq!(vcs.reset_count(), 1);

    let ledger = job_ledger(&state_dir, "job-structural");
    assert_eq!(count_events(&ledger, "session_reverted"), 1);
    assert_eq!(count_events(&ledger, "escalation_raised"), 1);
    ledger.verify_integrity().unwrap();
}

#[tokio::test]
async fn granted_escalation_retries_without_consuming_budget() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let contract = Contract {
        name: "delivery".into(),
        roles: vec![
            RoleSpec {
                id: "worker".into(),
                scope: vec!["src/**".into()],
                budget: covenant::contract::RoleBudget {
                    max_iterations: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            RoleSpec {
                id: "architect".into(),
                scope: vec!["docs/**".into()],
                ..Default::default()
            },
        ],
        phases: vec![PhaseSpec {
            id: "build".into(),
            actors: vec!["worker".into()],
            terminal: true,
            ..Default::default()
        }],
        escalation_chain: vec![EscalationStep {
            from_role: "worker".into(),
            to_role: Some("architect".into()),
            policy: Default::default(),
        }],
        ..Default::default()
    };

    let decision_path = JobPaths::new(state_dir.path(), "job-grant")
        .escalation_dir
        .join("worker-build-attempt1.json");
    let backend = ScriptedBackend::new(vec![
        ScriptedSession::completes("touched the design doc"),
        ScriptedSession::completes("reviewed the request").with_effect(Box::new(move || {
            std::fs::write(
                &decision_path,
                r#"{"grant": true, "notes": "one-off doc exception"}"#,
            )
            .unwrap();
        })),
        ScriptedSession::completes("redone under the grant"),
    ]);
    // Both worker attempts touch the architect's exclusive scope; the
    // second is covered by the granted override.
    let vcs = FakeVcs::new(vec![
        diff_touching(&["docs/design.md"]),
        diff_touching(&["docs/design.md"]),
    ]);

    let mut manager = JobManager::create(
        "job-grant",
        contract,
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        vcs.clone(),
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&CancelToken::new()).await.unwrap();
    drop(manager);

    // With max_iterations = 1, the job can only complete if the granted
    // retry was refunded rather than counted.
    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(backend.spawn_count(), 3);
    assert_eq!(vcs.reset_count(), 1);

    let ledger = job_ledger(&state_dir, "job-grant");
    assert_eq!(count_events(&ledger, "override_installed"), 1);
    assert_eq!(count_events(&ledger, "session_reverted"), 1);
    assert_eq!(count_events(&ledger, "role_completed"), 1);
    ledger.verify_integrity().unwrap();
}

#[tokio::test]
async fn repeated_completion_failure_fails_after_two_attempts() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let mut contract = single_phase_contract(5);
    contract.phases[0].completion_criteria = vec![CompletionCriterion::CommandSucceeds {
        command: "false".into(),
    }];

    let backend = ScriptedBackend::new(vec![
        ScriptedSession::completes("done, surely"),
        ScriptedSession::completes("done, surely again"),
    ]);
    let vcs = FakeVcs::new(vec![
        diff_touching(&["src/a.rs"]),
        diff_touching(&["src/a.rs"]),
    ]);

    let mut manager = JobManager::create(
        "job-repeat",
        contract,
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        vcs.clone(),
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&CancelToken::new()).await.unwrap();
    drop(manager);

    // Identical failure signatures on consecutive attempts short-circuit
    // well before the 5-attempt budget.
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.reason, "repeated_completion_failure");
    assert_eq!(backend.spawn_count(), 2);
    // The failing attempts keep their partial work committed.
    assert_eq!(vcs.commit_count(), 2);

    let ledger = job_ledger(&state_dir, "job-repeat");
    assert_eq!(count_events(&ledger, "completion_checked"), 2);
    assert_eq!(count_events(&ledger, "escalation_raised"), 1);
    assert_eq!(count_events(&ledger, "session_reverted"), 0);
    ledger.verify_integrity().unwrap();
}

#[tokio::test]
async fn oversized_diff_exhausts_the_diff_budget() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    // No diff_within_budget criterion: the role budget alone must bound
    // the change size.
    let mut contract = single_phase_contract(3);
    contract.roles[0].budget.max_diff_lines = 2;

    let backend = ScriptedBackend::new(vec![ScriptedSession::completes("one big change")]);
    let vcs = FakeVcs::new(vec![diff_touching(&["src/main.rs"])]);

    let mut manager = JobManager::create(
        "job-diff-budget",
        contract,
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        vcs.clone(),
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&CancelToken::new()).await.unwrap();
    drop(manager);

    // Without an escalation chain the exhausted diff budget is terminal;
    // the oversized work is reverted, not committed.
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.reason, "diff_budget_exhausted");
    assert_eq!(backend.spawn_count(), 1);
    assert_eq!(vcs.reset_count(), 1);
    assert_eq!(vcs.commit_count(), 0);

    let ledger = job_ledger(&state_dir, "job-diff-budget");
    assert_eq!(count_events(&ledger, "escalation_raised"), 1);
    assert_eq!(count_events(&ledger, "completion_checked"), 0);
    ledger.verify_integrity().unwrap();
}

#[tokio::test]
async fn feedback_snapshot_failure_is_an_error() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    // The session asks questions (a feedback-recording path) after its
    // snapshot file has been made unwritable.
    let snapshot = JobPaths::new(state_dir.path(), "job-snap").snapshot_path;
    let backend = ScriptedBackend::new(vec![ScriptedSession {
        events: vec![SessionEvent::Questions {
            questions: vec!["which database?".into()],
        }],
        effect: Some(Box::new(move || {
            std::fs::remove_file(&snapshot).unwrap();
            std::fs::create_dir(&snapshot).unwrap();
        })),
    }]);

    let mut manager = JobManager::create(
        "job-snap",
        single_phase_contract(2),
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        FakeVcs::new(vec![]),
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let err = manager.run(&CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, CovenantError::SnapshotPersistence(_)));
    assert_eq!(backend.spawn_count(), 1);
}

#[tokio::test]
async fn failed_plan_session_leaves_no_marker() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let mut contract = single_phase_contract(2);
    contract.roles[0].delegated = true;

    let paths = JobPaths::new(state_dir.path(), "job-plan-fail");
    let staging = paths.staging_dir.clone();
    // The plan session stages a file but exits without a terminal event.
    let backend = ScriptedBackend::new(vec![
        ScriptedSession {
            events: vec![],
            effect: Some(Box::new(move || {
                std::fs::write(staging.join("plan.md"), "# half a plan\n").unwrap();
            })),
        },
        ScriptedSession::completes("worked without a plan"),
    ]);
    let vcs = FakeVcs::new(vec![diff_touching(&["src/lib.rs"])]);

    let mut manager = JobManager::create(
        "job-plan-fail",
        contract,
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        vcs,
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&CancelToken::new()).await.unwrap();
    drop(manager);

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(backend.spawn_count(), 2);

    let requests = backend.requests.lock().unwrap();
    assert_eq!(requests[0].permissions.mode, SessionMode::Plan);
    assert_eq!(requests[1].permissions.mode, SessionMode::Implement);
    drop(requests);

    // Nothing was promoted and no marker was written: a resumed job will
    // re-attempt the plan step.
    assert!(!paths.planning_dir.join(".planned-build-worker").exists());
    assert!(!paths.planning_dir.join("plan.md").exists());
}

#[tokio::test]
async fn exhausted_global_budget_finishes_before_any_session() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let mut contract = single_phase_contract(2);
    contract.global_lifetime = GlobalLifetime { max_time_ms: 0 };

    let backend = ScriptedBackend::new(vec![]);

    let mut manager = JobManager::create(
        "job-budget",
        contract,
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        FakeVcs::new(vec![]),
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&CancelToken::new()).await.unwrap();
    drop(manager);

    assert_eq!(outcome.status, JobStatus::BudgetExceeded);
    assert_eq!(outcome.reason, "budget_exceeded");
    assert_eq!(backend.spawn_count(), 0);

    let ledger = job_ledger(&state_dir, "job-budget");
    assert_eq!(count_events(&ledger, "session_started"), 0);
    assert_eq!(count_events(&ledger, "job_finished"), 1);
    ledger.verify_integrity().unwrap();
}

#[tokio::test]
async fn delegated_role_plans_before_implementing() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let mut contract = single_phase_contract(2);
    contract.roles[0].delegated = true;
    contract.phases[0].completion_criteria = vec![CompletionCriterion::DelegationCoverage];

    let paths = JobPaths::new(state_dir.path(), "job-plan");
    let staging = paths.staging_dir.clone();
    let backend = ScriptedBackend::new(vec![
        ScriptedSession::completes("plan staged").with_effect(Box::new(move || {
            std::fs::write(staging.join("plan.md"), "# Plan\nwire the api\n").unwrap();
            std::fs::write(
                staging.join("delegation.json"),
                r#"{"tasks":[{"id":"t1","role_id":"worker","description":"wire the api","scope_hints":["src/api/**"]}]}"#,
            )
            .unwrap();
        })),
        ScriptedSession::completes("api wired"),
    ]);
    let vcs = FakeVcs::new(vec![diff_touching(&["src/api/users.rs"])]);

    let mut manager = JobManager::create(
        "job-plan",
        contract,
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        vcs,
        backend.clone(),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&CancelToken::new()).await.unwrap();
    drop(manager);

    assert_eq!(outcome.status, JobStatus::Completed);
    assert_eq!(backend.spawn_count(), 2);

    // The plan session ran read-only and its staged artifacts were
    // promoted into the planning tree.
    let requests = backend.requests.lock().unwrap();
    assert_eq!(requests[0].permissions.mode, SessionMode::Plan);
    assert_eq!(requests[1].permissions.mode, SessionMode::Implement);
    drop(requests);

    assert!(paths.planning_dir.join("plan.md").is_file());
    assert!(paths.planning_dir.join("delegation.json").is_file());
    assert!(paths.planning_dir.join(".planned-build-worker").is_file());

    let ledger = job_ledger(&state_dir, "job-plan");
    assert_eq!(count_events(&ledger, "session_started"), 2);
    ledger.verify_integrity().unwrap();
}

#[tokio::test]
async fn cancellation_is_a_terminal_outcome() {
    let state_dir = TempDir::new().unwrap();
    let workspace = TempDir::new().unwrap();

    let cancel = CancelToken::new();
    cancel.request_stop();

    let mut manager = JobManager::create(
        "job-cancel",
        single_phase_contract(2),
        EngineConfig::default(),
        state_dir.path(),
        workspace.path(),
        FakeVcs::new(vec![]),
        ScriptedBackend::new(vec![]),
        ScriptedApproval::new(vec![]),
    )
    .unwrap();

    let outcome = manager.run(&cancel).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(outcome.reason, "cancelled");
}
