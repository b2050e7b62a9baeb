//! Permission profiles derived from role scope and session mode.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::contract::{Contract, RoleSpec};
use crate::policy::PROTECTED_PATHS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    /// Read-only except the staging area; produces a plan artifact.
    Plan,
    Implement,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Implement => write!(f, "implement"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionProfile {
    pub mode: SessionMode,
    /// Globs the session may write to.
    pub allow: Vec<String>,
    /// Globs the session may never touch; always includes protected paths.
    pub deny: Vec<String>,
    pub allowed_commands: Vec<String>,
}

impl PermissionProfile {
    /// Deny-list always carries the protected paths; the allow-list is the
    /// role's scope plus shared scopes plus the staging area. Plan mode
    /// keeps only the staging area writable.
    pub fn derive(
        role: &RoleSpec,
        contract: &Contract,
        staging_dir: &Path,
        mode: SessionMode,
    ) -> Self {
        let staging = format!("{}/**", staging_dir.display());

        let allow = match mode {
            SessionMode::Plan => vec![staging],
            SessionMode::Implement => {
                let mut allow: Vec<String> = role.scope.clone();
                allow.extend(role.extra_paths.iter().cloned());
                allow.extend(
                    contract
                        .shared_patterns_for(&role.id)
                        .into_iter()
                        .map(String::from),
                );
                allow.push(staging);
                allow
            }
        };

        Self {
            mode,
            allow,
            deny: PROTECTED_PATHS.iter().map(|p| p.to_string()).collect(),
            allowed_commands: role.allowed_commands.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{PhaseSpec, SharedScope};

    fn contract() -> Contract {
        Contract {
            roles: vec![
                RoleSpec {
                    id: "worker".into(),
                    scope: vec!["src/**".into()],
                    extra_paths: vec!["Cargo.toml".into()],
                    ..Default::default()
                },
                RoleSpec {
                    id: "reviewer".into(),
                    scope: vec!["review/**".into()],
                    ..Default::default()
                },
            ],
            shared_scopes: vec![SharedScope {
                roles: vec!["worker".into(), "reviewer".into()],
                patterns: vec!["shared/**".into()],
            }],
            phases: vec![PhaseSpec {
                id: "p".into(),
                terminal: true,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn implement_profile_includes_scope_shared_and_staging() {
        let contract = contract();
        let role = contract.role("worker").unwrap();
        let profile = PermissionProfile::derive(
            role,
            &contract,
            Path::new("/jobs/j1/staging"),
            SessionMode::Implement,
        );

        assert!(profile.allow.iter().any(|p| p == "src/**"));
        assert!(profile.allow.iter().any(|p| p == "Cargo.toml"));
        assert!(profile.allow.iter().any(|p| p == "shared/**"));
        assert!(profile.allow.iter().any(|p| p.ends_with("staging/**")));
    }

    #[test]
    fn plan_profile_writes_only_staging() {
        let contract = contract();
        let role = contract.role("worker").unwrap();
        let profile = PermissionProfile::derive(
            role,
            &contract,
            Path::new("/jobs/j1/staging"),
            SessionMode::Plan,
        );

        assert_eq!(profile.allow.len(), 1);
        assert!(profile.allow[0].ends_with("staging/**"));
    }

    #[test]
    fn deny_always_covers_protected_paths() {
        let contract = contract();
        let role = contract.role("worker").unwrap();
        for mode in [SessionMode::Plan, SessionMode::Implement] {
            let profile =
                PermissionProfile::derive(role, &contract, Path::new("/s"), mode);
            for protected in PROTECTED_PATHS {
                assert!(profile.deny.iter().any(|d| d == protected));
            }
        }
    }
}
