//! Agent session lifecycle: spawn, prompt, monitor, stop.

pub mod boundary;
pub mod context;
pub mod events;
pub mod monitor;
pub mod permissions;
pub mod process;
pub mod supervisor;

pub use boundary::{ActivityProbe, SessionBackend, SessionHandle, SpawnRequest};
pub use context::RoleContext;
pub use events::{ExceededBudget, SessionEvent, SessionOutcome};
pub use monitor::{HealthMonitor, MonitorLimits, StopReason};
pub use permissions::{PermissionProfile, SessionMode};
pub use process::ProcessSessionBackend;
pub use supervisor::SessionSupervisor;
