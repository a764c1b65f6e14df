//! Conditional-reboot core: checker → agent → group → manager.

pub mod agent;
pub mod check;
pub mod group;
pub mod manager;
pub mod precondition;

pub use agent::{Agent, AgentState, CheckEvent, Streaks};
pub use check::{CheckResult, Checker, CheckerSpec};
pub use group::{EvaluatorMode, Group, RebootRequest, StateEvaluator, StateKind};
pub use manager::{ManagerHandle, ProcUptime, RebootManager, SystemctlExecutor};
pub use precondition::{Precondition, PreconditionSpec};
