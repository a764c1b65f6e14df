//! Per-checker agent: a state machine with streak-based flap suppression.
//!
//! Transitions are applied by a pure function over `(state, event)` so
//! the machine can be tested without any task machinery. The running
//! agent owns its state; everyone else reads through the lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::check::{CheckResult, Checker};
use super::precondition::Precondition;

/// Bounds for the per-agent check interval.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Current state of an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Initial,
    Ok,
    Uncertain {
        success_streak: u32,
        failure_streak: u32,
    },
    RebootNeeded,
    Error {
        consecutive_errors: u32,
    },
}

impl AgentState {
    /// Short state name used in config, status payloads and logs.
    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Initial => "initial",
            AgentState::Ok => "ok",
            AgentState::Uncertain { .. } => "uncertain",
            AgentState::RebootNeeded => "reboot-needed",
            AgentState::Error { .. } => "error",
        }
    }

    /// True when `other` is the same variant, ignoring counters.
    pub fn same_kind(&self, other: &AgentState) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Outcome of one checker invocation, as delivered to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckEvent {
    Success,
    Failure,
    Error,
}

/// Streak thresholds, both at least 1.
#[derive(Debug, Clone, Copy)]
pub struct Streaks {
    pub until_ok: u32,
    pub until_reboot: u32,
}

/// Apply one event to a state.
///
/// Inside `Uncertain`, a verdict increments its streak counter and the
/// machine leaves once the counter outweighs the opposite one by the
/// configured threshold, so isolated flaps offset rather than reset
/// the progress made towards either exit.
pub fn transition(state: &AgentState, event: CheckEvent, streaks: Streaks) -> AgentState {
    match (state, event) {
        (AgentState::Initial, CheckEvent::Success) => {
            if streaks.until_ok <= 1 {
                AgentState::Ok
            } else {
                AgentState::Uncertain {
                    success_streak: 1,
                    failure_streak: 0,
                }
            }
        }
        (AgentState::Initial, CheckEvent::Failure) => {
            if streaks.until_reboot <= 1 {
                AgentState::RebootNeeded
            } else {
                AgentState::Uncertain {
                    success_streak: 0,
                    failure_streak: 1,
                }
            }
        }
        (AgentState::Ok, CheckEvent::Success) => AgentState::Ok,
        (AgentState::Ok, CheckEvent::Failure) => {
            if streaks.until_reboot > 1 {
                AgentState::Uncertain {
                    success_streak: 0,
                    failure_streak: 1,
                }
            } else {
                AgentState::RebootNeeded
            }
        }
        (
            AgentState::Uncertain {
                success_streak,
                failure_streak,
            },
            CheckEvent::Success,
        ) => {
            let success_streak = success_streak + 1;
            let failure_streak = *failure_streak;
            if success_streak.saturating_sub(failure_streak) >= streaks.until_ok {
                AgentState::Ok
            } else {
                AgentState::Uncertain {
                    success_streak,
                    failure_streak,
                }
            }
        }
        (
            AgentState::Uncertain {
                success_streak,
                failure_streak,
            },
            CheckEvent::Failure,
        ) => {
            let failure_streak = failure_streak + 1;
            let success_streak = *success_streak;
            if failure_streak.saturating_sub(success_streak) >= streaks.until_reboot {
                AgentState::RebootNeeded
            } else {
                AgentState::Uncertain {
                    success_streak,
                    failure_streak,
                }
            }
        }
        (AgentState::RebootNeeded, CheckEvent::Success) => AgentState::Uncertain {
            success_streak: 1,
            failure_streak: 0,
        },
        (AgentState::RebootNeeded, CheckEvent::Failure) => AgentState::RebootNeeded,
        (AgentState::Error { .. }, CheckEvent::Success) => AgentState::Uncertain {
            success_streak: 1,
            failure_streak: 0,
        },
        (AgentState::Error { .. }, CheckEvent::Failure) => AgentState::RebootNeeded,
        (AgentState::Error { consecutive_errors }, CheckEvent::Error) => AgentState::Error {
            consecutive_errors: consecutive_errors + 1,
        },
        (_, CheckEvent::Error) => AgentState::Error {
            consecutive_errors: 1,
        },
    }
}

/// State plus the instant it was entered.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub state: AgentState,
    pub last_state_change: Instant,
}

impl StateSnapshot {
    pub fn state_duration(&self) -> Duration {
        self.last_state_change.elapsed()
    }
}

/// Per-checker stateful agent.
pub struct Agent {
    name: String,
    checker: Checker,
    precondition: Precondition,
    check_interval: Duration,
    streaks: Streaks,
    snapshot: RwLock<StateSnapshot>,
}

impl Agent {
    pub fn new(
        name: String,
        checker: Checker,
        precondition: Precondition,
        check_interval: Duration,
        streaks: Streaks,
    ) -> Self {
        Self {
            name,
            checker,
            precondition,
            check_interval: check_interval.clamp(MIN_CHECK_INTERVAL, MAX_CHECK_INTERVAL),
            streaks,
            snapshot: RwLock::new(StateSnapshot {
                state: AgentState::Initial,
                last_state_change: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Apply one check event. Returns true when the state kind changed,
    /// which is when a transition event goes out to the group.
    pub async fn apply(&self, event: CheckEvent) -> bool {
        let mut snap = self.snapshot.write().await;
        let next = transition(&snap.state, event, self.streaks);
        let kind_changed = !next.same_kind(&snap.state);
        if kind_changed {
            info!(
                agent = %self.name,
                from = snap.state.name(),
                to = next.name(),
                "agent state transition"
            );
            snap.last_state_change = Instant::now();
        }
        snap.state = next;
        kind_changed
    }

    /// The agent loop: every interval, gate on the precondition, run
    /// the checker and feed the verdict to the state machine. Serial
    /// per agent; no two checks overlap.
    pub async fn run(
        self: Arc<Self>,
        events: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(agent = %self.name, checker = self.checker.name(), "agent started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if !self.precondition.should_run() {
                debug!(agent = %self.name, "precondition closed, skipping check");
                continue;
            }
            let event = match self.checker.check(&cancel).await {
                CheckResult::Healthy => CheckEvent::Success,
                CheckResult::Unhealthy => CheckEvent::Failure,
                CheckResult::Error { kind, detail } => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.log_check_error(&kind, &detail).await;
                    CheckEvent::Error
                }
            };
            if self.apply(event).await {
                // Receiver gone means the group stopped first during
                // shutdown; nothing to do but exit on the next tick.
                let _ = events.send(self.name.clone()).await;
            }
        }
        debug!(agent = %self.name, "agent stopped");
    }

    /// Persistent checker errors drop to debug level after three in a
    /// row to keep a flaky dependency from flooding the log.
    async fn log_check_error(&self, kind: &str, detail: &str) {
        let errors = match &self.snapshot.read().await.state {
            AgentState::Error { consecutive_errors } => *consecutive_errors,
            _ => 0,
        };
        if errors >= 3 {
            debug!(agent = %self.name, kind, detail, "checker error (repeated)");
        } else {
            warn!(agent = %self.name, kind, detail, "checker error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reboot::check::CheckerSpec;

    const S: Streaks = Streaks {
        until_ok: 3,
        until_reboot: 2,
    };

    fn apply_all(start: AgentState, events: &[CheckEvent], streaks: Streaks) -> Vec<AgentState> {
        let mut state = start;
        let mut trace = Vec::new();
        for e in events {
            state = transition(&state, *e, streaks);
            trace.push(state.clone());
        }
        trace
    }

    #[test]
    fn test_two_failures_from_initial_reach_reboot() {
        use CheckEvent::*;
        let trace = apply_all(AgentState::Initial, &[Failure, Failure], S);
        assert_eq!(
            trace,
            vec![
                AgentState::Uncertain {
                    success_streak: 0,
                    failure_streak: 1
                },
                AgentState::RebootNeeded,
            ]
        );
    }

    #[test]
    fn test_flap_delays_reboot() {
        use CheckEvent::*;
        let trace = apply_all(AgentState::Initial, &[Failure, Success, Failure, Failure], S);
        assert_eq!(
            trace,
            vec![
                AgentState::Uncertain {
                    success_streak: 0,
                    failure_streak: 1
                },
                AgentState::Uncertain {
                    success_streak: 1,
                    failure_streak: 1
                },
                AgentState::Uncertain {
                    success_streak: 1,
                    failure_streak: 2
                },
                AgentState::RebootNeeded,
            ]
        );
    }

    #[test]
    fn test_initial_success_with_unit_streak_goes_ok() {
        let streaks = Streaks {
            until_ok: 1,
            until_reboot: 1,
        };
        assert_eq!(
            transition(&AgentState::Initial, CheckEvent::Success, streaks),
            AgentState::Ok
        );
        assert_eq!(
            transition(&AgentState::Initial, CheckEvent::Failure, streaks),
            AgentState::RebootNeeded
        );
    }

    #[test]
    fn test_ok_failure_with_unit_reboot_streak() {
        let streaks = Streaks {
            until_ok: 1,
            until_reboot: 1,
        };
        assert_eq!(
            transition(&AgentState::Ok, CheckEvent::Failure, streaks),
            AgentState::RebootNeeded
        );
        assert_eq!(
            transition(&AgentState::Ok, CheckEvent::Failure, S),
            AgentState::Uncertain {
                success_streak: 0,
                failure_streak: 1
            }
        );
    }

    #[test]
    fn test_uncertain_successes_reach_ok() {
        use CheckEvent::*;
        let trace = apply_all(AgentState::Initial, &[Success, Success, Success], S);
        assert_eq!(trace.last(), Some(&AgentState::Ok));
    }

    #[test]
    fn test_error_transitions() {
        assert_eq!(
            transition(&AgentState::Ok, CheckEvent::Error, S),
            AgentState::Error {
                consecutive_errors: 1
            }
        );
        assert_eq!(
            transition(
                &AgentState::Error {
                    consecutive_errors: 4
                },
                CheckEvent::Error,
                S
            ),
            AgentState::Error {
                consecutive_errors: 5
            }
        );
        assert_eq!(
            transition(
                &AgentState::Error {
                    consecutive_errors: 2
                },
                CheckEvent::Success,
                S
            ),
            AgentState::Uncertain {
                success_streak: 1,
                failure_streak: 0
            }
        );
        assert_eq!(
            transition(
                &AgentState::Error {
                    consecutive_errors: 2
                },
                CheckEvent::Failure,
                S
            ),
            AgentState::RebootNeeded
        );
    }

    #[test]
    fn test_reboot_needed_recovers_through_uncertain() {
        assert_eq!(
            transition(&AgentState::RebootNeeded, CheckEvent::Success, S),
            AgentState::Uncertain {
                success_streak: 1,
                failure_streak: 0
            }
        );
        assert_eq!(
            transition(&AgentState::RebootNeeded, CheckEvent::Failure, S),
            AgentState::RebootNeeded
        );
    }

    #[test]
    fn test_uncertain_counters_never_both_zero() {
        use CheckEvent::*;
        for events in [
            vec![Failure],
            vec![Success],
            vec![Failure, Success],
            vec![Success, Failure, Success],
        ] {
            let trace = apply_all(AgentState::Initial, &events, S);
            for state in trace {
                if let AgentState::Uncertain {
                    success_streak,
                    failure_streak,
                } = state
                {
                    assert!(success_streak + failure_streak > 0);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_apply_reports_kind_change_only() {
        let agent = Agent::new(
            "t".into(),
            Checker::new(CheckerSpec::File {
                path: "/nonexistent".into(),
                wants_absence: true,
            })
            .unwrap(),
            Precondition::Always,
            Duration::from_secs(30),
            S,
        );
        // Initial -> Uncertain is a kind change.
        assert!(agent.apply(CheckEvent::Failure).await);
        // Uncertain counter bumps are not.
        assert!(!agent.apply(CheckEvent::Success).await);
        assert!(!agent.apply(CheckEvent::Failure).await);
        // Uncertain -> RebootNeeded is.
        assert!(agent.apply(CheckEvent::Failure).await);
        assert_eq!(agent.snapshot().await.state, AgentState::RebootNeeded);
    }

    #[test]
    fn test_interval_clamped() {
        let agent = Agent::new(
            "t".into(),
            Checker::new(CheckerSpec::File {
                path: "/x".into(),
                wants_absence: false,
            })
            .unwrap(),
            Precondition::Always,
            Duration::from_secs(1),
            S,
        );
        assert_eq!(agent.check_interval, MIN_CHECK_INTERVAL);
    }
}
