//! Agent groups and the AND/OR state evaluator.

use std::sync::Arc;
use std::time::Duration;

use sc_shared::ScError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::agent::{Agent, AgentState, StateSnapshot};

/// Configured durations are bounded to a day.
pub const MAX_STATE_DURATION: Duration = Duration::from_secs(24 * 3600);

/// Safety tick: the evaluator re-runs at least this often even when no
/// transition event arrives, so duration thresholds are noticed.
const EVALUATION_TICK: Duration = Duration::from_secs(60);

/// State kind without counters, as named in evaluator config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Initial,
    Ok,
    Uncertain,
    RebootNeeded,
    Error,
}

impl StateKind {
    pub fn parse(s: &str) -> Result<Self, ScError> {
        match s {
            "initial" => Ok(StateKind::Initial),
            "ok" => Ok(StateKind::Ok),
            "uncertain" => Ok(StateKind::Uncertain),
            "reboot-needed" => Ok(StateKind::RebootNeeded),
            "error" => Ok(StateKind::Error),
            other => Err(ScError::Config(format!("unknown agent state {other:?}"))),
        }
    }

    fn matches(&self, state: &AgentState) -> bool {
        matches!(
            (self, state),
            (StateKind::Initial, AgentState::Initial)
                | (StateKind::Ok, AgentState::Ok)
                | (StateKind::Uncertain, AgentState::Uncertain { .. })
                | (StateKind::RebootNeeded, AgentState::RebootNeeded)
                | (StateKind::Error, AgentState::Error { .. })
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorMode {
    And,
    Or,
}

/// Conjunctive or disjunctive predicate over `(state, min_duration)`.
#[derive(Debug, Clone)]
pub struct StateEvaluator {
    mode: EvaluatorMode,
    requirements: Vec<(StateKind, Duration)>,
}

impl StateEvaluator {
    pub fn new(
        mode: EvaluatorMode,
        requirements: Vec<(StateKind, Duration)>,
    ) -> Result<Self, ScError> {
        if requirements.is_empty() {
            return Err(ScError::Config("evaluator needs at least one state".into()));
        }
        let requirements = requirements
            .into_iter()
            .map(|(kind, dur)| (kind, dur.min(MAX_STATE_DURATION)))
            .collect();
        Ok(Self { mode, requirements })
    }

    /// An agent satisfies the evaluator iff it currently sits in a
    /// configured state and has dwelled there at least the configured
    /// minimum. Duration zero means "as soon as the state is entered".
    fn satisfied(&self, snap: &StateSnapshot) -> bool {
        self.requirements
            .iter()
            .any(|(kind, min)| kind.matches(&snap.state) && snap.state_duration() >= *min)
    }

    pub fn should_reboot(&self, snapshots: &[StateSnapshot]) -> bool {
        if snapshots.is_empty() {
            return false;
        }
        match self.mode {
            EvaluatorMode::And => snapshots.iter().all(|s| self.satisfied(s)),
            EvaluatorMode::Or => snapshots.iter().any(|s| self.satisfied(s)),
        }
    }
}

/// Reboot request sent from a group to the manager.
#[derive(Debug, Clone)]
pub struct RebootRequest {
    pub group: String,
}

/// Ordered set of agents under one evaluator. Groups decide
/// independently; requests are idempotent from the manager's view.
pub struct Group {
    name: String,
    agents: Vec<Arc<Agent>>,
    evaluator: StateEvaluator,
}

impl Group {
    pub fn new(name: String, agents: Vec<Arc<Agent>>, evaluator: StateEvaluator) -> Self {
        Self {
            name,
            agents,
            evaluator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agents(&self) -> &[Arc<Agent>] {
        &self.agents
    }

    async fn snapshots(&self) -> Vec<StateSnapshot> {
        let mut snaps = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            snaps.push(agent.snapshot().await);
        }
        snaps
    }

    pub async fn should_reboot(&self) -> bool {
        self.evaluator.should_reboot(&self.snapshots().await)
    }

    /// Spawn the member agents, then evaluate after every transition
    /// event and on the safety tick.
    pub async fn run(
        self: Arc<Self>,
        requests: mpsc::Sender<RebootRequest>,
        cancel: CancellationToken,
    ) {
        let (event_tx, mut event_rx) = mpsc::channel::<String>(32);
        let mut tasks = tokio::task::JoinSet::new();
        for agent in &self.agents {
            tasks.spawn(Arc::clone(agent).run(event_tx.clone(), cancel.child_token()));
        }
        drop(event_tx);

        info!(group = %self.name, agents = self.agents.len(), "group started");
        let mut ticker = tokio::time::interval(EVALUATION_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = event_rx.recv() => {
                    match event {
                        Some(agent) => debug!(group = %self.name, agent, "transition event"),
                        None => break,
                    }
                }
                _ = ticker.tick() => {}
            }
            if self.should_reboot().await {
                info!(group = %self.name, "group requests reboot");
                let _ = requests
                    .send(RebootRequest {
                        group: self.name.clone(),
                    })
                    .await;
            }
        }
        tasks.shutdown().await;
        debug!(group = %self.name, "group stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn snap(state: AgentState, ago: Duration) -> StateSnapshot {
        StateSnapshot {
            state,
            last_state_change: Instant::now() - ago,
        }
    }

    fn reboot_after(min: Duration) -> StateEvaluator {
        StateEvaluator::new(EvaluatorMode::And, vec![(StateKind::RebootNeeded, min)]).unwrap()
    }

    #[test]
    fn test_and_requires_every_agent() {
        let eval = reboot_after(Duration::from_secs(60));
        let both = vec![
            snap(AgentState::RebootNeeded, Duration::from_secs(120)),
            snap(AgentState::RebootNeeded, Duration::from_secs(90)),
        ];
        assert!(eval.should_reboot(&both));

        let one_too_fresh = vec![
            snap(AgentState::RebootNeeded, Duration::from_secs(30)),
            snap(AgentState::RebootNeeded, Duration::from_secs(120)),
        ];
        assert!(!eval.should_reboot(&one_too_fresh));
    }

    #[test]
    fn test_agent_outside_configured_states_fails_conjunction() {
        let eval = reboot_after(Duration::ZERO);
        let mixed = vec![
            snap(AgentState::RebootNeeded, Duration::from_secs(10)),
            snap(AgentState::Ok, Duration::from_secs(10)),
        ];
        assert!(!eval.should_reboot(&mixed));
    }

    #[test]
    fn test_or_needs_one_agent() {
        let eval =
            StateEvaluator::new(EvaluatorMode::Or, vec![(StateKind::RebootNeeded, Duration::ZERO)])
                .unwrap();
        let mixed = vec![
            snap(AgentState::Ok, Duration::from_secs(10)),
            snap(AgentState::RebootNeeded, Duration::from_secs(1)),
        ];
        assert!(eval.should_reboot(&mixed));
        let none = vec![snap(AgentState::Ok, Duration::from_secs(10))];
        assert!(!eval.should_reboot(&none));
    }

    #[test]
    fn test_zero_duration_fires_immediately() {
        let eval = reboot_after(Duration::ZERO);
        let fresh = vec![snap(AgentState::RebootNeeded, Duration::ZERO)];
        assert!(eval.should_reboot(&fresh));
    }

    #[test]
    fn test_durations_clamped_to_a_day() {
        let eval = StateEvaluator::new(
            EvaluatorMode::And,
            vec![(StateKind::Ok, Duration::from_secs(48 * 3600))],
        )
        .unwrap();
        assert_eq!(eval.requirements[0].1, MAX_STATE_DURATION);
    }

    #[test]
    fn test_empty_requirements_rejected() {
        assert!(StateEvaluator::new(EvaluatorMode::And, vec![]).is_err());
    }

    #[test]
    fn test_state_kind_parse() {
        assert_eq!(
            StateKind::parse("reboot-needed").unwrap(),
            StateKind::RebootNeeded
        );
        assert!(StateKind::parse("borked").is_err());
    }
}
