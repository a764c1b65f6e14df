//! Conditional-reboot flow: config to groups, streak behavior across
//! agents, evaluator decisions, and the status listing.

use std::sync::Arc;
use std::time::Duration;

use scagentd::metrics::Metrics;
use scagentd::reboot::agent::CheckEvent;
use scagentd::reboot::manager::{RebootManager, SystemctlExecutor, UptimeSource};
use scagentd::config::Config;

struct FixedUptime(Duration);

impl UptimeSource for FixedUptime {
    fn uptime(&self) -> Duration {
        self.0
    }
}

const DOC: &str = r#"
reboot_manager:
  safe_min_uptime_secs: 7200
  groups:
    - name: kernel
      evaluator:
        mode: and
        states:
          reboot-needed: 0
      agents:
        - name: sentinel
          checker:
            type: os-reboot-needed
          streak_until_ok: 2
          streak_until_reboot: 3
        - name: services
          checker:
            type: needrestart
          precondition:
            type: time-window
            from: "22:00"
            to: "06:00"
"#;

#[tokio::test]
async fn test_streaks_gate_group_decision() {
    let config = Config::from_str(DOC).unwrap();
    let groups = config.reboot_manager.as_ref().unwrap().build_groups().unwrap();
    let group = &groups[0];
    let agents = group.agents();
    assert_eq!(agents.len(), 2);

    // Two failures are not enough for the three-streak agent.
    agents[0].apply(CheckEvent::Failure).await;
    agents[0].apply(CheckEvent::Failure).await;
    agents[1].apply(CheckEvent::Failure).await;
    assert!(!group.should_reboot().await);

    // Third failure tips the first agent; the second (streak 1) is
    // already in reboot-needed. Conjunction now holds.
    agents[0].apply(CheckEvent::Failure).await;
    assert!(group.should_reboot().await);
}

#[tokio::test]
async fn test_flap_offsets_instead_of_resetting() {
    let config = Config::from_str(DOC).unwrap();
    let groups = config.reboot_manager.as_ref().unwrap().build_groups().unwrap();
    let agent = &groups[0].agents()[0];

    // F, S, F, F: the lone success offsets one failure, so the third
    // failure is not yet decisive with streak_until_reboot = 3.
    agent.apply(CheckEvent::Failure).await;
    agent.apply(CheckEvent::Success).await;
    agent.apply(CheckEvent::Failure).await;
    agent.apply(CheckEvent::Failure).await;
    assert_eq!(agent.snapshot().await.state.name(), "uncertain");

    agent.apply(CheckEvent::Failure).await;
    agent.apply(CheckEvent::Failure).await;
    assert_eq!(agent.snapshot().await.state.name(), "reboot-needed");
}

#[tokio::test]
async fn test_error_then_failure_goes_straight_to_reboot_needed() {
    let config = Config::from_str(DOC).unwrap();
    let groups = config.reboot_manager.as_ref().unwrap().build_groups().unwrap();
    let agent = &groups[0].agents()[0];

    agent.apply(CheckEvent::Error).await;
    assert_eq!(agent.snapshot().await.state.name(), "error");
    agent.apply(CheckEvent::Failure).await;
    assert_eq!(agent.snapshot().await.state.name(), "reboot-needed");
}

#[tokio::test]
async fn test_status_lists_all_agents_with_dwell() {
    let config = Config::from_str(DOC).unwrap();
    let section = config.reboot_manager.as_ref().unwrap();
    let manager = RebootManager::new(
        section.build_groups().unwrap(),
        Box::new(SystemctlExecutor),
        Arc::new(FixedUptime(Duration::from_secs(3 * 3600))),
        section.safe_min_uptime(),
        Arc::new(Metrics::new().unwrap()),
    );
    let handle = manager.handle();

    let status = handle.status().await;
    assert!(!status.paused);
    assert_eq!(status.uptime_secs, 3 * 3600);
    assert_eq!(status.safe_min_uptime_secs, 7200);
    assert_eq!(status.agents.len(), 2);
    assert!(status.agents.iter().all(|a| a.group == "kernel"));
    assert!(status.agents.iter().any(|a| a.name == "sentinel"));
    assert_eq!(status.agents[0].state, "initial");

    handle.pause();
    assert!(handle.status().await.paused);
}
