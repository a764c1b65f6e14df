//! Preconditions gate checker invocation.

use chrono::{Local, NaiveTime};
use sc_shared::ScError;
use serde::Deserialize;

/// Precondition configuration under an agent's `precondition:` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum PreconditionSpec {
    Always,
    /// Local-time window, `HH:MM` bounds. Wraps midnight iff `to < from`.
    TimeWindow { from: String, to: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Always,
    TimeWindow { from: NaiveTime, to: NaiveTime },
}

impl Precondition {
    pub fn from_spec(spec: &PreconditionSpec) -> Result<Self, ScError> {
        match spec {
            PreconditionSpec::Always => Ok(Precondition::Always),
            PreconditionSpec::TimeWindow { from, to } => Ok(Precondition::TimeWindow {
                from: parse_hhmm(from)?,
                to: parse_hhmm(to)?,
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Precondition::Always => "always",
            Precondition::TimeWindow { .. } => "time-window",
        }
    }

    pub fn should_run(&self) -> bool {
        self.should_run_at(Local::now().time())
    }

    fn should_run_at(&self, now: NaiveTime) -> bool {
        match self {
            Precondition::Always => true,
            Precondition::TimeWindow { from, to } => {
                if from <= to {
                    *from <= now && now < *to
                } else {
                    // Wrapping window: inside iff outside the gap [to, from).
                    !(*to <= now && now < *from)
                }
            }
        }
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, ScError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| ScError::Config(format!("invalid time {s:?}: {e}")))
}
