use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the instance's owner asked for (`status` attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredStatus {
    Started,
    Stopped,
}

/// What the core last observed and published (`state` attribute).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Starting,
    Started,
    Stopping,
    Stopped,
}

impl DesiredStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(DesiredStatus::Started),
            "stopped" => Some(DesiredStatus::Stopped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DesiredStatus::Started => "started",
            DesiredStatus::Stopped => "stopped",
        }
    }

    /// The status implied by an observed state, for entities that carry none.
    pub fn from_observed(state: Option<ObservedState>) -> Self {
        match state {
            Some(ObservedState::Starting | ObservedState::Started) => DesiredStatus::Started,
            _ => DesiredStatus::Stopped,
        }
    }
}

impl ObservedState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(ObservedState::Starting),
            "started" => Some(ObservedState::Started),
            "stopping" => Some(ObservedState::Stopping),
            "stopped" => Some(ObservedState::Stopped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObservedState::Starting => "starting",
            ObservedState::Started => "started",
            ObservedState::Stopping => "stopping",
            ObservedState::Stopped => "stopped",
        }
    }

    /// Starting or started.
    pub fn is_up(self) -> bool {
        matches!(self, ObservedState::Starting | ObservedState::Started)
    }

    /// Half-way through a transition.
    pub fn is_transient(self) -> bool {
        matches!(self, ObservedState::Starting | ObservedState::Stopping)
    }
}

impl fmt::Display for DesiredStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn validate_transition(from: ObservedState, to: ObservedState) -> Result<(), CoreError> {
    use ObservedState::{Started, Starting, Stopped, Stopping};

    let valid = from == to
        || matches!(
            (from, to),
            (Stopped | Stopping | Started, Starting)
                | (Starting, Started)
                | (Starting | Started, Stopping)
                | (_, Stopped)
        );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
