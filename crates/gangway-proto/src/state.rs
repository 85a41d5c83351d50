//! Classification helpers for [`DeploymentState`].

use std::fmt;
use std::str::FromStr;

use crate::proto::DeploymentState;

impl DeploymentState {
    /// A finished deployment will never receive further status updates.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            DeploymentState::Success
                | DeploymentState::Error
                | DeploymentState::Failure
                | DeploymentState::Inactive
        )
    }

    /// Terminal states that did not end in success.
    pub fn is_error(self) -> bool {
        matches!(
            self,
            DeploymentState::Error | DeploymentState::Failure | DeploymentState::Inactive
        )
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str_name())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, thiserror::Error)]
#[error("unknown deployment state: {0}")]
pub struct UnknownState(String);

impl FromStr for DeploymentState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeploymentState::from_str_name(s).ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(DeploymentState::Success.is_finished());
        assert!(DeploymentState::Error.is_finished());
        assert!(DeploymentState::Failure.is_finished());
        assert!(DeploymentState::Inactive.is_finished());
        assert!(!DeploymentState::InProgress.is_finished());
        assert!(!DeploymentState::Queued.is_finished());
        assert!(!DeploymentState::Pending.is_finished());
    }

    #[test]
    fn error_states_exclude_success() {
        assert!(!DeploymentState::Success.is_error());
        assert!(DeploymentState::Failure.is_error());
        assert!(DeploymentState::Inactive.is_error());
    }

    #[test]
    fn wire_integers_are_stable() {
        assert_eq!(DeploymentState::Success as i32, 0);
        assert_eq!(DeploymentState::Error as i32, 1);
        assert_eq!(DeploymentState::Failure as i32, 2);
        assert_eq!(DeploymentState::Inactive as i32, 3);
        assert_eq!(DeploymentState::InProgress as i32, 4);
        assert_eq!(DeploymentState::Queued as i32, 5);
        assert_eq!(DeploymentState::Pending as i32, 6);
    }

    #[test]
    fn state_name_round_trip() {
        for state in [
            DeploymentState::Success,
            DeploymentState::InProgress,
            DeploymentState::Queued,
        ] {
            assert_eq!(state.to_string().parse::<DeploymentState>().unwrap(), state);
        }
    }
}
