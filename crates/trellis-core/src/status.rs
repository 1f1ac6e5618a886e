use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TrellisError;

/// Lifecycle state of a node execution.
///
/// ```text
/// QUEUED -> RUNNING -> { SUCCEEDED, FAILED, ERRORED, EXPIRED, ABORTED }
///           RUNNING -> DISCONTINUING -> { ABORTED, ERRORED }
/// ```
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    Discontinuing,
    Succeeded,
    Failed,
    Errored,
    Expired,
    Aborted,
}

impl Status {
    pub const ALL: [Status; 8] = [
        Status::Queued,
        Status::Running,
        Status::Discontinuing,
        Status::Succeeded,
        Status::Failed,
        Status::Errored,
        Status::Expired,
        Status::Aborted,
    ];

    /// Statuses swept by a force error-out.
    pub const ACTIVE: [Status; 2] = [Status::Queued, Status::Running];

    pub const NON_TERMINAL: [Status; 3] =
        [Status::Queued, Status::Running, Status::Discontinuing];

    pub fn is_terminal(self) -> bool {
        !Self::NON_TERMINAL.contains(&self)
    }

    /// Source statuses from which `self` may be entered.
    pub fn legal_predecessors(self) -> &'static [Status] {
        match self {
            Status::Queued => &[],
            Status::Running => &[Status::Queued],
            Status::Discontinuing => &[Status::Queued, Status::Running],
            Status::Succeeded | Status::Failed => &[Status::Running],
            Status::Expired => &[Status::Queued, Status::Running],
            Status::Errored | Status::Aborted => {
                &[Status::Queued, Status::Running, Status::Discontinuing]
            }
        }
    }

    pub fn can_transition_to(self, to: Status) -> bool {
        to.legal_predecessors().contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = TrellisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TrellisError::Config(format!("Unknown status: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::Running.is_terminal());
        assert!(!Status::Discontinuing.is_terminal());
        for s in [
            Status::Succeeded,
            Status::Failed,
            Status::Errored,
            Status::Expired,
            Status::Aborted,
        ] {
            assert!(s.is_terminal(), "{} should be terminal", s);
        }
    }

    #[test]
    fn test_nothing_leaves_terminal() {
        for from in Status::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in Status::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_no_backward_moves() {
        assert!(!Status::Running.can_transition_to(Status::Queued));
        assert!(!Status::Discontinuing.can_transition_to(Status::Running));
        assert!(!Status::Discontinuing.can_transition_to(Status::Succeeded));
        assert!(Status::Running.can_transition_to(Status::Discontinuing));
        assert!(Status::Discontinuing.can_transition_to(Status::Aborted));
    }

    #[test]
    fn test_parse_roundtrip() {
        assert_eq!("running".parse::<Status>().unwrap(), Status::Running);
        assert_eq!("DISCONTINUING".parse::<Status>().unwrap(), Status::Discontinuing);
        assert!("paused".parse::<Status>().is_err());
    }

    #[test]
    fn test_serde_uses_screaming_case() {
        let json = serde_json::to_string(&Status::Discontinuing).unwrap();
        assert_eq!(json, "\"DISCONTINUING\"");
    }
}
