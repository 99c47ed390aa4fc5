//! Deployment lifecycle states for check instance configurations.
//!
//! This is the one transition table for the lifecycle. The computation
//! step, the unblock/retire cycle, pull and feedback all consult it.
//!
//! ```text
//! blocked ──► awaiting_rollout ──► rollout_in_progress ──► active
//!                                   ▲        │                │
//!                                   └─ rollout_failed ◄┘      ▼
//!                                                   awaiting_deprovision
//!                                                             │
//!                      deprovision_failed ◄── deprovision_in_progress ──► deprovisioned
//!                              └──────────────────────►┘
//! ```
//!
//! `awaiting_deletion` is the administrative discard for versions that
//! never went live (duplicates, superseded or orphaned payloads).

use serde::{Deserialize, Serialize};

/// Status of one check instance configuration version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Blocked,
    AwaitingRollout,
    RolloutInProgress,
    Active,
    RolloutFailed,
    AwaitingDeprovision,
    DeprovisionInProgress,
    DeprovisionFailed,
    Deprovisioned,
    AwaitingDeletion,
}

/// The work a monitoring system is asked to perform for a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentTask {
    Rollout,
    Deprovision,
    None,
}

/// Outcome reported by a monitoring system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackResult {
    Success,
    Failed,
}

impl DeploymentStatus {
    /// States reachable from `self` according to the lifecycle table.
    pub fn successors(self) -> &'static [DeploymentStatus] {
        use DeploymentStatus::*;
        match self {
            Blocked => &[AwaitingRollout, AwaitingDeletion],
            AwaitingRollout => &[RolloutInProgress, AwaitingDeletion],
            RolloutInProgress => &[Active, RolloutFailed],
            Active => &[AwaitingDeprovision],
            RolloutFailed => &[RolloutInProgress, AwaitingDeletion],
            AwaitingDeprovision => &[DeprovisionInProgress],
            DeprovisionInProgress => &[Deprovisioned, DeprovisionFailed],
            DeprovisionFailed => &[DeprovisionInProgress],
            Deprovisioned => &[],
            AwaitingDeletion => &[],
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    pub fn can_transition(self, to: DeploymentStatus) -> bool {
        self.successors().contains(&to)
    }

    /// The status recorded as `next_status` while sitting in `self`.
    ///
    /// `active` has no scheduled successor: leaving it requires a newer
    /// version or a deletion.
    pub fn scheduled_next(self) -> Option<DeploymentStatus> {
        use DeploymentStatus::*;
        match self {
            Blocked => Some(AwaitingRollout),
            AwaitingRollout => Some(RolloutInProgress),
            RolloutInProgress => Some(Active),
            Active => None,
            RolloutFailed => Some(RolloutInProgress),
            AwaitingDeprovision => Some(DeprovisionInProgress),
            DeprovisionInProgress => Some(Deprovisioned),
            DeprovisionFailed => Some(DeprovisionInProgress),
            Deprovisioned | AwaitingDeletion => None,
        }
    }

    /// Where a pull by the monitoring system moves the configuration, and
    /// which task it is handed.
    ///
    /// In-progress states stay put so repeated pulls are idempotent.
    pub fn on_pull(self) -> (DeploymentStatus, DeploymentTask) {
        use DeploymentStatus::*;
        match self {
            AwaitingRollout | RolloutFailed | RolloutInProgress => {
                (RolloutInProgress, DeploymentTask::Rollout)
            }
            Active => (Active, DeploymentTask::Rollout),
            AwaitingDeprovision | DeprovisionFailed | DeprovisionInProgress => {
                (DeprovisionInProgress, DeploymentTask::Deprovision)
            }
            Blocked | Deprovisioned | AwaitingDeletion => (self, DeploymentTask::None),
        }
    }

    /// Where feedback moves the configuration, if the current state accepts it.
    pub fn on_feedback(self, result: FeedbackResult) -> Option<DeploymentStatus> {
        use DeploymentStatus::*;
        match (self, result) {
            (RolloutInProgress, FeedbackResult::Success) => Some(Active),
            (RolloutInProgress, FeedbackResult::Failed) => Some(RolloutFailed),
            (DeprovisionInProgress, FeedbackResult::Success) => Some(Deprovisioned),
            (DeprovisionInProgress, FeedbackResult::Failed) => Some(DeprovisionFailed),
            _ => None,
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        self.successors().is_empty()
    }

    /// Versions in these states never reached a monitoring system as live
    /// configuration and may be discarded outright when superseded.
    pub fn is_discardable(self) -> bool {
        self.can_transition(DeploymentStatus::AwaitingDeletion)
    }

    /// States the poke phase notifies about.
    pub fn awaits_action(self) -> bool {
        matches!(
            self,
            DeploymentStatus::AwaitingRollout | DeploymentStatus::AwaitingDeprovision
        )
    }

    pub fn as_str(self) -> &'static str {
        use DeploymentStatus::*;
        match self {
            Blocked => "blocked",
            AwaitingRollout => "awaiting_rollout",
            RolloutInProgress => "rollout_in_progress",
            Active => "active",
            RolloutFailed => "rollout_failed",
            AwaitingDeprovision => "awaiting_deprovision",
            DeprovisionInProgress => "deprovision_in_progress",
            DeprovisionFailed => "deprovision_failed",
            Deprovisioned => "deprovisioned",
            AwaitingDeletion => "awaiting_deletion",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for FeedbackResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedbackResult::Success => f.write_str("success"),
            FeedbackResult::Failed => f.write_str("failed"),
        }
    }
}

impl std::str::FromStr for FeedbackResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(FeedbackResult::Success),
            "failed" => Ok(FeedbackResult::Failed),
            other => Err(format!("unknown feedback result: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeploymentStatus::*;

    const ALL: [DeploymentStatus; 10] = [
        Blocked,
        AwaitingRollout,
        RolloutInProgress,
        Active,
        RolloutFailed,
        AwaitingDeprovision,
        DeprovisionInProgress,
        DeprovisionFailed,
        Deprovisioned,
        AwaitingDeletion,
    ];

    #[test]
    fn scheduled_next_is_always_a_successor() {
        for status in ALL {
            if let Some(next) = status.scheduled_next() {
                assert!(status.can_transition(next), "{status} -> {next}");
            }
        }
    }

    #[test]
    fn terminal_states() {
        assert!(Deprovisioned.is_terminal());
        assert!(AwaitingDeletion.is_terminal());
        assert!(!Active.is_terminal());
    }

    #[test]
    fn pull_moves_waiting_states_into_progress() {
        assert_eq!(
            AwaitingRollout.on_pull(),
            (RolloutInProgress, DeploymentTask::Rollout)
        );
        assert_eq!(
            AwaitingDeprovision.on_pull(),
            (DeprovisionInProgress, DeploymentTask::Deprovision)
        );
        assert_eq!(RolloutFailed.on_pull().0, RolloutInProgress);
        assert_eq!(Deprovisioned.on_pull(), (Deprovisioned, DeploymentTask::None));
    }

    #[test]
    fn pull_targets_are_legal_or_unchanged() {
        for status in ALL {
            let (to, _) = status.on_pull();
            assert!(to == status || status.can_transition(to), "{status} -> {to}");
        }
    }

    #[test]
    fn feedback_only_accepted_in_progress() {
        assert_eq!(RolloutInProgress.on_feedback(FeedbackResult::Success), Some(Active));
        assert_eq!(
            RolloutInProgress.on_feedback(FeedbackResult::Failed),
            Some(RolloutFailed)
        );
        assert_eq!(
            DeprovisionInProgress.on_feedback(FeedbackResult::Success),
            Some(Deprovisioned)
        );
        assert_eq!(
            DeprovisionInProgress.on_feedback(FeedbackResult::Failed),
            Some(DeprovisionFailed)
        );
        for status in [Blocked, AwaitingRollout, Active, Deprovisioned, RolloutFailed] {
            assert_eq!(status.on_feedback(FeedbackResult::Success), None);
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&AwaitingDeprovision).unwrap();
        assert_eq!(json, "\"awaiting_deprovision\"");
        assert_eq!(AwaitingDeprovision.to_string(), "awaiting_deprovision");
    }

    #[test]
    fn feedback_result_parses() {
        assert_eq!("success".parse::<FeedbackResult>(), Ok(FeedbackResult::Success));
        assert!("maybe".parse::<FeedbackResult>().is_err());
    }
}
