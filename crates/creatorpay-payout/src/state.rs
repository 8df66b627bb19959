//! Payout request state machine.
//!
//! ```text
//! pending ──approve──▶ approved ──dispatch──▶ processing ──success──▶ completed
//!    │  ▲                                        │   │
//!    │  └───────────── transient failure ────────┘   └─permanent failure─▶ failed
//!    ├──reject──▶ rejected
//!    └──cancel──▶ cancelled
//! ```
//!
//! `rejected`, `completed`, `failed` and `cancelled` are terminal.

use creatorpay_types::payout::PayoutStatus;
use serde::{Deserialize, Serialize};

use crate::{PayoutError, Result};

/// Everything that can happen to a payout request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Approve,
    Reject,
    Cancel,
    Dispatch,
    SettleSuccess,
    SettleTransientFailure,
    SettlePermanentFailure,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::Approve,
        Action::Reject,
        Action::Cancel,
        Action::Dispatch,
        Action::SettleSuccess,
        Action::SettleTransientFailure,
        Action::SettlePermanentFailure,
    ];
}

/// The status reached by applying `action` in status `from`.
///
/// # Errors
///
/// - [`PayoutError::InvalidTransition`] if the action is not allowed
pub fn transition(from: PayoutStatus, action: Action) -> Result<PayoutStatus> {
    use Action::*;
    use PayoutStatus::*;

    match (from, action) {
        (Pending, Approve) => Ok(Approved),
        (Pending, Reject) => Ok(Rejected),
        (Pending, Cancel) => Ok(Cancelled),
        (Approved, Dispatch) => Ok(Processing),
        (Processing, SettleSuccess) => Ok(Completed),
        (Processing, SettleTransientFailure) => Ok(Pending),
        (Processing, SettlePermanentFailure) => Ok(Failed),
        (from, action) => Err(PayoutError::InvalidTransition { from, action }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allowed_transitions() {
        let allowed: Vec<(PayoutStatus, Action, PayoutStatus)> = PayoutStatus::ALL
            .into_iter()
            .flat_map(|from| Action::ALL.into_iter().map(move |a| (from, a)))
            .filter_map(|(from, a)| transition(from, a).ok().map(|to| (from, a, to)))
            .collect();

        assert_eq!(
            allowed,
            vec![
                (PayoutStatus::Pending, Action::Approve, PayoutStatus::Approved),
                (PayoutStatus::Pending, Action::Reject, PayoutStatus::Rejected),
                (PayoutStatus::Pending, Action::Cancel, PayoutStatus::Cancelled),
                (PayoutStatus::Approved, Action::Dispatch, PayoutStatus::Processing),
                (PayoutStatus::Processing, Action::SettleSuccess, PayoutStatus::Completed),
                (PayoutStatus::Processing, Action::SettleTransientFailure, PayoutStatus::Pending),
                (PayoutStatus::Processing, Action::SettlePermanentFailure, PayoutStatus::Failed),
            ]
        );
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for status in PayoutStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for action in Action::ALL {
                assert!(matches!(
                    transition(status, action),
                    Err(PayoutError::InvalidTransition { .. })
                ));
            }
        }
    }
}
