//! Reconciliation phase machine using rust-fsm.
//!
//! The store's asynchronous work is tracked by an explicit finite state
//! machine instead of being derived from the published snapshot.
//!
//! ## State Diagram
//!
//! ```text
//! ┌──────────┐ ProviderEvent / RefreshRequested ┌──────────────┐
//! │   Idle   │ ───────────────────────────────► │ Reconciling  │◄─┐
//! └──────────┘                                  └──────┬───────┘  │ ProviderEvent
//!                                                      │ Settle   │ (supersedes)
//!                                                      ▼          │
//!                                               ┌──────────────┐──┘
//!                                               │   Settled    │
//!                                               └──────────────┘
//!                                        ProviderEvent / RefreshRequested
//!                                            loop back to Reconciling
//! ```
//!
//! `RefreshRequested` is deliberately not a legal input while
//! `Reconciling`: that rejection is what guards `refresh_user` against
//! concurrent invocation.

use rust_fsm::*;
use serde::{Deserialize, Serialize};

// Generates a module `reconcile_machine` with State, Input and
// StateMachine types.
state_machine! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub reconcile_machine(Idle)

    Idle => {
        ProviderEvent => Reconciling,
        RefreshRequested => Reconciling
    },
    Reconciling => {
        // A superseding provider event restarts reconciliation; the older
        // attempt's result is discarded by the generation counter.
        ProviderEvent => Reconciling,
        Settle => Settled
    },
    Settled => {
        ProviderEvent => Reconciling,
        RefreshRequested => Reconciling
    }
}

// Re-export the generated types with clearer names.
pub use reconcile_machine::Input as ReconcileInput;
pub use reconcile_machine::State as ReconcileMachineState;
pub use reconcile_machine::StateMachine as ReconcileMachine;

/// Simplified reconciliation phase for external consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePhase {
    /// No identity event has been observed yet.
    Idle,
    /// A reconciliation is in flight.
    Reconciling,
    /// The last reconciliation published its result.
    Settled,
}

impl ReconcilePhase {
    /// Returns true if a reconciliation is currently in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, ReconcilePhase::Reconciling)
    }
}

impl From<&ReconcileMachineState> for ReconcilePhase {
    fn from(state: &ReconcileMachineState) -> Self {
        match state {
            ReconcileMachineState::Idle => ReconcilePhase::Idle,
            ReconcileMachineState::Reconciling => ReconcilePhase::Reconciling,
            ReconcileMachineState::Settled => ReconcilePhase::Settled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_idle() {
        let machine = ReconcileMachine::new();
        assert_eq!(*machine.state(), ReconcileMachineState::Idle);
    }

    #[test]
    fn test_provider_event_starts_reconciliation() {
        let mut machine = ReconcileMachine::new();

        machine.consume(&ReconcileInput::ProviderEvent).unwrap();
        assert_eq!(*machine.state(), ReconcileMachineState::Reconciling);

        machine.consume(&ReconcileInput::Settle).unwrap();
        assert_eq!(*machine.state(), ReconcileMachineState::Settled);
    }

    #[test]
    fn test_refresh_starts_reconciliation_from_settled() {
        let mut machine = ReconcileMachine::new();

        machine.consume(&ReconcileInput::ProviderEvent).unwrap();
        machine.consume(&ReconcileInput::Settle).unwrap();

        machine.consume(&ReconcileInput::RefreshRequested).unwrap();
        assert_eq!(*machine.state(), ReconcileMachineState::Reconciling);
    }

    #[test]
    fn test_refresh_is_rejected_while_reconciling() {
        let mut machine = ReconcileMachine::new();

        machine.consume(&ReconcileInput::ProviderEvent).unwrap();
        assert_eq!(*machine.state(), ReconcileMachineState::Reconciling);

        let result = machine.consume(&ReconcileInput::RefreshRequested);
        assert!(result.is_err());
        assert_eq!(*machine.state(), ReconcileMachineState::Reconciling);
    }

    #[test]
    fn test_provider_event_supersedes_in_flight_reconciliation() {
        let mut machine = ReconcileMachine::new();

        machine.consume(&ReconcileInput::ProviderEvent).unwrap();
        machine.consume(&ReconcileInput::ProviderEvent).unwrap();
        assert_eq!(*machine.state(), ReconcileMachineState::Reconciling);

        machine.consume(&ReconcileInput::Settle).unwrap();
        assert_eq!(*machine.state(), ReconcileMachineState::Settled);
    }

    #[test]
    fn test_settle_is_rejected_outside_reconciling() {
        let mut machine = ReconcileMachine::new();
        assert!(machine.consume(&ReconcileInput::Settle).is_err());
    }

    #[test]
    fn test_phase_conversion() {
        assert_eq!(
            ReconcilePhase::from(&ReconcileMachineState::Idle),
            ReconcilePhase::Idle
        );
        assert_eq!(
            ReconcilePhase::from(&ReconcileMachineState::Reconciling),
            ReconcilePhase::Reconciling
        );
        assert_eq!(
            ReconcilePhase::from(&ReconcileMachineState::Settled),
            ReconcilePhase::Settled
        );
    }

    #[test]
    fn test_phase_is_busy() {
        assert!(!ReconcilePhase::Idle.is_busy());
        assert!(ReconcilePhase::Reconciling.is_busy());
        assert!(!ReconcilePhase::Settled.is_busy());
    }
}
