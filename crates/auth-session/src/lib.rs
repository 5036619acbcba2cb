//! Session state store and reconciliation.
//!
//! This crate provides:
//! - [`AuthSessionStore`]: subscribes to identity-change notifications and
//!   reconciles each one with the application backend into a published
//!   [`SessionState`] snapshot
//! - An explicit FSM tracking the reconciliation phase, with stale-result
//!   suppression for superseded reconciliations
//! - [`route_guard::decide`]: the pure route-protection decision
//! - [`AuthConfig`]: explicit library configuration with documented defaults

mod config;
mod error;
mod reconcile;
pub mod route_guard;
mod state;
mod store;

pub use config::{
    AuthConfig, EndpointPaths, PasswordPolicy, PasswordPolicyViolation, ProviderSettings,
    RoutePaths, SignInMethod,
};
pub use error::{SessionError, SessionResult};
pub use reconcile::reconcile_machine;
pub use reconcile::{ReconcileInput, ReconcileMachine, ReconcileMachineState, ReconcilePhase};
pub use route_guard::RouteDecision;
pub use state::SessionState;
pub use store::{AuthSessionStore, SessionTask, StateListener, StateSubscription};
