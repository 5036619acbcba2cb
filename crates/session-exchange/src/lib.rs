//! Backend session exchange.
//!
//! Exchanges an identity provider's proof token for an application-level
//! user record ([`ApplicationUser`]), and tears the backend session down on
//! logout.

mod error;
mod exchanger;
mod http;

pub use error::{ExchangeError, ExchangeResult};
pub use exchanger::{ApplicationUser, LocalSessionExchanger, SessionExchanger};
pub use http::{HttpSessionExchanger, DEFAULT_LOGIN_PATH, DEFAULT_LOGOUT_PATH};
