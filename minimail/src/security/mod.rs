//! Security module
//!
//! - [`auth`]: account store and credential checks
//! - [`tls`]: TLS configuration for listeners and outbound upgrades

pub mod auth;
pub mod tls;

pub use auth::AuthStore;
pub use tls::TlsConfig;
