//! SMTP implementation (RFC 5321)
//!
//! - [`server`]: listeners accepting inbound connections
//! - [`session`]: inbound session state machine (deliver and relay modes)
//! - [`commands`]: command parsing
//! - [`relay`]: outbound delivery worker, fan-out and bounce generation

pub mod commands;
pub mod relay;
pub mod server;
pub mod session;

pub use commands::SmtpCommand;
pub use relay::{RelayJob, RelayWorker};
pub use server::SmtpServer;
pub use session::SmtpSession;
