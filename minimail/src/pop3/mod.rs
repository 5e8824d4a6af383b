//! POP3 retrieval protocol
//!
//! - [`server`]: listeners
//! - [`session`]: list/fetch/delete session over the shared transport and
//!   storage contracts

pub mod server;
pub mod session;

pub use server::Pop3Server;
pub use session::Pop3Session;
