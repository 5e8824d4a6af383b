//! minimail: a minimal SMTP + POP3 mail server
//!
//! Accepts mail over SMTP, stores it one file per message under one
//! directory per mailbox, relays outbound mail to remote exchanges with
//! optional DKIM signing, and serves stored mail back over POP3.
//!
//! # Architecture
//!
//! - **Transport**: one abstraction over plaintext and TLS sockets with
//!   in-place STARTTLS upgrade, shared by all protocol front ends
//! - **Deliver vs. relay**: an inbound session persists mail for local
//!   recipients directly; an authenticated local sender gets its message
//!   staged once and fanned out per destination domain by a background
//!   relay worker, with per-domain failures collected into a bounce
//! - **Storage**: staged writes committed by atomic rename; a mailbox
//!   directory never holds a partially written message
//!
//! # Modules
//!
//! - [`config`]: TOML configuration
//! - [`error`]: error types
//! - [`transport`]: plaintext/TLS byte-stream abstraction
//! - [`framer`]: CRLF line framing
//! - [`storage`]: mailbox directories and staging
//! - [`security`]: account store and TLS material
//! - [`smtp`]: inbound state machine and outbound relay
//! - [`pop3`]: retrieval protocol
//! - [`utils`]: DKIM signing, MX lookup, address validation

pub mod config;
pub mod error;
pub mod framer;
pub mod pop3;
pub mod security;
pub mod smtp;
pub mod storage;
pub mod transport;
pub mod utils;

pub use config::Config;
pub use error::{MailError, Result};

/// Software name used in greetings and synthesized messages
pub const SERVER_NAME: &str = "minimail";
