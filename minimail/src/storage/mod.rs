//! Mail storage module
//!
//! One directory per mailbox address, one immutable file per message, and a
//! separate staging area for in-flight content:
//! - [`store`]: mailbox directories, staged writes, enumeration

pub mod store;

pub use store::{MailStore, MessageInfo, StagedFile};
