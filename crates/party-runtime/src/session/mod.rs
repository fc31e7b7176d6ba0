//! Session lifecycle.
//!
//! [`GroupManager`] is the entry point applications hold. It owns at most
//! one active session (engine, liaison, forwarding tasks) at a time and the
//! invitation trackers, which outlive sessions.

mod active;
pub mod manager;

pub use active::{leave_reason, matchmaking_event};
pub use manager::{GroupManager, MembershipState};
