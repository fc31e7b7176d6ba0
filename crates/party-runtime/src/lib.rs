//! # party-runtime
//!
//! Client-side group session runtime.
//!
//! - **Sync engine**: versioned group state, optimistic local mutations, gap detection and resync
//! - **Matchmaking liaison**: keeps the matchmaking connection on the group's profile
//! - **Invitations**: deduplicated outbound requests, superseding inbound offers
//! - **Hooks**: join/leave extension points
//! - **Group manager**: public surface; serialized create/join/leave and event routing
//!
//! ## Crate Position
//!
//! Top of the stack. Depends on: party-core, party-settings.
//! Networking is injected through the traits in [`transport`].

#![deny(unsafe_code)]

pub mod emitter;
pub mod hooks;
pub mod invitations;
pub mod matchmaking;
pub mod session;
pub mod sync;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main public API
pub use emitter::EventEmitter;
pub use hooks::{HookError, HookRegistry, SessionContext, SessionHook};
pub use invitations::{InboundInvitations, InvitationOutcome, InvitationTask, OutboundInvitations};
pub use matchmaking::MatchmakingLiaison;
pub use session::{GroupManager, MembershipState};
pub use sync::SyncEngine;
pub use transport::{
    GroupConnection, GroupConnector, GroupLink, InvitationChannel, MatchmakingClient, PushMessage,
};
