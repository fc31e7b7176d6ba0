//! # party-core
//!
//! Shared vocabulary for the party (group session) client:
//!
//! - **State**: [`types::GroupState`], [`types::GroupSettings`], [`types::MemberInfo`]
//!   with pure, version-gated mutation helpers
//! - **Wire DTOs**: push payloads and request bodies, camelCase on the wire
//! - **Errors**: [`errors::PartyError`] with the string-coded server taxonomy
//! - **Events**: [`events::GroupEvent`], the single subscriber-visible stream
//! - **Constants**: protocol version and route names
//! - **Logging**: `tracing` subscriber initialisation
//!
//! ## Crate Position
//!
//! Foundation crate. Depended on by party-runtime.

#![deny(unsafe_code)]

pub mod constants;
pub mod errors;
pub mod events;
pub mod logging;
pub mod types;

pub use errors::PartyError;
pub use events::GroupEvent;
