//! State synchronization.
//!
//! [`SyncEngine`] keeps the versioned copy of a joined group consistent with
//! the server: it applies pushed deltas in order, detects gaps, and
//! replaces the state with a full snapshot whenever it falls out of step.
//!
//! | Route | Payload | Effect |
//! |-------|---------|--------|
//! | `party.getPartyStateResponse` | `GroupState` | Replace everything (no version check) |
//! | `party.settingsUpdated` | `GroupSettings` | Replace settings, follow profile |
//! | `party.memberDataUpdated` | `UserDataUpdate` | Set one member's user data |
//! | `party.memberStatusUpdated` | `BatchStatusUpdate` | Set readiness for several members |
//! | `party.memberConnected` | `MemberInfo` | Add member |
//! | `party.memberDisconnected` | `MemberDisconnection` | Remove member |
//! | `party.leaderChanged` | leader id | Move leadership |

pub mod engine;

pub use engine::SyncEngine;
