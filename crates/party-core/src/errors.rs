//! Error taxonomy shared by every party component.
//!
//! Server-side rejections arrive as string codes; [`PartyError::from_code`]
//! turns them into typed variants so callers can `match` instead of
//! comparing strings. The same codes are produced locally for precondition
//! failures that never reach the server.

/// Wire codes for the errors the group server (and this client) raise.
pub mod codes {
    /// Accepting an invitation that is not pending.
    pub const INVALID_INVITATION: &str = "party.invalidInvitation";
    /// Joining or creating while already in a group.
    pub const ALREADY_IN_GROUP: &str = "party.alreadyInParty";
    /// Group operation while not in a group.
    pub const NOT_IN_GROUP: &str = "party.notInParty";
    /// Readiness change without a matchmaking profile.
    pub const GROUP_NOT_READY: &str = "party.partyNotReady";
    /// The client's settings version is stale.
    pub const SETTINGS_OUTDATED: &str = "party.settingsOutdated";
    /// Leader-only operation from a non-leader.
    pub const UNAUTHORIZED: &str = "unauthorized";
}

/// Errors surfaced by group operations.
///
/// `Clone` because a single in-flight operation (resync, matchmaking
/// connect, outbound invitation) hands the same outcome to every awaiter.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PartyError {
    /// No pending invitation from that sender.
    #[error("party.invalidInvitation")]
    InvalidInvitation,

    /// Already in (or joining) a group.
    #[error("party.alreadyInParty")]
    AlreadyInGroup,

    /// Not in a group.
    #[error("party.notInParty")]
    NotInGroup,

    /// No matchmaking profile configured.
    #[error("party.partyNotReady")]
    GroupNotReady,

    /// Local settings version is behind the server's.
    #[error("party.settingsOutdated")]
    SettingsOutdated,

    /// Caller is not the leader.
    #[error("unauthorized")]
    Unauthorized,

    /// Server rejected the call with a code this client does not know.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Transport failure (connection lost, timeout, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A pushed or returned payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Connecting to a matchmaking profile failed.
    #[error("Matchmaking error: {profile}: {message}")]
    Matchmaking {
        /// Profile being connected to.
        profile: String,
        /// Error description.
        message: String,
    },

    /// A join hook rejected the join.
    #[error("Hook error: {name}: {message}")]
    Hook {
        /// Hook name.
        name: String,
        /// Error description.
        message: String,
    },

    /// Operation was cancelled via its cancellation token or superseded.
    #[error("Operation cancelled")]
    Cancelled,

    /// The group session ended while the operation was pending.
    #[error("Group session disconnected")]
    Disconnected,
}

impl PartyError {
    /// Map a server error string to a typed error.
    pub fn from_code(code: &str) -> Self {
        match code {
            codes::INVALID_INVITATION => Self::InvalidInvitation,
            codes::ALREADY_IN_GROUP => Self::AlreadyInGroup,
            codes::NOT_IN_GROUP => Self::NotInGroup,
            codes::GROUP_NOT_READY => Self::GroupNotReady,
            codes::SETTINGS_OUTDATED => Self::SettingsOutdated,
            codes::UNAUTHORIZED => Self::Unauthorized,
            other => Self::Remote(other.to_string()),
        }
    }

    /// Wire code for the taxonomy variants, `None` for local-only errors.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::InvalidInvitation => Some(codes::INVALID_INVITATION),
            Self::AlreadyInGroup => Some(codes::ALREADY_IN_GROUP),
            Self::NotInGroup => Some(codes::NOT_IN_GROUP),
            Self::GroupNotReady => Some(codes::GROUP_NOT_READY),
            Self::SettingsOutdated => Some(codes::SETTINGS_OUTDATED),
            Self::Unauthorized => Some(codes::UNAUTHORIZED),
            Self::Remote(_)
            | Self::Transport(_)
            | Self::Decode(_)
            | Self::Matchmaking { .. }
            | Self::Hook { .. }
            | Self::Cancelled
            | Self::Disconnected => None,
        }
    }

    /// Whether a resync-then-retry can recover from this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SettingsOutdated)
    }

    /// Whether the error was raised locally without a remote round-trip.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::NotInGroup
                | Self::AlreadyInGroup
                | Self::Unauthorized
                | Self::GroupNotReady
                | Self::InvalidInvitation
        )
    }

    /// Error category for logging/metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidInvitation => "invalid_invitation",
            Self::AlreadyInGroup => "already_in_group",
            Self::NotInGroup => "not_in_group",
            Self::GroupNotReady => "group_not_ready",
            Self::SettingsOutdated => "settings_outdated",
            Self::Unauthorized => "unauthorized",
            Self::Remote(_) => "remote",
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Matchmaking { .. } => "matchmaking",
            Self::Hook { .. } => "hook",
            Self::Cancelled => "cancelled",
            Self::Disconnected => "disconnected",
        }
    }
}

impl From<serde_json::Error> for PartyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
