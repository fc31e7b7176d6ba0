//! Protocol constants and route names.

/// Protocol version this client speaks.
pub const PROTOCOL_VERSION: &str = "2019-10-23.1";

/// Custom data sent when the application provides none.
pub const DEFAULT_CUSTOM_DATA: &str = "{}";

/// Disconnection reason reported by the transport when the leader kicked us.
pub const KICKED_DISCONNECT_REASON: &str = "party.kicked";

/// Remote procedure names.
pub mod routes {
    /// Replace the group settings.
    pub const UPDATE_SETTINGS: &str = "party.updatepartysettings";
    /// Change the local member's readiness.
    pub const UPDATE_STATUS: &str = "party.updategamefinderplayerstatus";
    /// Change the local member's user data.
    pub const UPDATE_USER_DATA: &str = "party.updatepartyuserdata";
    /// Hand leadership to another member.
    pub const PROMOTE_LEADER: &str = "party.promoteleader";
    /// Remove a member.
    pub const KICK_PLAYER: &str = "party.kickplayer";
    /// Fetch the full group state.
    pub const GET_STATE: &str = "party.getpartystate2";

    /// Full state snapshot push.
    pub const STATE_RESPONSE: &str = "party.getPartyStateResponse";
    /// Settings push.
    pub const SETTINGS_UPDATED: &str = "party.settingsUpdated";
    /// User data push.
    pub const MEMBER_DATA_UPDATED: &str = "party.memberDataUpdated";
    /// Status batch push.
    pub const MEMBER_STATUS_UPDATED: &str = "party.memberStatusUpdated";
    /// Member joined push.
    pub const MEMBER_CONNECTED: &str = "party.memberConnected";
    /// Member left push.
    pub const MEMBER_DISCONNECTED: &str = "party.memberDisconnected";
    /// Leader changed push.
    pub const LEADER_CHANGED: &str = "party.leaderChanged";
}
