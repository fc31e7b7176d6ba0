//! Subscriber-visible group events.
//!
//! A single [`GroupEvent`] stream covers session lifecycle, replicated
//! state changes, inbound invitations, and matchmaking progress for the
//! group's current profile.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GroupInvitation, GroupSettings, LeaveReason, MatchmakingStatus, MemberInfo};

/// Events raised by the group client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum GroupEvent {
    /// Join completed: state is authoritative and hooks have run.
    Joined {
        /// Joined group session.
        session_id: String,
    },
    /// The local user is no longer in the group.
    Left {
        /// Session that was left.
        session_id: String,
        /// Why.
        reason: LeaveReason,
    },
    /// Group settings changed.
    SettingsUpdated {
        /// New settings.
        settings: GroupSettings,
    },
    /// Membership, readiness, user data, or leadership changed.
    MembersUpdated {
        /// Full member list after the change.
        members: Vec<MemberInfo>,
    },
    /// Someone invited the local user.
    InvitationReceived {
        /// The invitation.
        invitation: GroupInvitation,
    },
    /// An inbound invitation was withdrawn or superseded.
    InvitationCanceled {
        /// Inviting user.
        sender_id: String,
    },
    /// Matchmaking search state changed for the group's profile.
    MatchmakingStatusChanged {
        /// New state.
        status: MatchmakingStatus,
    },
    /// Matchmaking found a game for the group's profile.
    GameFound {
        /// Profile that matched.
        profile: String,
        /// Opaque connection details.
        details: Value,
    },
    /// Matchmaking failed for the group's profile.
    MatchmakingFailed {
        /// Profile that failed.
        profile: String,
        /// Failure reason.
        reason: String,
    },
}

impl GroupEvent {
    /// Short event type name for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "joined",
            Self::Left { .. } => "left",
            Self::SettingsUpdated { .. } => "settings_updated",
            Self::MembersUpdated { .. } => "members_updated",
            Self::InvitationReceived { .. } => "invitation_received",
            Self::InvitationCanceled { .. } => "invitation_canceled",
            Self::MatchmakingStatusChanged { .. } => "matchmaking_status_changed",
            Self::GameFound { .. } => "game_found",
            Self::MatchmakingFailed { .. } => "matchmaking_failed",
        }
    }

    /// Whether the event reflects replicated group state.
    pub fn is_state_change(&self) -> bool {
        matches!(self, Self::SettingsUpdated { .. } | Self::MembersUpdated { .. })
    }
}
