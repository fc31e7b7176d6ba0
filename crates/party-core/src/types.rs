//! Group state and wire types.
//!
//! - [`GroupState`]: the locally cached, versioned copy of a group
//! - [`GroupSettings`] / [`MemberInfo`]: the parts of it observers see
//! - Push/request DTOs exchanged with the group server
//!
//! All wire types use camelCase field names. The mutation helpers on
//! [`GroupState`] are pure; callers decide which change events to raise
//! from their boolean results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::DEFAULT_CUSTOM_DATA;

// ─────────────────────────────────────────────────────────────────────────────
// Members
// ─────────────────────────────────────────────────────────────────────────────

/// Readiness of a member for matchmaking.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MemberStatus {
    /// Not ready to start matchmaking.
    #[default]
    NotReady,
    /// Ready to start matchmaking.
    Ready,
}

/// A member of the group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    /// Unique user identifier.
    pub user_id: String,
    /// Matchmaking readiness.
    #[serde(default)]
    pub status: MemberStatus,
    /// Opaque, application-defined member data.
    #[serde(default)]
    pub user_data: String,
    /// Derived from the group's leader id, never trusted from the wire.
    #[serde(default, skip_serializing)]
    pub is_leader: bool,
}

impl MemberInfo {
    /// Create a not-ready member with empty user data.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    /// Builder: set status.
    #[must_use]
    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: set user data.
    #[must_use]
    pub fn with_user_data(mut self, data: impl Into<String>) -> Self {
        self.user_data = data.into();
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Shared group settings. Only the leader's updates are authoritative.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSettings {
    /// Matchmaking profile the group queues on. Empty means "no matchmaking".
    #[serde(default)]
    pub matchmaking_profile_name: String,
    /// Opaque, application-defined settings (JSON text).
    #[serde(default)]
    pub custom_data: String,
    /// Incremented by every settings update.
    #[serde(default)]
    pub settings_version: u64,
}

impl GroupSettings {
    /// Create settings for a profile with default custom data.
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            matchmaking_profile_name: profile.into(),
            custom_data: DEFAULT_CUSTOM_DATA.to_string(),
            settings_version: 0,
        }
    }

    /// Builder: set custom data.
    #[must_use]
    pub fn with_custom_data(mut self, data: impl Into<String>) -> Self {
        self.custom_data = data.into();
        self
    }
}

/// Settings an application asks for; the version is managed by the engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    /// New matchmaking profile name.
    pub matchmaking_profile_name: String,
    /// New custom data. Empty is sent as `{}`.
    #[serde(default)]
    pub custom_data: String,
}

impl SettingsUpdate {
    /// Create an update for a profile with empty custom data.
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            matchmaking_profile_name: profile.into(),
            custom_data: String::new(),
        }
    }

    /// Builder: set custom data.
    #[must_use]
    pub fn with_custom_data(mut self, data: impl Into<String>) -> Self {
        self.custom_data = data.into();
        self
    }

    /// Copy with empty custom data replaced by `{}`.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            matchmaking_profile_name: self.matchmaking_profile_name.clone(),
            custom_data: normalize_custom_data(&self.custom_data),
        }
    }
}

/// Replace empty custom data with the empty JSON object.
pub fn normalize_custom_data(data: &str) -> String {
    if data.is_empty() {
        DEFAULT_CUSTOM_DATA.to_string()
    } else {
        data.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Group state
// ─────────────────────────────────────────────────────────────────────────────

/// Versioned copy of a group. Version `0` means no snapshot has been received.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupState {
    /// Shared settings.
    #[serde(default)]
    pub settings: GroupSettings,
    /// Current leader.
    #[serde(default)]
    pub leader_id: String,
    /// Members in join order.
    #[serde(default)]
    pub members: Vec<MemberInfo>,
    /// Protocol version, +1 per server message.
    #[serde(default)]
    pub version: u64,
}

impl GroupState {
    /// Whether an authoritative snapshot has been applied.
    pub fn has_snapshot(&self) -> bool {
        self.version > 0
    }

    /// Check a pushed version against the current one, advancing on match.
    ///
    /// Returns `false` (and leaves the version untouched) when no snapshot
    /// has been applied yet or when the message is not the direct successor.
    pub fn accept_version(&mut self, incoming: u64) -> bool {
        if self.version > 0 && incoming == self.version + 1 {
            self.version = incoming;
            true
        } else {
            false
        }
    }

    /// Look up a member.
    pub fn member(&self, user_id: &str) -> Option<&MemberInfo> {
        self.members.iter().find(|m| m.user_id == user_id)
    }

    fn member_mut(&mut self, user_id: &str) -> Option<&mut MemberInfo> {
        self.members.iter_mut().find(|m| m.user_id == user_id)
    }

    /// Make `is_leader` agree with `leader_id`.
    pub fn recompute_leader(&mut self) {
        for member in &mut self.members {
            member.is_leader = member.user_id == self.leader_id;
        }
    }

    /// Change the leader. Returns `true` if it changed.
    pub fn set_leader(&mut self, leader_id: &str) -> bool {
        if self.leader_id == leader_id {
            return false;
        }
        leader_id.clone_into(&mut self.leader_id);
        self.recompute_leader();
        true
    }

    /// Replace settings unless the version is unchanged. Returns `true` if applied.
    pub fn apply_settings(&mut self, settings: GroupSettings) -> bool {
        if self.settings.settings_version == settings.settings_version {
            return false;
        }
        self.settings = settings;
        true
    }

    /// Apply a batch of status changes. Returns `true` if any status changed.
    pub fn apply_statuses(&mut self, updates: &[MemberStatusUpdate]) -> bool {
        let mut changed = false;
        for update in updates {
            if let Some(member) = self.member_mut(&update.user_id) {
                changed |= member.status != update.status;
                member.status = update.status;
            }
        }
        changed
    }

    /// Set a member's user data. Returns `true` if it changed.
    pub fn set_user_data(&mut self, user_id: &str, data: &str) -> bool {
        match self.member_mut(user_id) {
            Some(member) if member.user_data != data => {
                data.clone_into(&mut member.user_data);
                true
            }
            _ => false,
        }
    }

    /// Add a member, replacing any existing entry with the same id.
    pub fn add_member(&mut self, member: MemberInfo) {
        self.members.retain(|m| m.user_id != member.user_id);
        self.members.push(member);
        self.recompute_leader();
    }

    /// Remove a member. Returns `true` if it was present.
    pub fn remove_member(&mut self, user_id: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|m| m.user_id != user_id);
        self.members.len() < before
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire DTOs
// ─────────────────────────────────────────────────────────────────────────────

/// One entry of a status batch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatusUpdate {
    /// Member whose status changed.
    pub user_id: String,
    /// New status.
    pub status: MemberStatus,
}

/// Payload of `party.memberStatusUpdated`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusUpdate {
    /// Changed statuses.
    pub member_status: Vec<MemberStatusUpdate>,
}

/// Payload of `party.updategamefinderplayerstatus`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdateRequest {
    /// Requested status.
    pub desired_status: MemberStatus,
    /// Settings version the client believes is current.
    pub local_settings_version: u64,
}

/// Payload of `party.memberDataUpdated`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDataUpdate {
    /// Member whose data changed.
    pub user_id: String,
    /// New data.
    pub user_data: String,
}

/// Why a member left.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaveReason {
    /// Left voluntarily or lost connection.
    #[default]
    Left,
    /// Removed by the leader.
    Kicked,
}

/// Payload of `party.memberDisconnected`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberDisconnection {
    /// Member that left.
    pub user_id: String,
    /// Reason.
    #[serde(default)]
    pub reason: LeaveReason,
}

/// Parameters for creating a group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequest {
    /// Platform-side session to associate (may be empty).
    #[serde(default)]
    pub platform_session_id: String,
    /// Initial matchmaking profile.
    pub matchmaking_profile_name: String,
    /// Initial custom data. Empty is sent as `{}`.
    #[serde(default)]
    pub custom_data: String,
}

impl GroupRequest {
    /// Create a request for a profile.
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            matchmaking_profile_name: profile.into(),
            ..Self::default()
        }
    }

    /// Copy with empty custom data replaced by `{}`.
    #[must_use]
    pub fn normalized(&self) -> Self {
        Self {
            platform_session_id: self.platform_session_id.clone(),
            matchmaking_profile_name: self.matchmaking_profile_name.clone(),
            custom_data: normalize_custom_data(&self.custom_data),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Invitations
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound invitation to join another user's group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInvitation {
    /// Inviting user.
    pub sender_id: String,
    /// Group session to join.
    pub session_id: String,
    /// When the invitation arrived.
    pub received_at: DateTime<Utc>,
}

impl GroupInvitation {
    /// Create an invitation received now.
    pub fn new(sender_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            session_id: session_id.into(),
            received_at: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Matchmaking
// ─────────────────────────────────────────────────────────────────────────────

/// Search state reported by the matchmaking subsystem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchmakingStatus {
    /// Not searching.
    #[default]
    SearchStopped,
    /// Searching.
    SearchInProgress,
}

/// Event published by the matchmaking subsystem for one profile.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchmakingEvent {
    /// Profile the event concerns.
    pub profile: String,
    /// What happened.
    pub kind: MatchmakingEventKind,
}

/// Kind of a [`MatchmakingEvent`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MatchmakingEventKind {
    /// Search state changed.
    StatusChanged {
        /// New state.
        status: MatchmakingStatus,
    },
    /// A game was found.
    GameFound {
        /// Opaque connection details.
        details: Value,
    },
    /// The search failed.
    Failed {
        /// Failure reason.
        reason: String,
    },
}
