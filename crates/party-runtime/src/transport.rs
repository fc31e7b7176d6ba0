//! Collaborator interfaces.
//!
//! The runtime never talks to a network directly. Everything it needs from
//! the outside world is injected through these traits:
//!
//! | Trait | Provides |
//! |-------|----------|
//! | [`GroupConnection`] | Request/response calls on one joined group session |
//! | [`GroupConnector`] | Session creation, token exchange, connection establishment |
//! | [`MatchmakingClient`] | Per-profile matchmaking connect/disconnect and events |
//! | [`InvitationChannel`] | Routed peer-to-peer invitation requests |
//!
//! Payloads cross the boundary as `serde_json::Value`; the transport owns
//! the actual encoding. Server rejections must be mapped with
//! [`PartyError::from_code`] so the runtime can recognise stale-settings
//! errors.

use std::sync::Arc;

use async_trait::async_trait;
use party_core::PartyError;
use party_core::types::{GroupRequest, GroupState, MatchmakingEvent};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A server-initiated message on a group session.
#[derive(Clone, Debug, PartialEq)]
pub struct PushMessage {
    /// Push procedure name (see `party_core::constants::routes`).
    pub route: String,
    /// Protocol version carried by delta pushes; `None` for full snapshots.
    pub version: Option<u64>,
    /// Route-specific payload.
    pub payload: Value,
}

impl PushMessage {
    /// A versioned delta push.
    pub fn delta(route: &str, version: u64, payload: Value) -> Self {
        Self {
            route: route.to_string(),
            version: Some(version),
            payload,
        }
    }

    /// A full state snapshot push.
    pub fn snapshot(state: &GroupState) -> Result<Self, PartyError> {
        Ok(Self {
            route: party_core::constants::routes::STATE_RESPONSE.to_string(),
            version: None,
            payload: serde_json::to_value(state)?,
        })
    }
}

/// One established group session.
#[async_trait]
pub trait GroupConnection: Send + Sync {
    /// Identifier of the joined group session.
    fn session_id(&self) -> String;

    /// Identifier of the local user on this session.
    fn local_user_id(&self) -> String;

    /// Protocol version advertised by the server, if any.
    fn server_protocol_version(&self) -> Option<String> {
        None
    }

    /// Call a remote procedure.
    async fn call(&self, route: &str, payload: Value) -> Result<Value, PartyError>;

    /// Close the session. The link's `closed` channel fires afterwards.
    async fn disconnect(&self) -> Result<(), PartyError>;
}

/// Everything produced by connecting to a group session.
pub struct GroupLink {
    /// Call surface.
    pub connection: Arc<dyn GroupConnection>,
    /// Pushes in delivery order. Consumed by a single task, which makes it
    /// the serialized dispatcher for remote mutations.
    pub pushes: mpsc::UnboundedReceiver<PushMessage>,
    /// Fires once with the transport's disconnection reason.
    pub closed: oneshot::Receiver<String>,
}

/// Creates and connects to group sessions.
#[async_trait]
pub trait GroupConnector: Send + Sync {
    /// Create a new group session, returning a connection token.
    async fn create_session(&self, request: &GroupRequest) -> Result<String, PartyError>;

    /// Exchange a session id (from an invitation) for a connection token.
    async fn connection_token(&self, session_id: &str) -> Result<String, PartyError>;

    /// Connect to a session using a token.
    async fn connect(&self, token: &str) -> Result<GroupLink, PartyError>;
}

/// The matchmaking subsystem, seen from the client.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MatchmakingClient: Send + Sync {
    /// Connect to a profile. Should return early when `cancel` fires.
    async fn connect(&self, profile: &str, cancel: CancellationToken) -> Result<(), PartyError>;

    /// Disconnect from a profile.
    async fn disconnect(&self, profile: &str) -> Result<(), PartyError>;

    /// Events for every profile; consumers filter by profile name.
    fn subscribe(&self) -> broadcast::Receiver<MatchmakingEvent>;
}

/// Routed peer-to-peer invitation requests (`party.invite`).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InvitationChannel: Send + Sync {
    /// Invite `recipient_id` to `session_id`. Resolves when the recipient
    /// answers; dropping the future cancels the request.
    async fn send_invitation(&self, recipient_id: &str, session_id: &str) -> Result<(), PartyError>;
}
