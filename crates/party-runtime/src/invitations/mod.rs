//! Invitation coordination.
//!
//! Invitations are point-to-point handshakes carried by an
//! [`InvitationChannel`](crate::transport::InvitationChannel). They are not
//! tied to a joined group: offers can arrive, and sent requests can be
//! cancelled, while the client is between sessions.
//!
//! - [`OutboundInvitations`]: one request per recipient, shared by callers.
//! - [`InboundInvitations`]: one pending offer per sender; newer offers
//!   supersede older ones.

pub mod inbound;
pub mod outbound;

pub use inbound::{InboundInvitations, InvitationOutcome};
pub use outbound::{InvitationTask, OutboundInvitations};
