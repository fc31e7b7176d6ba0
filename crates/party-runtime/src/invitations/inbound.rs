//! Inbound invitations, at most one pending per sender.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use parking_lot::Mutex;
use party_core::PartyError;
use party_core::events::GroupEvent;
use party_core::types::GroupInvitation;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emitter::EventEmitter;

/// How a received invitation was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvitationOutcome {
    /// The local user accepted it.
    Accepted,
    /// The local user declined it.
    Declined,
    /// A newer invitation from the same sender replaced it.
    Superseded,
    /// The sender cancelled it, or the coordinator went away.
    Canceled,
}

struct InboundEntry {
    id: u64,
    invitation: GroupInvitation,
    resolve: oneshot::Sender<InvitationOutcome>,
}

/// Withdraws one `receive` call's entry when the call ends or its future is
/// dropped, unless the entry was already answered or superseded.
struct PendingGuard<'a> {
    owner: &'a InboundInvitations,
    sender_id: &'a str,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.owner.entries.lock();
        if entries.get(self.sender_id).is_some_and(|e| e.id == self.id) {
            let _ = entries.remove(self.sender_id);
            debug!(sender_id = self.sender_id, "invitation withdrawn");
            let _ = self.owner.events.emit(GroupEvent::InvitationCanceled {
                sender_id: self.sender_id.to_string(),
            });
        }
    }
}

/// Pending invitations other users have sent to this client.
pub struct InboundInvitations {
    entries: Mutex<HashMap<String, InboundEntry>>,
    events: Arc<EventEmitter<GroupEvent>>,
    next_id: AtomicU64,
}

impl InboundInvitations {
    /// Create an empty tracker raising events on `events`.
    pub fn new(events: Arc<EventEmitter<GroupEvent>>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Record an invitation from `sender_id` and wait until it is resolved.
    ///
    /// A pending invitation from the same sender is superseded first.
    /// `remote_cancel` is the transport's signal that the sender withdrew
    /// the request; dropping the returned future withdraws it as well. The
    /// transport may release the request once this returns.
    pub async fn receive(
        &self,
        sender_id: &str,
        session_id: &str,
        remote_cancel: CancellationToken,
    ) -> InvitationOutcome {
        let invitation = GroupInvitation::new(sender_id, session_id);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut entries = self.entries.lock();
            if let Some(previous) = entries.remove(sender_id) {
                debug!(sender_id, "superseding pending invitation");
                let _ = previous.resolve.send(InvitationOutcome::Superseded);
                let _ = self.events.emit(GroupEvent::InvitationCanceled {
                    sender_id: sender_id.to_string(),
                });
            }
            let _ = entries.insert(
                sender_id.to_string(),
                InboundEntry {
                    id,
                    invitation: invitation.clone(),
                    resolve: tx,
                },
            );
            let _ = self.events.emit(GroupEvent::InvitationReceived { invitation });
        }
        let _guard = PendingGuard {
            owner: self,
            sender_id,
            id,
        };
        counter!("party_invitations_received_total").increment(1);
        info!(sender_id, session_id, "invitation received");

        tokio::select! {
            biased;
            outcome = rx => outcome.unwrap_or(InvitationOutcome::Canceled),
            () = remote_cancel.cancelled() => InvitationOutcome::Canceled,
        }
    }

    /// Accept the pending invitation from `sender_id`.
    pub fn accept(&self, sender_id: &str) -> Result<GroupInvitation, PartyError> {
        let entry = self
            .entries
            .lock()
            .remove(sender_id)
            .ok_or(PartyError::InvalidInvitation)?;
        let _ = entry.resolve.send(InvitationOutcome::Accepted);
        Ok(entry.invitation)
    }

    /// Decline the pending invitation from `sender_id`.
    pub fn decline(&self, sender_id: &str) -> Result<(), PartyError> {
        let entry = self
            .entries
            .lock()
            .remove(sender_id)
            .ok_or(PartyError::InvalidInvitation)?;
        let _ = entry.resolve.send(InvitationOutcome::Declined);
        debug!(sender_id, "invitation declined");
        Ok(())
    }

    /// Pending invitations, oldest first.
    pub fn pending(&self) -> Vec<GroupInvitation> {
        let mut invitations: Vec<GroupInvitation> = self
            .entries
            .lock()
            .values()
            .map(|e| e.invitation.clone())
            .collect();
        invitations.sort_by_key(|i| i.received_at);
        invitations
    }
}
