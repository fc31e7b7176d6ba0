//! Outbound invitations, deduplicated by recipient.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use parking_lot::Mutex;
use party_core::PartyError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transport::InvitationChannel;

/// Completion of one outbound request, shared by every caller inviting the
/// same recipient.
pub type InvitationTask = Shared<BoxFuture<'static, Result<(), PartyError>>>;

struct OutboundEntry {
    id: u64,
    cancel: CancellationToken,
    task: InvitationTask,
}

struct OutboundInner {
    channel: Arc<dyn InvitationChannel>,
    entries: Mutex<HashMap<String, OutboundEntry>>,
    next_id: AtomicU64,
}

impl OutboundInner {
    /// Remove and cancel the entry for `recipient`, if it is still request `id`.
    fn close(&self, recipient: &str, id: u64) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(recipient).is_some_and(|e| e.id == id) {
            if let Some(entry) = entries.remove(recipient) {
                entry.cancel.cancel();
            }
            true
        } else {
            false
        }
    }
}

/// Pending invitations this client has sent.
pub struct OutboundInvitations {
    inner: Arc<OutboundInner>,
}

impl OutboundInvitations {
    /// Create an empty tracker sending through `channel`.
    pub fn new(channel: Arc<dyn InvitationChannel>) -> Self {
        Self {
            inner: Arc::new(OutboundInner {
                channel,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Invite `recipient` to `session_id`.
    ///
    /// Joins the outstanding request when one to this recipient exists.
    /// Cancelling `cancel` cancels the shared request for every caller.
    pub fn invite(&self, recipient: &str, session_id: &str, cancel: CancellationToken) -> InvitationTask {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get(recipient) {
            trace!(recipient, "joining outstanding invitation");
            let task = entry.task.clone();
            self.watch_caller(recipient, entry.id, cancel, task.clone());
            return task;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let task = send_request(
            Arc::downgrade(&self.inner),
            recipient.to_string(),
            session_id.to_string(),
            token.clone(),
            id,
        )
        .boxed()
        .shared();
        let _ = entries.insert(
            recipient.to_string(),
            OutboundEntry {
                id,
                cancel: token,
                task: task.clone(),
            },
        );
        drop(entries);

        counter!("party_invitations_sent_total").increment(1);
        debug!(recipient, session_id, "sending invitation");
        drop(tokio::spawn(task.clone()));
        self.watch_caller(recipient, id, cancel, task.clone());
        task
    }

    /// Cancel the outstanding request to `recipient`. No-op when there is none.
    pub fn cancel(&self, recipient: &str) {
        if let Some(entry) = self.inner.entries.lock().remove(recipient) {
            debug!(recipient, "invitation cancelled");
            entry.cancel.cancel();
        }
    }

    /// Recipients with an outstanding request, sorted.
    pub fn pending(&self) -> Vec<String> {
        let mut recipients: Vec<String> = self.inner.entries.lock().keys().cloned().collect();
        recipients.sort();
        recipients
    }

    /// Close request `id` when the caller's token fires before it settles.
    fn watch_caller(&self, recipient: &str, id: u64, cancel: CancellationToken, task: InvitationTask) {
        let weak = Arc::downgrade(&self.inner);
        let recipient = recipient.to_string();
        drop(tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    if let Some(inner) = weak.upgrade()
                        && inner.close(&recipient, id)
                    {
                        debug!(recipient, "invitation cancelled by caller");
                    }
                }
                _ = task => {}
            }
        }));
    }
}

impl Drop for OutboundInvitations {
    fn drop(&mut self) {
        for (_, entry) in self.inner.entries.lock().drain() {
            entry.cancel.cancel();
        }
    }
}

async fn send_request(
    weak: Weak<OutboundInner>,
    recipient: String,
    session_id: String,
    token: CancellationToken,
    id: u64,
) -> Result<(), PartyError> {
    let Some(channel) = weak.upgrade().map(|inner| Arc::clone(&inner.channel)) else {
        return Err(PartyError::Cancelled);
    };
    let result = tokio::select! {
        biased;
        () = token.cancelled() => Err(PartyError::Cancelled),
        r = channel.send_invitation(&recipient, &session_id) => r,
    };
    if let Some(inner) = weak.upgrade() {
        let _ = inner.close(&recipient, id);
    }
    trace!(recipient, ok = result.is_ok(), "invitation settled");
    result
}
