//! Group manager — the public surface of the party client.
//!
//! Holds at most one group session. Create/join/leave are serialized
//! through a chained leave task: a join first waits for the previous leave
//! to finish, so two sessions never overlap. Joining is reported (and
//! settings/members events start flowing) only after the first snapshot
//! has arrived and every join hook has succeeded.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use party_core::PartyError;
use party_core::constants::PROTOCOL_VERSION;
use party_core::events::GroupEvent;
use party_core::types::{
    GroupInvitation, GroupRequest, GroupSettings, LeaveReason, MemberInfo, MemberStatus, SettingsUpdate,
};
use party_settings::ClientSettings;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::emitter::EventEmitter;
use crate::hooks::{HookRegistry, SessionHook, run_join_hooks};
use crate::invitations::{InboundInvitations, InvitationOutcome, InvitationTask, OutboundInvitations};
use crate::session::active::{ActiveSession, leave_reason};
use crate::sync::SyncEngine;
use crate::transport::{GroupConnector, GroupLink, InvitationChannel, MatchmakingClient};

type LeaveTask = Shared<BoxFuture<'static, ()>>;

/// Where the manager is in the session lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipState {
    /// Not in a group.
    Idle,
    /// Connecting, waiting for the first snapshot, or running join hooks.
    Joining,
    /// In a group.
    Joined,
}

/// A join in progress.
#[derive(Clone)]
struct JoinAttempt {
    id: u64,
    cancel: CancellationToken,
    /// Resolves once the join has returned, including any abort.
    done: LeaveTask,
}

enum Membership {
    Idle,
    Joining(JoinAttempt),
    Joined(Arc<ActiveSession>),
}

struct ManagerState {
    membership: Membership,
    /// Latest leave; every join waits for it first.
    leave_task: LeaveTask,
    next_join: u64,
}

/// Returns the manager to `Idle` when a join ends without joining, unless a
/// leave or a newer join has already moved it on. Dropping it resolves the
/// attempt's `done` future.
struct JoinGuard<'a> {
    manager: &'a GroupManager,
    id: u64,
    _done: oneshot::Sender<()>,
}

impl Drop for JoinGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.manager.state.lock();
        if matches!(&state.membership, Membership::Joining(a) if a.id == self.id) {
            state.membership = Membership::Idle;
        }
    }
}

/// Client-side group session manager.
pub struct GroupManager {
    connector: Arc<dyn GroupConnector>,
    matchmaking: Arc<dyn MatchmakingClient>,
    settings: ClientSettings,
    events: Arc<EventEmitter<GroupEvent>>,
    hooks: Arc<RwLock<HookRegistry>>,
    outbound: OutboundInvitations,
    inbound: InboundInvitations,
    state: Mutex<ManagerState>,
}

impl GroupManager {
    /// Create an idle manager.
    pub fn new(
        connector: Arc<dyn GroupConnector>,
        matchmaking: Arc<dyn MatchmakingClient>,
        invitations: Arc<dyn InvitationChannel>,
        settings: &ClientSettings,
    ) -> Arc<Self> {
        let events = Arc::new(EventEmitter::with_capacity(settings.events.channel_capacity));
        Arc::new(Self {
            connector,
            matchmaking,
            settings: settings.clone(),
            inbound: InboundInvitations::new(Arc::clone(&events)),
            events,
            hooks: Arc::new(RwLock::new(HookRegistry::new())),
            outbound: OutboundInvitations::new(invitations),
            state: Mutex::new(ManagerState {
                membership: Membership::Idle,
                leave_task: futures::future::ready(()).boxed().shared(),
                next_join: 0,
            }),
        })
    }

    /// Subscribe to every group, invitation and matchmaking event.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    /// Register a join/leave hook. Replaces a hook with the same name.
    pub fn register_hook(&self, hook: Arc<dyn SessionHook>) {
        self.hooks.write().register(hook);
    }

    /// Remove a hook by name.
    pub fn unregister_hook(&self, name: &str) -> bool {
        self.hooks.write().unregister(name)
    }

    /// Current lifecycle state.
    pub fn membership(&self) -> MembershipState {
        match self.state.lock().membership {
            Membership::Idle => MembershipState::Idle,
            Membership::Joining(_) => MembershipState::Joining,
            Membership::Joined(_) => MembershipState::Joined,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Create a new group and join it.
    #[instrument(skip(self, request), fields(profile = %request.matchmaking_profile_name))]
    pub async fn create_group(self: &Arc<Self>, request: GroupRequest) -> Result<(), PartyError> {
        self.ensure_idle()?;
        let request = request.normalized();
        let token = self.connector.create_session(&request).await?;
        self.join_by_token(&token).await
    }

    /// Join the group the pending invitation from `sender_id` points to.
    #[instrument(skip(self))]
    pub async fn join_by_invitation(self: &Arc<Self>, sender_id: &str) -> Result<(), PartyError> {
        self.ensure_idle()?;
        let invitation = self.inbound.accept(sender_id)?;
        let token = self.connector.connection_token(&invitation.session_id).await?;
        self.join_by_token(&token).await
    }

    /// Join a group session with a connection token.
    ///
    /// Resolves once the first snapshot has been applied and every join
    /// hook has run. Fails with `AlreadyInGroup` unless idle, and with
    /// `Cancelled` when [`leave`](Self::leave) is called meanwhile.
    #[instrument(skip(self, token))]
    pub async fn join_by_token(self: &Arc<Self>, token: &str) -> Result<(), PartyError> {
        let (guard, cancel, previous_leave) = {
            let mut state = self.state.lock();
            if !matches!(state.membership, Membership::Idle) {
                return Err(PartyError::AlreadyInGroup);
            }
            state.next_join += 1;
            let (done_tx, done_rx) = oneshot::channel::<()>();
            let attempt = JoinAttempt {
                id: state.next_join,
                cancel: CancellationToken::new(),
                done: async move {
                    let _ = done_rx.await;
                }
                .boxed()
                .shared(),
            };
            let guard = JoinGuard {
                manager: self,
                id: attempt.id,
                _done: done_tx,
            };
            let cancel = attempt.cancel.clone();
            state.membership = Membership::Joining(attempt);
            (guard, cancel, state.leave_task.clone())
        };
        previous_leave.await;

        let session = match self.establish(token, &cancel).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "failed to join group session");
                return Err(e);
            }
        };

        let outcome = {
            let mut state = self.state.lock();
            let still_joining = matches!(
                &state.membership,
                Membership::Joining(a) if a.id == guard.id && !a.cancel.is_cancelled()
            );
            if session.is_ending() {
                Err(PartyError::Disconnected)
            } else if !still_joining {
                Err(PartyError::Cancelled)
            } else {
                session.mark_joined();
                state.membership = Membership::Joined(Arc::clone(&session));
                let (snapshot, engine_events) = session.engine.snapshot_and_subscribe();
                let _ = self.events.emit(GroupEvent::Joined {
                    session_id: session.session_id().to_string(),
                });
                let _ = self.events.emit(GroupEvent::MembersUpdated {
                    members: snapshot.members,
                });
                let _ = self.events.emit(GroupEvent::SettingsUpdated {
                    settings: snapshot.settings,
                });
                session.forward_engine_events(engine_events);
                session.forward_matchmaking_events(self.matchmaking.subscribe());
                Ok(())
            }
        };
        if let Err(e) = outcome {
            abort(&session).await;
            return Err(e);
        }

        info!(session_id = %session.session_id(), "joined group session");
        Ok(())
    }

    async fn establish(
        self: &Arc<Self>,
        token: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<ActiveSession>, PartyError> {
        let link = tokio::select! {
            () = cancel.cancelled() => return Err(PartyError::Cancelled),
            r = self.connector.connect(token) => r?,
        };
        let GroupLink {
            connection,
            pushes,
            closed,
        } = link;
        info!(
            session_id = %connection.session_id(),
            client_protocol = PROTOCOL_VERSION,
            server_protocol = connection.server_protocol_version().as_deref().unwrap_or("unknown"),
            "connected to group session"
        );

        let engine = SyncEngine::new(
            Arc::clone(&connection),
            Arc::clone(&self.matchmaking),
            self.settings.sync.clone(),
            self.settings.events.channel_capacity,
        );
        engine.start(pushes);
        let session = ActiveSession::new(
            engine,
            connection,
            Arc::clone(&self.events),
            Arc::clone(&self.hooks),
        );
        self.watch_closed(&session, closed);

        let ready = tokio::select! {
            () = cancel.cancelled() => Err(PartyError::Cancelled),
            r = session.engine.wait_for_initial_state() => r,
        };
        if let Err(e) = ready {
            abort(&session).await;
            return Err(e);
        }

        let hooks = self.hooks.read().hooks();
        if let Err(e) = run_join_hooks(&hooks, &session.context(None)).await {
            abort(&session).await;
            return Err(e.into());
        }
        Ok(session)
    }

    /// Tear the session down when the transport reports it closed.
    fn watch_closed(self: &Arc<Self>, session: &Arc<ActiveSession>, closed: oneshot::Receiver<String>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let session = Arc::clone(session);
        drop(tokio::spawn(async move {
            let reason = tokio::select! {
                r = closed => r.unwrap_or_default(),
                () = session.stopped() => return,
            };
            debug!(session_id = %session.session_id(), reason, "group session closed");
            session.teardown(leave_reason(&reason)).await;
            if let Some(manager) = weak.upgrade() {
                let mut state = manager.state.lock();
                if matches!(&state.membership, Membership::Joined(s) if Arc::ptr_eq(s, &session)) {
                    state.membership = Membership::Idle;
                }
            }
        }));
    }

    /// Leave the current group.
    ///
    /// While joining, cancels the join instead and resolves once it has
    /// unwound. Fails with `NotInGroup` when idle.
    #[instrument(skip(self))]
    pub async fn leave(self: &Arc<Self>) -> Result<(), PartyError> {
        let task = {
            let mut state = self.state.lock();
            let task = match std::mem::replace(&mut state.membership, Membership::Idle) {
                Membership::Idle => return Err(PartyError::NotInGroup),
                Membership::Joining(attempt) => {
                    debug!("leave requested while joining, cancelling join");
                    attempt.cancel.cancel();
                    attempt.done
                }
                Membership::Joined(session) => async move {
                    session.disconnect().await;
                    session.teardown(LeaveReason::Left).await;
                }
                .boxed()
                .shared(),
            };
            state.leave_task = task.clone();
            task
        };
        drop(tokio::spawn(task.clone()));
        task.await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Joined session id.
    pub fn session_id(&self) -> Result<String, PartyError> {
        Ok(self.session()?.session_id().to_string())
    }

    /// Group settings.
    pub fn settings(&self) -> Result<GroupSettings, PartyError> {
        Ok(self.session()?.engine.settings())
    }

    /// Group members.
    pub fn members(&self) -> Result<Vec<MemberInfo>, PartyError> {
        Ok(self.session()?.engine.members())
    }

    /// The local user's member entry.
    pub fn local_member(&self) -> Result<MemberInfo, PartyError> {
        self.session()?.engine.local_member().ok_or(PartyError::NotInGroup)
    }

    /// Leader's user id.
    pub fn leader_id(&self) -> Result<String, PartyError> {
        Ok(self.session()?.engine.leader_id())
    }

    /// Whether the local user leads the group.
    pub fn is_leader(&self) -> Result<bool, PartyError> {
        Ok(self.session()?.engine.is_leader())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Replace the group settings.
    pub async fn update_settings(&self, update: SettingsUpdate) -> Result<(), PartyError> {
        self.session()?.engine.update_settings(update).await
    }

    /// Change the local member's readiness.
    pub async fn update_local_readiness(&self, status: MemberStatus) -> Result<(), PartyError> {
        self.session()?.engine.update_local_readiness(status).await
    }

    /// Replace the local member's user data.
    pub async fn update_user_data(&self, data: impl Into<String>) -> Result<(), PartyError> {
        self.session()?.engine.update_user_data(data.into()).await
    }

    /// Hand leadership to `user_id`.
    pub async fn promote_leader(&self, user_id: &str) -> Result<(), PartyError> {
        self.session()?.engine.promote_leader(user_id).await
    }

    /// Remove `user_id` from the group.
    pub async fn kick_member(&self, user_id: &str) -> Result<(), PartyError> {
        self.session()?.engine.kick_member(user_id).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Invitations
    // ─────────────────────────────────────────────────────────────────────

    /// Invite `recipient_id` to the current group.
    pub fn invite(&self, recipient_id: &str, cancel: CancellationToken) -> Result<InvitationTask, PartyError> {
        let session = self.session()?;
        Ok(self.outbound.invite(recipient_id, session.session_id(), cancel))
    }

    /// Cancel the outstanding invitation to `recipient_id`, if any.
    pub fn cancel_invitation(&self, recipient_id: &str) {
        self.outbound.cancel(recipient_id);
    }

    /// Recipients of outstanding invitations.
    pub fn sent_pending_invitations(&self) -> Vec<String> {
        self.outbound.pending()
    }

    /// Invitations waiting for an answer.
    pub fn pending_invitations(&self) -> Vec<GroupInvitation> {
        self.inbound.pending()
    }

    /// Decline the pending invitation from `sender_id`.
    pub fn decline_invitation(&self, sender_id: &str) -> Result<(), PartyError> {
        self.inbound.decline(sender_id)
    }

    /// Handle an invitation delivered by the transport; resolves when the
    /// invitation is answered, superseded or withdrawn.
    pub async fn receive_invitation(
        &self,
        sender_id: &str,
        session_id: &str,
        remote_cancel: CancellationToken,
    ) -> InvitationOutcome {
        self.inbound.receive(sender_id, session_id, remote_cancel).await
    }

    fn session(&self) -> Result<Arc<ActiveSession>, PartyError> {
        match &self.state.lock().membership {
            Membership::Joined(session) => Ok(Arc::clone(session)),
            Membership::Idle | Membership::Joining(_) => Err(PartyError::NotInGroup),
        }
    }

    fn ensure_idle(&self) -> Result<(), PartyError> {
        match self.state.lock().membership {
            Membership::Idle => Ok(()),
            Membership::Joining(_) | Membership::Joined(_) => Err(PartyError::AlreadyInGroup),
        }
    }
}

impl Drop for GroupManager {
    fn drop(&mut self) {
        let membership = std::mem::replace(&mut self.state.get_mut().membership, Membership::Idle);
        match membership {
            Membership::Joined(session) => {
                session.halt();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    drop(handle.spawn(async move { session.disconnect().await }));
                }
            }
            Membership::Joining(attempt) => attempt.cancel.cancel(),
            Membership::Idle => {}
        }
    }
}

/// Undo a join that did not complete.
async fn abort(session: &ActiveSession) {
    session.disconnect().await;
    session.teardown(LeaveReason::Left).await;
}
