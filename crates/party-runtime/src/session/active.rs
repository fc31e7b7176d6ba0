//! One joined (or joining) group session and its teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use party_core::constants::KICKED_DISCONNECT_REASON;
use party_core::events::GroupEvent;
use party_core::types::{LeaveReason, MatchmakingEvent, MatchmakingEventKind};
use tokio::sync::{OnceCell, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emitter::EventEmitter;
use crate::hooks::{HookRegistry, SessionContext, run_leave_hooks};
use crate::sync::SyncEngine;
use crate::transport::GroupConnection;

/// Map a transport disconnection reason to a leave reason.
pub fn leave_reason(disconnect_reason: &str) -> LeaveReason {
    if disconnect_reason == KICKED_DISCONNECT_REASON {
        LeaveReason::Kicked
    } else {
        LeaveReason::Left
    }
}

/// Map a matchmaking event to the group event it surfaces as.
pub fn matchmaking_event(event: MatchmakingEvent) -> GroupEvent {
    match event.kind {
        MatchmakingEventKind::StatusChanged { status } => GroupEvent::MatchmakingStatusChanged { status },
        MatchmakingEventKind::GameFound { details } => GroupEvent::GameFound {
            profile: event.profile,
            details,
        },
        MatchmakingEventKind::Failed { reason } => GroupEvent::MatchmakingFailed {
            profile: event.profile,
            reason,
        },
    }
}

/// A connected session: the engine plus the tasks that serve it.
pub(crate) struct ActiveSession {
    pub(crate) engine: Arc<SyncEngine>,
    pub(crate) connection: Arc<dyn GroupConnection>,
    events: Arc<EventEmitter<GroupEvent>>,
    hooks: Arc<RwLock<HookRegistry>>,
    /// Ends the session's background tasks. Cancelled when teardown starts.
    stop: CancellationToken,
    /// Set once the join has been reported; gates leave hooks and `Left`.
    joined: AtomicBool,
    teardown: OnceCell<()>,
}

impl ActiveSession {
    pub(crate) fn new(
        engine: Arc<SyncEngine>,
        connection: Arc<dyn GroupConnection>,
        events: Arc<EventEmitter<GroupEvent>>,
        hooks: Arc<RwLock<HookRegistry>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            connection,
            events,
            hooks,
            stop: CancellationToken::new(),
            joined: AtomicBool::new(false),
            teardown: OnceCell::new(),
        })
    }

    pub(crate) fn session_id(&self) -> &str {
        self.engine.session_id()
    }

    pub(crate) fn context(&self, reason: Option<LeaveReason>) -> SessionContext {
        let state = self.engine.snapshot();
        SessionContext {
            session_id: self.session_id().to_string(),
            local_user_id: self.engine.local_user_id().to_string(),
            leader_id: state.leader_id,
            settings: state.settings,
            reason,
        }
    }

    /// Whether teardown has started.
    pub(crate) fn is_ending(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Resolves once teardown has started.
    pub(crate) async fn stopped(&self) {
        self.stop.cancelled().await;
    }

    /// Stop background tasks and the engine without running teardown.
    pub(crate) fn halt(&self) {
        self.stop.cancel();
        self.engine.close();
    }

    pub(crate) fn mark_joined(&self) {
        self.joined.store(true, Ordering::SeqCst);
    }

    /// Run teardown once: leave hooks and `Left` (only if the join was
    /// reported), then stop the engine. Later calls wait for the first.
    pub(crate) async fn teardown(&self, reason: LeaveReason) {
        let _ = self
            .teardown
            .get_or_init(|| async {
                self.stop.cancel();
                if self.joined.load(Ordering::SeqCst) {
                    let hooks = self.hooks.read().hooks();
                    let failures = run_leave_hooks(&hooks, &self.context(Some(reason))).await;
                    if failures > 0 {
                        warn!(session_id = %self.session_id(), failures, "leave hooks failed");
                    }
                    let _ = self.events.emit(GroupEvent::Left {
                        session_id: self.session_id().to_string(),
                        reason,
                    });
                    info!(session_id = %self.session_id(), ?reason, "left group session");
                }
                self.engine.close();
            })
            .await;
    }

    /// Disconnect the transport, logging failures.
    pub(crate) async fn disconnect(&self) {
        if let Err(e) = self.connection.disconnect().await {
            warn!(session_id = %self.session_id(), error = %e, "group disconnect failed");
        }
    }

    /// Forward engine events to the public stream until teardown.
    pub(crate) fn forward_engine_events(self: &Arc<Self>, mut rx: broadcast::Receiver<GroupEvent>) {
        let session = Arc::clone(self);
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = session.stop.cancelled() => break,
                    r = rx.recv() => match r {
                        Ok(event) => {
                            let _ = session.events.emit(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "group event forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));
    }

    /// Forward matchmaking events for the group's current profile.
    pub(crate) fn forward_matchmaking_events(self: &Arc<Self>, mut rx: broadcast::Receiver<MatchmakingEvent>) {
        let session = Arc::clone(self);
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = session.stop.cancelled() => break,
                    r = rx.recv() => match r {
                        Ok(event) => {
                            if event.profile == session.engine.settings().matchmaking_profile_name {
                                let _ = session.events.emit(matchmaking_event(event));
                            } else {
                                debug!(profile = %event.profile, "ignoring matchmaking event for another profile");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "matchmaking event forwarder lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }));
    }
}
