//! State synchronization engine — versioned group state with optimistic apply.
//!
//! Local mutations are applied to the cached [`GroupState`] first and sent
//! afterwards. Remote deltas are applied only when their version is the
//! direct successor of the cached one; anything else schedules a full
//! resync. A failed remote write also schedules a resync, so the
//! authoritative snapshot always supersedes a wrong local guess and there
//! is no explicit rollback path.
//!
//! Locking: one `parking_lot::Mutex` guards the state and the resync slot.
//! It is held for synchronous read/mutate/emit steps only, never across an
//! `.await`. Lock order is engine → liaison.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use party_core::constants::routes;
use party_core::events::GroupEvent;
use party_core::types::{
    BatchStatusUpdate, GroupSettings, GroupState, MemberDisconnection, MemberInfo, MemberStatus,
    MemberStatusUpdate, SettingsUpdate, StatusUpdateRequest, UserDataUpdate,
};
use party_core::PartyError;
use party_settings::SyncSettings;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::emitter::EventEmitter;
use crate::matchmaking::MatchmakingLiaison;
use crate::transport::{GroupConnection, MatchmakingClient, PushMessage};

type ResyncTask = Shared<BoxFuture<'static, ()>>;

struct EngineState {
    group: GroupState,
    /// The single in-flight full-state fetch, if any.
    resync: Option<ResyncTask>,
}

/// Owns the cached state of one joined group session.
pub struct SyncEngine {
    session_id: String,
    local_user_id: String,
    connection: Arc<dyn GroupConnection>,
    liaison: MatchmakingLiaison,
    state: Mutex<EngineState>,
    events: EventEmitter<GroupEvent>,
    initial_state: watch::Sender<bool>,
    closed: CancellationToken,
    config: SyncSettings,
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, PartyError> {
    Ok(serde_json::from_value(payload)?)
}

impl SyncEngine {
    /// Create an engine bound to `connection`, with its own matchmaking liaison.
    pub fn new(
        connection: Arc<dyn GroupConnection>,
        matchmaking: Arc<dyn MatchmakingClient>,
        config: SyncSettings,
        event_capacity: usize,
    ) -> Arc<Self> {
        let liaison = MatchmakingLiaison::new(matchmaking, Arc::clone(&connection));
        let (initial_state, _) = watch::channel(false);
        Arc::new(Self {
            session_id: connection.session_id(),
            local_user_id: connection.local_user_id(),
            connection,
            liaison,
            state: Mutex::new(EngineState {
                group: GroupState::default(),
                resync: None,
            }),
            events: EventEmitter::with_capacity(event_capacity),
            initial_state,
            closed: CancellationToken::new(),
            config,
        })
    }

    /// Start consuming pushes in delivery order.
    ///
    /// The dispatcher task holds only a weak handle and stops when the
    /// engine is closed or dropped, or when the transport drops its sender.
    pub fn start(self: &Arc<Self>, mut pushes: mpsc::UnboundedReceiver<PushMessage>) {
        let weak = Arc::downgrade(self);
        let closed = self.closed.clone();
        drop(tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    () = closed.cancelled() => break,
                    m = pushes.recv() => match m {
                        Some(m) => m,
                        None => break,
                    },
                };
                let Some(engine) = weak.upgrade() else { break };
                engine.handle_push(message);
            }
            trace!("push dispatcher stopped");
        }));
    }

    /// Stop the engine: end pending resyncs and retries, shut the liaison down.
    pub fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.liaison.shutdown();
        debug!(session_id = %self.session_id, "sync engine closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Session this engine is bound to.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Local user id.
    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Copy of the cached state.
    pub fn snapshot(&self) -> GroupState {
        self.state.lock().group.clone()
    }

    /// Current settings.
    pub fn settings(&self) -> GroupSettings {
        self.state.lock().group.settings.clone()
    }

    /// Current members.
    pub fn members(&self) -> Vec<MemberInfo> {
        self.state.lock().group.members.clone()
    }

    /// Current leader id.
    pub fn leader_id(&self) -> String {
        self.state.lock().group.leader_id.clone()
    }

    /// Cached protocol version.
    pub fn version(&self) -> u64 {
        self.state.lock().group.version
    }

    /// The local user's member entry.
    pub fn local_member(&self) -> Option<MemberInfo> {
        self.state.lock().group.member(&self.local_user_id).cloned()
    }

    /// Whether the local user leads the group.
    pub fn is_leader(&self) -> bool {
        self.state.lock().group.leader_id == self.local_user_id
    }

    /// Whether a full-state fetch is in flight.
    pub fn is_resyncing(&self) -> bool {
        self.state.lock().resync.is_some()
    }

    /// The matchmaking liaison following this group's profile.
    pub fn liaison(&self) -> &MatchmakingLiaison {
        &self.liaison
    }

    /// Subscribe to settings/members change events.
    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.events.subscribe()
    }

    /// Read the state and subscribe atomically, so no change falls between.
    pub fn snapshot_and_subscribe(&self) -> (GroupState, broadcast::Receiver<GroupEvent>) {
        let state = self.state.lock();
        (state.group.clone(), self.events.subscribe())
    }

    /// Resolve once the first authoritative snapshot has been applied.
    pub async fn wait_for_initial_state(&self) -> Result<(), PartyError> {
        let mut rx = self.initial_state.subscribe();
        tokio::select! {
            r = rx.wait_for(|ready| *ready) => r.map(|_| ()).map_err(|_| PartyError::Disconnected),
            () = self.closed.cancelled() => Err(PartyError::Disconnected),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local mutations
    // ─────────────────────────────────────────────────────────────────────

    /// Replace the group settings.
    ///
    /// Bumps the settings version and applies locally before sending. A
    /// stale-settings rejection is retried once after a resync (when
    /// enabled); any other failure resyncs and is returned.
    #[instrument(skip(self, update), fields(session_id = %self.session_id, profile = %update.matchmaking_profile_name))]
    pub async fn update_settings(self: &Arc<Self>, update: SettingsUpdate) -> Result<(), PartyError> {
        let update = update.normalized();
        let payload = serde_json::to_value(&update)?;
        let mut retried = false;
        loop {
            self.ensure_open()?;
            {
                let mut state = self.state.lock();
                let settings = GroupSettings {
                    matchmaking_profile_name: update.matchmaking_profile_name.clone(),
                    custom_data: update.custom_data.clone(),
                    settings_version: state.group.settings.settings_version + 1,
                };
                self.apply_settings_locked(&mut state, settings);
            }

            match self.connection.call(routes::UPDATE_SETTINGS, payload.clone()).await {
                Ok(_) => return Ok(()),
                Err(PartyError::SettingsOutdated) if self.config.settings_update_retry && !retried => {
                    debug!("settings outdated, resyncing before retry");
                    retried = true;
                    self.resync().await;
                }
                Err(e) => return self.sync_on_error(Err(e)),
            }
        }
    }

    /// Change the local member's readiness.
    ///
    /// No-op when unchanged. `Ready` is only sent once the matchmaking
    /// connection for the current profile has settled.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn update_local_readiness(self: &Arc<Self>, status: MemberStatus) -> Result<(), PartyError> {
        {
            let mut state = self.state.lock();
            let changed = state
                .group
                .member(&self.local_user_id)
                .is_some_and(|m| m.status != status);
            if !changed {
                return Ok(());
            }
            if state.group.settings.matchmaking_profile_name.is_empty() {
                return Err(PartyError::GroupNotReady);
            }
            let update = [MemberStatusUpdate {
                user_id: self.local_user_id.clone(),
                status,
            }];
            if state.group.apply_statuses(&update) {
                self.emit_members(&state.group);
            }
        }

        let result = self.update_status_with_retries(status).await;
        self.sync_on_error(result)
    }

    async fn update_status_with_retries(self: &Arc<Self>, status: MemberStatus) -> Result<(), PartyError> {
        let mut retries = 0u32;
        loop {
            self.ensure_open()?;
            if status == MemberStatus::Ready {
                self.liaison.wait_connected().await.map_err(|e| {
                    if self.closed.is_cancelled() {
                        PartyError::Disconnected
                    } else {
                        e
                    }
                })?;
            }
            let request = StatusUpdateRequest {
                desired_status: status,
                local_settings_version: self.state.lock().group.settings.settings_version,
            };

            match self
                .connection
                .call(routes::UPDATE_STATUS, serde_json::to_value(&request)?)
                .await
            {
                Ok(_) => return Ok(()),
                Err(PartyError::SettingsOutdated) => {
                    if self.config.readiness_max_retries.is_some_and(|max| retries >= max) {
                        warn!(retries, "readiness update still outdated, giving up");
                        return Err(PartyError::SettingsOutdated);
                    }
                    retries += 1;
                    counter!("party_readiness_retries_total").increment(1);
                    debug!(retries, "local settings outdated, resyncing before retry");
                    self.resync().await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace the local member's user data.
    #[instrument(skip(self, data), fields(session_id = %self.session_id))]
    pub async fn update_user_data(self: &Arc<Self>, data: String) -> Result<(), PartyError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if state.group.set_user_data(&self.local_user_id, &data) {
                self.emit_members(&state.group);
            }
        }
        let result = self
            .connection
            .call(routes::UPDATE_USER_DATA, Value::String(data))
            .await;
        self.sync_on_error(result.map(|_| ()))
    }

    /// Hand leadership to `user_id`. Leader only.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn promote_leader(self: &Arc<Self>, user_id: &str) -> Result<(), PartyError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if state.group.leader_id != self.local_user_id {
                return Err(PartyError::Unauthorized);
            }
            if state.group.set_leader(user_id) {
                self.emit_members(&state.group);
            }
        }
        let result = self
            .connection
            .call(routes::PROMOTE_LEADER, Value::String(user_id.to_string()))
            .await;
        self.sync_on_error(result.map(|_| ()))
    }

    /// Remove `user_id` from the group. Leader only.
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn kick_member(self: &Arc<Self>, user_id: &str) -> Result<(), PartyError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if state.group.leader_id != self.local_user_id {
                return Err(PartyError::Unauthorized);
            }
            if state.group.remove_member(user_id) {
                self.emit_members(&state.group);
            }
        }
        let result = self
            .connection
            .call(routes::KICK_PLAYER, Value::String(user_id.to_string()))
            .await;
        self.sync_on_error(result.map(|_| ()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Remote pushes
    // ─────────────────────────────────────────────────────────────────────

    /// Apply one server push.
    ///
    /// Snapshots replace the state unconditionally. Deltas must carry the
    /// direct successor of the cached version; otherwise they are dropped
    /// and a resync is scheduled.
    pub fn handle_push(self: &Arc<Self>, message: PushMessage) {
        let PushMessage {
            route,
            version,
            payload,
        } = message;
        let mut state = self.state.lock();

        if route == routes::STATE_RESPONSE {
            match decode::<GroupState>(payload) {
                Ok(snapshot) => self.apply_snapshot_locked(&mut state, snapshot),
                Err(e) => {
                    warn!(error = %e, "undecodable state snapshot, resyncing");
                    let _ = self.resync_locked(&mut state);
                }
            }
            return;
        }

        let Some(version) = version else {
            warn!(route, "delta push without version, resyncing");
            let _ = self.resync_locked(&mut state);
            return;
        };
        if !state.group.accept_version(version) {
            counter!("party_version_conflicts_total").increment(1);
            warn!(route, current = state.group.version, received = version, "version mismatch, resyncing");
            let _ = self.resync_locked(&mut state);
            return;
        }
        trace!(route, version, "applying push");

        if let Err(e) = self.apply_delta_locked(&mut state, &route, payload) {
            warn!(route, error = %e, "undecodable push, resyncing");
            let _ = self.resync_locked(&mut state);
        }
    }

    fn apply_delta_locked(&self, state: &mut EngineState, route: &str, payload: Value) -> Result<(), PartyError> {
        match route {
            routes::SETTINGS_UPDATED => {
                let settings: GroupSettings = decode(payload)?;
                self.apply_settings_locked(state, settings);
            }
            routes::MEMBER_DATA_UPDATED => {
                let update: UserDataUpdate = decode(payload)?;
                if state.group.set_user_data(&update.user_id, &update.user_data) {
                    self.emit_members(&state.group);
                }
            }
            routes::MEMBER_STATUS_UPDATED => {
                let batch: BatchStatusUpdate = decode(payload)?;
                if state.group.apply_statuses(&batch.member_status) {
                    self.emit_members(&state.group);
                }
            }
            routes::MEMBER_CONNECTED => {
                let member: MemberInfo = decode(payload)?;
                trace!(user_id = %member.user_id, "member connected");
                state.group.add_member(member);
                self.emit_members(&state.group);
            }
            routes::MEMBER_DISCONNECTED => {
                let message: MemberDisconnection = decode(payload)?;
                trace!(user_id = %message.user_id, reason = ?message.reason, "member disconnected");
                if state.group.remove_member(&message.user_id) {
                    self.emit_members(&state.group);
                }
            }
            routes::LEADER_CHANGED => {
                let leader_id: String = decode(payload)?;
                trace!(leader_id, "leader changed");
                if state.group.set_leader(&leader_id) {
                    self.emit_members(&state.group);
                }
            }
            other => debug!(route = other, "ignoring unknown push route"),
        }
        Ok(())
    }

    fn apply_snapshot_locked(&self, state: &mut EngineState, mut snapshot: GroupState) {
        snapshot.recompute_leader();
        trace!(version = snapshot.version, "received group state");
        state.group = snapshot;
        self.liaison
            .update_profile(&state.group.settings.matchmaking_profile_name);
        let _ = self.initial_state.send_replace(true);
        let _ = self.events.emit(GroupEvent::SettingsUpdated {
            settings: state.group.settings.clone(),
        });
        self.emit_members(&state.group);
    }

    fn apply_settings_locked(&self, state: &mut EngineState, settings: GroupSettings) {
        if state.group.apply_settings(settings) {
            self.liaison
                .update_profile(&state.group.settings.matchmaking_profile_name);
            let _ = self.events.emit(GroupEvent::SettingsUpdated {
                settings: state.group.settings.clone(),
            });
        }
    }

    fn emit_members(&self, group: &GroupState) {
        gauge!("party_members").set(group.members.len() as f64);
        let _ = self.events.emit(GroupEvent::MembersUpdated {
            members: group.members.clone(),
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Resync
    // ─────────────────────────────────────────────────────────────────────

    /// Fetch the full state, joining the in-flight fetch if there is one.
    ///
    /// Retries failed fetches after a fixed delay until one succeeds or the
    /// engine is closed.
    pub async fn resync(self: &Arc<Self>) {
        let task = {
            let mut state = self.state.lock();
            self.resync_locked(&mut state)
        };
        task.await;
    }

    /// Start a resync without waiting for it.
    pub fn schedule_resync(self: &Arc<Self>) {
        let mut state = self.state.lock();
        let _ = self.resync_locked(&mut state);
    }

    fn resync_locked(self: &Arc<Self>, state: &mut EngineState) -> ResyncTask {
        if self.closed.is_cancelled() {
            return futures::future::ready(()).boxed().shared();
        }
        if let Some(task) = &state.resync {
            return task.clone();
        }

        let weak = Arc::downgrade(self);
        let delay = Duration::from_millis(self.config.resync_retry_delay_ms);
        let closed = self.closed.clone();
        let task = fetch_until_applied(weak, closed, delay).boxed().shared();
        state.resync = Some(task.clone());
        drop(tokio::spawn(task.clone()));
        task
    }

    fn sync_on_error<T>(self: &Arc<Self>, result: Result<T, PartyError>) -> Result<T, PartyError> {
        if let Err(e) = &result {
            debug!(error = %e, "remote update failed, resyncing");
            self.schedule_resync();
        }
        result
    }

    fn ensure_open(&self) -> Result<(), PartyError> {
        if self.closed.is_cancelled() {
            Err(PartyError::Disconnected)
        } else {
            Ok(())
        }
    }
}

/// Runs as the engine's single resync task. Every exit clears the
/// in-flight slot in the same critical section that ends the resync, so a
/// gap detected afterwards always starts a fresh fetch.
async fn fetch_until_applied(weak: Weak<SyncEngine>, closed: CancellationToken, delay: Duration) {
    loop {
        let connection = match weak.upgrade() {
            Some(engine) => Arc::clone(&engine.connection),
            None => return,
        };

        let result = tokio::select! {
            () = closed.cancelled() => break,
            r = connection.call(routes::GET_STATE, Value::Null) => r,
        };

        match result.and_then(decode::<GroupState>) {
            Ok(snapshot) => {
                counter!("party_resyncs_total", "status" => "success").increment(1);
                if let Some(engine) = weak.upgrade() {
                    let mut state = engine.state.lock();
                    state.resync = None;
                    engine.apply_snapshot_locked(&mut state, snapshot);
                }
                return;
            }
            Err(e) => {
                counter!("party_resyncs_total", "status" => "failure").increment(1);
                error!(error = %e, "full state fetch failed, retrying");
                tokio::select! {
                    () = closed.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    if let Some(engine) = weak.upgrade() {
        engine.state.lock().resync = None;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testutil::{FakeConnection, FakeMatchmaking, group_state};
    use assert_matches::assert_matches;
    use party_core::types::LeaveReason;
    use serde_json::json;

    fn make_engine_with(config: SyncSettings) -> (Arc<SyncEngine>, Arc<FakeConnection>, Arc<FakeMatchmaking>) {
        let connection = Arc::new(FakeConnection::new("s1", "me"));
        let matchmaking = Arc::new(FakeMatchmaking::new());
        let engine = SyncEngine::new(connection.clone(), matchmaking.clone(), config, 64);
        (engine, connection, matchmaking)
    }

    fn make_engine() -> (Arc<SyncEngine>, Arc<FakeConnection>, Arc<FakeMatchmaking>) {
        make_engine_with(SyncSettings::default())
    }

    /// Engine holding `state` as its first snapshot.
    fn joined_engine(state: &GroupState) -> (Arc<SyncEngine>, Arc<FakeConnection>, Arc<FakeMatchmaking>) {
        let (engine, connection, matchmaking) = make_engine();
        engine.handle_push(PushMessage::snapshot(state).unwrap());
        (engine, connection, matchmaking)
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn drain(rx: &mut broadcast::Receiver<GroupEvent>) -> Vec<GroupEvent> {
        let mut events = vec![];
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    // --- Snapshots ---

    #[tokio::test]
    async fn snapshot_replaces_state_and_emits() {
        let (engine, _, _) = make_engine();
        let mut rx = engine.subscribe();

        engine.handle_push(PushMessage::snapshot(&group_state(&["me", "bob"], "bob", 5)).unwrap());

        assert_eq!(engine.version(), 5);
        assert_eq!(engine.leader_id(), "bob");
        assert!(!engine.is_leader());
        assert!(engine.members().iter().any(|m| m.user_id == "bob" && m.is_leader));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type(), "settings_updated");
        assert_eq!(events[1].event_type(), "members_updated");
    }

    #[tokio::test]
    async fn wait_for_initial_state_resolves_on_snapshot() {
        let (engine, _, _) = make_engine();
        let waiter = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.wait_for_initial_state().await }
        });
        settle().await;
        assert!(!waiter.is_finished());

        engine.handle_push(PushMessage::snapshot(&group_state(&["me"], "me", 1)).unwrap());
        assert!(waiter.await.unwrap().is_ok());

        // Already received: resolves immediately.
        engine.wait_for_initial_state().await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_initial_state_fails_when_closed() {
        let (engine, _, _) = make_engine();
        engine.close();
        assert_matches!(engine.wait_for_initial_state().await, Err(PartyError::Disconnected));
    }

    #[tokio::test]
    async fn snapshot_connects_matchmaking_profile() {
        let (engine, _, matchmaking) = joined_engine(&group_state(&["me"], "me", 1));
        engine.liaison().wait_connected().await.unwrap();
        assert_eq!(matchmaking.connects(), vec!["casual".to_string()]);
    }

    // --- Version gating ---

    #[tokio::test]
    async fn successor_delta_applies() {
        let (engine, connection, _) = joined_engine(&group_state(&["me", "bob"], "me", 5));
        let mut rx = engine.subscribe();

        engine.handle_push(PushMessage::delta(
            routes::MEMBER_STATUS_UPDATED,
            6,
            json!({"memberStatus": [{"userId": "bob", "status": "ready"}]}),
        ));

        assert_eq!(engine.version(), 6);
        let bob = engine.members().into_iter().find(|m| m.user_id == "bob").unwrap();
        assert_eq!(bob.status, MemberStatus::Ready);
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(connection.calls_to(routes::GET_STATE).is_empty());
    }

    #[tokio::test]
    async fn gap_discards_delta_and_resyncs_once() {
        let (engine, connection, _) = joined_engine(&group_state(&["me", "bob"], "me", 5));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 9)).unwrap()));
        connection.set_delay(routes::GET_STATE, Duration::from_millis(50));

        engine.handle_push(PushMessage::delta(routes::LEADER_CHANGED, 8, json!("bob")));
        engine.handle_push(PushMessage::delta(routes::LEADER_CHANGED, 10, json!("bob")));
        assert_eq!(engine.version(), 5);
        assert_eq!(engine.leader_id(), "me");
        assert!(engine.is_resyncing());

        engine.resync().await;
        assert_eq!(connection.calls_to(routes::GET_STATE).len(), 1);
        assert_eq!(engine.version(), 9);
        assert!(!engine.is_resyncing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gap_seen_right_after_resync_starts_new_fetch() {
        let (engine, connection, _) = joined_engine(&group_state(&["me", "bob"], "me", 5));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 9)).unwrap()));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 12)).unwrap()));
        let mut rx = engine.subscribe();

        // Reacts to the resync snapshot as soon as it is published.
        let watcher = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move {
                while let Ok(event) = rx.recv().await {
                    if matches!(event, GroupEvent::MembersUpdated { .. }) && engine.version() == 9 {
                        engine.handle_push(PushMessage::delta(routes::LEADER_CHANGED, 11, json!("me")));
                        return engine.is_resyncing();
                    }
                }
                false
            }
        });

        engine.resync().await;
        assert!(watcher.await.unwrap());
        engine.resync().await;

        assert_eq!(connection.calls_to(routes::GET_STATE).len(), 2);
        assert_eq!(engine.version(), 12);
        assert!(!engine.is_resyncing());
    }

    #[tokio::test]
    async fn delta_before_snapshot_resyncs() {
        let (engine, connection, _) = make_engine();
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 3)).unwrap()));

        engine.handle_push(PushMessage::delta(routes::LEADER_CHANGED, 1, json!("me")));
        engine.resync().await;

        assert_eq!(connection.calls_to(routes::GET_STATE).len(), 1);
        assert_eq!(engine.version(), 3);
    }

    #[tokio::test]
    async fn undecodable_delta_resyncs() {
        let (engine, connection, _) = joined_engine(&group_state(&["me"], "me", 1));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 4)).unwrap()));

        engine.handle_push(PushMessage::delta(routes::MEMBER_CONNECTED, 2, json!(42)));
        engine.resync().await;

        assert_eq!(engine.version(), 4);
    }

    #[tokio::test]
    async fn member_pushes_update_membership() {
        let (engine, _, _) = joined_engine(&group_state(&["me"], "me", 1));

        engine.handle_push(PushMessage::delta(routes::MEMBER_CONNECTED, 2, json!({"userId": "bob"})));
        engine.handle_push(PushMessage::delta(
            routes::MEMBER_DATA_UPDATED,
            3,
            json!({"userId": "bob", "userData": "mage"}),
        ));
        assert_eq!(engine.members().len(), 2);
        assert_eq!(engine.members()[1].user_data, "mage");

        engine.handle_push(PushMessage::delta(
            routes::MEMBER_DISCONNECTED,
            4,
            serde_json::to_value(MemberDisconnection {
                user_id: "bob".into(),
                reason: LeaveReason::Kicked,
            })
            .unwrap(),
        ));
        assert_eq!(engine.members().len(), 1);
        assert_eq!(engine.version(), 4);
    }

    #[tokio::test]
    async fn settings_push_with_same_version_is_ignored() {
        let (engine, _, _) = joined_engine(&group_state(&["me"], "me", 1));
        let mut rx = engine.subscribe();

        engine.handle_push(PushMessage::delta(
            routes::SETTINGS_UPDATED,
            2,
            json!({"matchmakingProfileName": "ranked", "customData": "{}", "settingsVersion": 0}),
        ));

        assert_eq!(engine.settings().matchmaking_profile_name, "casual");
        assert_eq!(engine.version(), 2);
        assert!(drain(&mut rx).is_empty());
    }

    // --- Resync ---

    #[tokio::test(start_paused = true)]
    async fn resync_retries_after_fixed_delay() {
        let (engine, connection, _) = make_engine();
        connection.respond(routes::GET_STATE, Err(PartyError::Transport("down".into())));
        connection.respond(routes::GET_STATE, Err(PartyError::Transport("down".into())));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 2)).unwrap()));

        let started = tokio::time::Instant::now();
        engine.resync().await;

        assert_eq!(connection.calls_to(routes::GET_STATE).len(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(400));
        assert_eq!(engine.version(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_resync_retries() {
        let (engine, connection, _) = make_engine();
        for _ in 0..10 {
            connection.respond(routes::GET_STATE, Err(PartyError::Transport("down".into())));
        }
        engine.schedule_resync();
        tokio::time::sleep(Duration::from_millis(450)).await;
        engine.close();
        engine.resync().await;
        let calls = connection.calls_to(routes::GET_STATE).len();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(connection.calls_to(routes::GET_STATE).len(), calls);
    }

    #[tokio::test]
    async fn concurrent_resyncs_share_one_fetch() {
        let (engine, connection, _) = make_engine();
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 2)).unwrap()));
        connection.set_delay(routes::GET_STATE, Duration::from_millis(20));

        let _ = tokio::join!(engine.resync(), engine.resync(), engine.resync());

        assert_eq!(connection.calls_to(routes::GET_STATE).len(), 1);
    }

    // --- Settings ---

    #[tokio::test]
    async fn update_settings_applies_optimistically() {
        let mut state = group_state(&["me", "bob"], "me", 5);
        state.settings.settings_version = 2;
        let (engine, connection, _) = joined_engine(&state);
        connection.set_delay(routes::UPDATE_SETTINGS, Duration::from_millis(20));

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.update_settings(SettingsUpdate::new("ranked")).await }
        });
        settle().await;
        assert_eq!(engine.settings().settings_version, 3);
        assert_eq!(engine.settings().matchmaking_profile_name, "ranked");

        call.await.unwrap().unwrap();
        let sent = connection.calls_to(routes::UPDATE_SETTINGS);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["customData"], "{}");
        assert!(connection.calls_to(routes::GET_STATE).is_empty());
    }

    #[tokio::test]
    async fn update_settings_outdated_resyncs_then_retries_once() {
        let mut state = group_state(&["me"], "me", 5);
        state.settings.settings_version = 2;
        let (engine, connection, _) = joined_engine(&state);
        let mut fresh = group_state(&["me"], "me", 7);
        fresh.settings.settings_version = 4;
        connection.respond(routes::UPDATE_SETTINGS, Err(PartyError::SettingsOutdated));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(&fresh).unwrap()));

        engine.update_settings(SettingsUpdate::new("ranked")).await.unwrap();

        assert_eq!(connection.calls_to(routes::GET_STATE).len(), 1);
        assert_eq!(connection.calls_to(routes::UPDATE_SETTINGS).len(), 2);
        assert_eq!(engine.settings().settings_version, 5);
        assert_eq!(engine.settings().matchmaking_profile_name, "ranked");
    }

    #[tokio::test]
    async fn update_settings_other_failure_resyncs_and_propagates() {
        let (engine, connection, _) = joined_engine(&group_state(&["me"], "me", 5));
        connection.respond(routes::UPDATE_SETTINGS, Err(PartyError::Remote("boom".into())));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 6)).unwrap()));

        let result = engine.update_settings(SettingsUpdate::new("ranked")).await;
        engine.resync().await;

        assert_matches!(result, Err(PartyError::Remote(_)));
        assert_eq!(connection.calls_to(routes::GET_STATE).len(), 1);
        assert_eq!(engine.settings().matchmaking_profile_name, "casual");
    }

    // --- Readiness ---

    #[tokio::test]
    async fn readiness_unchanged_is_noop() {
        let (engine, connection, _) = joined_engine(&group_state(&["me"], "me", 1));
        engine.update_local_readiness(MemberStatus::NotReady).await.unwrap();
        assert!(connection.calls().is_empty());
    }

    #[tokio::test]
    async fn readiness_without_profile_fails() {
        let mut state = group_state(&["me"], "me", 1);
        state.settings.matchmaking_profile_name.clear();
        let (engine, connection, _) = joined_engine(&state);

        let result = engine.update_local_readiness(MemberStatus::Ready).await;

        assert_matches!(result, Err(PartyError::GroupNotReady));
        assert!(connection.calls().is_empty());
        assert_eq!(engine.local_member().unwrap().status, MemberStatus::NotReady);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_waits_for_matchmaking_connection() {
        let connection = Arc::new(FakeConnection::new("s1", "me"));
        let matchmaking = Arc::new(FakeMatchmaking::new());
        matchmaking.set_connect_delay(Duration::from_secs(3));
        let engine = SyncEngine::new(connection.clone(), matchmaking.clone(), SyncSettings::default(), 64);
        engine.handle_push(PushMessage::snapshot(&group_state(&["me"], "me", 1)).unwrap());

        let call = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.update_local_readiness(MemberStatus::Ready).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(connection.calls_to(routes::UPDATE_STATUS).is_empty());
        assert_eq!(engine.local_member().unwrap().status, MemberStatus::Ready);

        call.await.unwrap().unwrap();
        let sent = connection.calls_to(routes::UPDATE_STATUS);
        assert_eq!(sent, vec![json!({"desiredStatus": "ready", "localSettingsVersion": 0})]);
        assert_eq!(matchmaking.completed_connects(), vec!["casual".to_string()]);
    }

    #[tokio::test]
    async fn readiness_retries_on_outdated_settings() {
        let (engine, connection, _) = joined_engine(&group_state(&["me"], "me", 1));
        let mut fresh = group_state(&["me"], "me", 3);
        fresh.settings.settings_version = 2;
        connection.respond(routes::UPDATE_STATUS, Err(PartyError::SettingsOutdated));
        connection.respond(routes::UPDATE_STATUS, Err(PartyError::SettingsOutdated));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(&fresh).unwrap()));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(&fresh).unwrap()));

        engine.update_local_readiness(MemberStatus::Ready).await.unwrap();

        let sent = connection.calls_to(routes::UPDATE_STATUS);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2]["localSettingsVersion"], 2);
        assert_eq!(connection.calls_to(routes::GET_STATE).len(), 2);
    }

    #[tokio::test]
    async fn readiness_retry_cap_gives_up() {
        let config = SyncSettings {
            readiness_max_retries: Some(1),
            ..SyncSettings::default()
        };
        let (engine, connection, _) = make_engine_with(config);
        engine.handle_push(PushMessage::snapshot(&group_state(&["me"], "me", 1)).unwrap());
        for _ in 0..3 {
            connection.respond(routes::UPDATE_STATUS, Err(PartyError::SettingsOutdated));
            connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me"], "me", 2)).unwrap()));
        }

        let result = engine.update_local_readiness(MemberStatus::NotReady).await;
        assert!(result.is_ok(), "unchanged status never reaches the server");

        let result = engine.update_local_readiness(MemberStatus::Ready).await;
        assert_matches!(result, Err(PartyError::SettingsOutdated));
        assert_eq!(connection.calls_to(routes::UPDATE_STATUS).len(), 2);
    }

    // --- Leader-only operations ---

    #[tokio::test]
    async fn kick_requires_leader() {
        let (engine, connection, _) = joined_engine(&group_state(&["me", "bob"], "bob", 1));
        assert_matches!(engine.kick_member("bob").await, Err(PartyError::Unauthorized));
        assert!(connection.calls().is_empty());
        assert_eq!(engine.members().len(), 2);
    }

    #[tokio::test]
    async fn kick_as_leader_removes_optimistically() {
        let (engine, connection, _) = joined_engine(&group_state(&["me", "bob"], "me", 1));
        let mut rx = engine.subscribe();

        engine.kick_member("bob").await.unwrap();

        assert_eq!(engine.members().len(), 1);
        assert_eq!(connection.calls_to(routes::KICK_PLAYER), vec![json!("bob")]);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn promote_moves_leadership() {
        let (engine, connection, _) = joined_engine(&group_state(&["me", "bob"], "me", 1));
        engine.promote_leader("bob").await.unwrap();

        assert!(!engine.is_leader());
        assert_eq!(engine.leader_id(), "bob");
        assert_eq!(connection.calls_to(routes::PROMOTE_LEADER), vec![json!("bob")]);
        assert_matches!(engine.promote_leader("me").await, Err(PartyError::Unauthorized));
    }

    #[tokio::test]
    async fn failed_remote_write_resyncs() {
        let (engine, connection, _) = joined_engine(&group_state(&["me", "bob"], "me", 1));
        connection.respond(routes::PROMOTE_LEADER, Err(PartyError::Transport("timeout".into())));
        connection.respond(routes::GET_STATE, Ok(serde_json::to_value(group_state(&["me", "bob"], "me", 2)).unwrap()));

        let result = engine.promote_leader("bob").await;
        engine.resync().await;

        assert_matches!(result, Err(PartyError::Transport(_)));
        assert_eq!(engine.leader_id(), "me");
        assert!(engine.is_leader());
    }

    // --- User data ---

    #[tokio::test]
    async fn user_data_applies_then_sends() {
        let (engine, connection, _) = joined_engine(&group_state(&["me"], "me", 1));
        engine.update_user_data("tank".into()).await.unwrap();

        assert_eq!(engine.local_member().unwrap().user_data, "tank");
        assert_eq!(connection.calls_to(routes::UPDATE_USER_DATA), vec![json!("tank")]);
    }

    // --- Dispatcher ---

    #[tokio::test]
    async fn start_consumes_pushes_in_order() {
        let (engine, _, _) = make_engine();
        let (tx, rx) = mpsc::unbounded_channel();
        engine.start(rx);

        tx.send(PushMessage::snapshot(&group_state(&["me"], "me", 1)).unwrap()).unwrap();
        tx.send(PushMessage::delta(routes::MEMBER_CONNECTED, 2, json!({"userId": "bob"}))).unwrap();
        tx.send(PushMessage::delta(routes::LEADER_CHANGED, 3, json!("bob"))).unwrap();
        engine.wait_for_initial_state().await.unwrap();
        settle().await;

        assert_eq!(engine.version(), 3);
        assert_eq!(engine.leader_id(), "bob");
    }

    #[tokio::test]
    async fn operations_fail_after_close() {
        let (engine, connection, _) = joined_engine(&group_state(&["me"], "me", 1));
        engine.close();

        assert_matches!(engine.update_user_data("x".into()).await, Err(PartyError::Disconnected));
        assert_matches!(
            engine.update_settings(SettingsUpdate::new("ranked")).await,
            Err(PartyError::Disconnected)
        );
        assert!(connection.calls().is_empty());
    }
}
