//! In-memory collaborators for runtime tests.
//!
//! The fakes record every interaction and let a test script responses,
//! inject delays (use `start_paused` tests for those), and hold requests
//! open until the test answers them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use party_core::PartyError;
use party_core::constants::PROTOCOL_VERSION;
use party_core::types::{GroupRequest, GroupSettings, GroupState, MatchmakingEvent, MemberInfo};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::transport::{
    GroupConnection, GroupConnector, GroupLink, InvitationChannel, MatchmakingClient, PushMessage,
};

/// Reason the fake reports when the client disconnects itself.
pub const CLIENT_DISCONNECT_REASON: &str = "client.disconnect";

/// Group state with profile `casual`, the given members, and leader.
pub fn group_state(members: &[&str], leader: &str, version: u64) -> GroupState {
    let mut state = GroupState {
        settings: GroupSettings::new("casual"),
        leader_id: leader.to_string(),
        members: members.iter().map(|id| MemberInfo::new(*id)).collect(),
        version,
    };
    state.recompute_leader();
    state
}

/// Decrements a counter when dropped, so cancelled futures are accounted for.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> (Self, usize) {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        (Self(Arc::clone(counter)), now)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Group connection
// ─────────────────────────────────────────────────────────────────────────────

/// Scriptable [`GroupConnection`].
///
/// Routes without a scripted response answer `Ok(Value::Null)`.
pub struct FakeConnection {
    session_id: String,
    user_id: String,
    calls: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, VecDeque<Result<Value, PartyError>>>>,
    delays: Mutex<HashMap<String, Duration>>,
    disconnects: AtomicUsize,
    closed: Mutex<Option<oneshot::Sender<String>>>,
}

impl FakeConnection {
    pub fn new(session_id: &str, user_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            calls: Mutex::new(vec![]),
            responses: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            disconnects: AtomicUsize::new(0),
            closed: Mutex::new(None),
        }
    }

    /// Connection whose `closed` channel fires on disconnect.
    pub fn linked(session_id: &str, user_id: &str) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        let connection = Self::new(session_id, user_id);
        *connection.closed.lock() = Some(tx);
        (connection, rx)
    }

    /// Queue a response for the next call to `route`.
    pub fn respond(&self, route: &str, result: Result<Value, PartyError>) {
        self.responses
            .lock()
            .entry(route.to_string())
            .or_default()
            .push_back(result);
    }

    /// Delay every call to `route`.
    pub fn set_delay(&self, route: &str, delay: Duration) {
        let _ = self.delays.lock().insert(route.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    /// Payloads sent to `route`, in order.
    pub fn calls_to(&self, route: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(r, _)| r == route)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Simulate the server closing the session.
    pub fn close_with(&self, reason: &str) {
        if let Some(tx) = self.closed.lock().take() {
            let _ = tx.send(reason.to_string());
        }
    }
}

#[async_trait]
impl GroupConnection for FakeConnection {
    fn session_id(&self) -> String {
        self.session_id.clone()
    }

    fn local_user_id(&self) -> String {
        self.user_id.clone()
    }

    fn server_protocol_version(&self) -> Option<String> {
        Some(PROTOCOL_VERSION.to_string())
    }

    async fn call(&self, route: &str, payload: Value) -> Result<Value, PartyError> {
        self.calls.lock().push((route.to_string(), payload));
        let delay = self.delays.lock().get(route).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .responses
            .lock()
            .get_mut(route)
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or(Ok(Value::Null))
    }

    async fn disconnect(&self) -> Result<(), PartyError> {
        let _ = self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.close_with(CLIENT_DISCONNECT_REASON);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────────────────

/// A session handed out by [`FakeConnector::connect`].
#[derive(Clone)]
pub struct FakeSession {
    pub connection: Arc<FakeConnection>,
    pub pushes: mpsc::UnboundedSender<PushMessage>,
}

impl FakeSession {
    /// Deliver a push to the client.
    pub fn push(&self, message: PushMessage) {
        let _ = self.pushes.send(message);
    }
}

/// Scriptable [`GroupConnector`].
///
/// Tokens are `token:<session id>`. With an initial state configured, every
/// connection receives it as a snapshot push straight away.
pub struct FakeConnector {
    user_id: String,
    initial_state: Mutex<Option<GroupState>>,
    created: Mutex<Vec<GroupRequest>>,
    token_requests: Mutex<Vec<String>>,
    sessions: Mutex<Vec<FakeSession>>,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl FakeConnector {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            initial_state: Mutex::new(None),
            created: Mutex::new(vec![]),
            token_requests: Mutex::new(vec![]),
            sessions: Mutex::new(vec![]),
            fail_connect: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
        }
    }

    pub fn set_initial_state(&self, state: GroupState) {
        *self.initial_state.lock() = Some(state);
    }

    pub fn fail_connects(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn created(&self) -> Vec<GroupRequest> {
        self.created.lock().clone()
    }

    pub fn token_requests(&self) -> Vec<String> {
        self.token_requests.lock().clone()
    }

    pub fn sessions(&self) -> Vec<FakeSession> {
        self.sessions.lock().clone()
    }

    /// Most recent session.
    pub fn last_session(&self) -> FakeSession {
        self.sessions
            .lock()
            .last()
            .cloned()
            .expect("no session connected")
    }
}

#[async_trait]
impl GroupConnector for FakeConnector {
    async fn create_session(&self, request: &GroupRequest) -> Result<String, PartyError> {
        let mut created = self.created.lock();
        created.push(request.clone());
        Ok(format!("token:created-{}", created.len()))
    }

    async fn connection_token(&self, session_id: &str) -> Result<String, PartyError> {
        self.token_requests.lock().push(session_id.to_string());
        Ok(format!("token:{session_id}"))
    }

    async fn connect(&self, token: &str) -> Result<GroupLink, PartyError> {
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(PartyError::Transport("connection refused".into()));
        }
        let session_id = token.strip_prefix("token:").unwrap_or(token);
        let (connection, closed) = FakeConnection::linked(session_id, &self.user_id);
        let connection = Arc::new(connection);
        let (tx, pushes) = mpsc::unbounded_channel();

        let initial = self.initial_state.lock().clone();
        if let Some(state) = initial {
            let _ = tx.send(PushMessage::snapshot(&state)?);
        }
        self.sessions.lock().push(FakeSession {
            connection: Arc::clone(&connection),
            pushes: tx,
        });

        Ok(GroupLink {
            connection,
            pushes,
            closed,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Matchmaking
// ─────────────────────────────────────────────────────────────────────────────

/// Scriptable [`MatchmakingClient`] that tracks connect concurrency.
pub struct FakeMatchmaking {
    connects: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    fail_disconnects: AtomicBool,
    delay: Mutex<Option<Duration>>,
    active: Arc<AtomicUsize>,
    max_active: AtomicUsize,
    events: broadcast::Sender<MatchmakingEvent>,
}

impl FakeMatchmaking {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connects: Mutex::new(vec![]),
            completed: Mutex::new(vec![]),
            disconnects: Mutex::new(vec![]),
            failing: Mutex::new(HashSet::new()),
            fail_disconnects: AtomicBool::new(false),
            delay: Mutex::new(None),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: AtomicUsize::new(0),
            events,
        }
    }

    /// Profiles connect was called for, including cancelled attempts.
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().clone()
    }

    /// Profiles whose connect ran to success.
    pub fn completed_connects(&self) -> Vec<String> {
        self.completed.lock().clone()
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.disconnects.lock().clone()
    }

    pub fn active_connects(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_connects(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn fail_connect(&self, profile: &str) {
        let _ = self.failing.lock().insert(profile.to_string());
    }

    pub fn fail_disconnects(&self) {
        self.fail_disconnects.store(true, Ordering::SeqCst);
    }

    /// Publish a matchmaking event.
    pub fn emit(&self, event: MatchmakingEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MatchmakingClient for FakeMatchmaking {
    async fn connect(&self, profile: &str, cancel: CancellationToken) -> Result<(), PartyError> {
        self.connects.lock().push(profile.to_string());
        let (_guard, now) = ActiveGuard::enter(&self.active);
        let _ = self.max_active.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::select! {
                () = cancel.cancelled() => return Err(PartyError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
        if self.failing.lock().contains(profile) {
            return Err(PartyError::Transport("matchmaking refused".into()));
        }
        self.completed.lock().push(profile.to_string());
        Ok(())
    }

    async fn disconnect(&self, profile: &str) -> Result<(), PartyError> {
        self.disconnects.lock().push(profile.to_string());
        if self.fail_disconnects.load(Ordering::SeqCst) {
            return Err(PartyError::Transport("not connected".into()));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MatchmakingEvent> {
        self.events.subscribe()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Invitations
// ─────────────────────────────────────────────────────────────────────────────

/// [`InvitationChannel`] whose requests stay open until answered.
pub struct FakeInvitations {
    sent: Mutex<Vec<(String, String)>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<(), PartyError>>>>,
    in_flight: Arc<AtomicUsize>,
}

impl FakeInvitations {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(vec![]),
            pending: Mutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// `(recipient, session)` pairs, in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    /// Requests still being awaited by the client.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Resolve the open request to `recipient`. Returns `false` if none.
    pub fn answer(&self, recipient: &str, result: Result<(), PartyError>) -> bool {
        match self.pending.lock().remove(recipient) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl InvitationChannel for FakeInvitations {
    async fn send_invitation(&self, recipient_id: &str, session_id: &str) -> Result<(), PartyError> {
        self.sent
            .lock()
            .push((recipient_id.to_string(), session_id.to_string()));
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.lock().insert(recipient_id.to_string(), tx);
        let (_guard, _) = ActiveGuard::enter(&self.in_flight);
        rx.await.unwrap_or(Err(PartyError::Cancelled))
    }
}
