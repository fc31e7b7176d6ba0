//! Matchmaking liaison — keeps the matchmaking connection on the group's profile.
//!
//! Connect attempts form a single chain: each new attempt waits for the
//! previous one to settle before it starts, so two connects never overlap.
//! A profile change cancels the in-flight attempt through its token and
//! replaces the token, which makes the superseded attempt's outcome
//! irrelevant. A connect failure that was not superseded disconnects the
//! whole group session.

use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::counter;
use parking_lot::Mutex;
use party_core::PartyError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::transport::{GroupConnection, MatchmakingClient};

/// Outcome of the latest link in the connect chain, shareable by every awaiter.
pub type ConnectTask = Shared<BoxFuture<'static, Result<(), PartyError>>>;

struct LiaisonState {
    profile: String,
    cancel: CancellationToken,
    task: ConnectTask,
    /// Bumped every time a new link is chained.
    generation: u64,
    shut_down: bool,
}

struct LiaisonInner {
    client: Arc<dyn MatchmakingClient>,
    connection: Arc<dyn GroupConnection>,
    state: Mutex<LiaisonState>,
}

/// Sequences matchmaking connect/disconnect for one group session.
pub struct MatchmakingLiaison {
    inner: Arc<LiaisonInner>,
}

fn settled() -> ConnectTask {
    futures::future::ready(Ok(())).boxed().shared()
}

impl MatchmakingLiaison {
    /// Create a liaison with no profile connected.
    ///
    /// `connection` is disconnected when a connect attempt fails.
    pub fn new(client: Arc<dyn MatchmakingClient>, connection: Arc<dyn GroupConnection>) -> Self {
        Self {
            inner: Arc::new(LiaisonInner {
                client,
                connection,
                state: Mutex::new(LiaisonState {
                    profile: String::new(),
                    cancel: CancellationToken::new(),
                    task: settled(),
                    generation: 0,
                    shut_down: false,
                }),
            }),
        }
    }

    /// Profile the liaison is connected or connecting to.
    pub fn current_profile(&self) -> String {
        self.inner.state.lock().profile.clone()
    }

    /// Number of connect attempts chained so far.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Follow a settings change to `profile`.
    ///
    /// No-op when the profile is unchanged. Otherwise cancels the pending
    /// attempt, disconnects from the old profile in the background, and
    /// chains a connect to the new one (unless it is empty).
    pub fn update_profile(&self, profile: &str) {
        let mut state = self.inner.state.lock();
        if state.shut_down || state.profile == profile {
            return;
        }

        state.cancel.cancel();
        state.cancel = CancellationToken::new();

        let old = std::mem::replace(&mut state.profile, profile.to_string());
        self.disconnect_in_background(old);

        if profile.is_empty() {
            debug!("matchmaking profile cleared");
            return;
        }

        trace!(profile, "connecting to the group's matchmaking profile");
        let task = connect_after(
            Arc::downgrade(&self.inner),
            state.task.clone(),
            profile.to_string(),
            state.cancel.clone(),
        )
        .boxed()
        .shared();
        state.task = task.clone();
        state.generation += 1;
        drop(state);

        // Drive the chain even if nobody awaits it.
        drop(tokio::spawn(task));
    }

    /// Wait for the latest connect attempt to settle.
    ///
    /// A superseded attempt is followed to its replacement; cancellation is
    /// only reported when nothing replaced it (profile cleared or shutdown).
    pub async fn wait_connected(&self) -> Result<(), PartyError> {
        loop {
            let (generation, task) = {
                let state = self.inner.state.lock();
                (state.generation, state.task.clone())
            };
            match task.await {
                Err(PartyError::Cancelled) if self.generation() != generation => {}
                other => return other,
            }
        }
    }

    /// Stop following settings: cancel any attempt and disconnect from the
    /// current profile. Idempotent.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.cancel.cancel();
        let old = std::mem::take(&mut state.profile);
        self.disconnect_in_background(old);
    }

    fn disconnect_in_background(&self, profile: String) {
        if profile.is_empty() {
            return;
        }
        let client = Arc::clone(&self.inner.client);
        drop(tokio::spawn(async move {
            if let Err(e) = client.disconnect(&profile).await {
                debug!(profile, error = %e, "matchmaking disconnect failed, ignoring");
            }
        }));
    }
}

async fn connect_after(
    weak: Weak<LiaisonInner>,
    previous: ConnectTask,
    profile: String,
    token: CancellationToken,
) -> Result<(), PartyError> {
    // Recover from a cancelled predecessor, not from a failed one: a
    // failure already tore the session down.
    match previous.await {
        Ok(()) | Err(PartyError::Cancelled) => {}
        Err(e) => return Err(e),
    }
    if token.is_cancelled() {
        return Err(PartyError::Cancelled);
    }
    let client = match weak.upgrade() {
        Some(inner) => Arc::clone(&inner.client),
        None => return Err(PartyError::Cancelled),
    };

    let result = tokio::select! {
        biased;
        () = token.cancelled() => Err(PartyError::Cancelled),
        r = client.connect(&profile, token.clone()) => r,
    };

    match result {
        Ok(()) => {
            counter!("party_matchmaking_connects_total", "status" => "success").increment(1);
            trace!(profile, "connected to matchmaking profile");
            Ok(())
        }
        Err(_) if token.is_cancelled() => {
            debug!(profile, "matchmaking connect superseded");
            Err(PartyError::Cancelled)
        }
        Err(e) => {
            counter!("party_matchmaking_connects_total", "status" => "failure").increment(1);
            error!(profile, error = %e, "failed to connect to matchmaking profile, leaving group");
            if let Some(inner) = weak.upgrade() {
                let connection = Arc::clone(&inner.connection);
                drop(tokio::spawn(async move {
                    if let Err(e) = connection.disconnect().await {
                        warn!(error = %e, "group disconnect after matchmaking failure failed");
                    }
                }));
            }
            Err(PartyError::Matchmaking {
                profile,
                message: e.to_string(),
            })
        }
    }
}
