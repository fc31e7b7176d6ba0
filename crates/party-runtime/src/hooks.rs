//! Session join/leave hooks.
//!
//! Extensions (voice chat, presence, analytics, ...) register a
//! [`SessionHook`] to take part in the session lifecycle. Join hooks run
//! sequentially after the first snapshot arrives and before the join is
//! reported; the first failure aborts the join. Leave hooks all run, and a
//! failing one is only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use party_core::PartyError;
use party_core::types::{GroupSettings, LeaveReason};
use thiserror::Error;
use tracing::{debug, error};

/// Errors raised by session hooks.
#[derive(Debug, Error)]
pub enum HookError {
    /// Hook did not finish within its timeout.
    #[error("Hook timed out after {timeout_ms}ms: {name}")]
    Timeout {
        /// Hook name.
        name: String,
        /// Configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// Hook reported a failure.
    #[error("Hook handler error in '{name}': {message}")]
    HandlerError {
        /// Hook name.
        name: String,
        /// Error message from the hook.
        message: String,
    },
}

impl HookError {
    /// Name of the hook that failed.
    pub fn hook_name(&self) -> &str {
        match self {
            Self::Timeout { name, .. } | Self::HandlerError { name, .. } => name,
        }
    }
}

impl From<HookError> for PartyError {
    fn from(e: HookError) -> Self {
        Self::Hook {
            name: e.hook_name().to_string(),
            message: e.to_string(),
        }
    }
}

/// What a hook sees about the session it runs for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionContext {
    /// Group session id.
    pub session_id: String,
    /// Local user id.
    pub local_user_id: String,
    /// Leader at the time the hook runs.
    pub leader_id: String,
    /// Settings at the time the hook runs.
    pub settings: GroupSettings,
    /// Why the session ended; `None` on join.
    pub reason: Option<LeaveReason>,
}

/// A join/leave lifecycle hook.
///
/// Higher priority hooks run first. Default priority is 0.
#[async_trait]
pub trait SessionHook: Send + Sync {
    /// Unique name for this hook.
    fn name(&self) -> &str;

    /// Execution priority. Higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// Optional timeout in milliseconds, applied to each invocation.
    fn timeout_ms(&self) -> Option<u64> {
        None
    }

    /// Called once the session is established, before the join is reported.
    async fn on_joining(&self, _context: &SessionContext) -> Result<(), HookError> {
        Ok(())
    }

    /// Called while the session is being torn down.
    async fn on_leaving(&self, _context: &SessionContext) -> Result<(), HookError> {
        Ok(())
    }
}

/// Priority-sorted set of session hooks.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn SessionHook>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook, replacing any hook with the same name.
    pub fn register(&mut self, hook: Arc<dyn SessionHook>) {
        let name = hook.name().to_string();
        self.hooks.retain(|h| h.name() != name);
        debug!(name = %name, priority = hook.priority(), "registering session hook");
        self.hooks.push(hook);
        self.hooks.sort_by_key(|h| std::cmp::Reverse(h.priority()));
    }

    /// Remove a hook by name. Returns `true` if it was registered.
    pub fn unregister(&mut self, name: &str) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|h| h.name() != name);
        self.hooks.len() < before
    }

    /// Hooks in execution order.
    pub fn hooks(&self) -> Vec<Arc<dyn SessionHook>> {
        self.hooks.clone()
    }

    /// Number of registered hooks.
    pub fn count(&self) -> usize {
        self.hooks.len()
    }
}

async fn with_timeout<F>(hook: &dyn SessionHook, fut: F) -> Result<(), HookError>
where
    F: Future<Output = Result<(), HookError>>,
{
    match hook.timeout_ms() {
        Some(timeout_ms) => tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
            .await
            .unwrap_or_else(|_| {
                Err(HookError::Timeout {
                    name: hook.name().to_string(),
                    timeout_ms,
                })
            }),
        None => fut.await,
    }
}

/// Run join hooks in order, stopping at the first failure.
pub async fn run_join_hooks(hooks: &[Arc<dyn SessionHook>], context: &SessionContext) -> Result<(), HookError> {
    for hook in hooks {
        debug!(name = hook.name(), session_id = %context.session_id, "running join hook");
        with_timeout(hook.as_ref(), hook.on_joining(context)).await?;
    }
    Ok(())
}

/// Run every leave hook; failures are logged and do not stop the others.
///
/// Returns the number of hooks that failed.
pub async fn run_leave_hooks(hooks: &[Arc<dyn SessionHook>], context: &SessionContext) -> usize {
    let mut failures = 0;
    for hook in hooks {
        if let Err(e) = with_timeout(hook.as_ref(), hook.on_leaving(context)).await {
            failures += 1;
            error!(name = hook.name(), session_id = %context.session_id, error = %e, "leave hook failed");
        }
    }
    failures
}
