//! Resource lifecycle base
//!
//! Every managed object (session, data stream, discovery engine) walks the
//! same state machine:
//!
//! ```text
//! created -> initializing -> active <-> idle -> stopping -> stopped -> disposed
//!                 \_____________ any non-terminal ____________/
//!                                     |
//!                                   error  -> disposed
//! ```
//!
//! Transitions are checked and published as [`ResourceStateEvent`]s.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{EventBus, SyncError, SyncResult, Timestamp};

/// State of a managed resource
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    Created,
    Initializing,
    Active,
    Idle,
    Stopping,
    Stopped,
    Error,
    Disposed,
}

impl ResourceState {
    /// Whether `self -> to` is a legal transition
    pub fn can_transition_to(self, to: ResourceState) -> bool {
        use ResourceState::*;
        match (self, to) {
            (Disposed, _) => false,
            (_, Error) => true,
            (_, Disposed) => matches!(self, Created | Stopped | Error),
            (Created, Initializing) => true,
            (Initializing, Active | Idle) => true,
            (Active, Idle) | (Idle, Active) => true,
            (Created | Initializing | Active | Idle, Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }

    /// Running states accept work
    pub fn is_running(self) -> bool {
        matches!(self, ResourceState::Active | ResourceState::Idle)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ResourceState::Disposed)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Created => "created",
            ResourceState::Initializing => "initializing",
            ResourceState::Active => "active",
            ResourceState::Idle => "idle",
            ResourceState::Stopping => "stopping",
            ResourceState::Stopped => "stopped",
            ResourceState::Error => "error",
            ResourceState::Disposed => "disposed",
        };
        f.write_str(s)
    }
}

/// State of a coordination session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Discovering,
    Joining,
    Active,
    Leaving,
    Error,
}

impl SessionState {
    /// Whether `self -> to` is a legal session transition
    ///
    /// Progress is strictly forward; `Error` is reachable from anywhere and
    /// only `Leaving`/`Disconnected` lead out of it.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (_, Error) => true,
            (Disconnected, Discovering) => true,
            (Discovering, Joining | Active) => true,
            (Joining, Active) => true,
            (Discovering | Joining | Active | Error, Leaving) => true,
            (Leaving | Error, Disconnected) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Discovering => "discovering",
            SessionState::Joining => "joining",
            SessionState::Active => "active",
            SessionState::Leaving => "leaving",
            SessionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Published on every resource state change
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceStateEvent {
    pub resource: String,
    pub old: ResourceState,
    pub new: ResourceState,
    pub reason: String,
    pub timestamp: Timestamp,
}

/// Checked state holder shared by all managed resources
#[derive(Debug)]
pub struct Lifecycle {
    name: String,
    state: ResourceState,
    events: EventBus<ResourceStateEvent>,
}

impl Lifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Lifecycle {
            name: name.into(),
            state: ResourceState::Created,
            events: EventBus::new(64),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn events(&self) -> &EventBus<ResourceStateEvent> {
        &self.events
    }

    /// Move to `to`, publishing the change
    ///
    /// Same-state transitions are accepted silently.
    pub fn transition(&mut self, to: ResourceState, reason: &str) -> SyncResult<()> {
        if self.state == to {
            return Ok(());
        }
        if !self.state.can_transition_to(to) {
            return Err(SyncError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        let old = self.state;
        self.state = to;
        debug!(resource = %self.name, %old, new = %to, reason, "lifecycle transition");
        self.events.emit(ResourceStateEvent {
            resource: self.name.clone(),
            old,
            new: to,
            reason: reason.to_string(),
            timestamp: Timestamp::now(),
        });
        Ok(())
    }

    /// Record a fatal error and hand it back for re-raising
    pub fn fail(&mut self, err: SyncError) -> SyncError {
        warn!(resource = %self.name, error = %err, "resource failed");
        if self.state != ResourceState::Disposed {
            // Error is reachable from every non-terminal state
            let _ = self.transition(ResourceState::Error, &err.to_string());
        }
        err
    }

    /// Ensure the resource can still be used
    pub fn ensure_not_disposed(&self) -> SyncResult<()> {
        if self.state == ResourceState::Disposed {
            return Err(SyncError::Disposed(self.name.clone()));
        }
        Ok(())
    }
}

/// Contract shared by every managed resource
#[allow(async_fn_in_trait)]
pub trait Resource {
    /// Current lifecycle state
    fn resource_state(&self) -> ResourceState;

    /// Bring the resource up; ends in `Active` or `Idle`
    async fn initialize(&mut self) -> SyncResult<ResourceState>;

    /// `Idle -> Active`
    async fn activate(&mut self) -> SyncResult<()>;

    /// `Active -> Idle`
    async fn deactivate(&mut self) -> SyncResult<()>;

    /// Release everything owned; calling it again is a no-op
    async fn dispose(&mut self) -> SyncResult<()>;

    /// Cheap liveness check
    fn health_check(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut lc = Lifecycle::new("test");
        for to in [
            ResourceState::Initializing,
            ResourceState::Active,
            ResourceState::Idle,
            ResourceState::Active,
            ResourceState::Stopping,
            ResourceState::Stopped,
            ResourceState::Disposed,
        ] {
            lc.transition(to, "step").unwrap();
        }
        assert_eq!(lc.state(), ResourceState::Disposed);
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut lc = Lifecycle::new("test");
        let err = lc.transition(ResourceState::Active, "skip").unwrap_err();
        assert_eq!(
            err,
            SyncError::InvalidTransition {
                from: ResourceState::Created,
                to: ResourceState::Active
            }
        );
        assert_eq!(lc.state(), ResourceState::Created);
    }

    #[test]
    fn test_error_reachable_and_disposable() {
        let mut lc = Lifecycle::new("test");
        lc.transition(ResourceState::Initializing, "init").unwrap();
        let err = lc.fail(SyncError::Transport("boom".into()));
        assert_eq!(err, SyncError::Transport("boom".into()));
        assert_eq!(lc.state(), ResourceState::Error);
        lc.transition(ResourceState::Disposed, "cleanup").unwrap();
        assert!(lc.ensure_not_disposed().is_err());
        // Nothing leaves Disposed, not even Error
        lc.fail(SyncError::NoCandidates);
        assert_eq!(lc.state(), ResourceState::Disposed);
    }

    #[tokio::test]
    async fn test_transition_emits_event() {
        let mut lc = Lifecycle::new("stream:eeg");
        let mut rx = lc.events().subscribe();
        lc.transition(ResourceState::Initializing, "start").unwrap();
        let env = rx.recv().await.unwrap();
        assert_eq!(env.event.resource, "stream:eeg");
        assert_eq!(env.event.old, ResourceState::Created);
        assert_eq!(env.event.new, ResourceState::Initializing);
        assert_eq!(env.event.reason, "start");
    }

    #[test]
    fn test_session_state_forward_only() {
        use SessionState::*;
        assert!(Disconnected.can_transition_to(Discovering));
        assert!(Discovering.can_transition_to(Active));
        assert!(Active.can_transition_to(Leaving));
        assert!(Leaving.can_transition_to(Disconnected));
        assert!(Active.can_transition_to(Error));
        assert!(Error.can_transition_to(Disconnected));
        assert!(!Active.can_transition_to(Discovering));
        assert!(!Error.can_transition_to(Active));
    }
}
