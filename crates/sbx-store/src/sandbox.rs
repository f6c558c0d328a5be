use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::Expirable;
use crate::error::StoreError;
use crate::latch::SetOnce;

/// Lifecycle states of a sandbox.
///
/// `Failed` is terminal: a transition whose work errored parks the sandbox
/// there and nothing moves it out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Running,
    Pausing,
    Killing,
    Snapshotting,
    Failed,
}

impl SandboxState {
    fn allows(self, target: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, target),
            (Running, Pausing)
                | (Running, Killing)
                | (Running, Snapshotting)
                | (Pausing, Killing)
                | (Snapshotting, Running)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxState::Running => "running",
            SandboxState::Pausing => "pausing",
            SandboxState::Killing => "killing",
            SandboxState::Snapshotting => "snapshotting",
            SandboxState::Failed => "failed",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Removal flavor requested by callers and by the eviction path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveAction {
    Pause,
    Kill,
}

impl RemoveAction {
    fn target(self) -> SandboxState {
        match self {
            RemoveAction::Pause => SandboxState::Pausing,
            RemoveAction::Kill => SandboxState::Killing,
        }
    }
}

/// Identity and configuration fixed when the sandbox is created.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub sandbox_id: String,
    pub template_id: String,
    pub base_template_id: String,
    pub build_id: String,
    pub kernel_version: String,
    pub firecracker_version: String,
    pub envd_version: String,
    pub node_id: String,
    pub cluster_id: Uuid,
    pub team_id: Uuid,
    pub client_id: String,
    pub envd_access_token: String,
    pub traffic_access_token: String,
    pub vcpu: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub auto_pause: bool,
    pub allow_internet_access: bool,
    pub max_instance_length: Duration,
    pub metadata: HashMap<String, String>,
}

struct Lifecycle {
    end_time: DateTime<Utc>,
    state: SandboxState,
    transition: Option<Transition>,
}

#[derive(Clone)]
struct Transition {
    target: SandboxState,
    latch: Arc<SetOnce<()>>,
}

struct SandboxInner {
    spec: SandboxSpec,
    start_time: DateTime<Utc>,
    lifecycle: RwLock<Lifecycle>,
}

/// A live sandbox handle. Cloning is cheap; all clones share the record.
///
/// The lifecycle lock orders every state change on this sandbox; the latch
/// inside an in-flight transition lets any number of callers wait without
/// holding the lock.
#[derive(Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

/// Outcome of requesting a transition.
pub enum Removal {
    /// The sandbox is already at (or already reached) the requested state.
    AlreadyDone,
    /// The caller owns the transition and must call [`TransitionHandle::finish`].
    Started(TransitionHandle),
}

/// Exclusive permit to complete one in-flight transition.
pub struct TransitionHandle {
    sandbox: Sandbox,
    latch: Arc<SetOnce<()>>,
}

impl TransitionHandle {
    /// Completes the transition. An error resolves every waiter with that
    /// error and parks the sandbox in `Failed`.
    pub fn finish(self, result: anyhow::Result<()>) {
        match result {
            Ok(()) => {
                self.sandbox.inner.lifecycle.write().transition = None;
                self.latch.set_value(());
            }
            Err(error) => {
                {
                    let mut lifecycle = self.sandbox.inner.lifecycle.write();
                    lifecycle.state = SandboxState::Failed;
                    lifecycle.transition = None;
                }
                self.latch.set_error(error);
            }
        }
    }
}

enum Pending {
    SameTarget(Arc<SetOnce<()>>),
    Retry(Arc<SetOnce<()>>),
}

impl Sandbox {
    /// Builds a running sandbox. `end_time` is clamped by the store on insert.
    pub fn running(spec: SandboxSpec, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(SandboxInner {
                spec,
                start_time,
                lifecycle: RwLock::new(Lifecycle {
                    end_time,
                    state: SandboxState::Running,
                    transition: None,
                }),
            }),
        }
    }

    pub fn spec(&self) -> &SandboxSpec {
        &self.inner.spec
    }

    pub fn sandbox_id(&self) -> &str {
        &self.inner.spec.sandbox_id
    }

    pub fn team_id(&self) -> Uuid {
        self.inner.spec.team_id
    }

    pub fn node_id(&self) -> &str {
        &self.inner.spec.node_id
    }

    pub fn cluster_id(&self) -> Uuid {
        self.inner.spec.cluster_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.inner.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.inner.lifecycle.read().end_time
    }

    pub fn state(&self) -> SandboxState {
        self.inner.lifecycle.read().state
    }

    /// Caps the end time at `start_time + max_instance_length`.
    pub(crate) fn clamp_end_time(&self) {
        let cap = self.inner.start_time + self.inner.spec.max_instance_length;
        let mut lifecycle = self.inner.lifecycle.write();
        if lifecycle.end_time > cap {
            lifecycle.end_time = cap;
        }
    }

    /// Moves the end time. Shrinking is refused (the current value is kept)
    /// unless `allow_shorter`; growth is capped at the instance length limit.
    /// Returns the effective end time.
    pub(crate) fn extend_end_time(
        &self,
        new_end: DateTime<Utc>,
        allow_shorter: bool,
    ) -> DateTime<Utc> {
        let cap = self.inner.start_time + self.inner.spec.max_instance_length;
        let mut lifecycle = self.inner.lifecycle.write();
        if new_end < lifecycle.end_time && !allow_shorter {
            return lifecycle.end_time;
        }
        lifecycle.end_time = new_end.min(cap);
        lifecycle.end_time
    }

    /// Requests a pause or kill. At most one transition runs at a time; see
    /// [`Removal`] for the two successful outcomes.
    pub async fn start_removing(
        &self,
        cancel: &CancellationToken,
        action: RemoveAction,
    ) -> Result<Removal, StoreError> {
        self.transition_to(cancel, action.target(), true).await
    }

    /// Begins snapshotting a running sandbox.
    pub async fn start_snapshot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Removal, StoreError> {
        // FIXME: policy for a kill request racing an in-flight snapshot is
        // unresolved; today the kill is rejected until the snapshot settles.
        self.transition_to(cancel, SandboxState::Snapshotting, false)
            .await
    }

    /// Returns a snapshotted sandbox to running.
    pub async fn resume(&self, cancel: &CancellationToken) -> Result<Removal, StoreError> {
        self.transition_to(cancel, SandboxState::Running, false).await
    }

    async fn transition_to(
        &self,
        cancel: &CancellationToken,
        target: SandboxState,
        expire: bool,
    ) -> Result<Removal, StoreError> {
        loop {
            let pending = {
                let mut lifecycle = self.inner.lifecycle.write();
                if let Some(in_flight) = lifecycle.transition.clone() {
                    if in_flight.target == target {
                        Pending::SameTarget(in_flight.latch)
                    } else if lifecycle.state.allows(target) {
                        // the requested target is reachable once the current
                        // transition settles; wait and re-evaluate
                        Pending::Retry(in_flight.latch)
                    } else {
                        return Err(StoreError::InvalidTransition {
                            from: lifecycle.state,
                            to: target,
                        });
                    }
                } else if lifecycle.state == target {
                    return Ok(Removal::AlreadyDone);
                } else if !lifecycle.state.allows(target) {
                    return Err(StoreError::InvalidTransition {
                        from: lifecycle.state,
                        to: target,
                    });
                } else {
                    if expire {
                        let now = Utc::now();
                        if lifecycle.end_time > now {
                            lifecycle.end_time = now;
                        }
                    }
                    let latch = Arc::new(SetOnce::new());
                    lifecycle.state = target;
                    lifecycle.transition = Some(Transition {
                        target,
                        latch: Arc::clone(&latch),
                    });
                    return Ok(Removal::Started(TransitionHandle {
                        sandbox: self.clone(),
                        latch,
                    }));
                }
            };

            match pending {
                Pending::SameTarget(latch) => {
                    latch.wait(cancel).await?;
                    return Ok(Removal::AlreadyDone);
                }
                Pending::Retry(latch) => {
                    latch.wait(cancel).await?;
                }
            }
        }
    }

    /// Resolves once no transition is pending. Returns immediately when the
    /// sandbox is idle.
    pub async fn wait_for_state_change(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let latch = self
            .inner
            .lifecycle
            .read()
            .transition
            .clone()
            .map(|transition| transition.latch);
        match latch {
            None => Ok(()),
            Some(latch) => {
                latch.wait(cancel).await?;
                Ok(())
            }
        }
    }
}

impl Expirable for Sandbox {
    fn is_expired(&self) -> bool {
        Utc::now() > self.inner.lifecycle.read().end_time
    }

    fn mark_expired(&self) {
        let now = Utc::now();
        let mut lifecycle = self.inner.lifecycle.write();
        if lifecycle.end_time > now {
            lifecycle.end_time = now;
        }
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("sandbox_id", &self.inner.spec.sandbox_id)
            .field("team_id", &self.inner.spec.team_id)
            .field("node_id", &self.inner.spec.node_id)
            .field("state", &self.state())
            .finish()
    }
}
