//! Idempotent "ensure active, deactivate only what we started" lifecycle shared
//! by the daemon, the connector and intercepts.

use std::time::Duration;
use tracing::{debug, warn};

use crate::cancel::{poll_until, CallContext, DetachedContext};
use crate::config::Timeouts;
use crate::error::TetherError;

/// What a probe found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Active,
    Absent,
    /// Present but not usable yet; probing is retried.
    NotReady(String),
}

/// Whether `start` brought the resource up or found someone else's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Started {
    Acquired,
    Existing,
}

pub trait Resource {
    fn name(&self) -> &str;

    fn probe(&mut self, ctx: &CallContext) -> Result<Probe, TetherError>;

    fn start(&mut self, ctx: &CallContext) -> Result<Started, TetherError>;

    fn ready(&mut self, _ctx: &CallContext) -> Result<bool, TetherError> {
        Ok(true)
    }

    fn quit(&mut self, ctx: &DetachedContext) -> Result<(), TetherError>;

    /// True once the liveness marker of the resource has disappeared.
    fn gone(&mut self, _ctx: &DetachedContext) -> Result<bool, TetherError> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub ready_attempts: u32,
    pub ready_interval: Duration,
    pub settle_attempts: u32,
    pub settle_interval: Duration,
    pub gone_attempts: u32,
    pub gone_interval: Duration,
}

impl Policy {
    pub fn from_timeouts(timeouts: &Timeouts) -> Self {
        Self {
            ready_attempts: timeouts.socket_wait_attempts(),
            ready_interval: timeouts.poll_interval(),
            settle_attempts: timeouts.network_ready_attempts,
            settle_interval: timeouts.network_ready_interval(),
            gone_attempts: timeouts.quit_wait_attempts(),
            gone_interval: timeouts.poll_interval(),
        }
    }

    /// Single-shot checks for resources whose RPCs answer synchronously.
    pub fn immediate() -> Self {
        Self {
            ready_attempts: 1,
            ready_interval: Duration::ZERO,
            settle_attempts: 1,
            settle_interval: Duration::ZERO,
            gone_attempts: 1,
            gone_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Inactive,
    Ensuring,
    Active,
    Deactivating,
}

pub struct Ensured<R: Resource> {
    resource: R,
    policy: Policy,
    state: ResourceState,
    owned: bool,
    retain: bool,
}

impl<R: Resource> Ensured<R> {
    pub fn new(resource: R, policy: Policy, retain: bool) -> Self {
        Self {
            resource,
            policy,
            state: ResourceState::Inactive,
            owned: false,
            retain,
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn owned(&self) -> bool {
        self.owned
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Make the resource active. Returns true when this call started it.
    pub fn ensure(&mut self, ctx: &CallContext) -> Result<bool, TetherError> {
        if self.state == ResourceState::Active {
            return Ok(false);
        }
        self.state = ResourceState::Ensuring;
        match self.ensure_inner(ctx) {
            Ok(acquired) => {
                self.state = ResourceState::Active;
                self.owned = self.owned || acquired;
                debug!(resource = self.resource.name(), acquired, "resource active");
                Ok(acquired)
            }
            Err(err) => {
                // A started resource that never became ready is still ours to undo.
                self.state = if self.owned {
                    ResourceState::Active
                } else {
                    ResourceState::Inactive
                };
                Err(err)
            }
        }
    }

    fn ensure_inner(&mut self, ctx: &CallContext) -> Result<bool, TetherError> {
        if self.settle(ctx)? == Probe::Active {
            return Ok(false);
        }
        ctx.check()?;
        let started = self.resource.start(ctx)?;
        if started == Started::Acquired {
            self.owned = true;
        }
        let Policy {
            ready_attempts,
            ready_interval,
            ..
        } = self.policy;
        let resource = &mut self.resource;
        let ready = poll_until(ctx, ready_attempts, ready_interval, || resource.ready(ctx))?;
        if !ready {
            return Err(TetherError::NotReady {
                resource: self.resource.name().to_string(),
                detail: format!(
                    "not ready after {} attempts",
                    self.policy.ready_attempts
                ),
            });
        }
        Ok(started == Started::Acquired)
    }

    /// Probe until the answer is definite, retrying while the resource
    /// reports a transient sub-state.
    fn settle(&mut self, ctx: &CallContext) -> Result<Probe, TetherError> {
        let attempts = self.policy.settle_attempts.max(1);
        let mut last_detail = String::new();
        for attempt in 0..attempts {
            match self.resource.probe(ctx)? {
                Probe::NotReady(detail) => {
                    debug!(resource = self.resource.name(), attempt, %detail, "waiting");
                    last_detail = detail;
                }
                definite => return Ok(definite),
            }
            if attempt + 1 < attempts {
                ctx.sleep(self.policy.settle_interval)?;
            }
        }
        Err(TetherError::NotReady {
            resource: self.resource.name().to_string(),
            detail: last_detail,
        })
    }

    /// Quit the resource if this invocation started it and either it is not
    /// retained or the enclosing operation failed. Returns true when a quit
    /// was performed.
    pub fn deactivate(&mut self, ctx: &DetachedContext, failed: bool) -> Result<bool, TetherError> {
        if !self.owned || (self.retain && !failed) {
            return Ok(false);
        }
        self.state = ResourceState::Deactivating;
        self.owned = false;
        let result = self.quit_and_wait(ctx);
        self.state = ResourceState::Inactive;
        if let Err(err) = &result {
            warn!(resource = self.resource.name(), error = %err, "deactivation failed");
        }
        result.map(|_| true)
    }

    fn quit_and_wait(&mut self, ctx: &DetachedContext) -> Result<(), TetherError> {
        self.resource.quit(ctx)?;
        let attempts = self.policy.gone_attempts;
        let interval = self.policy.gone_interval;
        let resource = &mut self.resource;
        if !poll_until(ctx, attempts, interval, || resource.gone(ctx))? {
            return Err(TetherError::Process(format!(
                "{} did not stop after quit",
                self.resource.name()
            )));
        }
        Ok(())
    }
}
