//! Call contexts: cancellation plus values that travel with every RPC and wait.
//!
//! Normal operations run under a [`CallContext`] whose cancellation is tied to
//! the user's interrupt. Cleanup must keep going after that cancellation fires,
//! so it runs under a [`DetachedContext`], which keeps the trace id but drops
//! cancellation. Teardown APIs take `&DetachedContext` so a call site cannot
//! hand them the cancellable context by accident.

use chrono::Utc;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::error::TetherError;

#[derive(Debug, Default)]
struct CancelState {
    cancelled: Mutex<bool>,
    condvar: Condvar,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn is_cancelled(&self) -> bool {
        self.cancelled.lock().map(|flag| *flag).unwrap_or(true)
    }

    fn cancel(&self) {
        if let Ok(mut flag) = self.cancelled.lock() {
            if *flag {
                return;
            }
            *flag = true;
            self.condvar.notify_all();
        }
        let children = self
            .children
            .lock()
            .map(|children| children.clone())
            .unwrap_or_default();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

#[derive(Debug, Clone)]
pub struct CallContext {
    cancel: Option<Arc<CancelState>>,
    trace_id: Arc<str>,
}

/// Cancels the context it was created with (and every context derived from it).
#[derive(Debug, Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.state.cancel();
    }
}

/// A context that never reports cancellation. Only [`CallContext::detached`]
/// creates one.
#[derive(Debug, Clone)]
pub struct DetachedContext(CallContext);

impl Deref for DetachedContext {
    type Target = CallContext;

    fn deref(&self) -> &CallContext {
        &self.0
    }
}

impl CallContext {
    pub fn background() -> Self {
        let now = Utc::now();
        let trace_id = format!(
            "{}-{:x}",
            now.format("%Y%m%dT%H%M%S"),
            u64::from(std::process::id()) << 16 ^ u64::from(now.timestamp_subsec_micros())
        );
        Self {
            cancel: None,
            trace_id: Arc::from(trace_id),
        }
    }

    pub fn with_trace_id(trace_id: &str) -> Self {
        Self {
            cancel: None,
            trace_id: Arc::from(trace_id),
        }
    }

    /// Derive a child context that is cancelled either through the returned
    /// handle or when this context is cancelled.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let state = Arc::new(CancelState::default());
        if let Some(parent) = &self.cancel {
            if let Ok(mut children) = parent.children.lock() {
                children.retain(|child| child.strong_count() > 0);
                children.push(Arc::downgrade(&state));
            }
            if parent.is_cancelled() {
                state.cancel();
            }
        }
        let ctx = Self {
            cancel: Some(Arc::clone(&state)),
            trace_id: Arc::clone(&self.trace_id),
        };
        (ctx, CancelHandle { state })
    }

    /// Same values, no cancellation and no deadline.
    pub fn detached(&self) -> DetachedContext {
        DetachedContext(Self {
            cancel: None,
            trace_id: Arc::clone(&self.trace_id),
        })
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|state| state.is_cancelled())
            .unwrap_or(false)
    }

    pub fn check(&self) -> Result<(), TetherError> {
        if self.is_cancelled() {
            return Err(TetherError::Cancelled);
        }
        Ok(())
    }

    /// Sleep for `duration`, returning early with `Cancelled` if the context
    /// is cancelled meanwhile.
    pub fn sleep(&self, duration: Duration) -> Result<(), TetherError> {
        let Some(state) = &self.cancel else {
            std::thread::sleep(duration);
            return Ok(());
        };
        let deadline = Instant::now() + duration;
        let mut cancelled = state
            .cancelled
            .lock()
            .map_err(|_| TetherError::Process("cancel state lock poisoned".to_string()))?;
        loop {
            if *cancelled {
                return Err(TetherError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            let (guard, _) = state
                .condvar
                .wait_timeout(cancelled, deadline - now)
                .map_err(|_| TetherError::Process("cancel state lock poisoned".to_string()))?;
            cancelled = guard;
        }
    }
}

/// Poll `ready` up to `attempts` times, sleeping `interval` between tries.
/// Returns `Ok(true)` as soon as `ready` does, `Ok(false)` once the attempts
/// run out.
pub fn poll_until<F>(
    ctx: &CallContext,
    attempts: u32,
    interval: Duration,
    mut ready: F,
) -> Result<bool, TetherError>
where
    F: FnMut() -> Result<bool, TetherError>,
{
    for attempt in 0..attempts {
        if ready()? {
            return Ok(true);
        }
        if attempt + 1 < attempts {
            ctx.sleep(interval)?;
        }
    }
    Ok(false)
}
