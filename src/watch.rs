use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use tracing::debug;

use crate::cancel::CallContext;
use crate::connector::SnapshotStream;
use crate::error::TetherError;
use crate::proto::{InterceptInfo, InterceptSnapshot};

const RECV_TICK: Duration = Duration::from_millis(100);

/// Feed each snapshot to `on_snapshot` until the stream ends or `ctx` is
/// cancelled. Cancellation ends the watch cleanly.
pub fn watch_loop<F>(
    ctx: &CallContext,
    stream: SnapshotStream,
    mut on_snapshot: F,
) -> Result<(), TetherError>
where
    F: FnMut(&InterceptSnapshot) -> Result<(), TetherError>,
{
    loop {
        if ctx.is_cancelled() {
            debug!("watch cancelled");
            return Ok(());
        }
        match stream.recv_timeout(RECV_TICK) {
            Ok(Ok(snapshot)) => on_snapshot(&snapshot)?,
            Ok(Err(err)) => return Err(err),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("watch stream closed");
                return Ok(());
            }
        }
    }
}

/// One line per intercept, the way `list` prints them.
pub fn describe(info: &InterceptInfo) -> String {
    let spec = &info.spec;
    let mut line = format!(
        "{}: intercepted, redirecting port {} to {}:{}",
        spec.name,
        spec.service_port_identifier.as_deref().unwrap_or("default"),
        spec.target_host,
        spec.target_port
    );
    if !spec.namespace.is_empty() {
        line = format!("{line} (namespace {})", spec.namespace);
    }
    if let Some(domain) = info.preview_domain.as_deref().filter(|d| !d.is_empty()) {
        line.push_str(&format!("\n    preview url: https://{domain}"));
    }
    if !info.disposition.is_empty() && info.disposition != "ACTIVE" {
        line.push_str(&format!("\n    state: {}", info.disposition));
    }
    line
}
