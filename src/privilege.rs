//! Privilege elevation for processes that must run as root.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::error::TetherError;

static SUDO_AUTHENTICATED: AtomicBool = AtomicBool::new(false);

pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Arguments for re-running `program` under sudo. The password prompt was
/// already answered by [`authenticate_once`], so sudo must not prompt again.
pub fn sudo_args(program: &Path, args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len() + 3);
    out.push("--non-interactive".to_string());
    out.push("--".to_string());
    out.push(program.to_string_lossy().to_string());
    out.extend(args.iter().cloned());
    out
}

/// Validate sudo credentials at most once per process.
pub fn authenticate_once() -> Result<(), TetherError> {
    if SUDO_AUTHENTICATED.load(Ordering::Acquire) {
        return Ok(());
    }
    debug!("validating sudo credentials");
    let status = Command::new("sudo")
        .arg("--validate")
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|err| {
            TetherError::Process(format!("failed to run sudo to obtain root privileges: {err}"))
        })?;
    if !status.success() {
        return Err(TetherError::Process(
            "unable to obtain root privileges; sudo authentication failed".to_string(),
        ));
    }
    SUDO_AUTHENTICATED.store(true, Ordering::Release);
    Ok(())
}

/// Build a command for `program`, elevated through sudo unless `elevate` is
/// false or the current process already runs as root.
pub fn command_for(program: &Path, args: &[String], elevate: bool) -> Result<Command, TetherError> {
    if !elevate || is_root() {
        let mut cmd = Command::new(program);
        cmd.args(args);
        return Ok(cmd);
    }
    authenticate_once()?;
    let mut cmd = Command::new("sudo");
    cmd.args(sudo_args(program, args));
    Ok(cmd)
}
