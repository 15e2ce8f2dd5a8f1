//! Child process supervision: attached runs with signal forwarding, detached
//! background launches, and `docker run` argument assembly.

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use signal_hook::iterator::Signals;
use signal_hook::SigId;
use std::collections::BTreeMap;
#[cfg(unix)]
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancel::{CallContext, CancelHandle};
use crate::error::TetherError;
use crate::privilege;

const WAIT_SLICE: Duration = Duration::from_millis(50);
const FORWARDED_SIGNALS: [i32; 2] = [SIGINT, SIGTERM];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl RunSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Self::default()
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn render(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// Forwards the first SIGINT or SIGTERM received while a child runs.
struct SignalForwarder {
    received: Arc<AtomicUsize>,
    ids: Vec<SigId>,
    forwarded: bool,
}

impl SignalForwarder {
    fn install() -> Result<Self, TetherError> {
        let received = Arc::new(AtomicUsize::new(0));
        let mut ids = Vec::new();
        for signal in FORWARDED_SIGNALS {
            let id = flag::register_usize(signal, Arc::clone(&received), signal as usize)?;
            ids.push(id);
        }
        Ok(Self {
            received,
            ids,
            forwarded: false,
        })
    }

    fn take(&mut self) -> Option<i32> {
        if self.forwarded {
            return None;
        }
        match self.received.swap(0, Ordering::SeqCst) {
            0 => None,
            signal => {
                self.forwarded = true;
                i32::try_from(signal).ok()
            }
        }
    }
}

impl Drop for SignalForwarder {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Cancel `handle` on the first SIGINT/SIGTERM. Any later one terminates the
/// process with the default action.
pub fn install_interrupt_listener(handle: CancelHandle) -> Result<(), TetherError> {
    let interrupted = Arc::new(AtomicBool::new(false));
    for signal in FORWARDED_SIGNALS {
        flag::register_conditional_default(signal, Arc::clone(&interrupted))?;
        flag::register(signal, Arc::clone(&interrupted))?;
    }
    let mut signals = Signals::new(FORWARDED_SIGNALS)?;
    thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            debug!(signal, "interrupt received; cancelling");
            handle.cancel();
        }
    });
    Ok(())
}

/// Run `spec` in the foreground and wait for it. Signals are forwarded to the
/// child once; cancellation of `ctx` terminates it with SIGTERM once.
pub fn run_attached(ctx: &CallContext, spec: &RunSpec) -> Result<(), TetherError> {
    debug!(command = %spec.render(), "running attached");
    let mut forwarder = SignalForwarder::install()?;
    let mut child = spec
        .command()
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|err| TetherError::Process(format!("failed to start `{}`: {err}", spec.render())))?;
    let status = wait_forwarding(ctx, &mut child, &mut forwarder)?;
    drop(forwarder);
    check_exit(spec, status)
}

fn wait_forwarding(
    ctx: &CallContext,
    child: &mut Child,
    forwarder: &mut SignalForwarder,
) -> Result<ExitStatus, TetherError> {
    let mut terminated = false;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if let Some(signal) = forwarder.take() {
            debug!(signal, pid = child.id(), "forwarding signal");
            terminated = true;
            send_signal(child, signal);
        } else if ctx.is_cancelled() && !terminated {
            debug!(pid = child.id(), "context cancelled; terminating child");
            terminated = true;
            send_signal(child, SIGTERM);
        }
        thread::sleep(WAIT_SLICE);
    }
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: i32) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    let rc = unsafe { libc::kill(pid, signal) };
    if rc != 0 {
        warn!(pid, signal, "failed to signal child process");
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _signal: i32) {
    let _ = child.kill();
}

fn check_exit(spec: &RunSpec, status: ExitStatus) -> Result<(), TetherError> {
    if status.success() {
        return Ok(());
    }
    let code = match status.code() {
        Some(code) => code,
        None => exit_signal(&status).map(|sig| 128 + sig).unwrap_or(1),
    };
    Err(TetherError::ExitStatus {
        command: spec.render(),
        code,
    })
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Own process group so terminal interrupts do not reach it.
fn detach(cmd: &mut Command) {
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    #[cfg(unix)]
    cmd.process_group(0);
}

/// Starts background service processes.
pub trait Launcher {
    fn launch(&self, program: &str, args: &[String], elevate: bool) -> Result<u32, TetherError>;
}

pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, program: &str, args: &[String], elevate: bool) -> Result<u32, TetherError> {
        let path = which::which(program).map_err(|_| {
            TetherError::Process(format!("{program} not found on PATH"))
        })?;
        let mut cmd = privilege::command_for(&path, args, elevate)?;
        detach(&mut cmd);
        let child = cmd
            .spawn()
            .map_err(|err| TetherError::Process(format!("failed to start {program}: {err}")))?;
        debug!(program, pid = child.id(), elevate, "launched");
        Ok(child.id())
    }
}

/// Inputs for a `docker run` of the user's container next to an intercept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DockerRun {
    pub intercept_name: String,
    pub local_port: u16,
    pub container_port: Option<u16>,
    /// Host mount point and the path it is mounted at inside the container.
    pub volume: Option<(String, String)>,
    pub env_file: Option<PathBuf>,
    pub user_args: Vec<String>,
}

impl DockerRun {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if !has_name_flag(&self.user_args) {
            args.push("--name".to_string());
            args.push(format!(
                "intercept-{}-{}",
                self.intercept_name, self.local_port
            ));
        }
        if let Some((host, container)) = &self.volume {
            args.push("-v".to_string());
            args.push(format!("{host}:{container}"));
        }
        if let Some(container_port) = self.container_port {
            args.push("-p".to_string());
            args.push(format!("{}:{}", self.local_port, container_port));
        }
        if let Some(env_file) = &self.env_file {
            args.push("--env-file".to_string());
            args.push(env_file.to_string_lossy().to_string());
        }
        args.extend(self.user_args.iter().cloned());
        args
    }

    pub fn run_spec(&self) -> RunSpec {
        RunSpec::new("docker", self.args())
    }
}

/// `docker run` options that take no value.
const DOCKER_SWITCHES: &[&str] = &[
    "--rm",
    "--detach",
    "--interactive",
    "--tty",
    "--init",
    "--privileged",
    "--publish-all",
    "--read-only",
    "--sig-proxy",
    "-P",
];

/// Whether the options before the image name already set `--name`. Anything
/// after the image belongs to the container's own command.
fn has_name_flag(args: &[String]) -> bool {
    let mut expects_value = false;
    for arg in args {
        if arg == "--name" || arg.starts_with("--name=") {
            return true;
        }
        if arg.starts_with('-') {
            expects_value = !is_switch(arg);
            continue;
        }
        if !expects_value {
            return false;
        }
        expects_value = false;
    }
    false
}

fn is_switch(arg: &str) -> bool {
    if arg.contains('=') || DOCKER_SWITCHES.contains(&arg) {
        return true;
    }
    // Bundled short switches such as `-it` or `-dit`.
    arg.strip_prefix('-')
        .filter(|rest| !rest.starts_with('-') && !rest.is_empty())
        .is_some_and(|rest| rest.chars().all(|c| matches!(c, 'd' | 'i' | 't')))
}
