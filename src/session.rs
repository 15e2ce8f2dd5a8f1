//! Nested daemon → connector → intercept session with reverse-order unwind.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::activator::{env_file_content, Activation, InterceptActivator, InterceptResource};
use crate::cancel::{CallContext, DetachedContext};
use crate::config::{connector_socket_path, daemon_socket_path, Config, KubeFlags};
use crate::connector::{ConnectorClient, ConnectorLaunch, ConnectorResource, SocketConnectorClient};
use crate::daemon::{DaemonClient, DaemonLaunch, DaemonResource, SocketDaemonClient};
use crate::ensure::{Ensured, Policy};
use crate::error::TetherError;
use crate::proto::{ConnectRequest, EstablishNetworkRequest};
use crate::request::InterceptPlan;
use crate::rpc::SocketTransport;
use crate::runner::{run_attached, DockerRun, Launcher, ProcessLauncher, RunSpec};

pub fn daemon_client(cfg: &Config) -> Arc<dyn DaemonClient> {
    Arc::new(SocketDaemonClient::new(SocketTransport::new(
        daemon_socket_path(cfg),
        "daemon",
    )))
}

pub fn connector_client(cfg: &Config, config_dir: &Path) -> Arc<dyn ConnectorClient> {
    Arc::new(SocketConnectorClient::new(SocketTransport::new(
        connector_socket_path(cfg, config_dir),
        "connector",
    )))
}

pub struct Session {
    daemon: Ensured<DaemonResource>,
    connector: Ensured<ConnectorResource>,
    intercept: Option<Ensured<InterceptResource>>,
}

impl Session {
    pub fn new(daemon: Ensured<DaemonResource>, connector: Ensured<ConnectorResource>) -> Self {
        Self {
            daemon,
            connector,
            intercept: None,
        }
    }

    /// Session wired to the configured sockets. `retain` keeps a daemon and
    /// connector this invocation starts running after a successful exit.
    pub fn from_config(cfg: &Config, config_dir: &Path, flags: &KubeFlags, retain: bool) -> Self {
        let policy = Policy::from_timeouts(&cfg.timeouts);
        let launcher: Arc<dyn Launcher> = Arc::new(ProcessLauncher);
        let connector_socket = connector_socket_path(cfg, config_dir);

        let daemon = DaemonResource::new(
            daemon_client(cfg),
            Arc::clone(&launcher),
            DaemonLaunch {
                executable: cfg.daemon.executable.clone(),
                socket_path: daemon_socket_path(cfg).to_string_lossy().to_string(),
                elevate: cfg.daemon.elevate,
                socket_attempts: cfg.timeouts.socket_wait_attempts(),
                socket_interval: cfg.timeouts.poll_interval(),
            },
            EstablishNetworkRequest {
                connector_socket: connector_socket.to_string_lossy().to_string(),
                mapped_namespaces: flags.mapped_namespaces.clone(),
            },
        );
        let connector = ConnectorResource::new(
            connector_client(cfg, config_dir),
            launcher,
            ConnectorLaunch {
                executable: cfg.connector.executable.clone(),
                socket_path: connector_socket.to_string_lossy().to_string(),
                socket_attempts: cfg.timeouts.socket_wait_attempts(),
                socket_interval: cfg.timeouts.poll_interval(),
            },
            ConnectRequest {
                kube_flags: flags.to_map(),
                mapped_namespaces: flags.mapped_namespaces.clone(),
                implicit: false,
            },
        );
        Self::new(
            Ensured::new(daemon, policy, retain),
            Ensured::new(connector, policy, retain),
        )
    }

    pub fn ensure_daemon(&mut self, ctx: &CallContext) -> Result<bool, TetherError> {
        self.daemon.ensure(ctx)
    }

    pub fn ensure_connector(&mut self, ctx: &CallContext) -> Result<bool, TetherError> {
        self.ensure_daemon(ctx)?;
        self.connector.ensure(ctx)
    }

    pub fn connector(&self) -> &ConnectorResource {
        self.connector.resource()
    }

    pub fn connector_client(&self) -> Arc<dyn ConnectorClient> {
        self.connector.resource().client()
    }

    /// Ensure daemon and connector, then the intercept described by
    /// `activator`. Returns whether this call created the intercept.
    pub fn ensure_intercept(
        &mut self,
        ctx: &CallContext,
        activator: InterceptActivator,
        retain: bool,
    ) -> Result<bool, TetherError> {
        self.ensure_connector(ctx)?;
        let intercept = self.intercept.insert(Ensured::new(
            InterceptResource::new(activator),
            Policy::immediate(),
            retain,
        ));
        intercept.ensure(ctx)
    }

    pub fn activation(&self) -> Option<&Activation> {
        self.intercept
            .as_ref()
            .and_then(|intercept| intercept.resource().activator().activation())
    }

    pub fn deactivate_intercept(
        &mut self,
        ctx: &DetachedContext,
        failed: bool,
    ) -> Result<bool, TetherError> {
        match self.intercept.as_mut() {
            Some(intercept) => intercept.deactivate(ctx, failed),
            None => Ok(false),
        }
    }

    pub fn deactivate_connector(
        &mut self,
        ctx: &DetachedContext,
        failed: bool,
    ) -> Result<bool, TetherError> {
        self.connector.deactivate(ctx, failed)
    }

    pub fn deactivate_daemon(
        &mut self,
        ctx: &DetachedContext,
        failed: bool,
    ) -> Result<bool, TetherError> {
        self.daemon.deactivate(ctx, failed)
    }

    /// Unwind in reverse acquisition order, attempting every step even when
    /// an earlier one fails.
    pub fn release(&mut self, ctx: &DetachedContext, failed: bool) -> Vec<TetherError> {
        let mut errors = Vec::new();
        if let Err(err) = self.deactivate_intercept(ctx, failed) {
            errors.push(err);
        }
        if let Err(err) = self.deactivate_connector(ctx, failed) {
            errors.push(err);
        }
        if let Err(err) = self.deactivate_daemon(ctx, failed) {
            errors.push(err);
        }
        errors
    }

    /// Run the intercept's command, or `docker run` its image, with the
    /// intercept's environment.
    pub fn run_under_intercept(&self, ctx: &CallContext) -> Result<(), TetherError> {
        let (Some(intercept), Some(activation)) = (self.intercept.as_ref(), self.activation())
        else {
            return Err(TetherError::Process("no active intercept".to_string()));
        };
        let plan = intercept.resource().activator().plan();
        if plan.command.is_empty() {
            return Ok(());
        }
        if !plan.docker_run {
            return run_command(ctx, &plan.command, &activation.environment);
        }

        let mut env_file = tempfile::Builder::new()
            .prefix(&format!("tether-{}-", plan.name()))
            .suffix(".env")
            .tempfile()?;
        env_file.write_all(env_file_content(&activation.environment).as_bytes())?;
        let env_path = env_file.into_temp_path();
        let run = docker_run(plan, activation, &env_path);
        let result = run_attached(ctx, &run.run_spec());
        if let Err(err) = env_path.close() {
            debug!(error = %err, "env file already gone");
        }
        result
    }
}

/// `docker run` inputs for the intercept's container. The remote mount is
/// exposed at the same path inside the container unless `--docker-mount`
/// names another one.
fn docker_run(plan: &InterceptPlan, activation: &Activation, env_file: &Path) -> DockerRun {
    let volume = activation.mount_path().map(|host| {
        let container = plan
            .docker_mount
            .clone()
            .unwrap_or_else(|| host.to_string());
        (host.to_string(), container)
    });
    let port = plan.port.as_ref();
    DockerRun {
        intercept_name: plan.name().to_string(),
        local_port: port.map(|p| p.local).unwrap_or_default(),
        container_port: port.and_then(|p| p.docker),
        volume,
        env_file: Some(env_file.to_path_buf()),
        user_args: plan.command.clone(),
    }
}

/// Run `command` attached, with `env` layered over the current environment.
pub fn run_command(
    ctx: &CallContext,
    command: &[String],
    env: &BTreeMap<String, String>,
) -> Result<(), TetherError> {
    let Some((program, args)) = command.split_first() else {
        return Ok(());
    };
    run_attached(ctx, &RunSpec::new(program.clone(), args.to_vec()).with_env(env.clone()))
}

/// Run `body` against `session`, then release whatever this invocation
/// acquired. Cleanup always runs on a detached context; its errors are
/// reported but never replace the body's result.
pub fn session_scope<T, F>(ctx: &CallContext, session: &mut Session, body: F) -> Result<T, TetherError>
where
    F: FnOnce(&mut Session) -> Result<T, TetherError>,
{
    let result = body(session);
    let cleanup_ctx = ctx.detached();
    for err in session.release(&cleanup_ctx, result.is_err()) {
        warn!(error = %err, "cleanup failed");
        eprintln!("cleanup: {err}");
    }
    result
}
