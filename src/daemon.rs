use std::sync::Arc;
use tracing::debug;

use crate::cancel::{poll_until, CallContext, DetachedContext};
use crate::ensure::{Probe, Resource, Started};
use crate::error::TetherError;
use crate::proto::{DaemonStatus, Empty, EstablishNetworkRequest, NetworkState};
use crate::rpc::SocketTransport;
use crate::runner::Launcher;

/// Calls understood by the root network daemon.
pub trait DaemonClient {
    fn is_running(&self) -> bool;
    fn status(&self, ctx: &CallContext) -> Result<DaemonStatus, TetherError>;
    fn establish_network(
        &self,
        ctx: &CallContext,
        request: &EstablishNetworkRequest,
    ) -> Result<DaemonStatus, TetherError>;
    fn quit(&self, ctx: &CallContext) -> Result<(), TetherError>;
}

pub struct SocketDaemonClient {
    transport: SocketTransport,
}

impl SocketDaemonClient {
    pub fn new(transport: SocketTransport) -> Self {
        Self { transport }
    }
}

impl DaemonClient for SocketDaemonClient {
    fn is_running(&self) -> bool {
        self.transport.exists()
    }

    fn status(&self, ctx: &CallContext) -> Result<DaemonStatus, TetherError> {
        self.transport.call(ctx, "/v1/status", &Empty {})
    }

    fn establish_network(
        &self,
        ctx: &CallContext,
        request: &EstablishNetworkRequest,
    ) -> Result<DaemonStatus, TetherError> {
        self.transport.call(ctx, "/v1/connect", request)
    }

    fn quit(&self, ctx: &CallContext) -> Result<(), TetherError> {
        let _: Empty = self.transport.call(ctx, "/v1/quit", &Empty {})?;
        Ok(())
    }
}

/// How to launch the daemon when its socket is absent.
#[derive(Debug, Clone)]
pub struct DaemonLaunch {
    pub executable: String,
    pub socket_path: String,
    pub elevate: bool,
    pub socket_attempts: u32,
    pub socket_interval: std::time::Duration,
}

pub struct DaemonResource {
    client: Arc<dyn DaemonClient>,
    launcher: Arc<dyn Launcher>,
    launch: DaemonLaunch,
    network: EstablishNetworkRequest,
}

impl DaemonResource {
    pub fn new(
        client: Arc<dyn DaemonClient>,
        launcher: Arc<dyn Launcher>,
        launch: DaemonLaunch,
        network: EstablishNetworkRequest,
    ) -> Self {
        Self {
            client,
            launcher,
            launch,
            network,
        }
    }

    pub fn client(&self) -> &Arc<dyn DaemonClient> {
        &self.client
    }
}

impl Resource for DaemonResource {
    fn name(&self) -> &str {
        "daemon"
    }

    fn probe(&mut self, ctx: &CallContext) -> Result<Probe, TetherError> {
        if !self.client.is_running() {
            return Ok(Probe::Absent);
        }
        let status = self.client.status(ctx)?;
        Ok(match status.network {
            NetworkState::Idle => Probe::Absent,
            NetworkState::Establishing => {
                Probe::NotReady("network overrides not yet established".to_string())
            }
            NetworkState::Ready => Probe::Active,
        })
    }

    fn start(&mut self, ctx: &CallContext) -> Result<Started, TetherError> {
        let mut started = Started::Existing;
        if !self.client.is_running() {
            let args = vec!["--socket".to_string(), self.launch.socket_path.clone()];
            self.launcher
                .launch(&self.launch.executable, &args, self.launch.elevate)?;
            started = Started::Acquired;
            let client = &self.client;
            let appeared = poll_until(
                ctx,
                self.launch.socket_attempts,
                self.launch.socket_interval,
                || Ok(client.is_running()),
            )?;
            if !appeared {
                return Err(TetherError::NotReady {
                    resource: "daemon".to_string(),
                    detail: format!("socket {} did not appear", self.launch.socket_path),
                });
            }
        }
        debug!(connector_socket = %self.network.connector_socket, "establishing network");
        self.client.establish_network(ctx, &self.network)?;
        Ok(started)
    }

    fn ready(&mut self, ctx: &CallContext) -> Result<bool, TetherError> {
        Ok(self.client.status(ctx)?.network == NetworkState::Ready)
    }

    fn quit(&mut self, ctx: &DetachedContext) -> Result<(), TetherError> {
        self.client.quit(ctx)
    }

    fn gone(&mut self, _ctx: &DetachedContext) -> Result<bool, TetherError> {
        Ok(!self.client.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure::{Ensured, Policy};
    use crate::testutil::{FakeDaemon, RecordingLauncher};
    use std::time::Duration;

    fn resource(daemon: &Arc<FakeDaemon>, launcher: &Arc<RecordingLauncher>) -> DaemonResource {
        let client: Arc<dyn DaemonClient> = Arc::clone(daemon) as Arc<dyn DaemonClient>;
        let launch_via: Arc<dyn Launcher> = Arc::clone(launcher) as Arc<dyn Launcher>;
        DaemonResource::new(
            client,
            launch_via,
            DaemonLaunch {
                executable: "tether-daemon".to_string(),
                socket_path: "/tmp/d.sock".to_string(),
                elevate: true,
                socket_attempts: 3,
                socket_interval: Duration::from_millis(1),
            },
            EstablishNetworkRequest::default(),
        )
    }

    fn policy() -> Policy {
        Policy {
            ready_attempts: 3,
            settle_attempts: 3,
            ..Policy::immediate()
        }
    }

    #[test]
    fn absent_daemon_is_launched_elevated_and_owned() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.start_on_launch();
        let launcher = Arc::new(RecordingLauncher::starting(Arc::clone(&daemon)));
        let mut ensured = Ensured::new(resource(&daemon, &launcher), policy(), false);
        let ctx = CallContext::background();

        assert!(ensured.ensure(&ctx).unwrap());
        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].0, "tether-daemon");
        assert!(launches[0].2, "daemon must be elevated");
        assert_eq!(daemon.establish_calls(), 1);

        assert!(ensured.deactivate(&ctx.detached(), false).unwrap());
        assert_eq!(daemon.quit_calls(), 1);
        assert!(!daemon.is_running());
    }

    #[test]
    fn running_daemon_with_network_is_left_alone() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.set_running(NetworkState::Ready);
        let launcher = Arc::new(RecordingLauncher::starting(Arc::clone(&daemon)));
        let mut ensured = Ensured::new(resource(&daemon, &launcher), policy(), false);
        let ctx = CallContext::background();

        assert!(!ensured.ensure(&ctx).unwrap());
        assert!(launcher.launches().is_empty());
        assert!(!ensured.deactivate(&ctx.detached(), true).unwrap());
        assert_eq!(daemon.quit_calls(), 0);
    }

    #[test]
    fn establishing_network_is_retried_then_reported() {
        let daemon = Arc::new(FakeDaemon::default());
        daemon.set_running(NetworkState::Establishing);
        let launcher = Arc::new(RecordingLauncher::starting(Arc::clone(&daemon)));
        let mut ensured = Ensured::new(resource(&daemon, &launcher), policy(), false);
        let err = ensured.ensure(&CallContext::background()).unwrap_err();
        assert!(
            err.to_string()
                .contains("network overrides not yet established"),
            "{err}"
        );
        assert_eq!(daemon.status_calls(), 3);
    }
}
