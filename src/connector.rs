use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cancel::{poll_until, CallContext, DetachedContext};
use crate::ensure::{Probe, Resource, Started};
use crate::error::TetherError;
use crate::proto::{
    ClusterInfo, ConnectOutcome, ConnectRequest, ConnectResult, ConnectorStatus,
    CreateInterceptRequest, Empty, IngressInfo, IngressInfoList, InterceptResult,
    InterceptSnapshot, InterceptSpec, LoginResult, RemoveInterceptRequest, ResolveIngressRequest,
    UpdateInterceptRequest,
};
use crate::rpc::SocketTransport;
use crate::runner::Launcher;

pub type SnapshotStream = Receiver<Result<InterceptSnapshot, TetherError>>;

/// Calls understood by the per-user session connector.
pub trait ConnectorClient {
    fn is_running(&self) -> bool;
    fn status(&self, ctx: &CallContext) -> Result<ConnectorStatus, TetherError>;
    fn connect(&self, ctx: &CallContext, request: &ConnectRequest)
        -> Result<ConnectResult, TetherError>;
    fn quit(&self, ctx: &CallContext) -> Result<(), TetherError>;
    fn login(&self, ctx: &CallContext) -> Result<LoginResult, TetherError>;
    fn can_intercept(
        &self,
        ctx: &CallContext,
        request: &CreateInterceptRequest,
    ) -> Result<InterceptResult, TetherError>;
    fn create_intercept(
        &self,
        ctx: &CallContext,
        request: &CreateInterceptRequest,
    ) -> Result<InterceptResult, TetherError>;
    fn remove_intercept(&self, ctx: &CallContext, name: &str)
        -> Result<InterceptResult, TetherError>;
    fn update_intercept(
        &self,
        ctx: &CallContext,
        request: &UpdateInterceptRequest,
    ) -> Result<InterceptResult, TetherError>;
    fn list_intercepts(&self, ctx: &CallContext) -> Result<InterceptSnapshot, TetherError>;
    fn watch_intercepts(&self, ctx: &CallContext) -> Result<SnapshotStream, TetherError>;
    fn get_ingress_infos(&self, ctx: &CallContext) -> Result<Vec<IngressInfo>, TetherError>;
    fn resolve_ingress_info(
        &self,
        ctx: &CallContext,
        request: &ResolveIngressRequest,
    ) -> Result<IngressInfo, TetherError>;
}

pub struct SocketConnectorClient {
    transport: SocketTransport,
}

impl SocketConnectorClient {
    pub fn new(transport: SocketTransport) -> Self {
        Self { transport }
    }
}

impl ConnectorClient for SocketConnectorClient {
    fn is_running(&self) -> bool {
        self.transport.exists()
    }

    fn status(&self, ctx: &CallContext) -> Result<ConnectorStatus, TetherError> {
        self.transport.call(ctx, "/v1/status", &Empty {})
    }

    fn connect(
        &self,
        ctx: &CallContext,
        request: &ConnectRequest,
    ) -> Result<ConnectResult, TetherError> {
        self.transport.call(ctx, "/v1/connect", request)
    }

    fn quit(&self, ctx: &CallContext) -> Result<(), TetherError> {
        let _: Empty = self.transport.call(ctx, "/v1/quit", &Empty {})?;
        Ok(())
    }

    fn login(&self, ctx: &CallContext) -> Result<LoginResult, TetherError> {
        self.transport.call(ctx, "/v1/login", &Empty {})
    }

    fn can_intercept(
        &self,
        ctx: &CallContext,
        request: &CreateInterceptRequest,
    ) -> Result<InterceptResult, TetherError> {
        self.transport.call(ctx, "/v1/intercepts/can", request)
    }

    fn create_intercept(
        &self,
        ctx: &CallContext,
        request: &CreateInterceptRequest,
    ) -> Result<InterceptResult, TetherError> {
        self.transport.call(ctx, "/v1/intercepts/create", request)
    }

    fn remove_intercept(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<InterceptResult, TetherError> {
        let request = RemoveInterceptRequest {
            name: name.to_string(),
        };
        self.transport.call(ctx, "/v1/intercepts/remove", &request)
    }

    fn update_intercept(
        &self,
        ctx: &CallContext,
        request: &UpdateInterceptRequest,
    ) -> Result<InterceptResult, TetherError> {
        self.transport.call(ctx, "/v1/intercepts/update", request)
    }

    fn list_intercepts(&self, ctx: &CallContext) -> Result<InterceptSnapshot, TetherError> {
        self.transport.call(ctx, "/v1/intercepts/list", &Empty {})
    }

    fn watch_intercepts(&self, ctx: &CallContext) -> Result<SnapshotStream, TetherError> {
        let mut stream = self.transport.stream(ctx, "/v1/intercepts/watch")?;
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || loop {
            let item = match stream.next_event() {
                Ok(Some(event)) => serde_json::from_str::<InterceptSnapshot>(&event.data)
                    .map_err(TetherError::from),
                Ok(None) => break,
                Err(err) => Err(err),
            };
            let stop = item.is_err();
            if tx.send(item).is_err() || stop {
                break;
            }
        });
        Ok(rx)
    }

    fn get_ingress_infos(&self, ctx: &CallContext) -> Result<Vec<IngressInfo>, TetherError> {
        let list: IngressInfoList = self.transport.call(ctx, "/v1/ingress/list", &Empty {})?;
        Ok(list.ingress_infos)
    }

    fn resolve_ingress_info(
        &self,
        ctx: &CallContext,
        request: &ResolveIngressRequest,
    ) -> Result<IngressInfo, TetherError> {
        self.transport.call(ctx, "/v1/ingress/resolve", request)
    }
}

/// Map a connect outcome onto success (and whether it made the connection)
/// or an error carrying the remote category.
pub fn connect_outcome(result: &ConnectResult) -> Result<Started, TetherError> {
    let default_message = match result.outcome {
        ConnectOutcome::Unspecified => return Ok(Started::Acquired),
        ConnectOutcome::AlreadyConnected => return Ok(Started::Existing),
        ConnectOutcome::Disconnected => "not connected",
        ConnectOutcome::MustRestart => {
            "cluster configuration changed; quit the session and connect again"
        }
        ConnectOutcome::ClusterFailed => "unable to connect to the cluster",
        ConnectOutcome::TrafficManagerFailed => "unable to connect to the traffic manager",
        ConnectOutcome::DaemonFailed => "the network daemon failed to establish the session",
    };
    let message = if result.message.trim().is_empty() {
        default_message.to_string()
    } else {
        result.message.clone()
    };
    Err(TetherError::Remote {
        message,
        category: result.error_category.unwrap_or_default(),
    })
}

/// Reuse the current session without starting anything. An implicit connect
/// that finds the connector disconnected is retried once as an explicit
/// connect with no flags.
pub fn connect_implicitly(
    ctx: &CallContext,
    client: &dyn ConnectorClient,
) -> Result<ConnectResult, TetherError> {
    if !client.is_running() {
        return Err(TetherError::User(
            "not connected; run `tether connect` first".to_string(),
        ));
    }
    let mut result = client.connect(ctx, &ConnectRequest::implicit())?;
    if result.outcome == ConnectOutcome::Disconnected {
        debug!("implicit connect found no session; connecting explicitly");
        result = client.connect(ctx, &ConnectRequest::default())?;
    }
    connect_outcome(&result)?;
    Ok(result)
}

#[derive(Debug, Clone)]
pub struct ConnectorLaunch {
    pub executable: String,
    pub socket_path: String,
    pub socket_attempts: u32,
    pub socket_interval: Duration,
}

pub struct ConnectorResource {
    client: Arc<dyn ConnectorClient>,
    launcher: Arc<dyn Launcher>,
    launch: ConnectorLaunch,
    request: ConnectRequest,
    message: Option<String>,
    cluster: Option<ClusterInfo>,
}

impl ConnectorResource {
    pub fn new(
        client: Arc<dyn ConnectorClient>,
        launcher: Arc<dyn Launcher>,
        launch: ConnectorLaunch,
        request: ConnectRequest,
    ) -> Self {
        Self {
            client,
            launcher,
            launch,
            request,
            message: None,
            cluster: None,
        }
    }

    pub fn client(&self) -> Arc<dyn ConnectorClient> {
        Arc::clone(&self.client)
    }

    /// Message the connector returned for a fresh connection.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn cluster(&self) -> Option<&ClusterInfo> {
        self.cluster.as_ref()
    }
}

impl Resource for ConnectorResource {
    fn name(&self) -> &str {
        "connector"
    }

    fn probe(&mut self, ctx: &CallContext) -> Result<Probe, TetherError> {
        if !self.client.is_running() {
            return Ok(Probe::Absent);
        }
        match self.client.status(ctx) {
            Ok(status) if status.connected => {
                self.cluster = status.cluster;
                Ok(Probe::Active)
            }
            Ok(_) => Ok(Probe::Absent),
            Err(TetherError::Cancelled) => Err(TetherError::Cancelled),
            Err(err) => {
                warn!(error = %err, "connector socket present but status failed");
                Ok(Probe::Absent)
            }
        }
    }

    fn start(&mut self, ctx: &CallContext) -> Result<Started, TetherError> {
        if !self.client.is_running() {
            let args = vec!["--socket".to_string(), self.launch.socket_path.clone()];
            self.launcher.launch(&self.launch.executable, &args, false)?;
            let client = &self.client;
            let appeared = poll_until(
                ctx,
                self.launch.socket_attempts,
                self.launch.socket_interval,
                || Ok(client.is_running()),
            )?;
            if !appeared {
                return Err(TetherError::NotReady {
                    resource: "connector".to_string(),
                    detail: format!("socket {} did not appear", self.launch.socket_path),
                });
            }
        }
        let result = self.client.connect(ctx, &self.request)?;
        let started = connect_outcome(&result)?;
        if started == Started::Acquired && !result.message.trim().is_empty() {
            self.message = Some(result.message.clone());
        }
        self.cluster = Some(result.cluster);
        Ok(started)
    }

    fn ready(&mut self, ctx: &CallContext) -> Result<bool, TetherError> {
        Ok(self.client.status(ctx)?.connected)
    }

    fn quit(&mut self, ctx: &DetachedContext) -> Result<(), TetherError> {
        self.client.quit(ctx)
    }

    fn gone(&mut self, _ctx: &DetachedContext) -> Result<bool, TetherError> {
        Ok(!self.client.is_running())
    }
}

fn identifies_cluster(cluster: &ClusterInfo) -> bool {
    !cluster.server.is_empty() || !cluster.context.is_empty()
}

/// Key of the per-cluster ingress cache. Asks the connector for its status
/// when `known` carries no cluster identity.
pub fn cluster_key(
    ctx: &CallContext,
    client: &dyn ConnectorClient,
    known: Option<&ClusterInfo>,
) -> Result<String, TetherError> {
    if let Some(cluster) = known.filter(|cluster| identifies_cluster(cluster)) {
        return Ok(cluster.cache_key());
    }
    match client.status(ctx)?.cluster {
        Some(cluster) if identifies_cluster(&cluster) => Ok(cluster.cache_key()),
        _ => Err(TetherError::User(
            "connector did not report cluster identity".to_string(),
        )),
    }
}

/// Intercept names are unique per namespace; a spec with no namespace refers
/// to the connected one.
pub fn spec_matches(spec: &InterceptSpec, name: &str, namespace: &str) -> bool {
    spec.name == name && (namespace.is_empty() || spec.namespace == namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure::{Ensured, Policy};
    use crate::error::ErrorCategory;
    use crate::testutil::{FakeConnector, RecordingLauncher};

    fn launch() -> ConnectorLaunch {
        ConnectorLaunch {
            executable: "tether-connector".to_string(),
            socket_path: "/tmp/c.sock".to_string(),
            socket_attempts: 3,
            socket_interval: Duration::from_millis(1),
        }
    }

    fn resource(connector: &Arc<FakeConnector>, launcher: &Arc<RecordingLauncher>) -> ConnectorResource {
        let client: Arc<dyn ConnectorClient> = Arc::clone(connector) as Arc<dyn ConnectorClient>;
        let launch_via: Arc<dyn Launcher> = Arc::clone(launcher) as Arc<dyn Launcher>;
        let mut request = ConnectRequest::default();
        request
            .kube_flags
            .insert("context".to_string(), "dev".to_string());
        ConnectorResource::new(client, launch_via, launch(), request)
    }

    #[test]
    fn outcomes_map_to_success_or_categorized_error() {
        let mut result = ConnectResult::default();
        assert_eq!(connect_outcome(&result).unwrap(), Started::Acquired);
        result.outcome = ConnectOutcome::AlreadyConnected;
        assert_eq!(connect_outcome(&result).unwrap(), Started::Existing);

        result.outcome = ConnectOutcome::ClusterFailed;
        result.message = "no route to cluster".to_string();
        result.error_category = Some(ErrorCategory::Config);
        let err = connect_outcome(&result).unwrap_err();
        assert_eq!(err.to_string(), "no route to cluster");
        assert_eq!(err.category(), ErrorCategory::Config);

        result.outcome = ConnectOutcome::MustRestart;
        result.message.clear();
        result.error_category = None;
        let err = connect_outcome(&result).unwrap_err();
        assert!(err.to_string().contains("quit"));
        assert_eq!(err.category(), ErrorCategory::Unknown);
    }

    #[test]
    fn implicit_connect_retries_once_explicitly() {
        let connector = FakeConnector::running();
        connector.push_connect(ConnectResult {
            outcome: ConnectOutcome::Disconnected,
            ..ConnectResult::default()
        });
        connector.push_connect(ConnectResult::default());
        connect_implicitly(&CallContext::background(), &*connector).unwrap();
        let requests = connector.connect_requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].implicit);
        assert!(!requests[1].implicit);
        assert!(requests[1].kube_flags.is_empty());
    }

    #[test]
    fn implicit_connect_surfaces_second_disconnect() {
        let connector = FakeConnector::running();
        for _ in 0..3 {
            connector.push_connect(ConnectResult {
                outcome: ConnectOutcome::Disconnected,
                ..ConnectResult::default()
            });
        }
        let err = connect_implicitly(&CallContext::background(), &*connector).unwrap_err();
        assert!(matches!(err, TetherError::Remote { .. }));
        assert_eq!(connector.connect_requests().len(), 2);
    }

    #[test]
    fn implicit_connect_without_connector_is_user_error() {
        let connector = Arc::new(FakeConnector::default());
        let err = connect_implicitly(&CallContext::background(), &*connector).unwrap_err();
        assert!(err.is_user_error());
        assert!(connector.connect_requests().is_empty());
    }

    #[test]
    fn absent_connector_is_launched_and_connected_with_flags() {
        let connector = Arc::new(FakeConnector::default());
        let launcher = Arc::new(RecordingLauncher::starting(Arc::clone(&connector)));
        connector.push_connect(ConnectResult {
            message: "Connected to context dev".to_string(),
            ..ConnectResult::default()
        });
        let mut ensured = Ensured::new(resource(&connector, &launcher), Policy::immediate(), true);
        let ctx = CallContext::background();
        assert!(ensured.ensure(&ctx).unwrap());
        assert_eq!(ensured.resource().message(), Some("Connected to context dev"));
        let launches = launcher.launches();
        assert_eq!(launches.len(), 1);
        assert!(!launches[0].2, "connector runs as the user");
        let requests = connector.connect_requests();
        assert_eq!(requests[0].kube_flags.get("context").map(String::as_str), Some("dev"));

        assert!(!ensured.deactivate(&ctx.detached(), false).unwrap());
        assert!(ensured.deactivate(&ctx.detached(), true).unwrap());
        assert_eq!(connector.quit_calls(), 1);
    }

    #[test]
    fn cluster_key_never_falls_back_to_empty() {
        let ctx = CallContext::background();
        let connector = FakeConnector::running();
        connector.set_connected(true);
        let known = ClusterInfo {
            server: "https://k8s.example".to_string(),
            context: "dev".to_string(),
            ..ClusterInfo::default()
        };
        assert_eq!(
            cluster_key(&ctx, &*connector, Some(&known)).unwrap(),
            "https://k8s.example/dev"
        );

        let err = cluster_key(&ctx, &*connector, None).unwrap_err();
        assert!(err.to_string().contains("cluster identity"));
        let err = cluster_key(&ctx, &*connector, Some(&ClusterInfo::default())).unwrap_err();
        assert!(err.is_user_error());

        connector.set_cluster(Some(known.clone()));
        assert_eq!(
            cluster_key(&ctx, &*connector, Some(&ClusterInfo::default())).unwrap(),
            known.cache_key()
        );
    }

    #[test]
    fn connected_connector_is_reused() {
        let connector = FakeConnector::running();
        connector.set_connected(true);
        let launcher = Arc::new(RecordingLauncher::starting(Arc::clone(&connector)));
        let mut ensured = Ensured::new(resource(&connector, &launcher), Policy::immediate(), false);
        assert!(!ensured.ensure(&CallContext::background()).unwrap());
        assert!(connector.connect_requests().is_empty());
        assert!(launcher.launches().is_empty());
    }
}
