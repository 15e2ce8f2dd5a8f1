//! In-memory stand-ins for the daemon, the connector and the interactive bits.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crate::cancel::{CallContext, CancelHandle};
use crate::connector::{ConnectorClient, SnapshotStream};
use crate::daemon::DaemonClient;
use crate::error::TetherError;
use crate::ingress::{IngressCache, Prompter};
use crate::login::Authenticator;
use crate::mount::MountRequest;
use crate::ports::PortMapping;
use crate::proto::{
    ClusterInfo, ConnectOutcome, ConnectRequest, ConnectResult, ConnectorStatus, CreateInterceptRequest,
    DaemonStatus, EstablishNetworkRequest, IngressInfo, InterceptResult, InterceptSnapshot,
    InterceptSpec, LoginResult, NetworkState, ResolveIngressRequest, UpdateInterceptRequest,
};
use crate::request::{InterceptPlan, LOOPBACK};
use crate::runner::Launcher;

/// Ordered record of calls across several fakes.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn new_journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub trait Launchable {
    fn launched(&self);
}

#[derive(Default)]
struct DaemonState {
    running: bool,
    network: NetworkState,
    starts_on_launch: bool,
    status_calls: usize,
    establish_calls: usize,
    quit_calls: usize,
}

#[derive(Default)]
pub struct FakeDaemon {
    state: Mutex<DaemonState>,
    journal: Option<Journal>,
}

impl FakeDaemon {
    pub fn sharing(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: Some(Arc::clone(journal)),
            ..Self::default()
        })
    }

    fn note(&self, call: &str) {
        if let Some(journal) = &self.journal {
            journal.lock().unwrap().push(format!("daemon.{call}"));
        }
    }

    pub fn start_on_launch(&self) {
        self.state.lock().unwrap().starts_on_launch = true;
    }

    pub fn set_running(&self, network: NetworkState) {
        let mut state = self.state.lock().unwrap();
        state.running = true;
        state.network = network;
    }

    pub fn status_calls(&self) -> usize {
        self.state.lock().unwrap().status_calls
    }

    pub fn establish_calls(&self) -> usize {
        self.state.lock().unwrap().establish_calls
    }

    pub fn quit_calls(&self) -> usize {
        self.state.lock().unwrap().quit_calls
    }
}

impl Launchable for FakeDaemon {
    fn launched(&self) {
        let mut state = self.state.lock().unwrap();
        if state.starts_on_launch {
            state.running = true;
            state.network = NetworkState::Idle;
        }
    }
}

impl DaemonClient for FakeDaemon {
    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn status(&self, ctx: &CallContext) -> Result<DaemonStatus, TetherError> {
        ctx.check()?;
        let mut state = self.state.lock().unwrap();
        state.status_calls += 1;
        Ok(DaemonStatus {
            version: "test".to_string(),
            network: state.network.clone(),
        })
    }

    fn establish_network(
        &self,
        ctx: &CallContext,
        _request: &EstablishNetworkRequest,
    ) -> Result<DaemonStatus, TetherError> {
        ctx.check()?;
        self.note("establish_network");
        let mut state = self.state.lock().unwrap();
        state.establish_calls += 1;
        state.network = NetworkState::Ready;
        Ok(DaemonStatus {
            version: "test".to_string(),
            network: NetworkState::Ready,
        })
    }

    fn quit(&self, ctx: &CallContext) -> Result<(), TetherError> {
        ctx.check()?;
        self.note("quit");
        let mut state = self.state.lock().unwrap();
        state.quit_calls += 1;
        state.running = false;
        state.network = NetworkState::Idle;
        Ok(())
    }
}

#[derive(Default)]
struct ConnectorState {
    running: bool,
    connected: bool,
    cluster: Option<ClusterInfo>,
    calls: Vec<String>,
    connect_queue: VecDeque<ConnectResult>,
    connect_requests: Vec<ConnectRequest>,
    can_queue: VecDeque<InterceptResult>,
    create_queue: VecDeque<InterceptResult>,
    create_requests: Vec<CreateInterceptRequest>,
    remove_queue: VecDeque<InterceptResult>,
    removed: Vec<String>,
    update_queue: VecDeque<InterceptResult>,
    update_requests: Vec<UpdateInterceptRequest>,
    snapshot: InterceptSnapshot,
    ingress_infos: Vec<IngressInfo>,
    fail_ingress: bool,
    login: Option<LoginResult>,
    cancel_on_create: Option<CancelHandle>,
    quit_calls: usize,
}

#[derive(Default)]
pub struct FakeConnector {
    state: Mutex<ConnectorState>,
    journal: Option<Journal>,
}

impl FakeConnector {
    pub fn running() -> Arc<Self> {
        let connector = Self::default();
        connector.state.lock().unwrap().running = true;
        Arc::new(connector)
    }

    pub fn sharing(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: Some(Arc::clone(journal)),
            ..Self::default()
        })
    }

    pub fn record(&self, call: &str) {
        self.state.lock().unwrap().calls.push(call.to_string());
        if let Some(journal) = &self.journal {
            journal.lock().unwrap().push(format!("connector.{call}"));
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().unwrap().connected = connected;
    }

    pub fn set_cluster(&self, cluster: Option<ClusterInfo>) {
        self.state.lock().unwrap().cluster = cluster;
    }

    pub fn push_connect(&self, result: ConnectResult) {
        self.state.lock().unwrap().connect_queue.push_back(result);
    }

    pub fn connect_requests(&self) -> Vec<ConnectRequest> {
        self.state.lock().unwrap().connect_requests.clone()
    }

    pub fn quit_calls(&self) -> usize {
        self.state.lock().unwrap().quit_calls
    }

    pub fn set_login(&self, logged_in: bool, message: &str) {
        self.state.lock().unwrap().login = Some(LoginResult {
            logged_in,
            message: message.to_string(),
        });
    }

    pub fn push_can(&self, result: InterceptResult) {
        self.state.lock().unwrap().can_queue.push_back(result);
    }

    pub fn push_create(&self, result: InterceptResult) {
        self.state.lock().unwrap().create_queue.push_back(result);
    }

    pub fn create_requests(&self) -> Vec<CreateInterceptRequest> {
        self.state.lock().unwrap().create_requests.clone()
    }

    pub fn push_remove(&self, result: InterceptResult) {
        self.state.lock().unwrap().remove_queue.push_back(result);
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn push_update(&self, result: InterceptResult) {
        self.state.lock().unwrap().update_queue.push_back(result);
    }

    pub fn update_requests(&self) -> Vec<UpdateInterceptRequest> {
        self.state.lock().unwrap().update_requests.clone()
    }

    pub fn set_snapshot(&self, snapshot: InterceptSnapshot) {
        self.state.lock().unwrap().snapshot = snapshot;
    }

    pub fn fail_ingress_lookups(&self) {
        self.state.lock().unwrap().fail_ingress = true;
    }

    /// Cancel `handle` while the create call is in flight, as an interrupt
    /// arriving mid-request would.
    pub fn cancel_on_create(&self, handle: CancelHandle) {
        self.state.lock().unwrap().cancel_on_create = Some(handle);
    }
}

impl Launchable for FakeConnector {
    fn launched(&self) {
        self.state.lock().unwrap().running = true;
    }
}

impl ConnectorClient for FakeConnector {
    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    fn status(&self, ctx: &CallContext) -> Result<ConnectorStatus, TetherError> {
        ctx.check()?;
        let state = self.state.lock().unwrap();
        Ok(ConnectorStatus {
            connected: state.connected,
            cluster: state.cluster.clone(),
            ..ConnectorStatus::default()
        })
    }

    fn connect(
        &self,
        ctx: &CallContext,
        request: &ConnectRequest,
    ) -> Result<ConnectResult, TetherError> {
        ctx.check()?;
        self.record("connect");
        let mut state = self.state.lock().unwrap();
        state.connect_requests.push(request.clone());
        let result = state.connect_queue.pop_front().unwrap_or_default();
        if matches!(
            result.outcome,
            ConnectOutcome::Unspecified | ConnectOutcome::AlreadyConnected
        ) {
            state.connected = true;
        }
        Ok(result)
    }

    fn quit(&self, ctx: &CallContext) -> Result<(), TetherError> {
        ctx.check()?;
        self.record("quit");
        let mut state = self.state.lock().unwrap();
        state.quit_calls += 1;
        state.running = false;
        state.connected = false;
        Ok(())
    }

    fn login(&self, ctx: &CallContext) -> Result<LoginResult, TetherError> {
        ctx.check()?;
        self.record("login");
        let state = self.state.lock().unwrap();
        Ok(state.login.clone().unwrap_or(LoginResult {
            logged_in: true,
            message: String::new(),
        }))
    }

    fn can_intercept(
        &self,
        ctx: &CallContext,
        _request: &CreateInterceptRequest,
    ) -> Result<InterceptResult, TetherError> {
        ctx.check()?;
        self.record("can_intercept");
        Ok(self
            .state
            .lock()
            .unwrap()
            .can_queue
            .pop_front()
            .unwrap_or_default())
    }

    fn create_intercept(
        &self,
        ctx: &CallContext,
        request: &CreateInterceptRequest,
    ) -> Result<InterceptResult, TetherError> {
        ctx.check()?;
        self.record("create_intercept");
        let mut state = self.state.lock().unwrap();
        state.create_requests.push(request.clone());
        if let Some(handle) = state.cancel_on_create.take() {
            handle.cancel();
        }
        Ok(state.create_queue.pop_front().unwrap_or_default())
    }

    fn remove_intercept(
        &self,
        ctx: &CallContext,
        name: &str,
    ) -> Result<InterceptResult, TetherError> {
        ctx.check()?;
        self.record("remove_intercept");
        let mut state = self.state.lock().unwrap();
        state.removed.push(name.to_string());
        Ok(state.remove_queue.pop_front().unwrap_or_default())
    }

    fn update_intercept(
        &self,
        ctx: &CallContext,
        request: &UpdateInterceptRequest,
    ) -> Result<InterceptResult, TetherError> {
        ctx.check()?;
        self.record("update_intercept");
        let mut state = self.state.lock().unwrap();
        state.update_requests.push(request.clone());
        Ok(state.update_queue.pop_front().unwrap_or_default())
    }

    fn list_intercepts(&self, ctx: &CallContext) -> Result<InterceptSnapshot, TetherError> {
        ctx.check()?;
        self.record("list_intercepts");
        Ok(self.state.lock().unwrap().snapshot.clone())
    }

    fn watch_intercepts(&self, ctx: &CallContext) -> Result<SnapshotStream, TetherError> {
        ctx.check()?;
        self.record("watch_intercepts");
        let (tx, rx) = mpsc::channel();
        let snapshot = self.state.lock().unwrap().snapshot.clone();
        let _ = tx.send(Ok(snapshot));
        Ok(rx)
    }

    fn get_ingress_infos(&self, ctx: &CallContext) -> Result<Vec<IngressInfo>, TetherError> {
        ctx.check()?;
        self.record("get_ingress_infos");
        let state = self.state.lock().unwrap();
        if state.fail_ingress {
            return Err(TetherError::Rpc("ingress lookup failed".to_string()));
        }
        Ok(state.ingress_infos.clone())
    }

    fn resolve_ingress_info(
        &self,
        ctx: &CallContext,
        _request: &ResolveIngressRequest,
    ) -> Result<IngressInfo, TetherError> {
        ctx.check()?;
        self.record("resolve_ingress_info");
        if self.state.lock().unwrap().fail_ingress {
            return Err(TetherError::Rpc("ingress lookup failed".to_string()));
        }
        Ok(IngressInfo::default())
    }
}

/// Launches by flipping the matching fake to running.
pub struct RecordingLauncher {
    targets: Vec<(String, Arc<dyn Launchable>)>,
    launches: Mutex<Vec<(String, Vec<String>, bool)>>,
}

impl RecordingLauncher {
    pub fn new(targets: Vec<(&str, Arc<dyn Launchable>)>) -> Self {
        Self {
            targets: targets
                .into_iter()
                .map(|(name, target)| (name.to_string(), target))
                .collect(),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn starting<T: Launchable + 'static>(target: Arc<T>) -> Self {
        Self::new(vec![("*", target as Arc<dyn Launchable>)])
    }

    pub fn launches(&self) -> Vec<(String, Vec<String>, bool)> {
        self.launches.lock().unwrap().clone()
    }
}

impl Launcher for RecordingLauncher {
    fn launch(&self, program: &str, args: &[String], elevate: bool) -> Result<u32, TetherError> {
        self.launches
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec(), elevate));
        if let Some((_, target)) = self
            .targets
            .iter()
            .find(|(name, _)| name == program || name == "*")
        {
            target.launched();
        }
        Ok(4242)
    }
}

#[derive(Default)]
pub struct MemoryIngressCache {
    entries: Mutex<BTreeMap<String, IngressInfo>>,
    saves: Mutex<usize>,
}

impl MemoryIngressCache {
    pub fn saves(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

impl IngressCache for MemoryIngressCache {
    fn load(&self, key: &str) -> Result<Option<IngressInfo>, TetherError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn save(&self, key: &str, info: &IngressInfo) -> Result<(), TetherError> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), info.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

pub struct ScriptedPrompter {
    interactive: bool,
    answers: Mutex<VecDeque<String>>,
    warnings: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            interactive: true,
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    pub fn non_interactive() -> Self {
        Self {
            interactive: false,
            ..Self::new(&[])
        }
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().unwrap().clone()
    }
}

impl Prompter for ScriptedPrompter {
    fn interactive(&self) -> bool {
        self.interactive
    }

    fn ask(&self, prompt: &str, _default: &str) -> Result<String, TetherError> {
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| TetherError::User(format!("no scripted answer for {prompt}")))
    }

    fn warn(&self, message: &str) {
        self.warnings.lock().unwrap().push(message.to_string());
    }
}

pub struct RecordingAuthenticator {
    succeed: bool,
    log: Option<Arc<FakeConnector>>,
}

impl RecordingAuthenticator {
    pub fn succeeding() -> Self {
        Self {
            succeed: true,
            log: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            succeed: false,
            log: None,
        }
    }

    /// Succeeds and records "authenticate" in the connector's call log.
    pub fn logging_to(connector: &Arc<FakeConnector>) -> Self {
        Self {
            succeed: true,
            log: Some(Arc::clone(connector)),
        }
    }
}

impl Authenticator for RecordingAuthenticator {
    fn ensure_logged_in(&self, _ctx: &CallContext) -> Result<(), TetherError> {
        if let Some(connector) = &self.log {
            connector.record("authenticate");
        }
        if self.succeed {
            Ok(())
        } else {
            Err(TetherError::User("not logged in".to_string()))
        }
    }
}

pub fn sample_plan(name: &str) -> InterceptPlan {
    InterceptPlan {
        request: CreateInterceptRequest {
            spec: InterceptSpec {
                name: name.to_string(),
                agent: name.to_string(),
                target_host: LOOPBACK.to_string(),
                target_port: 8080,
                mechanism: "tcp".to_string(),
                ..InterceptSpec::default()
            },
            agent_image: "tether/agent:latest".to_string(),
        },
        port: Some(PortMapping {
            local: 8080,
            docker: None,
            service_identifier: None,
        }),
        mount: MountRequest::Disabled,
        docker_run: false,
        docker_mount: None,
        preview: None,
        requires_login: false,
        env_file: None,
        env_json: None,
        command: Vec::new(),
    }
}
