//! Intercept activation: validate, log in, create, attach a preview domain,
//! and remove again on teardown.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cancel::{CallContext, DetachedContext};
use crate::config::write_atomic_text_file;
use crate::connector::{cluster_key, spec_matches, ConnectorClient};
use crate::ensure::{Probe, Resource, Started};
use crate::error::{ErrorCategory, TetherError};
use crate::ingress::{IngressCache, IngressSelector, IngressTarget, Prompter};
use crate::login::Authenticator;
use crate::mount::MountPoint;
use crate::proto::{
    ClusterInfo, InterceptError, InterceptInfo, InterceptResult, PreviewSpec, PreviewUpdate,
    UpdateInterceptRequest,
};
use crate::request::{InterceptPlan, PreviewPlan};

pub const ENV_INTERCEPT_ID: &str = "TETHER_INTERCEPT_ID";
pub const ENV_ROOT: &str = "TETHER_ROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Building,
    Validating,
    LoggingIn,
    Creating,
    Active,
    Failed,
    IngressPending,
    PreviewAttached,
    Deactivating,
    Inactive,
}

#[derive(Debug)]
pub struct Activation {
    pub acquired: bool,
    pub info: InterceptInfo,
    pub environment: BTreeMap<String, String>,
    pub mount: Option<MountPoint>,
    /// Set when the intercept already existed.
    pub notice: Option<String>,
    /// The intercept stays active when attaching a preview domain fails.
    pub preview_error: Option<TetherError>,
}

impl Activation {
    pub fn mount_path(&self) -> Option<&str> {
        self.info
            .mount_point
            .as_deref()
            .filter(|path| !path.is_empty())
    }
}

/// Collaborators used only while activating.
pub struct ActivatorDeps {
    pub authenticator: Box<dyn Authenticator>,
    pub prompter: Box<dyn Prompter>,
    pub cache: Box<dyn IngressCache>,
    /// Cluster reported when connecting, if any.
    pub cluster: Option<ClusterInfo>,
}

pub struct InterceptActivator {
    client: Arc<dyn ConnectorClient>,
    deps: ActivatorDeps,
    plan: InterceptPlan,
    state: ActivationState,
    activation: Option<Activation>,
}

impl InterceptActivator {
    pub fn new(client: Arc<dyn ConnectorClient>, deps: ActivatorDeps, plan: InterceptPlan) -> Self {
        Self {
            client,
            deps,
            plan,
            state: ActivationState::Inactive,
            activation: None,
        }
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    pub fn plan(&self) -> &InterceptPlan {
        &self.plan
    }

    pub fn activation(&self) -> Option<&Activation> {
        self.activation.as_ref()
    }

    fn transition(&mut self, next: ActivationState) {
        debug!(intercept = self.plan.name(), from = ?self.state, to = ?next, "intercept state");
        self.state = next;
    }

    /// Create the intercept. Returns true when this call created it.
    pub fn activate(&mut self, ctx: &CallContext) -> Result<bool, TetherError> {
        self.transition(ActivationState::Building);
        let mount = MountPoint::prepare(&self.plan.mount)?;
        let mut request = self.plan.request.clone();
        request.spec.mount_point = mount.as_ref().map(MountPoint::display);

        self.transition(ActivationState::Validating);
        let checked = self.client.can_intercept(ctx, &request);
        let checked = self.fail_on_err(checked, &mount)?;
        match checked.error {
            InterceptError::Unspecified => {}
            InterceptError::AlreadyExists => return self.adopt_existing(ctx, checked, mount),
            _ => {
                let err = intercept_error(self.plan.name(), &checked);
                return Err(self.fail(err, &mount));
            }
        }

        if self.plan.requires_login {
            self.transition(ActivationState::LoggingIn);
            let login = self.deps.authenticator.ensure_logged_in(ctx);
            self.fail_on_err(login, &mount)?;
        }

        self.transition(ActivationState::Creating);
        let created = self.client.create_intercept(ctx, &request);
        let created = self.fail_on_err(created, &mount)?;
        match created.error {
            InterceptError::Unspecified => {}
            InterceptError::AlreadyExists => return self.adopt_existing(ctx, created, mount),
            InterceptError::BadArgs => {
                self.compensate(&ctx.detached());
                let message = if created.error_text.is_empty() {
                    format!("invalid arguments for intercept {}", self.plan.name())
                } else {
                    created.error_text.clone()
                };
                return Err(self.fail(TetherError::User(message), &mount));
            }
            _ => {
                let err = intercept_error(self.plan.name(), &created);
                return Err(self.fail(err, &mount));
            }
        }

        let mut info = created
            .intercept_info
            .unwrap_or_else(|| InterceptInfo {
                spec: request.spec.clone(),
                ..InterceptInfo::default()
            });
        if info.mount_point.is_none() {
            info.mount_point = request.spec.mount_point.clone();
        }
        self.transition(ActivationState::Active);
        let environment = environment_for(&info);
        self.activation = Some(Activation {
            acquired: true,
            info,
            environment,
            mount,
            notice: None,
            preview_error: None,
        });

        if let Err(err) = self.write_env_outputs() {
            if let Err(cleanup) = self.deactivate(&ctx.detached()) {
                warn!(error = %cleanup, "failed to remove intercept after env output error");
            }
            return Err(err);
        }

        if let Some(preview) = self.plan.preview.clone() {
            self.attach_preview(ctx, &preview);
        }
        Ok(true)
    }

    fn fail_on_err<T>(
        &mut self,
        result: Result<T, TetherError>,
        mount: &Option<MountPoint>,
    ) -> Result<T, TetherError> {
        result.map_err(|err| self.fail(err, mount))
    }

    fn fail(&mut self, err: TetherError, mount: &Option<MountPoint>) -> TetherError {
        if let Some(mount) = mount {
            mount.cleanup();
        }
        self.transition(ActivationState::Failed);
        err
    }

    /// Best-effort removal of an intercept the connector just rejected. The
    /// outcome is logged; the rejection is what gets reported.
    fn compensate(&self, ctx: &DetachedContext) {
        match self.client.remove_intercept(ctx, self.plan.name()) {
            Ok(result) if result.error == InterceptError::Unspecified => {}
            Ok(result) => warn!(
                intercept = self.plan.name(),
                error = result.error.as_str(),
                "compensating remove reported an error"
            ),
            Err(err) => warn!(intercept = self.plan.name(), error = %err, "compensating remove failed"),
        }
    }

    fn adopt_existing(
        &mut self,
        ctx: &CallContext,
        result: InterceptResult,
        mount: Option<MountPoint>,
    ) -> Result<bool, TetherError> {
        if let Some(mount) = &mount {
            mount.cleanup();
        }
        let info = match result.intercept_info {
            Some(info) => info,
            None => self.find_existing(ctx)?.unwrap_or_else(|| InterceptInfo {
                spec: self.plan.request.spec.clone(),
                ..InterceptInfo::default()
            }),
        };
        let notice = if result.error_text.is_empty() {
            format!("intercept {} already exists", self.plan.name())
        } else {
            result.error_text
        };
        self.adopt(info, Some(notice));
        Ok(false)
    }

    fn find_existing(&self, ctx: &CallContext) -> Result<Option<InterceptInfo>, TetherError> {
        let snapshot = self.client.list_intercepts(ctx)?;
        let namespace = &self.plan.request.spec.namespace;
        Ok(snapshot
            .intercepts
            .into_iter()
            .find(|info| spec_matches(&info.spec, self.plan.name(), namespace)))
    }

    /// Record an intercept this invocation did not create.
    fn adopt(&mut self, info: InterceptInfo, notice: Option<String>) {
        self.transition(ActivationState::Active);
        let environment = environment_for(&info);
        self.activation = Some(Activation {
            acquired: false,
            info,
            environment,
            mount: None,
            notice,
            preview_error: None,
        });
    }

    fn attach_preview(&mut self, ctx: &CallContext, preview: &PreviewPlan) {
        self.transition(ActivationState::IngressPending);
        match self.add_preview(ctx, preview) {
            Ok(domain) => {
                if let Some(activation) = self.activation.as_mut() {
                    activation.info.preview_domain = domain;
                }
                self.transition(ActivationState::PreviewAttached);
            }
            Err(err) => {
                warn!(intercept = self.plan.name(), error = %err, "preview domain not attached");
                if let Some(activation) = self.activation.as_mut() {
                    activation.preview_error = Some(err);
                }
                self.transition(ActivationState::Active);
            }
        }
    }

    fn add_preview(
        &self,
        ctx: &CallContext,
        preview: &PreviewPlan,
    ) -> Result<Option<String>, TetherError> {
        let spec = &self.plan.request.spec;
        let target = IngressTarget {
            name: spec.agent.clone(),
            namespace: spec.namespace.clone(),
            service: spec.service_name.clone(),
            port_identifier: spec.service_port_identifier.clone(),
        };
        let cache_key = cluster_key(ctx, self.client.as_ref(), self.deps.cluster.as_ref())?;
        let selector = IngressSelector::new(self.deps.prompter.as_ref(), self.deps.cache.as_ref());
        let ingress = selector.select(
            ctx,
            self.client.as_ref(),
            &cache_key,
            &target,
            &preview.overrides,
        )?;
        let request = UpdateInterceptRequest {
            name: spec.name.clone(),
            preview: PreviewUpdate::Add {
                spec: PreviewSpec {
                    ingress,
                    display_banner: preview.banner,
                },
            },
        };
        let result = self.client.update_intercept(ctx, &request)?;
        if result.error != InterceptError::Unspecified {
            return Err(intercept_error(&spec.name, &result));
        }
        Ok(result.intercept_info.and_then(|info| info.preview_domain))
    }

    fn write_env_outputs(&self) -> Result<(), TetherError> {
        let Some(activation) = &self.activation else {
            return Ok(());
        };
        if let Some(path) = &self.plan.env_file {
            write_env_file(path, &activation.environment)?;
        }
        if let Some(path) = &self.plan.env_json {
            let content = serde_json::to_string_pretty(&activation.environment)?;
            write_atomic_text_file(path, &content, Some(0o600))?;
        }
        Ok(())
    }

    /// Remove the intercept and any empty mount point we created. Always
    /// runs on a detached context.
    pub fn deactivate(&mut self, ctx: &DetachedContext) -> Result<(), TetherError> {
        self.transition(ActivationState::Deactivating);
        let removed = self.client.remove_intercept(ctx, self.plan.name());
        if let Some(mount) = self.activation.as_ref().and_then(|a| a.mount.as_ref()) {
            mount.cleanup();
        }
        self.transition(ActivationState::Inactive);
        let result = removed?;
        match result.error {
            InterceptError::Unspecified | InterceptError::NotFound => Ok(()),
            _ => Err(intercept_error(self.plan.name(), &result)),
        }
    }
}

/// The remote environment plus the synthetic entries a subprocess uses to
/// find the intercept.
pub fn environment_for(info: &InterceptInfo) -> BTreeMap<String, String> {
    let mut env = info.environment.clone();
    env.insert(ENV_INTERCEPT_ID.to_string(), info.id.clone());
    if let Some(mount) = info.mount_point.as_deref().filter(|m| !m.is_empty()) {
        env.insert(ENV_ROOT.to_string(), mount.to_string());
    }
    env
}

/// `KEY=value` lines in the format `docker run --env-file` reads.
pub fn env_file_content(env: &BTreeMap<String, String>) -> String {
    let mut content = String::new();
    for (key, value) in env {
        content.push_str(key);
        content.push('=');
        content.push_str(&value.replace('\n', "\\n"));
        content.push('\n');
    }
    content
}

pub fn write_env_file(path: &Path, env: &BTreeMap<String, String>) -> Result<(), TetherError> {
    write_atomic_text_file(path, &env_file_content(env), Some(0o600))
}

pub fn intercept_error(name: &str, result: &InterceptResult) -> TetherError {
    let message = if result.error_text.is_empty() {
        format!(
            "intercept {name} failed: {}",
            result.error.as_str().replace('_', " ")
        )
    } else {
        result.error_text.clone()
    };
    let category = result
        .error_category
        .unwrap_or_else(|| default_category(result.error));
    TetherError::Intercept {
        code: result.error,
        message,
        category,
    }
}

fn default_category(code: InterceptError) -> ErrorCategory {
    match code {
        InterceptError::AlreadyExists
        | InterceptError::LocalTargetInUse
        | InterceptError::NoAcceptableWorkload
        | InterceptError::AmbiguousMatch
        | InterceptError::UnsupportedWorkload
        | InterceptError::NotFound
        | InterceptError::MountPointBusy
        | InterceptError::MisconfiguredWorkload
        | InterceptError::BadArgs => ErrorCategory::User,
        _ => ErrorCategory::Unknown,
    }
}

/// The intercept as an ensured resource. Probing lists the connector's
/// intercepts so an existing one is reused rather than created again.
pub struct InterceptResource {
    activator: InterceptActivator,
}

impl InterceptResource {
    pub fn new(activator: InterceptActivator) -> Self {
        Self { activator }
    }

    pub fn activator(&self) -> &InterceptActivator {
        &self.activator
    }
}

impl Resource for InterceptResource {
    fn name(&self) -> &str {
        "intercept"
    }

    fn probe(&mut self, ctx: &CallContext) -> Result<Probe, TetherError> {
        match self.activator.find_existing(ctx)? {
            Some(info) => {
                let notice = format!("intercept {} is already active", self.activator.plan.name());
                self.activator.adopt(info, Some(notice));
                Ok(Probe::Active)
            }
            None => Ok(Probe::Absent),
        }
    }

    fn start(&mut self, ctx: &CallContext) -> Result<Started, TetherError> {
        Ok(if self.activator.activate(ctx)? {
            Started::Acquired
        } else {
            Started::Existing
        })
    }

    fn quit(&mut self, ctx: &DetachedContext) -> Result<(), TetherError> {
        self.activator.deactivate(ctx)
    }
}
