//! Turns intercept command-line arguments into a validated creation request.
//! Everything here runs before the first RPC.

use std::path::{Path, PathBuf};

use crate::error::TetherError;
use crate::ingress::IngressOverrides;
use crate::mechanism::MechanismProvider;
use crate::mount::{resolve_mount, MountProbe, MountRequest};
use crate::ports::{ExtraPort, PortMapping};
use crate::proto::{CreateInterceptRequest, InterceptSpec};

pub const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptArgs {
    pub name: String,
    pub namespace: Option<String>,
    pub workload: Option<String>,
    pub service: Option<String>,
    pub port: Option<String>,
    pub to_pod: Vec<String>,
    pub mount: Option<String>,
    pub docker_run: bool,
    pub docker_mount: Option<String>,
    pub local_only: bool,
    pub preview: bool,
    pub ingress: IngressOverrides,
    pub banner: bool,
    pub mechanism: String,
    pub mechanism_args: Vec<String>,
    pub env_file: Option<PathBuf>,
    pub env_json: Option<PathBuf>,
    pub command: Vec<String>,
}

impl Default for InterceptArgs {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: None,
            workload: None,
            service: None,
            port: None,
            to_pod: Vec::new(),
            mount: None,
            docker_run: false,
            docker_mount: None,
            local_only: false,
            preview: false,
            ingress: IngressOverrides::default(),
            banner: true,
            mechanism: "tcp".to_string(),
            mechanism_args: Vec::new(),
            env_file: None,
            env_json: None,
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewPlan {
    pub overrides: IngressOverrides,
    pub banner: bool,
}

/// A validated intercept request plus the local wiring around it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptPlan {
    pub request: CreateInterceptRequest,
    pub port: Option<PortMapping>,
    pub mount: MountRequest,
    pub docker_run: bool,
    pub docker_mount: Option<String>,
    pub preview: Option<PreviewPlan>,
    pub requires_login: bool,
    pub env_file: Option<PathBuf>,
    pub env_json: Option<PathBuf>,
    pub command: Vec<String>,
}

impl InterceptPlan {
    pub fn name(&self) -> &str {
        &self.request.spec.name
    }
}

pub struct RequestBuilder<'a> {
    mount_probe: &'a dyn MountProbe,
    mechanisms: &'a dyn MechanismProvider,
    default_port: String,
}

impl<'a> RequestBuilder<'a> {
    pub fn new(
        mount_probe: &'a dyn MountProbe,
        mechanisms: &'a dyn MechanismProvider,
        default_port: &str,
    ) -> Self {
        Self {
            mount_probe,
            mechanisms,
            default_port: default_port.to_string(),
        }
    }

    pub fn build(&self, args: &InterceptArgs) -> Result<InterceptPlan, TetherError> {
        validate_name(&args.name)?;
        if args.local_only {
            check_local_only(args)?;
        }

        let port = if args.local_only {
            None
        } else {
            let token = args.port.as_deref().unwrap_or(&self.default_port);
            Some(PortMapping::parse(token, args.docker_run)?)
        };
        let extra_ports = args
            .to_pod
            .iter()
            .map(|raw| ExtraPort::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        if args.docker_mount.is_some() && !args.docker_run {
            return Err(TetherError::User(
                "--docker-mount requires --docker-run".to_string(),
            ));
        }
        let mount = if args.local_only {
            MountRequest::Disabled
        } else {
            resolve_mount(MountRequest::parse(args.mount.as_deref())?, self.mount_probe)?
        };
        if let Some(container_path) = &args.docker_mount {
            if mount == MountRequest::Disabled {
                return Err(TetherError::User(
                    "--docker-mount requires mounts to be enabled".to_string(),
                ));
            }
            if !Path::new(container_path).is_absolute() {
                return Err(TetherError::User(format!(
                    "--docker-mount path {container_path} must be absolute"
                )));
            }
        }

        let mechanism = self
            .mechanisms
            .resolve(&args.mechanism, &args.mechanism_args)?;
        if args.docker_run && args.command.is_empty() {
            return Err(TetherError::User(
                "--docker-run requires an image and its arguments after --".to_string(),
            ));
        }

        let agent = if args.local_only {
            String::new()
        } else {
            args.workload.clone().unwrap_or_else(|| args.name.clone())
        };
        let spec = InterceptSpec {
            name: args.name.clone(),
            namespace: args.namespace.clone().unwrap_or_default(),
            agent,
            service_name: args.service.clone(),
            target_host: LOOPBACK.to_string(),
            target_port: port.as_ref().map(|p| p.local).unwrap_or_default(),
            service_port_identifier: port.as_ref().and_then(|p| p.service_identifier.clone()),
            extra_ports,
            mechanism: mechanism.name,
            mechanism_args: mechanism.args,
            mount_point: None,
            local_only: args.local_only,
        };
        let preview = args.preview.then(|| PreviewPlan {
            overrides: args.ingress.clone(),
            banner: args.banner,
        });
        Ok(InterceptPlan {
            request: CreateInterceptRequest {
                spec,
                agent_image: mechanism.agent_image,
            },
            port,
            mount,
            docker_run: args.docker_run,
            docker_mount: args.docker_mount.clone(),
            requires_login: mechanism.requires_login || preview.is_some(),
            preview,
            env_file: args.env_file.clone(),
            env_json: args.env_json.clone(),
            command: args.command.clone(),
        })
    }
}

fn validate_name(name: &str) -> Result<(), TetherError> {
    if name.trim().is_empty() {
        return Err(TetherError::User("intercept name must not be empty".to_string()));
    }
    if name.chars().any(|c| c.is_whitespace() || c == '/') {
        return Err(TetherError::User(format!(
            "invalid intercept name {name:?}"
        )));
    }
    Ok(())
}

fn check_local_only(args: &InterceptArgs) -> Result<(), TetherError> {
    let mut conflicts = Vec::new();
    if args.workload.is_some() {
        conflicts.push("--workload");
    }
    if args.service.is_some() {
        conflicts.push("--service");
    }
    if args.port.is_some() {
        conflicts.push("--port");
    }
    if args.mount.as_deref().is_some_and(|mount| mount != "false") {
        conflicts.push("--mount");
    }
    if args.preview {
        conflicts.push("--preview-url");
    }
    if args.docker_run {
        conflicts.push("--docker-run");
    }
    if conflicts.is_empty() {
        return Ok(());
    }
    Err(TetherError::User(format!(
        "--local-only cannot be combined with {}",
        conflicts.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanism::BuiltinMechanisms;

    struct Probe(bool);

    impl MountProbe for Probe {
        fn available(&self) -> Result<(), String> {
            if self.0 {
                Ok(())
            } else {
                Err("sshfs is not installed".to_string())
            }
        }
    }

    fn args(name: &str) -> InterceptArgs {
        InterceptArgs {
            name: name.to_string(),
            ..InterceptArgs::default()
        }
    }

    fn build(args: &InterceptArgs, mounts: bool) -> Result<InterceptPlan, TetherError> {
        let probe = Probe(mounts);
        let mechanisms = BuiltinMechanisms::new("tether/agent:latest");
        RequestBuilder::new(&probe, &mechanisms, "8080").build(args)
    }

    #[test]
    fn defaults_produce_loopback_request() {
        let plan = build(&args("echo"), true).unwrap();
        let spec = &plan.request.spec;
        assert_eq!(spec.agent, "echo");
        assert_eq!(spec.target_host, LOOPBACK);
        assert_eq!(spec.target_port, 8080);
        assert_eq!(spec.mechanism, "tcp");
        assert_eq!(plan.request.agent_image, "tether/agent:latest");
        assert_eq!(plan.mount, MountRequest::Auto);
        assert!(!plan.requires_login);
    }

    #[test]
    fn local_only_conflicts_are_rejected() {
        for mutate in [
            (|a: &mut InterceptArgs| a.workload = Some("w".to_string())) as fn(&mut InterceptArgs),
            |a: &mut InterceptArgs| a.service = Some("s".to_string()),
            |a: &mut InterceptArgs| a.port = Some("8080".to_string()),
            |a: &mut InterceptArgs| a.mount = Some("true".to_string()),
            |a: &mut InterceptArgs| a.preview = true,
        ] {
            let mut a = args("echo");
            a.local_only = true;
            mutate(&mut a);
            let err = build(&a, true).unwrap_err();
            assert!(err.is_user_error());
            assert!(err.to_string().contains("--local-only"), "{err}");
        }
    }

    #[test]
    fn local_only_without_conflicts_builds_bare_spec() {
        let mut a = args("ns-access");
        a.local_only = true;
        a.namespace = Some("staging".to_string());
        let plan = build(&a, false).unwrap();
        assert!(plan.request.spec.local_only);
        assert!(plan.request.spec.agent.is_empty());
        assert_eq!(plan.port, None);
        assert_eq!(plan.mount, MountRequest::Disabled);
    }

    #[test]
    fn port_formats_depend_on_docker_mode() {
        let mut a = args("echo");
        a.port = Some("8080:9090:http".to_string());
        let err = build(&a, true).unwrap_err();
        assert!(err.to_string().contains("<local port>[:<remote port name or number>]"));

        a.docker_run = true;
        a.command = vec!["busybox".to_string()];
        let plan = build(&a, true).unwrap();
        let port = plan.port.unwrap();
        assert_eq!(port.docker, Some(9090));
        assert_eq!(plan.request.spec.service_port_identifier.as_deref(), Some("http"));
    }

    #[test]
    fn mount_gate_depends_on_explicitness() {
        let plan = build(&args("echo"), false).unwrap();
        assert_eq!(plan.mount, MountRequest::Disabled);

        for value in ["true", "/tmp/tether-mnt"] {
            let mut a = args("echo");
            a.mount = Some(value.to_string());
            let err = build(&a, false).unwrap_err();
            assert!(err.to_string().contains("remote mounts are unavailable"), "{err}");
        }

        let mut a = args("echo");
        a.mount = Some("false".to_string());
        assert_eq!(build(&a, false).unwrap().mount, MountRequest::Disabled);
    }

    #[test]
    fn docker_mount_requires_docker_run_and_mounts() {
        let mut a = args("echo");
        a.docker_mount = Some("/src".to_string());
        let err = build(&a, true).unwrap_err();
        assert!(err.to_string().contains("requires --docker-run"));

        a.docker_run = true;
        a.command = vec!["img".to_string()];
        a.mount = Some("false".to_string());
        let err = build(&a, true).unwrap_err();
        assert!(err.to_string().contains("mounts to be enabled"));

        a.mount = None;
        let plan = build(&a, true).unwrap();
        assert_eq!(plan.docker_mount.as_deref(), Some("/src"));
    }

    #[test]
    fn docker_run_needs_image() {
        let mut a = args("echo");
        a.docker_run = true;
        assert!(build(&a, true).unwrap_err().to_string().contains("--docker-run requires"));
    }

    #[test]
    fn extra_ports_fail_whole_build() {
        let mut a = args("echo");
        a.to_pod = vec!["8081".to_string(), "53/UDP".to_string()];
        let plan = build(&a, true).unwrap();
        assert_eq!(plan.request.spec.extra_ports.len(), 2);

        a.to_pod.push("nope".to_string());
        assert!(build(&a, true).is_err());
    }

    #[test]
    fn preview_and_http_require_login() {
        let mut a = args("echo");
        a.preview = true;
        assert!(build(&a, true).unwrap().requires_login);

        let mut a = args("echo");
        a.mechanism = "http".to_string();
        a.mechanism_args = vec!["--http-path-prefix=/api".to_string()];
        assert!(build(&a, true).unwrap().requires_login);
    }

    #[test]
    fn empty_name_is_rejected() {
        assert!(build(&args(" "), true).is_err());
        assert!(build(&args("a/b"), true).is_err());
    }
}
