mod activator;
mod cancel;
mod config;
mod connector;
mod daemon;
mod ensure;
mod error;
mod ingress;
mod login;
mod mechanism;
mod mount;
mod ports;
mod privilege;
mod proto;
mod request;
mod rpc;
mod runner;
mod session;
#[cfg(test)]
mod testutil;
mod watch;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info_span};
use tracing_subscriber::EnvFilter;

use crate::activator::{intercept_error, Activation, ActivatorDeps, InterceptActivator};
use crate::cancel::{poll_until, CallContext};
use crate::config::{
    default_config_dir, ingress_cache_path, load_config, read_config, resolve_config_path,
    write_atomic_text_file, Config, KubeFlags, DEFAULT_CONFIG_YAML,
};
use crate::connector::{cluster_key, connect_implicitly, spec_matches, ConnectorClient};
use crate::daemon::DaemonClient;
use crate::error::{ErrorDetails, TetherError};
use crate::ingress::{
    DialoguerPrompter, FileIngressCache, IngressOverrides, IngressSelector, IngressTarget,
    Prompter,
};
use crate::login::{Authenticator, ConnectorLogin};
use crate::mechanism::BuiltinMechanisms;
use crate::mount::HelperMountProbe;
use crate::proto::{
    InterceptError, InterceptInfo, PreviewSpec, PreviewUpdate, UpdateInterceptRequest,
};
use crate::request::{InterceptArgs, RequestBuilder};
use crate::runner::install_interrupt_listener;
use crate::session::{connector_client, daemon_client, run_command, session_scope, Session};
use crate::watch::{describe, watch_loop};

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Route cluster traffic to a local process")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug, Clone, Default)]
struct KubeArgs {
    #[arg(long)]
    context: Option<String>,
    #[arg(long, short = 'n')]
    namespace: Option<String>,
    #[arg(long)]
    kubeconfig: Option<String>,
    #[arg(long = "mapped-namespaces", value_delimiter = ',')]
    mapped_namespaces: Vec<String>,
}

impl KubeArgs {
    fn into_flags(self) -> KubeFlags {
        KubeFlags {
            context: self.context,
            namespace: self.namespace,
            kubeconfig: self.kubeconfig,
            mapped_namespaces: self.mapped_namespaces,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
struct IngressArgs {
    #[arg(long = "ingress-host")]
    host: Option<String>,
    #[arg(id = "ingress_port", long = "ingress-port")]
    port: Option<u16>,
    #[arg(long = "ingress-tls")]
    tls: Option<bool>,
    #[arg(long = "ingress-l5")]
    l5_host: Option<String>,
}

impl IngressArgs {
    fn into_overrides(self) -> IngressOverrides {
        IngressOverrides {
            host: self.host,
            port: self.port,
            tls: self.tls,
            l5_host: self.l5_host,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    Connect {
        #[command(flatten)]
        kube: KubeArgs,
        #[arg(last = true)]
        command: Vec<String>,
    },
    Status,
    Quit {
        #[arg(long, default_value_t = false)]
        stop_daemon: bool,
    },
    List {
        #[arg(long, default_value_t = false)]
        watch: bool,
    },
    Intercept(InterceptCommand),
    Leave {
        name: String,
    },
    Preview {
        #[command(subcommand)]
        command: PreviewCommand,
    },
    Login,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Args, Debug)]
struct InterceptCommand {
    name: String,
    #[command(flatten)]
    kube: KubeArgs,
    #[arg(long)]
    workload: Option<String>,
    #[arg(long)]
    service: Option<String>,
    #[arg(long)]
    port: Option<String>,
    #[arg(long = "to-pod")]
    to_pod: Vec<String>,
    #[arg(long)]
    mount: Option<String>,
    #[arg(long, default_value_t = false)]
    docker_run: bool,
    #[arg(long)]
    docker_mount: Option<String>,
    #[arg(long, default_value_t = false)]
    local_only: bool,
    #[arg(long = "preview-url", default_value_t = false)]
    preview_url: bool,
    #[command(flatten)]
    ingress: IngressArgs,
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    banner: bool,
    #[arg(long, default_value = "tcp")]
    mechanism: String,
    #[arg(long = "mechanism-arg", allow_hyphen_values = true)]
    mechanism_args: Vec<String>,
    #[arg(long)]
    env_file: Option<PathBuf>,
    #[arg(long)]
    env_json: Option<PathBuf>,
    #[arg(last = true)]
    command: Vec<String>,
}

impl InterceptCommand {
    fn into_args(self, flags: &KubeFlags) -> InterceptArgs {
        InterceptArgs {
            name: self.name,
            namespace: flags.namespace.clone(),
            workload: self.workload,
            service: self.service,
            port: self.port,
            to_pod: self.to_pod,
            mount: self.mount,
            docker_run: self.docker_run,
            docker_mount: self.docker_mount,
            local_only: self.local_only,
            preview: self.preview_url,
            ingress: self.ingress.into_overrides(),
            banner: self.banner,
            mechanism: self.mechanism,
            mechanism_args: self.mechanism_args,
            env_file: self.env_file,
            env_json: self.env_json,
            command: self.command,
        }
    }
}

#[derive(Subcommand, Debug)]
enum PreviewCommand {
    Add {
        name: String,
        #[command(flatten)]
        ingress: IngressArgs,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        banner: bool,
    },
    Remove {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    config_dir: PathBuf,
    json: bool,
}

impl Context {
    fn config(&self) -> Result<Config, TetherError> {
        load_config(&self.config_path)
    }
}

fn main() -> Result<(), TetherError> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let ctx = build_context(&cli);

    let (root, cancel) = CallContext::background().with_cancel();
    install_interrupt_listener(cancel)?;
    let span = info_span!("tether", trace_id = root.trace_id());
    let _guard = span.enter();

    let result = match cli.command {
        Commands::Connect { kube, command } => handle_connect(&ctx, &root, kube, command),
        Commands::Status => handle_status(&ctx, &root),
        Commands::Quit { stop_daemon } => handle_quit(&ctx, &root, stop_daemon),
        Commands::List { watch } => handle_list(&ctx, &root, watch),
        Commands::Intercept(command) => handle_intercept(&ctx, &root, command),
        Commands::Leave { name } => handle_leave(&ctx, &root, &name),
        Commands::Preview { command } => handle_preview(&ctx, &root, command),
        Commands::Login => handle_login(&ctx, &root),
        Commands::Config { command } => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        let details = ErrorDetails::from_error(&err);
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: Some(details),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
            if let Some(hint) = details.hint {
                eprintln!("{hint}");
            }
        }
        std::process::exit(err.exit_code());
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "tether=debug" } else { "tether=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn build_context(cli: &Cli) -> Context {
    let config_path = resolve_config_path(cli.config.as_ref());
    let config_dir = config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_config_dir);
    Context {
        config_path,
        config_dir,
        json: cli.json,
    }
}

fn handle_connect(
    ctx: &Context,
    root: &CallContext,
    kube: KubeArgs,
    command: Vec<String>,
) -> Result<(), TetherError> {
    let cfg = ctx.config()?;
    let flags = KubeFlags::from_config(&cfg.cluster).merged(kube.into_flags());
    let mut session = Session::from_config(&cfg, &ctx.config_dir, &flags, command.is_empty());
    session_scope(root, &mut session, |session| {
        let connected = session.ensure_connector(root)?;
        let message = session
            .connector()
            .message()
            .map(str::to_string)
            .unwrap_or_else(|| {
                if connected {
                    "Connected".to_string()
                } else {
                    "Already connected".to_string()
                }
            });
        if command.is_empty() {
            return output(ctx, json!({ "connected": true, "message": message }));
        }
        if !ctx.json {
            eprintln!("{message}");
        }
        run_command(root, &command, &BTreeMap::new())
    })
}

fn handle_status(ctx: &Context, root: &CallContext) -> Result<(), TetherError> {
    let cfg = ctx.config()?;
    let daemon = daemon_client(&cfg);
    let connector = connector_client(&cfg, &ctx.config_dir);

    let daemon_status = if daemon.is_running() {
        Some(daemon.status(root)?)
    } else {
        None
    };
    let connector_status = if connector.is_running() {
        Some(connector.status(root)?)
    } else {
        None
    };

    if ctx.json {
        return output(
            ctx,
            json!({
                "daemon": {
                    "running": daemon_status.is_some(),
                    "status": daemon_status,
                },
                "connector": {
                    "running": connector_status.is_some(),
                    "status": connector_status,
                },
            }),
        );
    }
    match &daemon_status {
        Some(status) => println!("Daemon: running (network {:?})", status.network),
        None => println!("Daemon: not running"),
    }
    match &connector_status {
        Some(status) if status.connected => {
            let cluster = status
                .cluster
                .as_ref()
                .map(|cluster| format!(" to {} ({})", cluster.context, cluster.server))
                .unwrap_or_default();
            println!("Connector: connected{cluster}");
        }
        Some(_) => println!("Connector: running, not connected"),
        None => println!("Connector: not running"),
    }
    Ok(())
}

fn handle_quit(ctx: &Context, root: &CallContext, stop_daemon: bool) -> Result<(), TetherError> {
    let cfg = ctx.config()?;
    let attempts = cfg.timeouts.quit_wait_attempts();
    let interval = cfg.timeouts.poll_interval();

    let connector = connector_client(&cfg, &ctx.config_dir);
    let connector_quit = connector.is_running();
    if connector_quit {
        connector.quit(root)?;
        if !poll_until(root, attempts, interval, || Ok(!connector.is_running()))? {
            return Err(TetherError::Process(
                "connector did not stop after quit".to_string(),
            ));
        }
    }

    let mut daemon_quit = false;
    if stop_daemon {
        let daemon = daemon_client(&cfg);
        daemon_quit = daemon.is_running();
        if daemon_quit {
            daemon.quit(root)?;
            if !poll_until(root, attempts, interval, || Ok(!daemon.is_running()))? {
                return Err(TetherError::Process(
                    "daemon did not stop after quit".to_string(),
                ));
            }
        }
    }

    output(
        ctx,
        json!({ "connector_stopped": connector_quit, "daemon_stopped": daemon_quit }),
    )
}

fn handle_list(ctx: &Context, root: &CallContext, watch: bool) -> Result<(), TetherError> {
    let cfg = ctx.config()?;
    let connector = connector_client(&cfg, &ctx.config_dir);
    connect_implicitly(root, connector.as_ref())?;

    if watch {
        let stream = connector.watch_intercepts(root)?;
        return watch_loop(root, stream, |snapshot| {
            if ctx.json {
                return print_json(snapshot);
            }
            print_intercepts(&snapshot.intercepts);
            Ok(())
        });
    }

    let snapshot = connector.list_intercepts(root)?;
    if ctx.json {
        return output(ctx, serde_json::to_value(&snapshot)?);
    }
    print_intercepts(&snapshot.intercepts);
    Ok(())
}

fn print_intercepts(intercepts: &[InterceptInfo]) {
    if intercepts.is_empty() {
        println!("No intercepts");
        return;
    }
    for info in intercepts {
        println!("{}", describe(info));
    }
}

fn handle_intercept(
    ctx: &Context,
    root: &CallContext,
    command: InterceptCommand,
) -> Result<(), TetherError> {
    let cfg = ctx.config()?;
    let flags = KubeFlags::from_config(&cfg.cluster).merged(command.kube.clone().into_flags());
    let args = command.into_args(&flags);

    let mount_probe = HelperMountProbe::new(&cfg.mount.helper);
    let mechanisms = BuiltinMechanisms::new(&cfg.intercept.agent_image);
    let plan = RequestBuilder::new(&mount_probe, &mechanisms, &cfg.intercept.default_port)
        .build(&args)?;
    debug!(intercept = plan.name(), "request validated");
    let retain_intercept = plan.command.is_empty();

    let mut session = Session::from_config(&cfg, &ctx.config_dir, &flags, true);
    session_scope(root, &mut session, |session| {
        session.ensure_connector(root)?;
        let client = session.connector_client();
        let cluster = session.connector().cluster().cloned();
        let prompter = DialoguerPrompter::new();
        let deps = ActivatorDeps {
            authenticator: Box::new(ConnectorLogin::new(
                Arc::clone(&client),
                prompter.interactive(),
            )),
            prompter: Box::new(prompter),
            cache: Box::new(FileIngressCache::new(ingress_cache_path())),
            cluster,
        };
        let activator = InterceptActivator::new(client, deps, plan);
        session.ensure_intercept(root, activator, retain_intercept)?;
        report_activation(ctx, session)?;
        session.run_under_intercept(root)
    })
}

fn report_activation(ctx: &Context, session: &Session) -> Result<(), TetherError> {
    let Some(activation) = session.activation() else {
        return Ok(());
    };
    if let Some(err) = &activation.preview_error {
        eprintln!("warning: preview URL not created: {err}");
    }
    if ctx.json {
        return output(ctx, activation_json(activation));
    }
    if let Some(notice) = &activation.notice {
        eprintln!("{notice}");
    }
    eprintln!("{}", describe(&activation.info));
    if let Some(path) = activation.mount_path() {
        eprintln!("    volume mount point: {path}");
    }
    Ok(())
}

/// JSON view of an activation. A preview domain that could not be attached
/// is reported next to the intercept that stays active.
fn activation_json(activation: &Activation) -> serde_json::Value {
    json!({
        "acquired": activation.acquired,
        "notice": activation.notice,
        "intercept": activation.info,
        "environment": activation.environment,
        "preview_error": activation.preview_error.as_ref().map(|err| err.to_string()),
    })
}

fn handle_leave(ctx: &Context, root: &CallContext, name: &str) -> Result<(), TetherError> {
    let cfg = ctx.config()?;
    let connector = connector_client(&cfg, &ctx.config_dir);
    connect_implicitly(root, connector.as_ref())?;
    let result = connector.remove_intercept(root, name)?;
    if result.error != InterceptError::Unspecified {
        return Err(intercept_error(name, &result));
    }
    output(ctx, json!({ "removed": name }))
}

fn handle_preview(
    ctx: &Context,
    root: &CallContext,
    command: PreviewCommand,
) -> Result<(), TetherError> {
    let cfg = ctx.config()?;
    let connector = connector_client(&cfg, &ctx.config_dir);
    let connected = connect_implicitly(root, connector.as_ref())?;

    let (name, preview) = match command {
        PreviewCommand::Add {
            name,
            ingress,
            banner,
        } => {
            let info = find_intercept(root, connector.as_ref(), &name)?;
            let target = IngressTarget {
                name: info.spec.agent.clone(),
                namespace: info.spec.namespace.clone(),
                service: info.spec.service_name.clone(),
                port_identifier: info.spec.service_port_identifier.clone(),
            };
            let prompter = DialoguerPrompter::new();
            let cache = FileIngressCache::new(ingress_cache_path());
            let ingress = IngressSelector::new(&prompter, &cache).select(
                root,
                connector.as_ref(),
                &cluster_key(root, connector.as_ref(), Some(&connected.cluster))?,
                &target,
                &ingress.into_overrides(),
            )?;
            let preview = PreviewUpdate::Add {
                spec: PreviewSpec {
                    ingress,
                    display_banner: banner,
                },
            };
            (name, preview)
        }
        PreviewCommand::Remove { name } => (name, PreviewUpdate::Remove),
    };

    let result = connector.update_intercept(
        root,
        &UpdateInterceptRequest {
            name: name.clone(),
            preview,
        },
    )?;
    if result.error != InterceptError::Unspecified {
        return Err(intercept_error(&name, &result));
    }
    let domain = result.intercept_info.and_then(|info| info.preview_domain);
    if !ctx.json {
        match &domain {
            Some(domain) => println!("Preview URL: https://{domain}"),
            None => println!("Preview URL removed from {name}"),
        }
        return Ok(());
    }
    output(ctx, json!({ "name": name, "preview_domain": domain }))
}

fn find_intercept(
    root: &CallContext,
    connector: &dyn ConnectorClient,
    name: &str,
) -> Result<InterceptInfo, TetherError> {
    connector
        .list_intercepts(root)?
        .intercepts
        .into_iter()
        .find(|info| spec_matches(&info.spec, name, ""))
        .ok_or_else(|| TetherError::User(format!("intercept {name} not found")))
}

fn handle_login(ctx: &Context, root: &CallContext) -> Result<(), TetherError> {
    let cfg = ctx.config()?;
    let flags = KubeFlags::from_config(&cfg.cluster);
    let mut session = Session::from_config(&cfg, &ctx.config_dir, &flags, true);
    session_scope(root, &mut session, |session| {
        session.ensure_connector(root)?;
        let interactive = DialoguerPrompter::new().interactive();
        ConnectorLogin::new(session.connector_client(), interactive).ensure_logged_in(root)?;
        output(ctx, json!({ "logged_in": true }))
    })
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), TetherError> {
    match command {
        ConfigCommand::Init => {
            let created = !ctx.config_path.exists();
            if created {
                write_atomic_text_file(&ctx.config_path, DEFAULT_CONFIG_YAML, None)?;
            }
            output(
                ctx,
                json!({
                    "path": ctx.config_path.to_string_lossy(),
                    "created": created,
                }),
            )
        }
        ConfigCommand::Validate => {
            let exists = ctx.config_path.exists();
            if exists {
                read_config(&ctx.config_path)?;
            }
            output(
                ctx,
                json!({
                    "path": ctx.config_path.to_string_lossy(),
                    "valid": true,
                    "defaults": !exists,
                }),
            )
        }
    }
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), TetherError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), TetherError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
