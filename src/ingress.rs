//! Ingress selection for preview domains: defaults from the per-cluster cache
//! or the cluster itself, confirmed interactively or through flags.

use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::Input;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::debug;

use crate::cancel::CallContext;
use crate::config::write_atomic_text_file;
use crate::connector::ConnectorClient;
use crate::error::TetherError;
use crate::proto::{IngressInfo, ResolveIngressRequest};

const HOST_PATTERN: &str =
    r"^[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?)*$";

pub trait Prompter {
    fn interactive(&self) -> bool;
    fn ask(&self, prompt: &str, default: &str) -> Result<String, TetherError>;
    fn warn(&self, message: &str);
}

pub struct DialoguerPrompter {
    theme: ColorfulTheme,
}

impl DialoguerPrompter {
    pub fn new() -> Self {
        Self {
            theme: ColorfulTheme::default(),
        }
    }
}

impl Default for DialoguerPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for DialoguerPrompter {
    fn interactive(&self) -> bool {
        io::stdin().is_terminal() && io::stderr().is_terminal()
    }

    fn ask(&self, prompt: &str, default: &str) -> Result<String, TetherError> {
        let answer = Input::<String>::with_theme(&self.theme)
            .with_prompt(prompt)
            .default(default.to_string())
            .interact_text()?;
        Ok(answer)
    }

    fn warn(&self, message: &str) {
        eprintln!("{}", style(message).yellow());
    }
}

/// Ask `prompt` until `parse` accepts the answer. Blank answers take the
/// default.
pub fn ask_until_valid<T, F>(
    prompter: &dyn Prompter,
    prompt: &str,
    default: &str,
    parse: F,
) -> Result<T, TetherError>
where
    F: Fn(&str) -> Result<T, String>,
{
    loop {
        let answer = prompter.ask(prompt, default)?;
        let answer = match answer.trim() {
            "" => default,
            trimmed => trimmed,
        };
        match parse(answer) {
            Ok(value) => return Ok(value),
            Err(message) => prompter.warn(&message),
        }
    }
}

static HOST_RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

pub fn validate_host(host: &str) -> Result<String, String> {
    let re = HOST_RE
        .get_or_init(|| Regex::new(HOST_PATTERN))
        .as_ref()
        .map_err(|err| err.to_string())?;
    if re.is_match(host) {
        Ok(host.to_string())
    } else {
        Err(format!("{host} is not a valid host name"))
    }
}

fn parse_port(raw: &str) -> Result<u16, String> {
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(format!("{raw} is not a valid port number (1-65535)")),
    }
}

fn parse_yes_no(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" => Ok(true),
        "n" | "no" | "false" => Ok(false),
        _ => Err("please answer yes or no".to_string()),
    }
}

/// Per-cluster store of confirmed ingress values.
pub trait IngressCache {
    fn load(&self, key: &str) -> Result<Option<IngressInfo>, TetherError>;
    fn save(&self, key: &str, info: &IngressInfo) -> Result<(), TetherError>;
}

pub struct FileIngressCache {
    path: PathBuf,
}

impl FileIngressCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read_all(&self) -> Result<BTreeMap<String, IngressInfo>, TetherError> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(serde_json::from_str(&content)?)
    }
}

impl IngressCache for FileIngressCache {
    fn load(&self, key: &str) -> Result<Option<IngressInfo>, TetherError> {
        Ok(self.read_all()?.remove(key))
    }

    fn save(&self, key: &str, info: &IngressInfo) -> Result<(), TetherError> {
        let mut all = self.read_all()?;
        all.insert(key.to_string(), info.clone());
        let content = serde_json::to_string_pretty(&all)?;
        write_atomic_text_file(&self.path, &content, Some(0o600))
    }
}

/// Values given through `--ingress-*` flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<bool>,
    pub l5_host: Option<String>,
}

impl IngressOverrides {
    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.port.is_none() && self.tls.is_none() && self.l5_host.is_none()
    }
}

/// The service a preview domain will point at.
#[derive(Debug, Clone, Default)]
pub struct IngressTarget {
    pub name: String,
    pub namespace: String,
    pub service: Option<String>,
    pub port_identifier: Option<String>,
}

pub struct IngressSelector<'a> {
    prompter: &'a dyn Prompter,
    cache: &'a dyn IngressCache,
}

impl<'a> IngressSelector<'a> {
    pub fn new(prompter: &'a dyn Prompter, cache: &'a dyn IngressCache) -> Self {
        Self { prompter, cache }
    }

    pub fn select(
        &self,
        ctx: &CallContext,
        connector: &dyn ConnectorClient,
        cache_key: &str,
        target: &IngressTarget,
        overrides: &IngressOverrides,
    ) -> Result<IngressInfo, TetherError> {
        let cached = self.cache.load(cache_key)?;
        let defaults = match &cached {
            Some(info) => info.clone(),
            None => remote_default(ctx, connector, target)?,
        };
        let confirmed = if !overrides.is_empty() {
            apply_overrides(&defaults, overrides)?
        } else if self.prompter.interactive() {
            self.ask(&defaults)?
        } else {
            return Err(TetherError::User(
                "a preview domain needs ingress details; pass --ingress-host/--ingress-port or run in a terminal"
                    .to_string(),
            ));
        };
        if cached.as_ref() != Some(&confirmed) {
            debug!(cache_key, "updating ingress cache");
            self.cache.save(cache_key, &confirmed)?;
        }
        Ok(confirmed)
    }

    fn ask(&self, defaults: &IngressInfo) -> Result<IngressInfo, TetherError> {
        let host = ask_until_valid(
            self.prompter,
            "Ingress host (the service the preview domain routes to)",
            &defaults.host,
            validate_host,
        )?;
        let port = ask_until_valid(
            self.prompter,
            "Ingress port",
            &defaults.port.to_string(),
            parse_port,
        )?;
        let tls_default = if defaults.use_tls { "yes" } else { "no" };
        let use_tls = ask_until_valid(self.prompter, "Use TLS", tls_default, parse_yes_no)?;
        let l5_default = l5_default(defaults, &host);
        let l5_host = ask_until_valid(
            self.prompter,
            "Ingress L5 host (Host header sent to the ingress)",
            &l5_default,
            validate_host,
        )?;
        Ok(IngressInfo {
            host,
            port,
            use_tls,
            l5_host,
        })
    }
}

fn l5_default(defaults: &IngressInfo, host: &str) -> String {
    if defaults.l5_host.is_empty() || defaults.l5_host == defaults.host {
        host.to_string()
    } else {
        defaults.l5_host.clone()
    }
}

fn apply_overrides(
    defaults: &IngressInfo,
    overrides: &IngressOverrides,
) -> Result<IngressInfo, TetherError> {
    let host = overrides.host.clone().unwrap_or_else(|| defaults.host.clone());
    let host = validate_host(&host).map_err(TetherError::User)?;
    let port = overrides.port.unwrap_or(defaults.port);
    if port == 0 {
        return Err(TetherError::User("--ingress-port must be positive".to_string()));
    }
    let l5_host = match &overrides.l5_host {
        Some(l5) => validate_host(l5).map_err(TetherError::User)?,
        None => l5_default(defaults, &host),
    };
    Ok(IngressInfo {
        host,
        port,
        use_tls: overrides.tls.unwrap_or(defaults.use_tls),
        l5_host,
    })
}

/// Ask the cluster for a sensible ingress, falling back to the service's
/// in-cluster name on port 80.
fn remote_default(
    ctx: &CallContext,
    connector: &dyn ConnectorClient,
    target: &IngressTarget,
) -> Result<IngressInfo, TetherError> {
    let service = target.service.clone().unwrap_or_else(|| target.name.clone());
    let request = ResolveIngressRequest {
        namespace: target.namespace.clone(),
        service: service.clone(),
        port_identifier: target.port_identifier.clone(),
    };
    match connector.resolve_ingress_info(ctx, &request) {
        Ok(info) if !info.host.is_empty() => return Ok(info),
        Ok(_) => {}
        Err(TetherError::Cancelled) => return Err(TetherError::Cancelled),
        Err(err) => debug!(error = %err, "resolve ingress failed"),
    }
    match connector.get_ingress_infos(ctx) {
        Ok(infos) => {
            if let Some(info) = infos.into_iter().find(|info| !info.host.is_empty()) {
                return Ok(info);
            }
        }
        Err(TetherError::Cancelled) => return Err(TetherError::Cancelled),
        Err(err) => debug!(error = %err, "listing ingress infos failed"),
    }
    let namespace = if target.namespace.is_empty() {
        "default"
    } else {
        target.namespace.as_str()
    };
    let host = format!("{service}.{namespace}");
    Ok(IngressInfo {
        l5_host: host.clone(),
        host,
        port: 80,
        use_tls: false,
    })
}
