//! Request and response payloads exchanged with the daemon and connector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ErrorCategory;
use crate::ports::ExtraPort;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkState {
    #[default]
    Idle,
    Establishing,
    Ready,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonStatus {
    pub version: String,
    pub network: NetworkState,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EstablishNetworkRequest {
    pub connector_socket: String,
    pub mapped_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterInfo {
    pub server: String,
    pub context: String,
    pub namespace: String,
}

impl ClusterInfo {
    /// Key used by the per-cluster ingress cache.
    pub fn cache_key(&self) -> String {
        format!("{}/{}", self.server, self.context)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorStatus {
    pub connected: bool,
    pub cluster: Option<ClusterInfo>,
    pub connected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectRequest {
    pub kube_flags: BTreeMap<String, String>,
    pub mapped_namespaces: Vec<String>,
    /// An implicit request only reports the current connection; it never
    /// starts a new one.
    pub implicit: bool,
}

impl ConnectRequest {
    pub fn implicit() -> Self {
        Self {
            implicit: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    #[default]
    Unspecified,
    AlreadyConnected,
    Disconnected,
    MustRestart,
    ClusterFailed,
    TrafficManagerFailed,
    DaemonFailed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectResult {
    pub outcome: ConnectOutcome,
    pub message: String,
    pub cluster: ClusterInfo,
    pub error_category: Option<ErrorCategory>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginResult {
    pub logged_in: bool,
    pub message: String,
}

/// Discriminated outcome of intercept RPCs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterceptError {
    #[default]
    Unspecified,
    Internal,
    NoConnection,
    NoTrafficManager,
    TrafficManagerConnecting,
    TrafficManagerError,
    AlreadyExists,
    LocalTargetInUse,
    NoAcceptableWorkload,
    AmbiguousMatch,
    FailedToEstablish,
    UnsupportedWorkload,
    NotFound,
    MountPointBusy,
    MisconfiguredWorkload,
    BadArgs,
}

impl InterceptError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Internal => "internal",
            Self::NoConnection => "no_connection",
            Self::NoTrafficManager => "no_traffic_manager",
            Self::TrafficManagerConnecting => "traffic_manager_connecting",
            Self::TrafficManagerError => "traffic_manager_error",
            Self::AlreadyExists => "already_exists",
            Self::LocalTargetInUse => "local_target_in_use",
            Self::NoAcceptableWorkload => "no_acceptable_workload",
            Self::AmbiguousMatch => "ambiguous_match",
            Self::FailedToEstablish => "failed_to_establish",
            Self::UnsupportedWorkload => "unsupported_workload",
            Self::NotFound => "not_found",
            Self::MountPointBusy => "mount_point_busy",
            Self::MisconfiguredWorkload => "misconfigured_workload",
            Self::BadArgs => "bad_args",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptSpec {
    pub name: String,
    pub namespace: String,
    pub agent: String,
    pub service_name: Option<String>,
    pub target_host: String,
    pub target_port: u16,
    pub service_port_identifier: Option<String>,
    pub extra_ports: Vec<ExtraPort>,
    pub mechanism: String,
    pub mechanism_args: Vec<String>,
    pub mount_point: Option<String>,
    pub local_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateInterceptRequest {
    pub spec: InterceptSpec,
    pub agent_image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptInfo {
    pub id: String,
    pub spec: InterceptSpec,
    pub environment: BTreeMap<String, String>,
    pub mount_point: Option<String>,
    pub preview_domain: Option<String>,
    pub disposition: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptResult {
    pub error: InterceptError,
    pub error_text: String,
    pub error_category: Option<ErrorCategory>,
    pub intercept_info: Option<InterceptInfo>,
}

impl InterceptResult {
    pub fn ok(info: InterceptInfo) -> Self {
        Self {
            intercept_info: Some(info),
            ..Self::default()
        }
    }

    pub fn failed(error: InterceptError, text: &str) -> Self {
        Self {
            error,
            error_text: text.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoveInterceptRequest {
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressInfo {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub l5_host: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewSpec {
    pub ingress: IngressInfo,
    pub display_banner: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PreviewUpdate {
    Add { spec: PreviewSpec },
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInterceptRequest {
    pub name: String,
    pub preview: PreviewUpdate,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveIngressRequest {
    pub namespace: String,
    pub service: String,
    pub port_identifier: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressInfoList {
    pub ingress_infos: Vec<IngressInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptSnapshot {
    pub intercepts: Vec<InterceptInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Empty {}
