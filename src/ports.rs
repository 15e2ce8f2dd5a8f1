//! `--port` and `--to-pod` token parsing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TetherError;

const PORT_FORMAT: &str = "<local port>[:<remote port name or number>]";
const DOCKER_PORT_FORMAT: &str =
    "<local port>[:<container port>][:<remote port name or number>]";

/// Parsed form of the `--port` token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub local: u16,
    pub docker: Option<u16>,
    pub service_identifier: Option<String>,
}

impl PortMapping {
    /// Parse `local[:remoteOrContainer[:serviceIdentifier]]`.
    pub fn parse(token: &str, docker_run: bool) -> Result<Self, TetherError> {
        let format_error = || {
            let expected = if docker_run {
                DOCKER_PORT_FORMAT
            } else {
                PORT_FORMAT
            };
            TetherError::User(format!(
                "port \"{token}\" must be of the form {expected}"
            ))
        };

        let parts: Vec<&str> = token.split(':').collect();
        let local = parse_port_number(parts[0]).ok_or_else(format_error)?;
        match parts.as_slice() {
            [_] => Ok(Self {
                local,
                docker: None,
                service_identifier: None,
            }),
            [_, second] => {
                if docker_run {
                    if let Some(docker) = parse_port_number(second) {
                        return Ok(Self {
                            local,
                            docker: Some(docker),
                            service_identifier: None,
                        });
                    }
                }
                let identifier = validate_port_identifier(second).map_err(|_| format_error())?;
                Ok(Self {
                    local,
                    docker: None,
                    service_identifier: Some(identifier),
                })
            }
            [_, second, third] if docker_run => {
                let docker = parse_port_number(second).ok_or_else(format_error)?;
                let identifier = validate_port_identifier(third).map_err(|_| format_error())?;
                Ok(Self {
                    local,
                    docker: Some(docker),
                    service_identifier: Some(identifier),
                })
            }
            _ => Err(format_error()),
        }
    }
}

fn parse_port_number(raw: &str) -> Option<u16> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}

/// A service port is identified by number or by IANA service name.
pub fn validate_port_identifier(raw: &str) -> Result<String, TetherError> {
    if raw.is_empty() {
        return Err(TetherError::User("empty port identifier".to_string()));
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return parse_port_number(raw)
            .map(|port| port.to_string())
            .ok_or_else(|| TetherError::User(format!("invalid port number {raw}")));
    }
    let valid_chars = raw
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let has_letter = raw.chars().any(|c| c.is_ascii_lowercase());
    if raw.len() > 15
        || !valid_chars
        || !has_letter
        || raw.starts_with('-')
        || raw.ends_with('-')
        || raw.contains("--")
    {
        return Err(TetherError::User(format!(
            "invalid port name {raw}: must be a lowercase IANA service name of at most 15 characters"
        )));
    }
    Ok(raw.to_string())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// An additional port forwarded from the intercepted pod to localhost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl ExtraPort {
    pub fn parse(raw: &str) -> Result<Self, TetherError> {
        let invalid = || {
            TetherError::User(format!(
                "--to-pod \"{raw}\" must be of the form <port>[/TCP|/UDP]"
            ))
        };
        let (port, protocol) = match raw.split_once('/') {
            Some((port, proto)) => {
                let protocol = match proto.to_ascii_uppercase().as_str() {
                    "TCP" => Protocol::Tcp,
                    "UDP" => Protocol::Udp,
                    _ => return Err(invalid()),
                };
                (port, protocol)
            }
            None => (raw, Protocol::Tcp),
        };
        let port = parse_port_number(port).ok_or_else(invalid)?;
        Ok(Self { port, protocol })
    }
}

impl fmt::Display for ExtraPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Protocol::Tcp => write!(f, "{}", self.port),
            Protocol::Udp => write!(f, "{}/UDP", self.port),
        }
    }
}
