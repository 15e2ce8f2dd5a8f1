use crate::error::TetherError;

/// A resolved traffic-selection mechanism. Name and arguments are passed to
/// the connector untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mechanism {
    pub name: String,
    pub args: Vec<String>,
    pub agent_image: String,
    pub requires_login: bool,
}

pub trait MechanismProvider {
    fn resolve(&self, name: &str, args: &[String]) -> Result<Mechanism, TetherError>;
}

/// `tcp` redirects every connection; `http` filters by request and needs an
/// authenticated session.
pub struct BuiltinMechanisms {
    agent_image: String,
}

impl BuiltinMechanisms {
    pub fn new(agent_image: &str) -> Self {
        Self {
            agent_image: agent_image.to_string(),
        }
    }
}

impl MechanismProvider for BuiltinMechanisms {
    fn resolve(&self, name: &str, args: &[String]) -> Result<Mechanism, TetherError> {
        let requires_login = match name {
            "tcp" => {
                if let Some(arg) = args.first() {
                    return Err(TetherError::User(format!(
                        "mechanism tcp takes no arguments (got {arg})"
                    )));
                }
                false
            }
            "http" => {
                if let Some(arg) = args.iter().find(|arg| !arg.starts_with("--http-")) {
                    return Err(TetherError::User(format!(
                        "mechanism http only accepts --http-* arguments (got {arg})"
                    )));
                }
                true
            }
            other => {
                return Err(TetherError::User(format!(
                    "unknown mechanism {other}; expected tcp or http"
                )))
            }
        };
        Ok(Mechanism {
            name: name.to_string(),
            args: args.to_vec(),
            agent_image: self.agent_image.clone(),
            requires_login,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_needs_no_login_and_no_args() {
        let provider = BuiltinMechanisms::new("tether/agent:1");
        let mechanism = provider.resolve("tcp", &[]).unwrap();
        assert!(!mechanism.requires_login);
        assert_eq!(mechanism.agent_image, "tether/agent:1");
        assert!(provider.resolve("tcp", &["--x".to_string()]).is_err());
    }

    #[test]
    fn http_args_are_validated_and_require_login() {
        let provider = BuiltinMechanisms::new("img");
        let args = vec!["--http-header=x-user=me".to_string()];
        let mechanism = provider.resolve("http", &args).unwrap();
        assert!(mechanism.requires_login);
        assert_eq!(mechanism.args, args);
        let err = provider
            .resolve("http", &["--header".to_string()])
            .unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn unknown_mechanism_is_rejected() {
        let err = BuiltinMechanisms::new("img").resolve("grpc", &[]).unwrap_err();
        assert!(err.to_string().contains("unknown mechanism grpc"));
    }
}
