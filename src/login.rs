use std::sync::Arc;
use tracing::debug;

use crate::cancel::CallContext;
use crate::connector::ConnectorClient;
use crate::error::TetherError;

pub trait Authenticator {
    fn ensure_logged_in(&self, ctx: &CallContext) -> Result<(), TetherError>;
}

/// Logs in through the connector, which may open a browser, so a terminal
/// must be attached.
pub struct ConnectorLogin {
    client: Arc<dyn ConnectorClient>,
    interactive: bool,
}

impl ConnectorLogin {
    pub fn new(client: Arc<dyn ConnectorClient>, interactive: bool) -> Self {
        Self {
            client,
            interactive,
        }
    }
}

impl Authenticator for ConnectorLogin {
    fn ensure_logged_in(&self, ctx: &CallContext) -> Result<(), TetherError> {
        if !self.interactive {
            return Err(TetherError::User(
                "login requires an interactive terminal; run `tether login` first".to_string(),
            ));
        }
        let result = self.client.login(ctx)?;
        if !result.logged_in {
            let message = if result.message.is_empty() {
                "login failed".to_string()
            } else {
                result.message
            };
            return Err(TetherError::User(message));
        }
        debug!("logged in");
        Ok(())
    }
}
