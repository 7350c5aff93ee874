//! Administrator login.
//!
//! One shared admin password, configured at startup. A successful login
//! yields a bearer token valid for 24 hours. Tokens are process-local.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::session::{random_token, secrets_match};

/// Admin token lifetime.
pub const ADMIN_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("administration is disabled")]
    Disabled,

    #[error("invalid admin credentials")]
    InvalidCredentials,

    #[error("admin token expired or invalid")]
    Unauthorized,
}

pub struct AdminAuth {
    password: Option<String>,
    /// token → expires_at (ms)
    tokens: Mutex<HashMap<String, u64>>,
    clock: SharedClock,
}

impl AdminAuth {
    /// `None` disables every admin operation.
    pub fn new(password: Option<String>, clock: SharedClock) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()),
            tokens: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn enabled(&self) -> bool {
        self.password.is_some()
    }

    pub fn login(&self, password: &str) -> Result<String, AdminError> {
        let expected = self.password.as_deref().ok_or(AdminError::Disabled)?;
        if !secrets_match(expected, password) {
            log::warn!("Rejected admin login");
            return Err(AdminError::InvalidCredentials);
        }
        let token = random_token();
        let now = self.clock.now_millis();
        let mut tokens = self.tokens.lock();
        tokens.retain(|_, expiry| *expiry > now);
        tokens.insert(token.clone(), now + ADMIN_TOKEN_TTL.as_millis() as u64);
        log::info!("Admin login");
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> Result<(), AdminError> {
        if !self.enabled() {
            return Err(AdminError::Disabled);
        }
        let now = self.clock.now_millis();
        let mut tokens = self.tokens.lock();
        let found = tokens
            .iter()
            .find(|(issued, _)| secrets_match(issued, token))
            .map(|(issued, expiry)| (issued.clone(), *expiry));
        match found {
            Some((_, expiry)) if expiry > now => Ok(()),
            Some((issued, _)) => {
                tokens.remove(&issued);
                Err(AdminError::Unauthorized)
            }
            None => Err(AdminError::Unauthorized),
        }
    }

    pub fn logout(&self, token: &str) -> bool {
        self.tokens.lock().remove(token).is_some()
    }
}
