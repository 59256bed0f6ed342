//! Authorization for mutating endpoints
//!
//! A request is authorized by `Authorization: Bearer <password|cron secret>`
//! or by the dashboard cookie holding the hex SHA-256 of the password.

use axum::http::{header::AUTHORIZATION, HeaderMap};
use axum_extra::extract::CookieJar;
use sha2::{Digest, Sha256};

use crate::config::AuthConfig;
use crate::error::{Error, Result};

/// Cookie set by the dashboard login
pub const AUTH_COOKIE: &str = "dashboard_auth";

/// Hex SHA-256 of a password, as stored in the dashboard cookie
pub fn password_token(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Checks request credentials against the configured secrets
#[derive(Debug, Clone, Default)]
pub struct Authorizer {
    bearer_tokens: Vec<String>,
    cookie_token: Option<String>,
}

impl Authorizer {
    /// Create an authorizer; empty secrets are ignored
    pub fn new(config: &AuthConfig) -> Self {
        let password = config.password.clone().filter(|p| !p.is_empty());
        let cron_secret = config.cron_secret.clone().filter(|s| !s.is_empty());

        Self {
            cookie_token: password.as_deref().map(password_token),
            bearer_tokens: password.into_iter().chain(cron_secret).collect(),
        }
    }

    /// Whether any secret is configured
    pub fn is_configured(&self) -> bool {
        !self.bearer_tokens.is_empty()
    }

    /// Authorize a request by its headers
    pub fn check(&self, headers: &HeaderMap) -> Result<()> {
        if !self.is_configured() {
            return Err(Error::config("PASSWORD is missing"));
        }

        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if bearer.is_some_and(|token| self.bearer_tokens.iter().any(|t| t == token)) {
            return Ok(());
        }

        if let Some(expected) = &self.cookie_token {
            let jar = CookieJar::from_headers(headers);
            if jar.get(AUTH_COOKIE).is_some_and(|c| c.value() == expected) {
                return Ok(());
            }
        }

        Err(Error::Unauthorized)
    }
}
