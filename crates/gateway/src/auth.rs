//! Connect-time authentication: shared token or shared password equality.

use sluice_protocol::ConnectAuth;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Token,
    Password,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::Token => "token",
            AuthMode::Password => "password",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
}

/// A configured token wins over a configured password; neither means open
/// access.
pub fn resolve_auth(token: Option<String>, password: Option<String>) -> ResolvedAuth {
    let token = token.filter(|t| !t.trim().is_empty());
    let password = password.filter(|p| !p.trim().is_empty());
    let mode = if token.is_some() {
        AuthMode::Token
    } else if password.is_some() {
        AuthMode::Password
    } else {
        AuthMode::None
    };
    ResolvedAuth {
        mode,
        token,
        password,
    }
}

impl ResolvedAuth {
    /// Check the credentials presented on `connect`.
    pub fn check(&self, presented: Option<&ConnectAuth>) -> Result<(), &'static str> {
        match self.mode {
            AuthMode::None => Ok(()),
            AuthMode::Token => {
                let expected = self.token.as_deref().unwrap_or_default();
                match presented.and_then(|a| a.token.as_deref()) {
                    Some(t) if t == expected => Ok(()),
                    Some(_) => Err("invalid token"),
                    None => Err("token required"),
                }
            },
            AuthMode::Password => {
                let expected = self.password.as_deref().unwrap_or_default();
                match presented.and_then(|a| a.password.as_deref()) {
                    Some(p) if p == expected => Ok(()),
                    Some(_) => Err("invalid password"),
                    None => Err("password required"),
                }
            },
        }
    }
}
