//! Authentication capabilities.
//!
//! The replicator never inspects credentials itself. It asks an
//! [`Authenticator`] whether a cookie session has to be established, what
//! to POST to log in, and which `Authorization` header to attach.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::fmt;

pub trait Authenticator: Send + Sync + fmt::Debug {
    /// True if a session cookie must be obtained before replicating.
    fn uses_cookie_login(&self) -> bool;

    /// Login endpoint. Relative paths are resolved against the database,
    /// a leading `/` against the server root.
    fn login_path(&self) -> Option<String> {
        None
    }

    /// Body POSTed to [`login_path`](Self::login_path). `None` skips login.
    fn login_parameters(&self) -> Option<Value> {
        None
    }

    /// Value of the `Authorization` header, if any.
    fn authorization_header(&self) -> Option<String> {
        None
    }
}

/// HTTP basic auth on every request.
#[derive(Clone)]
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BasicAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthenticator")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl Authenticator for BasicAuthenticator {
    fn uses_cookie_login(&self) -> bool {
        false
    }

    fn authorization_header(&self) -> Option<String> {
        let token = BASE64.encode(format!("{}:{}", self.username, self.password));
        Some(format!("Basic {token}"))
    }
}

/// Cookie session obtained by POSTing credentials to `_session`.
#[derive(Clone)]
pub struct SessionAuthenticator {
    username: String,
    password: String,
    login_path: String,
}

impl SessionAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            login_path: "_session".to_string(),
        }
    }

    /// Use a different login endpoint, e.g. a provider-specific one.
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }
}

impl fmt::Debug for SessionAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionAuthenticator")
            .field("username", &self.username)
            .field("login_path", &self.login_path)
            .finish_non_exhaustive()
    }
}

impl Authenticator for SessionAuthenticator {
    fn uses_cookie_login(&self) -> bool {
        true
    }

    fn login_path(&self) -> Option<String> {
        Some(self.login_path.clone())
    }

    fn login_parameters(&self) -> Option<Value> {
        Some(json!({ "name": self.username, "password": self.password }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header() {
        let auth = BasicAuthenticator::new("alice", "secret");
        assert!(!auth.uses_cookie_login());
        assert_eq!(
            auth.authorization_header().as_deref(),
            Some("Basic YWxpY2U6c2VjcmV0")
        );
        assert!(auth.login_parameters().is_none());
    }

    #[test]
    fn test_session_login() {
        let auth = SessionAuthenticator::new("alice", "secret");
        assert!(auth.uses_cookie_login());
        assert_eq!(auth.login_path().as_deref(), Some("_session"));
        assert_eq!(
            auth.login_parameters(),
            Some(json!({"name": "alice", "password": "secret"}))
        );
        assert!(auth.authorization_header().is_none());
    }

    #[test]
    fn test_debug_hides_password() {
        let basic = format!("{:?}", BasicAuthenticator::new("alice", "secret"));
        let session = format!("{:?}", SessionAuthenticator::new("bob", "hunter2"));
        assert!(!basic.contains("secret"));
        assert!(!session.contains("hunter2"));
        assert!(session.contains("bob"));
    }
}
