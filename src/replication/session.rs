//! Cookie session bootstrap.

use super::Replication;
use crate::auth::Authenticator;
use crate::error::{status, Result};
use crate::remote::RemoteRequest;
use serde_json::Value;
use tracing::{debug, info, warn};

impl Replication {
    /// Make sure a cookie session exists before replicating.
    ///
    /// Only authenticators that use cookie login need this. An existing
    /// session (non-empty `userCtx.name`) is reused; otherwise log in.
    pub(super) async fn check_session(&self) -> Result<()> {
        let Some(auth) = self
            .authenticator
            .clone()
            .filter(|auth| auth.uses_cookie_login())
        else {
            return Ok(());
        };

        let response = match self.send_request(RemoteRequest::get("_session")).await {
            // Older servers only answer at the root.
            Err(e) if e.is_http_status(status::NOT_FOUND) => {
                self.send_request(RemoteRequest::get("/_session")).await?
            }
            other => other?,
        };

        let info = response.json_value()?;
        let user = info
            .pointer("/userCtx/name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty());
        match user {
            Some(user) => {
                info!(session_id = %self.session_id(), user, "Using existing session");
                Ok(())
            }
            None => self.login(auth.as_ref()).await,
        }
    }

    async fn login(&self, auth: &dyn Authenticator) -> Result<()> {
        let (Some(path), Some(params)) = (auth.login_path(), auth.login_parameters()) else {
            debug!(session_id = %self.session_id(), "Authenticator has no login parameters");
            return Ok(());
        };

        info!(session_id = %self.session_id(), path = %path, "Logging in");
        match self.send_request(RemoteRequest::post(path, params)).await {
            Ok(_) => {
                info!(session_id = %self.session_id(), "Logged in");
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.session_id(), error = %e, "Login failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::detached_core;
    use crate::auth::{Authenticator, BasicAuthenticator, SessionAuthenticator};
    use crate::error::ReplicationError;
    use crate::remote::mock::{json_response, MockRemote};
    use reqwest::Method;
    use serde_json::json;
    use std::sync::Arc;

    fn session_auth() -> Option<Arc<dyn Authenticator>> {
        Some(Arc::new(SessionAuthenticator::new("alice", "secret")))
    }

    #[tokio::test]
    async fn test_no_session_check_without_cookie_login() {
        let remote = MockRemote::new(|_| json_response(json!({})));
        let auth: Arc<dyn Authenticator> = Arc::new(BasicAuthenticator::new("alice", "secret"));
        let core = detached_core(remote.clone(), Some(auth));

        core.check_session().await.unwrap();
        assert!(remote.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_existing_session_skips_login() {
        let remote = MockRemote::new(|_| json_response(json!({"userCtx": {"name": "alice"}})));
        let core = detached_core(remote.clone(), session_auth());

        core.check_session().await.unwrap();
        assert_eq!(remote.paths(), vec!["_session"]);
    }

    #[tokio::test]
    async fn test_logs_in_when_anonymous() {
        let remote = MockRemote::new(|req| {
            if req.method == Method::POST {
                json_response(json!({"ok": true}))
            } else {
                json_response(json!({"userCtx": {"name": null}}))
            }
        });
        let core = detached_core(remote.clone(), session_auth());

        core.check_session().await.unwrap();
        let requests = remote.requests.lock();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].method, Method::POST);
        assert_eq!(requests[1].path, "_session");
    }

    #[tokio::test]
    async fn test_falls_back_to_root_session() {
        let remote = MockRemote::new(|req| match req.path.as_str() {
            "_session" => Err(ReplicationError::http(404, "not_found")),
            _ => json_response(json!({"userCtx": {"name": "alice"}})),
        });
        let core = detached_core(remote.clone(), session_auth());

        core.check_session().await.unwrap();
        assert_eq!(remote.paths(), vec!["_session", "/_session"]);
    }

    #[tokio::test]
    async fn test_login_failure_is_reported() {
        let remote = MockRemote::new(|req| {
            if req.method == Method::POST {
                Err(ReplicationError::http(401, "unauthorized"))
            } else {
                json_response(json!({"userCtx": {}}))
            }
        });
        let core = detached_core(remote, session_auth());

        let err = core.check_session().await.unwrap_err();
        assert!(err.is_http_status(401));
    }
}
