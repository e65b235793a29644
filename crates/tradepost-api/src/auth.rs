use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::BackendClient;
use crate::error::{BackendError, Result};

const AUTH_PATH: &str = "auth/v1";

/// Account as the auth service knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
    #[serde(default)]
    pub user_metadata: Value,
    pub created_at: Option<DateTime<Utc>>,
}

/// Signed-in session; serializable so it survives restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Unix timestamp (seconds)
    pub expires_at: Option<i64>,
    pub user: Option<AuthUser>,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map(|exp| exp <= now.timestamp())
            .unwrap_or(false)
    }
}

/// What sign-up hands back
#[derive(Debug, Clone, PartialEq)]
pub enum SignUp {
    /// Account created and signed in
    SignedIn(Session),
    /// Account created, waiting for email confirmation
    PendingConfirmation(AuthUser),
}

/// Auth operations of the hosted backend
#[async_trait]
pub trait AuthBackend: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<SignUp>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session>;

    /// Revoke the current session; signing out twice is fine
    async fn sign_out(&self) -> Result<()>;

    /// `None` when nobody is signed in
    async fn current_user(&self) -> Result<Option<AuthUser>>;
}

impl BackendClient {
    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/{}/{}", self.base_url, AUTH_PATH, endpoint)
    }
}

#[async_trait]
impl AuthBackend for BackendClient {
    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<SignUp> {
        debug!("Signing up {}", email);

        let request = self
            .client
            .post(self.auth_url("signup"))
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password, "data": metadata }));
        let body = Self::read_json(request.send().await?).await?;

        if body.get("access_token").is_some() {
            let session: Session = serde_json::from_value(body)?;
            self.set_session(Some(session.clone()));
            info!("Signed up and signed in as {}", email);
            return Ok(SignUp::SignedIn(session));
        }

        // Confirmation pending: either `{user: {...}}` or the bare user
        let user_value = body.get("user").cloned().unwrap_or(body);
        let user: AuthUser = serde_json::from_value(user_value)?;
        info!("Signed up {}, confirmation pending", email);
        Ok(SignUp::PendingConfirmation(user))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session> {
        debug!("Signing in {}", email);

        let request = self
            .client
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&json!({ "email": email, "password": password }));
        let body = Self::read_json(request.send().await?).await?;

        let session: Session = serde_json::from_value(body)?;
        self.set_session(Some(session.clone()));
        info!("Signed in as {}", email);
        Ok(session)
    }

    async fn sign_out(&self) -> Result<()> {
        let Some(session) = self.session() else {
            return Ok(());
        };

        let request = self
            .client
            .post(self.auth_url("logout"))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token);
        let result = Self::read_json(request.send().await?).await;

        // The local session goes away even if the token was already revoked
        self.set_session(None);

        match result {
            Ok(_) => Ok(()),
            Err(BackendError::Api { status: 401, .. }) | Err(BackendError::Api { status: 403, .. }) => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn current_user(&self) -> Result<Option<AuthUser>> {
        let Some(session) = self.session() else {
            return Ok(None);
        };

        let request = self
            .client
            .get(self.auth_url("user"))
            .header("apikey", &self.anon_key)
            .bearer_auth(&session.access_token);
        let body = Self::read_json(request.send().await?).await?;

        Ok(Some(serde_json::from_value(body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_from_token_response() {
        let body = json!({
            "access_token": "jwt",
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": 1_700_000_000,
            "refresh_token": "refresh",
            "user": {
                "id": "7c1e0d8a-0000-4000-8000-000000000001",
                "email": "buyer@example.com",
                "user_metadata": { "company_name": "Acme" },
                "created_at": "2024-01-02T03:04:05Z"
            }
        });

        let session: Session = serde_json::from_value(body).unwrap();
        assert_eq!(session.access_token, "jwt");
        let user = session.user.as_ref().unwrap();
        assert_eq!(user.email.as_deref(), Some("buyer@example.com"));
        assert_eq!(user.user_metadata["company_name"], "Acme");
    }

    #[test]
    fn test_session_expiry() {
        let session = Session {
            access_token: "jwt".into(),
            refresh_token: None,
            token_type: default_token_type(),
            expires_at: Some(1_000),
            user: None,
        };

        let before = DateTime::<Utc>::from_timestamp(999, 0).unwrap();
        let after = DateTime::<Utc>::from_timestamp(1_000, 0).unwrap();
        assert!(!session.is_expired(before));
        assert!(session.is_expired(after));
    }

    #[tokio::test]
    async fn test_signed_out_client_has_no_user() {
        let client = BackendClient::new("https://shop.example.co", "anon").unwrap();

        // Neither call should touch the network without a session
        assert_eq!(client.current_user().await.unwrap(), None);
        assert!(client.sign_out().await.is_ok());
    }
}
