//! Authenticated-session lifecycle.
//!
//! The session manager owns every provider's token state; all other
//! components hold read-only views. Refreshes are single-flight per provider:
//! the per-provider slot is an async mutex, so concurrent callers of
//! [`SessionManager::get_token`] await the one in-flight refresh instead of
//! stampeding the provider.
//!
//! Token material never reaches logs: secrets have a redacting `Debug` and no
//! `Serialize` implementation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{CallError, ErrorKind};
use crate::provider::ProviderAdapter;

/// Opaque secret material. `Debug` and `Display` always redact.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap secret material.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the underlying value. Call sites must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Supported credential shapes.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// A pre-issued opaque bearer token, optionally expiring.
    Bearer {
        /// The token.
        token: Secret,
        /// Expiry, if the issuer communicated one.
        expires_at: Option<DateTime<Utc>>,
    },
    /// Username + password (password grant).
    Password {
        /// Account name.
        username: String,
        /// Account password.
        password: Secret,
    },
    /// Client id + client secret (client-credentials grant).
    ClientCredentials {
        /// OAuth client id.
        client_id: String,
        /// OAuth client secret.
        client_secret: Secret,
    },
    /// A browser-captured session (cookie or equivalent), for providers
    /// without a token API.
    BrowserSession {
        /// Captured session material.
        captured: Secret,
    },
}

/// A minted token plus refresh material.
#[derive(Debug, Clone)]
pub struct SessionToken {
    /// Bearer access token.
    pub access_token: Secret,
    /// Refresh token, when the grant issues one.
    pub refresh_token: Option<Secret>,
    /// Absolute expiry; `None` means non-expiring.
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    /// A non-expiring bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(token),
            refresh_token: None,
            expires_at: None,
        }
    }

    /// A token expiring after `ttl`.
    pub fn expiring(token: impl Into<String>, ttl: Duration) -> Self {
        Self {
            access_token: Secret::new(token),
            refresh_token: None,
            expires_at: Utc::now().checked_add_signed(
                chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero()),
            ),
        }
    }

    /// Whether the token expires within `window` from now.
    pub fn expires_within(&self, window: Duration) -> bool {
        match self.expires_at {
            Some(at) => {
                let margin = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
                Utc::now() + margin >= at
            }
            None => false,
        }
    }
}

/// Lifecycle state of one provider's session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No token minted yet.
    #[default]
    Uninitialized,
    /// Token present and outside the refresh window.
    Valid,
    /// A refresh is in flight.
    Refreshing,
    /// The last refresh failed; credentials are considered bad until replaced.
    Invalid,
}

/// Read-only view of one provider's session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Provider id.
    pub provider_id: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Token expiry, when known.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Slot {
    token: Option<SessionToken>,
    state: SessionState,
}

/// Owns per-provider sessions; spans multiple runs.
#[derive(Debug)]
pub struct SessionManager {
    refresh_window: Duration,
    credentials: DashMap<String, Credentials>,
    slots: DashMap<String, Arc<tokio::sync::Mutex<Slot>>>,
}

impl SessionManager {
    /// Manager with the default 60 s proactive-refresh window.
    pub fn new() -> Self {
        Self::with_refresh_window(Duration::from_secs(60))
    }

    /// Manager with a custom proactive-refresh window.
    pub fn with_refresh_window(refresh_window: Duration) -> Self {
        Self {
            refresh_window,
            credentials: DashMap::new(),
            slots: DashMap::new(),
        }
    }

    /// Install credentials for a provider, resetting any existing session.
    pub fn set_credentials(&self, provider_id: &str, credentials: Credentials) {
        self.credentials.insert(provider_id.to_string(), credentials);
        self.slots.remove(provider_id);
    }

    /// Whether credentials are registered for a provider. Providers without
    /// credentials are called anonymously; no token is attached.
    pub fn has_credentials(&self, provider_id: &str) -> bool {
        self.credentials.contains_key(provider_id)
    }

    fn slot(&self, provider_id: &str) -> Arc<tokio::sync::Mutex<Slot>> {
        Arc::clone(
            self.slots
                .entry(provider_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Return a valid bearer token for the provider, refreshing transparently
    /// when the current token is absent or within the refresh window.
    pub async fn get_token(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
    ) -> std::result::Result<String, CallError> {
        let slot = self.slot(adapter.id());
        let mut guard = slot.lock().await;
        if let Some(token) = &guard.token {
            if !token.expires_within(self.refresh_window) {
                return Ok(token.access_token.expose().to_string());
            }
        }
        self.refresh_locked(adapter, &mut guard).await
    }

    /// Drop the current token and mint a fresh one. Used for the single
    /// 401-replay: the resilient caller forces one reauthentication, replays,
    /// and surfaces `authentication_failed` on a second 401.
    pub async fn force_refresh(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
    ) -> std::result::Result<String, CallError> {
        let slot = self.slot(adapter.id());
        let mut guard = slot.lock().await;
        guard.token = None;
        self.refresh_locked(adapter, &mut guard).await
    }

    async fn refresh_locked(
        &self,
        adapter: &Arc<dyn ProviderAdapter>,
        guard: &mut Slot,
    ) -> std::result::Result<String, CallError> {
        let credentials = self
            .credentials
            .get(adapter.id())
            .map(|c| c.clone())
            .ok_or_else(|| {
                CallError::new(
                    ErrorKind::AuthenticationFailed,
                    format!("no credentials registered for provider '{}'", adapter.id()),
                )
            })?;

        guard.state = SessionState::Refreshing;
        tracing::debug!(provider = adapter.id(), "refreshing session token");
        match adapter.authenticate(&credentials).await {
            Ok(token) => {
                let value = token.access_token.expose().to_string();
                guard.token = Some(token);
                guard.state = SessionState::Valid;
                Ok(value)
            }
            Err(err) => {
                guard.token = None;
                guard.state = SessionState::Invalid;
                tracing::warn!(provider = adapter.id(), kind = %err.kind, "session refresh failed");
                Err(CallError {
                    kind: ErrorKind::AuthenticationFailed,
                    message: err.message,
                    status: err.status,
                    hints: None,
                })
            }
        }
    }

    /// Read-only view of a provider's session.
    pub fn session(&self, provider_id: &str) -> Session {
        let state = self
            .slots
            .get(provider_id)
            .and_then(|slot| slot.try_lock().ok().map(|g| (g.state, g.token.clone())));
        match state {
            Some((state, token)) => Session {
                provider_id: provider_id.to_string(),
                state,
                expires_at: token.and_then(|t| t.expires_at),
            },
            None => Session {
                provider_id: provider_id.to_string(),
                state: SessionState::Uninitialized,
                expires_at: None,
            },
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
