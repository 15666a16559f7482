//! Authenticated-session lifecycle and its durable backing.
//!
//! The store is the only writer of the [`TOKEN_SLOT`] and [`USER_SLOT`] slots.
//! Every change to the credential or identity is written to storage while the
//! state lock is held, so observers never see memory and storage disagree.

use std::sync::Arc;

use shared::{
    domain::{Credential, Identity, SessionStatus},
    protocol::{AdminLoginRequest, AuthReply, AuthResponse, ProfileResponse},
};
use storage::{KeyValueStore, SlotWrite};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{
    gateway::{Gateway, GatewayError, ProviderPayload},
    ClientEvent,
};

pub const TOKEN_SLOT: &str = "token";
pub const USER_SLOT: &str = "user";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub credential: Option<Credential>,
    pub identity: Option<Identity>,
    pub status: SessionStatus,
}

impl SessionSnapshot {
    pub fn is_authenticated(&self) -> bool {
        self.credential.is_some()
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no credential")]
    NoCredential,
    #[error("authentication rejected: {0}")]
    Rejected(String),
    #[error("credential invalid: {0}")]
    InvalidCredential(String),
    #[error("session changed while the request was in flight")]
    Superseded,
    #[error("failed to persist session: {0}")]
    Storage(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

pub struct SessionStore {
    gateway: Arc<dyn Gateway>,
    storage: Arc<dyn KeyValueStore>,
    state: Mutex<SessionSnapshot>,
    events: broadcast::Sender<ClientEvent>,
}

impl SessionStore {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        storage: Arc<dyn KeyValueStore>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            gateway,
            storage,
            state: Mutex::new(SessionSnapshot::default()),
            events,
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().await.clone()
    }

    pub async fn credential(&self) -> Option<Credential> {
        self.state.lock().await.credential.clone()
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.state.lock().await.identity.clone()
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.lock().await.status
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.is_authenticated()
    }

    /// Restores the session persisted by a previous run. Unreadable or
    /// half-written slots yield an empty session and are erased.
    pub async fn initialize(&self) -> SessionSnapshot {
        let raw_token = self.read_slot(TOKEN_SLOT).await;
        let raw_user = self.read_slot(USER_SLOT).await;

        let credential = raw_token.clone().and_then(Credential::new);
        let identity = raw_user.as_deref().and_then(Identity::from_json);

        let mut guard = self.state.lock().await;
        match (credential, identity) {
            (Some(credential), Some(identity)) => {
                guard.credential = Some(credential);
                guard.identity = Some(identity);
                guard.status = SessionStatus::Idle;
                info!(
                    user = %identity_label(guard.identity.as_ref()),
                    "session: restored persisted session"
                );
            }
            _ if raw_token.is_some() || raw_user.is_some() => {
                warn!(
                    has_token = raw_token.is_some(),
                    has_user = raw_user.is_some(),
                    "session: discarding malformed persisted session"
                );
                // A surviving half never restores, so memory is empty either way.
                *guard = SessionSnapshot::default();
                if let Err(err) = self.erase_slots().await {
                    warn!("session: malformed persisted session left in place: {err}");
                }
            }
            _ => {
                *guard = SessionSnapshot::default();
            }
        }
        self.publish(&guard);
        guard.clone()
    }

    /// Exchanges the identity provider's payload for a backend session.
    pub async fn authenticate(
        &self,
        payload: &ProviderPayload,
    ) -> Result<AuthResponse, SessionError> {
        self.set_status(SessionStatus::Loading).await;
        let reply = self.gateway.authenticate(payload).await;
        self.finish_login(reply).await
    }

    pub async fn authenticate_admin(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthResponse, SessionError> {
        self.set_status(SessionStatus::Loading).await;
        let request = AdminLoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let reply = self.gateway.admin_login(&request).await;
        self.finish_login(reply).await
    }

    /// Checks the held credential against the profile endpoint. Any failed
    /// check ends the session.
    pub async fn validate(&self) -> Result<ProfileResponse, SessionError> {
        let credential = {
            let mut guard = self.state.lock().await;
            match guard.credential.clone() {
                Some(credential) => {
                    guard.status = SessionStatus::Loading;
                    self.publish(&guard);
                    credential
                }
                None => {
                    let _ = self.reset_locked(&mut guard, SessionStatus::Error).await;
                    self.publish(&guard);
                    warn!("session: validate called without a credential");
                    return Err(SessionError::NoCredential);
                }
            }
        };

        let outcome = self.gateway.fetch_profile(&credential).await;

        let mut guard = self.state.lock().await;
        if guard.credential.as_ref() != Some(&credential) {
            warn!("session: profile answer arrived for a replaced credential; ignoring");
            return Err(SessionError::Superseded);
        }

        match outcome {
            Ok(profile) => {
                if let Err(err) = self
                    .storage
                    .set(USER_SLOT, &profile.user.to_json())
                    .await
                {
                    guard.status = SessionStatus::Error;
                    self.publish(&guard);
                    warn!("session: failed to persist refreshed profile: {err:#}");
                    return Err(SessionError::Storage(format!("{err:#}")));
                }
                guard.identity = Some(profile.user.clone());
                guard.status = SessionStatus::Success;
                self.publish(&guard);
                info!(
                    user = %identity_label(guard.identity.as_ref()),
                    "session: credential validated"
                );
                Ok(profile)
            }
            Err(err) => {
                let _ = self.reset_locked(&mut guard, SessionStatus::Error).await;
                self.publish(&guard);
                match err {
                    GatewayError::Api(rejection) if rejection.is_auth_rejection() => {
                        warn!(
                            status = rejection.status,
                            "session: credential rejected by profile check; session cleared"
                        );
                        Err(SessionError::InvalidCredential(rejection.message))
                    }
                    err => {
                        warn!("session: profile check failed; session cleared: {err}");
                        Err(err.into())
                    }
                }
            }
        }
    }

    /// Drops the session from memory and storage. Safe to call repeatedly.
    /// When storage refuses the erase the session stays in place and the
    /// status turns to `Error`.
    pub async fn clear(&self) -> Result<(), SessionError> {
        let mut guard = self.state.lock().await;
        let outcome = self.reset_locked(&mut guard, SessionStatus::Idle).await;
        self.publish(&guard);
        if outcome.is_ok() {
            info!("session: cleared");
        }
        outcome
    }

    async fn finish_login(
        &self,
        reply: Result<AuthReply, GatewayError>,
    ) -> Result<AuthResponse, SessionError> {
        let response = match reply {
            Ok(AuthReply::Granted(response)) => response,
            Ok(AuthReply::Rejected(rejection)) => {
                self.set_status(SessionStatus::Error).await;
                warn!(reason = %rejection.error, "session: authentication rejected");
                return Err(SessionError::Rejected(rejection.error));
            }
            Err(err) => {
                self.set_status(SessionStatus::Error).await;
                warn!("session: authentication request failed: {err}");
                return Err(err.into());
            }
        };

        let Some(credential) = Credential::new(response.token.clone()) else {
            self.set_status(SessionStatus::Error).await;
            warn!("session: backend issued an empty token");
            return Err(SessionError::Rejected("backend issued an empty token".into()));
        };

        let mut guard = self.state.lock().await;
        let writes = [
            SlotWrite::set(TOKEN_SLOT, credential.as_str()),
            SlotWrite::set(USER_SLOT, response.user.to_json()),
        ];
        if let Err(err) = self.storage.apply(&writes).await {
            warn!("session: failed to persist new session: {err:#}");
            self.restore_slots(&guard).await;
            guard.status = SessionStatus::Error;
            self.publish(&guard);
            return Err(SessionError::Storage(format!("{err:#}")));
        }

        guard.credential = Some(credential);
        guard.identity = Some(response.user.clone());
        guard.status = SessionStatus::Success;
        self.publish(&guard);
        info!(
            user = %identity_label(guard.identity.as_ref()),
            "session: authenticated"
        );
        Ok(response)
    }

    async fn set_status(&self, status: SessionStatus) {
        let mut guard = self.state.lock().await;
        guard.status = status;
        self.publish(&guard);
    }

    async fn read_slot(&self, key: &str) -> Option<String> {
        match self.storage.get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(slot = key, "session: failed to read persisted slot: {err:#}");
                None
            }
        }
    }

    /// Empties `state` once both slots are gone from storage. If storage keeps
    /// the session, `state` keeps it too and only the status changes.
    async fn reset_locked(
        &self,
        state: &mut SessionSnapshot,
        status: SessionStatus,
    ) -> Result<(), SessionError> {
        if let Err(err) = self.erase_slots().await {
            state.status = SessionStatus::Error;
            let _ = self.events.send(ClientEvent::Notice(format!(
                "could not remove the stored session: {err}"
            )));
            return Err(err);
        }
        state.credential = None;
        state.identity = None;
        state.status = status;
        Ok(())
    }

    /// Erases both slots, one at a time if the batch fails. One removed slot
    /// is enough: a lone token or user never restores.
    async fn erase_slots(&self) -> Result<(), SessionError> {
        let writes = [SlotWrite::remove(TOKEN_SLOT), SlotWrite::remove(USER_SLOT)];
        let Err(batch_err) = self.storage.apply(&writes).await else {
            return Ok(());
        };
        warn!("session: failed to erase persisted session: {batch_err:#}");

        let mut erased = 0;
        for key in [TOKEN_SLOT, USER_SLOT] {
            match self.storage.remove(key).await {
                Ok(()) => erased += 1,
                Err(err) => warn!(slot = key, "session: failed to erase slot: {err:#}"),
            }
        }
        if erased == 0 {
            return Err(SessionError::Storage(format!("{batch_err:#}")));
        }
        Ok(())
    }

    /// Rewrites the slots from the in-memory session after a failed write.
    async fn restore_slots(&self, snapshot: &SessionSnapshot) {
        let writes = match (&snapshot.credential, &snapshot.identity) {
            (Some(credential), Some(identity)) => vec![
                SlotWrite::set(TOKEN_SLOT, credential.as_str()),
                SlotWrite::set(USER_SLOT, identity.to_json()),
            ],
            _ => vec![SlotWrite::remove(TOKEN_SLOT), SlotWrite::remove(USER_SLOT)],
        };
        if let Err(err) = self.storage.apply(&writes).await {
            warn!("session: failed to restore persisted session: {err:#}");
        }
    }

    fn publish(&self, snapshot: &SessionSnapshot) {
        let _ = self
            .events
            .send(ClientEvent::SessionChanged(snapshot.clone()));
    }
}

fn identity_label(identity: Option<&Identity>) -> String {
    identity
        .and_then(Identity::display_name)
        .unwrap_or_else(|| "<unnamed>".to_string())
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
