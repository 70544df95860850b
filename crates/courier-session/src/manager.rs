//! Session manager owning per-identity credentials and protocol clients.

use std::{collections::HashMap, sync::Arc};

use courier_core::{
    ClientError, ClientFactory, Clock, CredentialIssuer, DecodeError, DecodedCredential,
    EngineStorage, Identity, IssueError, ProtocolClient, SessionConfig, SessionStore, StoreError,
    StoreHandle, SystemClock, decode_unverified, generate_device_id,
};
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::events::{EventBus, SessionEvent};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Issuer error: {0}")]
    Issue(#[from] IssueError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    #[error("Credential decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Issued credential expires at {expires_at}, inside the freshness window at {now}")]
    CredentialTooShortLived { expires_at: i64, now: i64 },
    #[error("No session for identity: {0}")]
    NoSession(Identity),
}

impl SessionError {
    /// Whether the issuer reported the identity's credentials as revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::Issue(e) if e.is_revoked())
    }
}

/// Cached state for one identity.
struct SessionRecord {
    credential: String,
    claims: DecodedCredential,
    /// Fixed once the record exists.
    passphrase: Option<String>,
    client: Arc<dyn ProtocolClient>,
    store: Arc<dyn StoreHandle>,
}

/// Per-identity slot; its mutex serializes every operation on that identity.
type Slot = Arc<Mutex<Option<SessionRecord>>>;

/// Session manager for per-identity credentials and protocol clients.
///
/// Callers ask for a client by identity and get one bound to a credential
/// that stays valid for at least the configured window. Operations on one
/// identity are serialized; different identities never share a lock beyond
/// the brief slot table lookup.
pub struct SessionManager<I, S, F>
where
    I: CredentialIssuer,
    S: SessionStore,
    F: ClientFactory,
{
    issuer: I,
    store: S,
    clients: F,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
    slots: RwLock<HashMap<Identity, Slot>>,
    events: EventBus,
}

impl<I, S, F> SessionManager<I, S, F>
where
    I: CredentialIssuer,
    S: SessionStore,
    F: ClientFactory,
{
    /// Create a new session manager with default config and the system clock.
    #[must_use]
    pub fn new(issuer: I, store: S, clients: F) -> Self {
        Self {
            issuer,
            store,
            clients,
            clock: Arc::new(SystemClock),
            config: SessionConfig::default(),
            slots: RwLock::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    /// Replace the config.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Get a receiver for lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Stream of lifecycle events.
    #[must_use]
    pub fn events(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        self.events.stream()
    }

    /// Return a credential valid for longer than the freshness window,
    /// creating or refreshing the identity's session as needed.
    ///
    /// `passphrase` only applies when no session record exists yet.
    ///
    /// # Errors
    /// Returns error if a session cannot be created. Failures while
    /// refreshing an existing session fall back to re-creation instead.
    pub async fn ensure_valid_session(
        &self,
        identity: &Identity,
        passphrase: Option<&str>,
    ) -> Result<String, SessionError> {
        let slot = self.slot(identity).await;
        let mut guard = slot.lock().await;
        let result = self.ensure_locked(identity, passphrase, &mut guard).await;
        drop(guard);
        drop(slot);

        if result.is_err() {
            self.prune(identity).await;
        }
        result
    }

    /// Get the identity's protocol client, bound to a fresh credential.
    ///
    /// # Errors
    /// Returns error if a session cannot be created.
    pub async fn get_client(
        &self,
        identity: &Identity,
    ) -> Result<Arc<dyn ProtocolClient>, SessionError> {
        let slot = self.slot(identity).await;
        let mut guard = slot.lock().await;
        let result = match self.ensure_locked(identity, None, &mut guard).await {
            Ok(_) => guard
                .as_ref()
                .map(|record| Arc::clone(&record.client))
                .ok_or_else(|| SessionError::NoSession(identity.clone())),
            Err(e) => Err(e),
        };
        drop(guard);
        drop(slot);

        if result.is_err() {
            self.prune(identity).await;
        }
        result
    }

    /// Tear down the identity's session. No-op if none exists.
    ///
    /// With `destroy_storage`, all local encrypted state for the identity is
    /// irreversibly deleted; otherwise the store is only closed.
    ///
    /// # Errors
    /// Returns error if stopping the client or a store call fails. The
    /// record is dropped from the cache either way.
    pub async fn delete_session(
        &self,
        identity: &Identity,
        destroy_storage: bool,
    ) -> Result<(), SessionError> {
        let Some(slot) = self.slots.read().await.get(identity).cloned() else {
            return Ok(());
        };

        let mut guard = slot.lock().await;
        let result = match guard.take() {
            Some(record) => self
                .teardown(identity, record, destroy_storage)
                .await
                .map(|()| true),
            None => Ok(false),
        };
        drop(guard);
        drop(slot);
        self.prune(identity).await;

        if matches!(result, Ok(true)) {
            info!(identity = %identity, destroyed = destroy_storage, "Session deleted");
            self.events.emit(SessionEvent::Deleted {
                identity: identity.clone(),
                destroyed: destroy_storage,
            });
        }
        result.map(|_| ())
    }

    /// Delete every cached session, keeping durable storage.
    ///
    /// Waits the configured grace period first so background work across
    /// sessions can quiesce. Work may still be in flight on return.
    ///
    /// # Errors
    /// Returns the first teardown error; later sessions are left in place.
    pub async fn reset(&self) -> Result<(), SessionError> {
        tokio::time::sleep(self.config.reset_grace()).await;

        let identities = self.active_identities().await;
        info!(count = identities.len(), "Resetting sessions");
        for identity in identities {
            tokio::task::yield_now().await;
            self.delete_session(&identity, false).await?;
        }
        Ok(())
    }

    /// Identities that currently hold a session record, or have an
    /// operation in flight.
    pub async fn active_identities(&self) -> Vec<Identity> {
        self.slots
            .read()
            .await
            .iter()
            .filter(|(_, slot)| match slot.try_lock() {
                Ok(record) => record.is_some(),
                // Locked slots have an operation in flight.
                Err(_) => true,
            })
            .map(|(identity, _)| identity.clone())
            .collect()
    }

    /// Whether the identity has a session record. Waits for in-flight
    /// operations on that identity.
    pub async fn has_session(&self, identity: &Identity) -> bool {
        let Some(slot) = self.slots.read().await.get(identity).cloned() else {
            return false;
        };
        slot.lock().await.is_some()
    }

    async fn slot(&self, identity: &Identity) -> Slot {
        if let Some(slot) = self.slots.read().await.get(identity) {
            return Arc::clone(slot);
        }
        Arc::clone(self.slots.write().await.entry(identity.clone()).or_default())
    }

    /// Drop the identity's slot if it is empty and nobody else holds it.
    ///
    /// Slots are only cloned under the table lock, so a strong count of one
    /// under the write lock means no caller can be waiting on it.
    async fn prune(&self, identity: &Identity) {
        let mut slots = self.slots.write().await;
        let unused = slots.get(identity).is_some_and(|slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().is_ok_and(|record| record.is_none())
        });
        if unused {
            slots.remove(identity);
        }
    }

    async fn ensure_locked(
        &self,
        identity: &Identity,
        passphrase: Option<&str>,
        record: &mut Option<SessionRecord>,
    ) -> Result<String, SessionError> {
        let now = self.clock.now_epoch_seconds();
        let window = self.config.expiry_window_secs;

        let refreshed = match record.as_mut() {
            None => None,
            Some(current) => {
                if !current.claims.is_expiring(now, window)
                    && current.client.is_bound_to(&current.credential)
                {
                    debug!(identity = %identity, "Reusing cached session");
                    return Ok(current.credential.clone());
                }
                Some(
                    self.refresh(identity, current)
                        .await
                        .map(|()| current.credential.clone()),
                )
            }
        };

        let mut passphrase = passphrase.map(str::to_owned);
        match refreshed {
            Some(Ok(credential)) => {
                info!(identity = %identity, "Session refreshed");
                self.events.emit(SessionEvent::Refreshed {
                    identity: identity.clone(),
                });
                return Ok(credential);
            }
            Some(Err(e)) => {
                warn!(identity = %identity, "Session refresh failed, recreating: {e}");
                self.events.emit(SessionEvent::RefreshFailed {
                    identity: identity.clone(),
                    reason: e.to_string(),
                });
                if let Some(stale) = record.take() {
                    passphrase = stale.passphrase.clone();
                    self.discard(identity, stale, e.is_revoked()).await;
                }
            }
            None => {}
        }

        let (created, reused_stored) = self.create(identity, passphrase).await?;
        let credential = created.credential.clone();
        *record = Some(created);

        info!(identity = %identity, reused_stored, "Session created");
        self.events.emit(SessionEvent::Created {
            identity: identity.clone(),
            reused_stored,
        });
        Ok(credential)
    }

    /// Swap a new credential into an existing record in place.
    async fn refresh(
        &self,
        identity: &Identity,
        record: &mut SessionRecord,
    ) -> Result<(), SessionError> {
        let (credential, claims) = self.issue(identity, &record.claims.device_id).await?;
        record.client.update_credential(&credential).await?;
        record.store.save_credential(&credential).await?;
        record.credential = credential;
        record.claims = claims;
        Ok(())
    }

    /// Best-effort cleanup of a record whose refresh failed.
    async fn discard(&self, identity: &Identity, stale: SessionRecord, revoked: bool) {
        if let Err(e) = stale.client.stop().await {
            warn!(identity = %identity, "Failed to stop stale client: {e}");
        }
        // A revoked credential must not be revived from storage.
        if revoked {
            if let Err(e) = stale.store.delete_credential().await {
                warn!(identity = %identity, "Failed to purge revoked credential: {e}");
            }
        }
    }

    /// Build a new record from storage or the issuer.
    ///
    /// The store is closed again if anything after opening it fails, since
    /// no record is left to own the handle.
    async fn create(
        &self,
        identity: &Identity,
        passphrase: Option<String>,
    ) -> Result<(SessionRecord, bool), SessionError> {
        let store = self.store.open(identity, passphrase.as_deref()).await?;
        match self.bind(identity, store, passphrase).await {
            Ok(created) => Ok(created),
            Err(e) => {
                if let Err(close_err) = self.store.close(identity).await {
                    warn!(identity = %identity, "Failed to close store after failed create: {close_err}");
                }
                Err(e)
            }
        }
    }

    async fn bind(
        &self,
        identity: &Identity,
        store: Arc<dyn StoreHandle>,
        passphrase: Option<String>,
    ) -> Result<(SessionRecord, bool), SessionError> {
        let now = self.clock.now_epoch_seconds();
        let window = self.config.expiry_window_secs;

        let stored = store.get_credential().await?;
        let (credential, claims, reused_stored) = match stored {
            Some(stored) => match decode_unverified(&stored) {
                Ok(claims) if !claims.is_expiring(now, window) => (stored, claims, true),
                Ok(claims) => {
                    debug!(identity = %identity, "Stored credential expiring, reissuing");
                    let (credential, claims) = self.issue(identity, &claims.device_id).await?;
                    (credential, claims, false)
                }
                Err(e) => {
                    debug!(identity = %identity, "Stored credential unreadable: {e}");
                    let (credential, claims) =
                        self.issue(identity, &generate_device_id()).await?;
                    (credential, claims, false)
                }
            },
            None => {
                let (credential, claims) = self.issue(identity, &generate_device_id()).await?;
                (credential, claims, false)
            }
        };

        let client = self
            .clients
            .create(identity, &credential, &claims, Some(Arc::clone(&store)))
            .await?;

        let engine = if store.is_durable() {
            EngineStorage::Durable {
                namespace: self.config.engine_namespace(identity.as_str()),
                passphrase: passphrase.clone(),
            }
        } else {
            EngineStorage::InMemory
        };
        client.start(engine).await?;

        if let Err(e) = store.save_credential(&credential).await {
            if let Err(stop_err) = client.stop().await {
                warn!(identity = %identity, "Failed to stop unpersisted client: {stop_err}");
            }
            return Err(e.into());
        }

        let record = SessionRecord {
            credential,
            claims,
            passphrase,
            client,
            store,
        };
        Ok((record, reused_stored))
    }

    /// Request a credential and check it clears the freshness window.
    async fn issue(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> Result<(String, DecodedCredential), SessionError> {
        debug!(identity = %identity, device_id, "Requesting credential");
        let issued = self.issuer.issue(identity, device_id).await?;
        let claims = decode_unverified(&issued.credential)?;

        let now = self.clock.now_epoch_seconds();
        if claims.is_expiring(now, self.config.expiry_window_secs) {
            return Err(SessionError::CredentialTooShortLived {
                expires_at: claims.expires_at,
                now,
            });
        }
        if claims.expires_at != issued.expires_at {
            debug!(
                identity = %identity,
                claimed = claims.expires_at,
                reported = issued.expires_at,
                "Issuer expiry differs from credential claims"
            );
        }
        Ok((issued.credential, claims))
    }

    /// Stop, drain, and release everything a record owns.
    async fn teardown(
        &self,
        identity: &Identity,
        record: SessionRecord,
        destroy_storage: bool,
    ) -> Result<(), SessionError> {
        record.client.stop().await?;
        record.client.drain().await;
        tokio::task::yield_now().await;

        record.store.delete_credential().await?;
        if destroy_storage {
            let namespace = self.config.engine_namespace(identity.as_str());
            record.client.destroy_local_crypto_state(&namespace).await?;
            self.store.destroy(identity).await?;
        } else {
            self.store.close(identity).await?;
        }
        Ok(())
    }
}
