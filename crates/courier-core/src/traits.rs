//! Traits for the collaborators the session manager drives.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DecodedCredential, Identity};

/// Credential freshly minted by the issuer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCredential {
    /// Bearer credential string.
    pub credential: String,
    /// Expiry reported by the issuer (Unix epoch seconds).
    pub expires_at: i64,
}

/// Credential issuance error.
#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Credential revoked: {0}")]
    Revoked(String),
}

impl IssueError {
    /// Whether the identity's existing credentials were revoked server-side.
    #[must_use]
    pub const fn is_revoked(&self) -> bool {
        matches!(self, Self::Revoked(_))
    }
}

/// Issues signed bearer credentials.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Issue a credential for an identity on the given device.
    async fn issue(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> Result<IssuedCredential, IssueError>;
}

/// Encrypted store error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store is locked: wrong or missing passphrase")]
    Locked,
    #[error("Store I/O error: {0}")]
    Io(String),
    #[error("Corrupt store contents: {0}")]
    Corrupt(String),
}

/// Open handle on one identity's encrypted store.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// Read the cached credential, if any.
    async fn get_credential(&self) -> Result<Option<String>, StoreError>;

    /// Replace the cached credential.
    async fn save_credential(&self, credential: &str) -> Result<(), StoreError>;

    /// Remove the cached credential.
    async fn delete_credential(&self) -> Result<(), StoreError>;

    /// Whether the runtime offers a durable keyed backend the protocol
    /// engine can keep its own state in.
    fn is_durable(&self) -> bool;
}

/// Per-identity encrypted persistence.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Open (creating if necessary) the store for an identity.
    ///
    /// Idempotent: returns the existing handle if already open.
    async fn open(
        &self,
        identity: &Identity,
        passphrase: Option<&str>,
    ) -> Result<Arc<dyn StoreHandle>, StoreError>;

    /// Close the identity's handle, keeping its contents.
    async fn close(&self, identity: &Identity) -> Result<(), StoreError>;

    /// Irreversibly delete everything stored for the identity.
    async fn destroy(&self, identity: &Identity) -> Result<(), StoreError>;
}

/// Where the protocol engine keeps its sync and crypto state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStorage {
    /// Durable keyed storage under a per-identity namespace.
    Durable {
        namespace: String,
        passphrase: Option<String>,
    },
    /// Process memory only; lost on restart.
    InMemory,
}

/// Protocol client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client construction failed: {0}")]
    Construction(String),
    #[error("Sync error: {0}")]
    Sync(String),
    #[error("Crypto state error: {0}")]
    Crypto(String),
}

/// Stateful protocol client bound to one credential at a time.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Begin background sync.
    async fn start(&self, storage: EngineStorage) -> Result<(), ClientError>;

    /// Stop background sync. Teardown may leave continuations in flight.
    async fn stop(&self) -> Result<(), ClientError>;

    /// Resolves once in-flight background continuations have settled.
    async fn drain(&self);

    /// Hot-swap the bearer credential.
    async fn update_credential(&self, credential: &str) -> Result<(), ClientError>;

    /// Whether the client is currently configured with `credential`.
    fn is_bound_to(&self, credential: &str) -> bool;

    /// Destroy local crypto material kept under `namespace`.
    async fn destroy_local_crypto_state(&self, namespace: &str) -> Result<(), ClientError>;
}

/// Constructs protocol clients.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a client bound to `credential`. The client is not started.
    async fn create(
        &self,
        identity: &Identity,
        credential: &str,
        claims: &DecodedCredential,
        store: Option<Arc<dyn StoreHandle>>,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError>;
}
