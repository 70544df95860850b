//! Walk a couple of identities through the session lifecycle.
//!
//! Run with: cargo run -p session-demo
//!
//! Set `RUST_LOG=debug` to see cache hits. An optional first argument is a
//! path to a JSON `SessionConfig`.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context as _;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use courier_core::{
    ClientError, ClientFactory, Clock, CredentialIssuer, DecodedCredential, EngineStorage,
    Identity, IssueError, IssuedCredential, ProtocolClient, SessionConfig, StoreHandle,
    SystemClock,
};
use courier_session::{SessionManager, storage::MemoryStore};
use futures::StreamExt as _;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long minted credentials live.
const CREDENTIAL_TTL_SECS: i64 = 3600;

/// Issuer that mints unsigned credentials locally.
struct LocalIssuer {
    minted: AtomicUsize,
}

#[async_trait]
impl CredentialIssuer for LocalIssuer {
    async fn issue(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> Result<IssuedCredential, IssueError> {
        let expires_at = SystemClock.now_epoch_seconds() + CREDENTIAL_TTL_SECS;
        let payload = serde_json::json!({
            "sub": identity.as_str(),
            "device_id": device_id,
            "exp": expires_at,
            "jti": self.minted.fetch_add(1, Ordering::Relaxed),
        });
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(payload.to_string());

        tracing::info!(%identity, device_id, "Minted credential");
        Ok(IssuedCredential {
            credential: format!("{header}.{body}."),
            expires_at,
        })
    }
}

/// Protocol client that only logs what it is asked to do.
struct LoggingClient {
    identity: Identity,
    credential: Mutex<String>,
}

#[async_trait]
impl ProtocolClient for LoggingClient {
    async fn start(&self, storage: EngineStorage) -> Result<(), ClientError> {
        tracing::info!(identity = %self.identity, ?storage, "Sync started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        tracing::info!(identity = %self.identity, "Sync stopped");
        Ok(())
    }

    async fn drain(&self) {
        tokio::task::yield_now().await;
    }

    async fn update_credential(&self, credential: &str) -> Result<(), ClientError> {
        *self
            .credential
            .lock()
            .map_err(|e| ClientError::Sync(e.to_string()))? = credential.to_string();
        tracing::info!(identity = %self.identity, "Credential swapped");
        Ok(())
    }

    fn is_bound_to(&self, credential: &str) -> bool {
        self.credential
            .lock()
            .is_ok_and(|bound| bound.as_str() == credential)
    }

    async fn destroy_local_crypto_state(&self, namespace: &str) -> Result<(), ClientError> {
        tracing::info!(identity = %self.identity, namespace, "Crypto state destroyed");
        Ok(())
    }
}

struct LoggingClientFactory;

#[async_trait]
impl ClientFactory for LoggingClientFactory {
    async fn create(
        &self,
        identity: &Identity,
        credential: &str,
        claims: &DecodedCredential,
        _store: Option<Arc<dyn StoreHandle>>,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError> {
        tracing::info!(%identity, device_id = %claims.device_id, "Client created");
        Ok(Arc::new(LoggingClient {
            identity: identity.clone(),
            credential: Mutex::new(credential.to_string()),
        }))
    }
}

fn load_config() -> anyhow::Result<SessionConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(SessionConfig {
            reset_grace_ms: 200,
            ..SessionConfig::default()
        });
    };
    let json = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    SessionConfig::from_json_str(&json).with_context(|| format!("parsing {path}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let manager = Arc::new(
        SessionManager::new(
            LocalIssuer {
                minted: AtomicUsize::new(0),
            },
            MemoryStore::new(),
            LoggingClientFactory,
        )
        .with_config(config),
    );

    let mut events = manager.events();
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match serde_json::to_string(&event) {
                Ok(json) => tracing::info!("event: {json}"),
                Err(e) => tracing::error!("Failed to serialize event: {e}"),
            }
        }
    });

    let alice = Identity::new("alice");
    let bob = Identity::new("bob");

    let first = manager.ensure_valid_session(&alice, Some("hunter2")).await?;
    let again = manager.ensure_valid_session(&alice, None).await?;
    anyhow::ensure!(first == again, "cached credential changed");

    let client = manager.get_client(&bob).await?;
    let bob_credential = manager.ensure_valid_session(&bob, None).await?;
    anyhow::ensure!(client.is_bound_to(&bob_credential), "client not bound");

    manager.delete_session(&bob, true).await?;
    tracing::info!(active = ?manager.active_identities().await, "After delete");

    manager.reset().await?;
    tracing::info!(active = ?manager.active_identities().await, "After reset");

    // Let the event logger catch up before exiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    event_log.abort();
    Ok(())
}
