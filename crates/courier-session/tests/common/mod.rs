//! Scripted stand-ins for the session manager's collaborators.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use courier_core::{
    ClientError, ClientFactory, Clock, CredentialIssuer, DecodedCredential, EngineStorage,
    Identity, IssueError, IssuedCredential, ProtocolClient, SessionConfig, SessionStore,
    StoreError, StoreHandle,
};
use courier_session::{SessionManager, storage::MemoryStore};

pub const NOW: i64 = 1_700_000_000;

/// Mint an unsigned credential carrying the given claims.
pub fn mint(device_id: &str, expires_at: i64, nonce: usize) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"EdDSA","typ":"JWT"}"#);
    let payload = serde_json::json!({
        "device_id": device_id,
        "exp": expires_at,
        "n": nonce,
    });
    let body = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{header}.{body}.c2lnbmF0dXJl")
}

/// Shared, append-only record of collaborator calls in order.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

#[derive(Clone)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self(Arc::new(AtomicI64::new(now)))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_epoch_seconds(&self) -> i64 {
        self.now()
    }
}

struct IssuerState {
    clock: ManualClock,
    ttl: AtomicI64,
    calls: Mutex<Vec<(Identity, String)>>,
    failures: Mutex<VecDeque<IssueError>>,
    delay: Mutex<Option<Duration>>,
    minted: AtomicUsize,
    journal: Journal,
}

/// Issuer that mints credentials `ttl` seconds into the future.
#[derive(Clone)]
pub struct ScriptedIssuer(Arc<IssuerState>);

impl ScriptedIssuer {
    pub fn new(clock: ManualClock, journal: Journal) -> Self {
        Self(Arc::new(IssuerState {
            clock,
            ttl: AtomicI64::new(3600),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            delay: Mutex::new(None),
            minted: AtomicUsize::new(0),
            journal,
        }))
    }

    pub fn set_ttl(&self, ttl: i64) {
        self.0.ttl.store(ttl, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.0.delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_next(&self, error: IssueError) {
        self.0.failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<(Identity, String)> {
        self.0.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.0.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl CredentialIssuer for ScriptedIssuer {
    async fn issue(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> Result<IssuedCredential, IssueError> {
        let delay = *self.0.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.0
            .calls
            .lock()
            .unwrap()
            .push((identity.clone(), device_id.to_string()));
        self.0.journal.push(format!("issue:{device_id}"));

        let failure = self.0.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let expires_at = self.0.clock.now() + self.0.ttl.load(Ordering::SeqCst);
        let nonce = self.0.minted.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCredential {
            credential: mint(device_id, expires_at, nonce),
            expires_at,
        })
    }
}

struct StoreState {
    inner: MemoryStore,
    calls: AtomicUsize,
    fail_saves: AtomicBool,
    journal: Journal,
}

/// Memory store that counts every call and can fail saves on demand.
#[derive(Clone)]
pub struct CountingStore(Arc<StoreState>);

impl CountingStore {
    pub fn new(inner: MemoryStore, journal: Journal) -> Self {
        Self(Arc::new(StoreState {
            inner,
            calls: AtomicUsize::new(0),
            fail_saves: AtomicBool::new(false),
            journal,
        }))
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.0.inner
    }

    pub fn call_count(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.0.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn record(&self, entry: &str) {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        self.0.journal.push(entry);
    }
}

#[async_trait]
impl SessionStore for CountingStore {
    async fn open(
        &self,
        identity: &Identity,
        passphrase: Option<&str>,
    ) -> Result<Arc<dyn StoreHandle>, StoreError> {
        self.record("store:open");
        let inner = self.0.inner.open(identity, passphrase).await?;
        Ok(Arc::new(CountingHandle {
            store: self.clone(),
            inner,
        }))
    }

    async fn close(&self, identity: &Identity) -> Result<(), StoreError> {
        self.record("store:close");
        self.0.inner.close(identity).await
    }

    async fn destroy(&self, identity: &Identity) -> Result<(), StoreError> {
        self.record("store:destroy");
        self.0.inner.destroy(identity).await
    }
}

struct CountingHandle {
    store: CountingStore,
    inner: Arc<dyn StoreHandle>,
}

#[async_trait]
impl StoreHandle for CountingHandle {
    async fn get_credential(&self) -> Result<Option<String>, StoreError> {
        self.store.record("store:get");
        self.inner.get_credential().await
    }

    async fn save_credential(&self, credential: &str) -> Result<(), StoreError> {
        self.store.record("store:save");
        if self.store.0.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io("disk full".to_string()));
        }
        self.inner.save_credential(credential).await
    }

    async fn delete_credential(&self) -> Result<(), StoreError> {
        self.store.record("store:delete_credential");
        self.inner.delete_credential().await
    }

    fn is_durable(&self) -> bool {
        self.inner.is_durable()
    }
}

/// Protocol client that records what the manager asks of it.
pub struct FakeClient {
    pub identity: Identity,
    bound: Mutex<String>,
    started: Mutex<Option<EngineStorage>>,
    stopped: AtomicBool,
    drained: AtomicBool,
    fail_update: AtomicBool,
    fail_stop: AtomicBool,
    journal: Journal,
}

impl FakeClient {
    pub fn bound(&self) -> String {
        self.bound.lock().unwrap().clone()
    }

    /// Rebind without going through the manager.
    pub fn rebind(&self, credential: &str) {
        *self.bound.lock().unwrap() = credential.to_string();
    }

    pub fn engine(&self) -> Option<EngineStorage> {
        self.started.lock().unwrap().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    pub fn set_fail_update(&self, fail: bool) {
        self.fail_update.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn start(&self, storage: EngineStorage) -> Result<(), ClientError> {
        self.journal.push("client:start");
        *self.started.lock().unwrap() = Some(storage);
        Ok(())
    }

    async fn stop(&self) -> Result<(), ClientError> {
        self.journal.push("client:stop");
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ClientError::Sync("engine busy".to_string()));
        }
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn drain(&self) {
        self.journal.push("client:drain");
        self.drained.store(true, Ordering::SeqCst);
    }

    async fn update_credential(&self, credential: &str) -> Result<(), ClientError> {
        self.journal.push("client:update");
        if self.fail_update.load(Ordering::SeqCst) {
            return Err(ClientError::Sync("socket closed".to_string()));
        }
        self.rebind(credential);
        Ok(())
    }

    fn is_bound_to(&self, credential: &str) -> bool {
        *self.bound.lock().unwrap() == credential
    }

    async fn destroy_local_crypto_state(&self, namespace: &str) -> Result<(), ClientError> {
        self.journal.push(format!("client:destroy_crypto:{namespace}"));
        Ok(())
    }
}

/// Factory handing out `FakeClient`s and remembering each one.
#[derive(Clone, Default)]
pub struct FakeFactory {
    created: Arc<Mutex<Vec<Arc<FakeClient>>>>,
    journal: Journal,
}

impl FakeFactory {
    pub fn new(journal: Journal) -> Self {
        Self {
            created: Arc::default(),
            journal,
        }
    }

    pub fn created(&self) -> Vec<Arc<FakeClient>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<FakeClient> {
        self.created.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create(
        &self,
        identity: &Identity,
        credential: &str,
        _claims: &DecodedCredential,
        _store: Option<Arc<dyn StoreHandle>>,
    ) -> Result<Arc<dyn ProtocolClient>, ClientError> {
        self.journal.push("client:create");
        let client = Arc::new(FakeClient {
            identity: identity.clone(),
            bound: Mutex::new(credential.to_string()),
            started: Mutex::new(None),
            stopped: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            fail_update: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            journal: self.journal.clone(),
        });
        self.created.lock().unwrap().push(Arc::clone(&client));
        Ok(client)
    }
}

pub type TestManager = SessionManager<ScriptedIssuer, CountingStore, FakeFactory>;

/// Manager plus handles on every collaborator.
pub struct Harness {
    pub manager: Arc<TestManager>,
    pub clock: ManualClock,
    pub issuer: ScriptedIssuer,
    pub store: CountingStore,
    pub factory: FakeFactory,
    pub journal: Journal,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    pub fn with_store(memory: MemoryStore) -> Self {
        let config = SessionConfig {
            reset_grace_ms: 0,
            ..SessionConfig::default()
        };
        Self::with_parts(memory, config)
    }

    pub fn with_config(config: SessionConfig) -> Self {
        Self::with_parts(MemoryStore::new(), config)
    }

    fn with_parts(memory: MemoryStore, config: SessionConfig) -> Self {
        let clock = ManualClock::new(NOW);
        let journal = Journal::default();
        let issuer = ScriptedIssuer::new(clock.clone(), journal.clone());
        let store = CountingStore::new(memory, journal.clone());
        let factory = FakeFactory::new(journal.clone());
        let manager = SessionManager::new(issuer.clone(), store.clone(), factory.clone())
            .with_config(config)
            .with_clock(Arc::new(clock.clone()));

        Self {
            manager: Arc::new(manager),
            clock,
            issuer,
            store,
            factory,
            journal,
        }
    }
}
