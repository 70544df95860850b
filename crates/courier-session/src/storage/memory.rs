//! In-memory session store.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use courier_core::{Identity, SessionStore, StoreError, StoreHandle};

/// Contents kept for one identity.
#[derive(Debug, Default, Clone)]
struct Vault {
    passphrase: Option<String>,
    credential: Option<String>,
}

type Vaults = Arc<RwLock<HashMap<Identity, Vault>>>;

/// In-memory store implementation.
///
/// Useful for development and tests. Contents survive `close` but not a
/// process restart, and nothing is encrypted; the passphrase is only
/// checked for equality.
pub struct MemoryStore {
    vaults: Vaults,
    handles: RwLock<HashMap<Identity, Arc<MemoryHandle>>>,
    engine_backend: bool,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vaults: Arc::new(RwLock::new(HashMap::new())),
            handles: RwLock::new(HashMap::new()),
            engine_backend: false,
        }
    }

    /// Report a durable engine backend from every handle this store opens.
    #[must_use]
    pub const fn with_engine_backend(mut self, available: bool) -> Self {
        self.engine_backend = available;
        self
    }

    /// Read an identity's credential without opening a handle.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn peek_credential(&self, identity: &Identity) -> Result<Option<String>, StoreError> {
        Ok(self
            .vaults
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?
            .get(identity)
            .and_then(|v| v.credential.clone()))
    }

    /// Seed an identity's credential without opening a handle.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn seed_credential(
        &self,
        identity: &Identity,
        passphrase: Option<&str>,
        credential: &str,
    ) -> Result<(), StoreError> {
        let mut vaults = self
            .vaults
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let vault = vaults.entry(identity.clone()).or_default();
        vault.passphrase = passphrase.map(str::to_owned);
        vault.credential = Some(credential.to_string());
        Ok(())
    }

    /// Whether anything is stored for the identity.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn contains(&self, identity: &Identity) -> Result<bool, StoreError> {
        Ok(self
            .vaults
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?
            .contains_key(identity))
    }

    /// Whether a handle is currently open for the identity.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn is_open(&self, identity: &Identity) -> Result<bool, StoreError> {
        Ok(self
            .handles
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?
            .contains_key(identity))
    }

    fn detach(&self, identity: &Identity) -> Result<(), StoreError> {
        let handle = self
            .handles
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?
            .remove(identity);
        if let Some(handle) = handle {
            handle.open.store(false, Ordering::Release);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn open(
        &self,
        identity: &Identity,
        passphrase: Option<&str>,
    ) -> Result<Arc<dyn StoreHandle>, StoreError> {
        let mut handles = self
            .handles
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;

        if let Some(handle) = handles.get(identity) {
            return Ok(Arc::clone(handle) as Arc<dyn StoreHandle>);
        }

        {
            let mut vaults = self
                .vaults
                .write()
                .map_err(|e| StoreError::Io(e.to_string()))?;
            let vault = vaults.entry(identity.clone()).or_insert_with(|| Vault {
                passphrase: passphrase.map(str::to_owned),
                credential: None,
            });
            if vault.passphrase.as_deref() != passphrase {
                return Err(StoreError::Locked);
            }
        }

        let handle = Arc::new(MemoryHandle {
            identity: identity.clone(),
            vaults: Arc::clone(&self.vaults),
            open: AtomicBool::new(true),
            engine_backend: self.engine_backend,
        });
        handles.insert(identity.clone(), Arc::clone(&handle));

        Ok(handle)
    }

    async fn close(&self, identity: &Identity) -> Result<(), StoreError> {
        self.detach(identity)
    }

    async fn destroy(&self, identity: &Identity) -> Result<(), StoreError> {
        self.detach(identity)?;
        self.vaults
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?
            .remove(identity);
        Ok(())
    }
}

/// Handle on one identity's in-memory vault.
pub struct MemoryHandle {
    identity: Identity,
    vaults: Vaults,
    open: AtomicBool,
    engine_backend: bool,
}

impl MemoryHandle {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Io(format!("store for {} is closed", self.identity)))
        }
    }
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    async fn get_credential(&self) -> Result<Option<String>, StoreError> {
        self.ensure_open()?;
        Ok(self
            .vaults
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?
            .get(&self.identity)
            .and_then(|v| v.credential.clone()))
    }

    async fn save_credential(&self, credential: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.vaults
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?
            .entry(self.identity.clone())
            .or_default()
            .credential = Some(credential.to_string());
        Ok(())
    }

    async fn delete_credential(&self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if let Some(vault) = self
            .vaults
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?
            .get_mut(&self.identity)
        {
            vault.credential = None;
        }
        Ok(())
    }

    fn is_durable(&self) -> bool {
        self.engine_backend
    }
}
