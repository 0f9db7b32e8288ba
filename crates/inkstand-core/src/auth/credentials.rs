//! Token storage: the in-memory credential triple and its durable backends.

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::StorageError;

/// Keychain service name
const SERVICE_NAME: &str = "inkstand";

/// Keychain account holding the serialized credential set
const KEYRING_ACCOUNT: &str = "session";

/// Credential file name in cache directory
const CREDENTIALS_FILE: &str = "credentials.json";

/// Default early-refresh margin.
pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// The access/refresh token pair and the access token's expiry.
///
/// Either the whole set is present or there is none at all.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry of the access token, epoch milliseconds
    pub expires_at_ms: i64,
}

impl CredentialSet {
    /// Check the presence invariant: both tokens set and a positive expiry
    pub fn is_valid(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty() && self.expires_at_ms > 0
    }
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("expires_at_ms", &self.expires_at_ms)
            .finish_non_exhaustive()
    }
}

/// Durable home for the credential set.
pub trait TokenStorage: Send + Sync {
    fn load(&self) -> Result<Option<CredentialSet>, StorageError>;
    fn save(&self, credentials: &CredentialSet) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
}

/// JSON file in the cache directory.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            path: cache_dir.join(CREDENTIALS_FILE),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl TokenStorage for FileStorage {
    fn load(&self) -> Result<Option<CredentialSet>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Write to a temp file and rename over the target, so readers of the
    /// file never see a partially written set.
    fn save(&self, credentials: &CredentialSet) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(credentials)?;
        let tmp_name = format!(
            "{}.{}.tmp",
            self.path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy(),
            std::process::id()
        );
        let tmp_path = self.path.with_file_name(tmp_name);
        std::fs::write(&tmp_path, contents)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// OS keychain entry holding the serialized set.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self) -> Result<Entry, StorageError> {
        Ok(Entry::new(&self.service, KEYRING_ACCOUNT)?)
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStorage for KeyringStorage {
    fn load(&self) -> Result<Option<CredentialSet>, StorageError> {
        match self.entry()?.get_password() {
            Ok(secret) => Ok(Some(serde_json::from_str(&secret)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, credentials: &CredentialSet) -> Result<(), StorageError> {
        let secret = serde_json::to_string(credentials)?;
        self.entry()?.set_password(&secret)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local storage; nothing survives a restart.
#[derive(Default)]
pub struct MemoryStorage {
    slot: Mutex<Option<CredentialSet>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryStorage {
    fn load(&self) -> Result<Option<CredentialSet>, StorageError> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, credentials: &CredentialSet) -> Result<(), StorageError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credentials.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Current epoch time in milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// In-memory credential set plus a generation counter.
///
/// The generation changes on every write, so a writer that read the set
/// earlier can tell whether anything replaced it since.
struct Slot {
    set: Option<CredentialSet>,
    generation: u64,
}

/// Single source of truth for the current credential set.
///
/// Readers always observe a complete set: every write replaces the whole
/// triple under one lock. Writes go to the durable backend as well; a
/// backend failure is reported but the in-memory set is still updated so
/// the running process keeps a usable session.
pub struct CredentialStore {
    backend: Box<dyn TokenStorage>,
    current: RwLock<Slot>,
}

impl CredentialStore {
    /// Open a store, restoring whatever the backend holds.
    ///
    /// A stored set that violates the presence invariant is discarded.
    pub fn open(backend: impl TokenStorage + 'static) -> Result<Self, StorageError> {
        let restored = match backend.load()? {
            Some(set) if set.is_valid() => Some(set),
            Some(_) => {
                warn!("Discarding incomplete stored credentials");
                backend.clear()?;
                None
            }
            None => None,
        };
        debug!(restored = restored.is_some(), "Credential store opened");

        Ok(Self {
            backend: Box::new(backend),
            current: RwLock::new(Slot {
                set: restored,
                generation: 0,
            }),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(MemoryStorage::new()),
            current: RwLock::new(Slot {
                set: None,
                generation: 0,
            }),
        }
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().set.as_ref().map(|c| c.access_token.clone())
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().set.as_ref().map(|c| c.refresh_token.clone())
    }

    /// Refresh token together with the generation it was read at
    pub fn versioned_refresh_token(&self) -> (u64, Option<String>) {
        let slot = self.read();
        (
            slot.generation,
            slot.set.as_ref().map(|c| c.refresh_token.clone()),
        )
    }

    /// Bumped by every `set_tokens` and `clear`
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    /// Expiry in epoch milliseconds, 0 when logged out
    pub fn expires_at(&self) -> i64 {
        self.read().set.as_ref().map(|c| c.expires_at_ms).unwrap_or(0)
    }

    /// Whole-set read; access token and expiry always belong together.
    pub fn snapshot(&self) -> Option<CredentialSet> {
        self.read().set.clone()
    }

    pub fn is_present(&self) -> bool {
        self.read().set.is_some()
    }

    /// Store a new token pair expiring `expires_in_secs` from now.
    pub fn set_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: u64,
    ) -> Result<(), StorageError> {
        let set = Self::credential_set(access_token, refresh_token, expires_in_secs);
        self.write(None, Some(set)).map(|_| ())
    }

    /// Like [`set_tokens`](Self::set_tokens), but only while the store is
    /// still at `generation`. Returns whether the write happened.
    pub fn set_tokens_if(
        &self,
        generation: u64,
        access_token: &str,
        refresh_token: &str,
        expires_in_secs: u64,
    ) -> Result<bool, StorageError> {
        let set = Self::credential_set(access_token, refresh_token, expires_in_secs);
        self.write(Some(generation), Some(set))
    }

    /// Remove the credential set from memory and durable storage.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.write(None, None).map(|_| ())
    }

    /// Clear only while the store is still at `generation`.
    pub fn clear_if(&self, generation: u64) -> Result<bool, StorageError> {
        self.write(Some(generation), None)
    }

    /// True when the access token expires within `skew` (or is absent).
    pub fn is_expired(&self, skew: Duration) -> bool {
        self.is_expired_at(now_ms(), skew)
    }

    pub fn is_expired_at(&self, now_ms: i64, skew: Duration) -> bool {
        let skew_ms = i64::try_from(skew.as_millis()).unwrap_or(i64::MAX);
        now_ms >= self.expires_at().saturating_sub(skew_ms)
    }

    /// Time left until the access token expires, zero if already expired.
    pub fn time_until_expiry(&self) -> Duration {
        let remaining = self.expires_at() - now_ms();
        Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
    }

    fn credential_set(access_token: &str, refresh_token: &str, expires_in_secs: u64) -> CredentialSet {
        let lifetime_ms = i64::try_from(expires_in_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000);
        CredentialSet {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at_ms: now_ms().saturating_add(lifetime_ms).max(1),
        }
    }

    /// Replace the set in memory and in the backend, under the write lock so
    /// memory and backend never disagree about the latest write.
    ///
    /// With `expected`, nothing is written unless the generation still matches.
    /// A backend failure still updates memory and counts as written.
    fn write(&self, expected: Option<u64>, set: Option<CredentialSet>) -> Result<bool, StorageError> {
        let mut slot = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if expected.is_some_and(|generation| generation != slot.generation) {
            return Ok(false);
        }

        let persisted = match &set {
            Some(set) => self.backend.save(set),
            None => self.backend.clear(),
        };
        slot.set = set;
        slot.generation = slot.generation.wrapping_add(1);
        drop(slot);

        match persisted {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(error = %e, "Failed to persist credentials");
                Err(e)
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Slot> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }
}
