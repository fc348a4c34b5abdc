//! Pubkey to cohort mapping.
//!
//! Reads vastly outnumber writes, so every store serves lookups from an
//! in-memory snapshot behind a reader-writer lock. [`Whitelist`] serializes
//! the read-modify-write commands issued by admins.

use crate::error::Error;
use crate::storage::{sql_timestamp, RelayDatabase};
use async_trait::async_trait;
use nostr::{PublicKey, Timestamp};
use parking_lot::RwLock;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub pubkey: PublicKey,
    pub cohorts: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

impl WhitelistEntry {
    pub fn new<I, S>(pubkey: PublicKey, cohorts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pubkey,
            cohorts: cohorts.into_iter().map(Into::into).collect(),
            expires_at: None,
        }
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub fn has_cohort(&self, cohort: &str) -> bool {
        self.cohorts.contains(cohort)
    }

    pub fn intersects(&self, cohorts: &BTreeSet<String>) -> bool {
        !self.cohorts.is_disjoint(cohorts)
    }
}

/// Storage seam for whitelist entries.
#[async_trait]
pub trait WhitelistStore: Send + Sync + std::fmt::Debug {
    /// Snapshot lookup; must not wait on writers.
    fn get(&self, pubkey: &PublicKey) -> Option<WhitelistEntry>;
    fn list(&self) -> Vec<WhitelistEntry>;
    async fn put(&self, entry: WhitelistEntry) -> Result<(), Error>;
    async fn delete(&self, pubkey: &PublicKey) -> Result<bool, Error>;
}

#[derive(Debug, Default)]
pub struct MemoryWhitelist {
    entries: RwLock<HashMap<PublicKey, WhitelistEntry>>,
}

impl MemoryWhitelist {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WhitelistStore for MemoryWhitelist {
    fn get(&self, pubkey: &PublicKey) -> Option<WhitelistEntry> {
        self.entries.read().get(pubkey).cloned()
    }

    fn list(&self) -> Vec<WhitelistEntry> {
        self.entries.read().values().cloned().collect()
    }

    async fn put(&self, entry: WhitelistEntry) -> Result<(), Error> {
        self.entries.write().insert(entry.pubkey, entry);
        Ok(())
    }

    async fn delete(&self, pubkey: &PublicKey) -> Result<bool, Error> {
        Ok(self.entries.write().remove(pubkey).is_some())
    }
}

/// Whitelist persisted in the relay database with a write-through cache.
#[derive(Debug)]
pub struct SqliteWhitelist {
    database: Arc<RelayDatabase>,
    cache: MemoryWhitelist,
}

impl SqliteWhitelist {
    pub async fn load(database: Arc<RelayDatabase>) -> Result<Self, Error> {
        let rows = database
            .read(|conn| {
                let mut stmt =
                    conn.prepare("SELECT pubkey, cohorts, expires_at FROM whitelist")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                })?;
                let mut entries = Vec::new();
                for row in rows {
                    let (pubkey, cohorts, expires_at) = row?;
                    let pubkey = PublicKey::from_hex(&pubkey).map_err(|e| {
                        Error::storage(format!("Corrupt whitelist pubkey {pubkey}: {e}"), false)
                    })?;
                    entries.push(WhitelistEntry {
                        pubkey,
                        cohorts: serde_json::from_str(&cohorts)?,
                        expires_at: expires_at.map(|at| Timestamp::from(at.max(0) as u64)),
                    });
                }
                Ok(entries)
            })
            .await?;

        let cache = MemoryWhitelist::new();
        {
            let mut entries = cache.entries.write();
            for entry in rows {
                entries.insert(entry.pubkey, entry);
            }
        }
        info!(target: "auth", "Loaded {} whitelist entries", cache.entries.read().len());

        Ok(Self { database, cache })
    }
}

#[async_trait]
impl WhitelistStore for SqliteWhitelist {
    fn get(&self, pubkey: &PublicKey) -> Option<WhitelistEntry> {
        self.cache.get(pubkey)
    }

    fn list(&self) -> Vec<WhitelistEntry> {
        self.cache.list()
    }

    async fn put(&self, entry: WhitelistEntry) -> Result<(), Error> {
        let pubkey = entry.pubkey.to_hex();
        let cohorts = serde_json::to_string(&entry.cohorts)?;
        let expires_at = entry.expires_at.map(|at| sql_timestamp(at.as_u64()));
        self.database
            .write(move |conn| {
                conn.execute(
                    "INSERT INTO whitelist (pubkey, cohorts, expires_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(pubkey) DO UPDATE SET
                        cohorts = excluded.cohorts,
                        expires_at = excluded.expires_at,
                        updated_at = excluded.updated_at",
                    params![
                        pubkey,
                        cohorts,
                        expires_at,
                        sql_timestamp(Timestamp::now().as_u64())
                    ],
                )?;
                Ok(())
            })
            .await?;
        self.cache.put(entry).await
    }

    async fn delete(&self, pubkey: &PublicKey) -> Result<bool, Error> {
        let hex = pubkey.to_hex();
        self.database
            .write(move |conn| {
                conn.execute("DELETE FROM whitelist WHERE pubkey = ?1", params![hex])?;
                Ok(())
            })
            .await?;
        self.cache.delete(pubkey).await
    }
}

/// Membership commands over a [`WhitelistStore`].
#[derive(Debug, Clone)]
pub struct Whitelist {
    store: Arc<dyn WhitelistStore>,
    default_cohort: String,
    admin_cohort: String,
    writes: Arc<Mutex<()>>,
}

impl Whitelist {
    pub fn new(
        store: Arc<dyn WhitelistStore>,
        default_cohort: impl Into<String>,
        admin_cohort: impl Into<String>,
    ) -> Self {
        Self {
            store,
            default_cohort: default_cohort.into(),
            admin_cohort: admin_cohort.into(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn admin_cohort(&self) -> &str {
        &self.admin_cohort
    }

    /// Entry for `pubkey` if present and not expired at `now`.
    pub fn active_entry(&self, pubkey: &PublicKey, now: Timestamp) -> Option<WhitelistEntry> {
        self.store
            .get(pubkey)
            .filter(|entry| !entry.is_expired_at(now))
    }

    pub fn lookup(&self, pubkey: &PublicKey) -> Option<WhitelistEntry> {
        self.store.get(pubkey)
    }

    pub fn is_admin(&self, pubkey: &PublicKey, now: Timestamp) -> bool {
        self.active_entry(pubkey, now)
            .is_some_and(|entry| entry.has_cohort(&self.admin_cohort))
    }

    pub fn list(&self) -> Vec<WhitelistEntry> {
        let mut entries = self.store.list();
        entries.sort_by_key(|entry| entry.pubkey.to_hex());
        entries
    }

    /// Merges `cohorts` into the entry for `pubkey`, creating it with the
    /// default cohort when no cohort is named. An expiry, when given,
    /// replaces the previous one.
    pub async fn add_member(
        &self,
        pubkey: PublicKey,
        cohorts: BTreeSet<String>,
        expires_at: Option<Timestamp>,
    ) -> Result<WhitelistEntry, Error> {
        let _guard = self.writes.lock().await;
        let mut entry = self
            .store
            .get(&pubkey)
            .unwrap_or_else(|| WhitelistEntry::new(pubkey, Vec::<String>::new()));

        if cohorts.is_empty() {
            entry.cohorts.insert(self.default_cohort.clone());
        } else {
            entry.cohorts.extend(cohorts);
        }
        if expires_at.is_some() {
            entry.expires_at = expires_at;
        }

        self.store.put(entry.clone()).await?;
        debug!(target: "auth", "Whitelisted {} with cohorts {:?}", pubkey, entry.cohorts);
        Ok(entry)
    }

    /// Removes the named cohorts, or the whole entry when none are named or
    /// nothing is left. Returns the remaining entry.
    pub async fn remove_member(
        &self,
        pubkey: PublicKey,
        cohorts: BTreeSet<String>,
    ) -> Result<Option<WhitelistEntry>, Error> {
        let _guard = self.writes.lock().await;
        let Some(mut entry) = self.store.get(&pubkey) else {
            return Ok(None);
        };

        entry.cohorts.retain(|cohort| !cohorts.contains(cohort));
        if cohorts.is_empty() || entry.cohorts.is_empty() {
            self.store.delete(&pubkey).await?;
            debug!(target: "auth", "Removed {} from whitelist", pubkey);
            return Ok(None);
        }

        self.store.put(entry.clone()).await?;
        debug!(target: "auth", "Removed cohorts {:?} from {}", cohorts, pubkey);
        Ok(Some(entry))
    }

    /// Replaces the entry wholesale.
    pub async fn set_entry(&self, entry: WhitelistEntry) -> Result<(), Error> {
        let _guard = self.writes.lock().await;
        self.store.put(entry).await
    }

    pub async fn delete(&self, pubkey: &PublicKey) -> Result<bool, Error> {
        let _guard = self.writes.lock().await;
        self.store.delete(pubkey).await
    }

    /// Ensures every bootstrap admin carries the admin cohort.
    pub async fn seed_admins(&self, admins: &[PublicKey]) -> Result<(), Error> {
        for admin in admins {
            let cohorts = BTreeSet::from([self.admin_cohort.clone()]);
            self.add_member(*admin, cohorts, None).await?;
        }
        if !admins.is_empty() {
            info!(target: "auth", "Seeded {} bootstrap admin(s)", admins.len());
        }
        Ok(())
    }
}
