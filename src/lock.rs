//! Named advisory locks on top of the store.
//!
//! A lock is one key whose value is `(owner_uuid, lease_deadline_ns)`.
//! Acquisition is a compare-and-set inside one write transaction: the key is
//! written iff absent or expired. Holders refresh the lease while working and
//! hand `txn_check` to other components so their writes can verify ownership
//! inside the same transaction that applies side-effects.

use std::{num::NonZeroUsize, sync::Arc, time::Instant};

use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    error::{Result, RoomservError},
    keys::{self, Element, Subspace},
    store::{Store, WriteTxn},
};

pub const DEFAULT_LEASE_SECS: i64 = 60;

/// How long a known-foreign owner is cached before we probe the store again.
const NEGATIVE_CACHE_SECS: u64 = 30;
const CACHE_CAPACITY: usize = 1000;

struct CachedOwner {
    owner: Uuid,
    cached_at: Instant,
}

#[derive(Clone)]
pub struct LockManager {
    store: Store,
    subspace: Subspace,
    cache: Arc<Mutex<LruCache<String, CachedOwner>>>,
}

impl LockManager {
    pub fn new(store: Store, subspace: Subspace) -> Self {
        Self {
            store,
            subspace,
            cache: Arc::new(Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_CAPACITY).expect("static capacity"),
            ))),
        }
    }

    fn key(&self, name: &str) -> Vec<u8> {
        self.subspace.pack(&[Element::Str(name.to_owned())])
    }

    /// Try to take the named lock for `lease_secs`. Returns `None` when the
    /// lock is held elsewhere (and caches the foreign owner for a while so
    /// repeated candidates skip the store).
    pub async fn try_acquire(
        &self,
        ctx: &CancellationToken,
        name: &str,
        lease_secs: i64,
    ) -> Result<Option<Lock>> {
        {
            let mut cache = self.cache.lock();
            if let Some(entry) = cache.get(name) {
                if entry.cached_at.elapsed().as_secs() < NEGATIVE_CACHE_SECS {
                    trace!(lock = name, owner = %entry.owner, "Lock known to be held elsewhere");
                    return Ok(None);
                }
                cache.pop(name);
            }
        }

        let owner = Uuid::new_v4();
        let key = self.key(name);
        let lock_name = name.to_owned();

        let (acquired, _) = self
            .store
            .write_txn(ctx, |txn| {
                match read_lock_value(txn, &key)? {
                    Some((current, deadline_ns)) if deadline_ns > now_ns() && current != owner => {
                        Ok(Some(current))
                    }
                    _ => {
                        write_lock_value(txn, &key, owner, lease_secs);
                        Ok(None)
                    }
                }
            })
            .await?;

        if let Some(current) = acquired {
            self.cache.lock().put(
                lock_name,
                CachedOwner {
                    owner: current,
                    cached_at: Instant::now(),
                },
            );
            return Ok(None);
        }

        debug!(lock = name, %owner, "Acquired lock");
        Ok(Some(Lock {
            store: self.store.clone(),
            key,
            name: name.to_owned(),
            owner,
            lease_secs,
        }))
    }
}

pub struct Lock {
    store: Store,
    key: Vec<u8>,
    name: String,
    owner: Uuid,
    lease_secs: i64,
}

impl Lock {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Extend the lease. Fails with `Conflict` if the lock was lost.
    pub async fn refresh(&self, ctx: &CancellationToken) -> Result<()> {
        let key = self.key.clone();
        let owner = self.owner;
        let lease_secs = self.lease_secs;
        self.store
            .write_txn(ctx, |txn| {
                verify_owner(txn, &key, owner)?;
                write_lock_value(txn, &key, owner, lease_secs);
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Verify ownership inside a caller transaction, so dependent writes
    /// (like federation position updates) abort when the lock was stolen.
    pub fn txn_check(&self, txn: &WriteTxn<'_>) -> Result<()> {
        verify_owner(txn, &self.key, self.owner)
    }

    pub async fn release(self, ctx: &CancellationToken) -> Result<()> {
        let key = self.key.clone();
        let owner = self.owner;
        self.store
            .write_txn(ctx, |txn| {
                if let Some((current, _)) = read_lock_value(txn, &key)? {
                    if current == owner {
                        txn.clear(key.clone());
                    }
                }
                Ok(())
            })
            .await?;
        debug!(lock = %self.name, "Released lock");
        Ok(())
    }
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn read_lock_value(txn: &WriteTxn<'_>, key: &[u8]) -> Result<Option<(Uuid, i64)>> {
    let Some(raw) = txn.get(key)? else {
        return Ok(None);
    };
    let elems = keys::unpack(&raw)?;
    if elems.len() != 2 {
        return Err(RoomservError::Fatal("malformed lock value".into()));
    }
    let owner = Uuid::from_slice(keys::element_bytes(&elems[0])?)
        .map_err(|err| RoomservError::Fatal(format!("malformed lock owner: {err}")))?;
    let deadline_ns = keys::element_int(&elems[1])?;
    Ok(Some((owner, deadline_ns)))
}

fn write_lock_value(txn: &WriteTxn<'_>, key: &[u8], owner: Uuid, lease_secs: i64) {
    let deadline_ns = now_ns() + lease_secs * 1_000_000_000;
    let value = keys::pack(&[
        Element::Bytes(owner.as_bytes().to_vec()),
        Element::Int(deadline_ns),
    ]);
    txn.set(key.to_vec(), value);
}

fn verify_owner(txn: &WriteTxn<'_>, key: &[u8], owner: Uuid) -> Result<()> {
    match read_lock_value(txn, key)? {
        Some((current, deadline_ns)) if current == owner && deadline_ns > now_ns() => Ok(()),
        Some((current, _)) if current != owner => Err(RoomservError::Conflict(
            "lock is owned by another process".into(),
        )),
        _ => Err(RoomservError::Conflict("lock lease has expired".into())),
    }
}
