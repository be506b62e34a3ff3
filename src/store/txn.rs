use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, SnapshotWithThreadMode, WriteBatch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Db, RangeOptions, Store};
use crate::{
    error::{Result, RoomservError},
    keys::{Versionstamp, MAX_USER_VERSION},
};

/// Read surface shared by snapshot and write transactions, so directory
/// lookups compose into either.
pub trait TxnRead {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        opts: RangeOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

/// Resolves to the commit versionstamp once the owning transaction commits.
/// Cheap to clone out of the transaction closure.
#[derive(Clone, Default)]
pub struct CommitVersion(Arc<OnceLock<Versionstamp>>);

impl CommitVersion {
    pub fn get(&self) -> Option<Versionstamp> {
        self.0.get().copied()
    }

    fn resolve(&self, version: Versionstamp) {
        let _ = self.0.set(version);
    }
}

/// Snapshot read view. All reads observe the store as of one commit version.
pub struct ReadTxn<'db> {
    snapshot: SnapshotWithThreadMode<'db, Db>,
    ctx: CancellationToken,
    deadline: Instant,
}

impl<'db> ReadTxn<'db> {
    pub(crate) fn new(store: &'db Store, ctx: CancellationToken) -> Self {
        Self {
            snapshot: store.db().snapshot(),
            ctx,
            deadline: Instant::now() + store.timeout(),
        }
    }

    fn check(&self) -> Result<()> {
        if self.ctx.is_cancelled() {
            return Err(RoomservError::Cancelled);
        }
        if Instant::now() > self.deadline {
            return Err(RoomservError::Retryable(
                "transaction deadline exceeded".into(),
            ));
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.snapshot.get(key)?)
    }

    /// Scan `[begin, end)` in key order (or reverse), up to `limit` entries.
    pub fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        opts: RangeOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.check()?;
        let limit = opts.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();

        let mode = if opts.reverse {
            IteratorMode::From(end, Direction::Reverse)
        } else {
            IteratorMode::From(begin, Direction::Forward)
        };

        for item in self.snapshot.iterator(mode) {
            let (key, value) = item.map_err(RoomservError::from)?;
            let key = key.to_vec();
            if opts.reverse {
                // Seek lands on the first key <= end; end itself is exclusive.
                if key.as_slice() >= end {
                    continue;
                }
                if key.as_slice() < begin {
                    break;
                }
            } else if key.as_slice() >= end {
                break;
            }
            out.push((key, value.to_vec()));
            if out.len() >= limit {
                break;
            }
            self.check()?;
        }
        Ok(out)
    }
}

impl TxnRead for ReadTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        ReadTxn::get(self, key)
    }

    fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        opts: RangeOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        ReadTxn::get_range(self, begin, end, opts)
    }
}

enum Pending {
    Set(Vec<u8>),
    /// Key is the stamped template; the commit version lands at `offset`.
    SetStampedKey { offset: usize, value: Vec<u8> },
    /// Value is the stamped template.
    SetStampedValue { offset: usize, value: Vec<u8> },
    Clear,
}

#[derive(Default)]
struct PendingWrites {
    mutations: BTreeMap<Vec<u8>, Pending>,
    stamped: usize,
}

/// Transactional write view with read-your-writes: reads and range scans see
/// the pending mutations overlaid on the snapshot. Mutation goes through a
/// shared handle, mirroring the store's transaction API.
pub struct WriteTxn<'db> {
    read: ReadTxn<'db>,
    pending: Mutex<PendingWrites>,
    version: CommitVersion,
}

impl<'db> WriteTxn<'db> {
    pub(crate) fn new(store: &'db Store, ctx: CancellationToken) -> Self {
        Self {
            read: ReadTxn::new(store, ctx),
            pending: Mutex::new(PendingWrites::default()),
            version: CommitVersion::default(),
        }
    }

    /// Handle resolving to the commit versionstamp after commit.
    pub fn commit_version(&self) -> CommitVersion {
        self.version.clone()
    }

    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.pending
            .lock()
            .mutations
            .insert(key, Pending::Set(value));
    }

    pub fn clear(&self, key: Vec<u8>) {
        let mut pending = self.pending.lock();
        // Clearing a key that only exists as a pending stamped write undoes
        // the write; the store cannot contain the sentinel template.
        if let Some(Pending::SetStampedKey { .. }) = pending.mutations.get(&key) {
            pending.mutations.remove(&key);
            return;
        }
        pending.mutations.insert(key, Pending::Clear);
    }

    pub fn set_versionstamped_key(&self, key: Vec<u8>, offset: usize, value: Vec<u8>) -> Result<()> {
        let mut pending = self.pending.lock();
        bump_stamped(&mut pending)?;
        pending
            .mutations
            .insert(key, Pending::SetStampedKey { offset, value });
        Ok(())
    }

    pub fn set_versionstamped_value(
        &self,
        key: Vec<u8>,
        value: Vec<u8>,
        offset: usize,
    ) -> Result<()> {
        let mut pending = self.pending.lock();
        bump_stamped(&mut pending)?;
        pending
            .mutations
            .insert(key, Pending::SetStampedValue { offset, value });
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.pending.lock().mutations.get(key) {
            Some(Pending::Set(value)) | Some(Pending::SetStampedKey { value, .. }) => {
                Ok(Some(value.clone()))
            }
            Some(Pending::SetStampedValue { value, .. }) => Ok(Some(value.clone())),
            Some(Pending::Clear) => Ok(None),
            None => self.read.get(key),
        }
    }

    /// Range scan merging the snapshot with pending mutations. Pending sets
    /// shadow snapshot values; pending clears hide them.
    pub fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        opts: RangeOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let limit = opts.limit.unwrap_or(usize::MAX);

        let pending = self.pending.lock();
        let in_range: Vec<(Vec<u8>, Option<Vec<u8>>)> = pending
            .mutations
            .range::<Vec<u8>, _>((
                Bound::Included(begin.to_vec()),
                Bound::Excluded(end.to_vec()),
            ))
            .map(|(key, pending)| match pending {
                Pending::Set(value)
                | Pending::SetStampedKey { value, .. }
                | Pending::SetStampedValue { value, .. } => (key.clone(), Some(value.clone())),
                Pending::Clear => (key.clone(), None),
            })
            .collect();
        drop(pending);

        // Pending clears can hide at most one snapshot key each, so widening
        // by the overlay size keeps the merge exact under the limit.
        let snapshot_opts = RangeOptions {
            limit: opts.limit.map(|l| l + in_range.len()),
            reverse: opts.reverse,
        };
        let base = self.read.get_range(begin, end, snapshot_opts)?;

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = base.into_iter().collect();
        for (key, value) in in_range {
            match value {
                Some(value) => {
                    merged.insert(key, value);
                }
                None => {
                    merged.remove(&key);
                }
            }
        }

        let out: Vec<(Vec<u8>, Vec<u8>)> = if opts.reverse {
            merged.into_iter().rev().take(limit).collect()
        } else {
            merged.into_iter().take(limit).collect()
        };
        Ok(out)
    }

    pub(crate) fn fill_batch(&self, batch: &mut WriteBatch, tx_bytes: [u8; 10]) -> Result<()> {
        let mut pending = self.pending.lock();
        for (key, pending) in std::mem::take(&mut pending.mutations) {
            match pending {
                Pending::Set(value) => batch.put(key, value),
                Pending::Clear => batch.delete(key),
                Pending::SetStampedKey { offset, value } => {
                    let mut key = key;
                    if offset + 10 > key.len() {
                        return Err(RoomservError::Fatal("stamp offset out of range".into()));
                    }
                    key[offset..offset + 10].copy_from_slice(&tx_bytes);
                    batch.put(key, value);
                }
                Pending::SetStampedValue { offset, mut value } => {
                    if offset + 10 > value.len() {
                        return Err(RoomservError::Fatal("stamp offset out of range".into()));
                    }
                    value[offset..offset + 10].copy_from_slice(&tx_bytes);
                    batch.put(key, value);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn resolve_version(&self, version: Versionstamp) {
        self.version.resolve(version);
    }
}

fn bump_stamped(pending: &mut PendingWrites) -> Result<()> {
    if pending.stamped >= MAX_USER_VERSION as usize {
        return Err(RoomservError::Fatal(
            "too many stamped writes in one transaction".into(),
        ));
    }
    pending.stamped += 1;
    Ok(())
}

impl TxnRead for WriteTxn<'_> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        WriteTxn::get(self, key)
    }

    fn get_range(
        &self,
        begin: &[u8],
        end: &[u8],
        opts: RangeOptions,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        WriteTxn::get_range(self, begin, end, opts)
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = attempt.min(7);
    Duration::from_millis(10u64 << exp)
}

impl Store {
    /// Run a closure against a snapshot read view, retrying retryable store
    /// errors with exponential backoff up to the configured cap.
    /// Cancellation aborts without retry.
    pub async fn read_txn<T>(
        &self,
        ctx: &CancellationToken,
        mut f: impl FnMut(&ReadTxn<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(RoomservError::Cancelled);
            }
            let txn = self.begin_read(ctx);
            match f(&txn) {
                Err(err) if err.is_retryable() && attempt < self.retry_limit() => {
                    attempt += 1;
                    trace!(attempt, %err, "Retrying read transaction");
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(RoomservError::Cancelled),
                        _ = tokio::time::sleep(backoff(attempt)) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// Run a closure against a transactional write view and commit it,
    /// returning the closure result together with the commit versionstamp.
    pub async fn write_txn<T>(
        &self,
        ctx: &CancellationToken,
        mut f: impl FnMut(&WriteTxn<'_>) -> Result<T>,
    ) -> Result<(T, Versionstamp)> {
        let mut attempt = 0;
        loop {
            if ctx.is_cancelled() {
                return Err(RoomservError::Cancelled);
            }
            let txn = self.begin_write(ctx);
            let result = f(&txn).and_then(|value| {
                let version = self.commit(&txn)?;
                txn.resolve_version(version);
                Ok((value, version))
            });
            match result {
                Err(err) if err.is_retryable() && attempt < self.retry_limit() => {
                    attempt += 1;
                    trace!(attempt, %err, "Retrying write transaction");
                    tokio::select! {
                        _ = ctx.cancelled() => return Err(RoomservError::Cancelled),
                        _ = tokio::time::sleep(backoff(attempt)) => {}
                    }
                }
                other => return other,
            }
        }
    }
}
