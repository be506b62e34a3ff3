//! Ordered key-value engine with multi-key transactions and commit-time
//! versionstamps, backed by RocksDB.
//!
//! Writers are serialised under a single commit mutex; each commit allocates
//! the next 10-byte commit version and substitutes it into every stamped key
//! and value before the batch is applied atomically. Readers run against a
//! RocksDB snapshot and observe a prefix-consistent view.

mod txn;

pub use txn::{CommitVersion, ReadTxn, TxnRead, WriteTxn};

use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, MultiThreaded, Options, WriteBatch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    config::DatabaseConfig,
    error::{Result, RoomservError},
    keys::{versionstamp_value, Element, Subspace, Versionstamp, TTV_USER_VERSION},
};

pub(crate) type Db = DBWithThreadMode<MultiThreaded>;

/// Engine-reserved key; tuple-encoded keys never start with 0xff.
const COMMIT_VERSION_KEY: &[u8] = b"\xffcommit-version";

const TTV_PREFIX: &str = "ttv";

#[derive(Debug, Clone, Copy, Default)]
pub struct RangeOptions {
    pub limit: Option<usize>,
    pub reverse: bool,
}

impl RangeOptions {
    pub fn limited(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            reverse: false,
        }
    }

    pub fn reversed() -> Self {
        Self {
            limit: None,
            reverse: true,
        }
    }
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db: Db,
    commit_lock: Mutex<()>,
    last_commit: AtomicU64,
    ttv: Subspace,
    timeout: Duration,
    retry_limit: u32,
}

impl Store {
    pub fn open(path: impl AsRef<Path>, cfg: &DatabaseConfig) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = Db::open(&options, path.as_ref())?;

        let last_commit = match db.get(COMMIT_VERSION_KEY)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    RoomservError::Fatal("corrupt commit version counter".into())
                })?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };

        debug!(
            path = %path.as_ref().display(),
            last_commit,
            "Opened store"
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                commit_lock: Mutex::new(()),
                last_commit: AtomicU64::new(last_commit),
                ttv: Subspace::new(&[TTV_PREFIX.into()]),
                timeout: cfg.transaction_timeout(),
                retry_limit: cfg.transaction_retry_limit,
            }),
        })
    }

    pub(crate) fn db(&self) -> &Db {
        &self.inner.db
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub(crate) fn retry_limit(&self) -> u32 {
        self.inner.retry_limit
    }

    /// Apply a finished write transaction. Allocates the commit version,
    /// substitutes it into stamped writes, appends the time-to-version entry
    /// and writes the whole batch atomically.
    pub(crate) fn commit(&self, txn: &WriteTxn<'_>) -> Result<Versionstamp> {
        let _guard = self.inner.commit_lock.lock();

        let next = self.inner.last_commit.load(Ordering::Acquire) + 1;
        let mut tx_bytes = [0u8; 10];
        tx_bytes[2..].copy_from_slice(&next.to_be_bytes());

        let mut batch = WriteBatch::default();
        txn.fill_batch(&mut batch, tx_bytes)?;

        // Global nanos -> version entry. The sentinel user version sorts
        // after anything stamped inside the transaction.
        let now_nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        batch.put(
            self.inner.ttv.pack(&[Element::Int(now_nanos)]),
            versionstamp_value(Versionstamp::complete(tx_bytes, TTV_USER_VERSION)),
        );
        batch.put(COMMIT_VERSION_KEY, next.to_be_bytes());

        self.inner.db.write(batch)?;
        self.inner.last_commit.store(next, Ordering::Release);

        let version = Versionstamp::complete(tx_bytes, 0);
        trace!(%version, "Committed write transaction");
        Ok(version)
    }

    /// The versionstamp of the most recent committed write, via the
    /// time-to-version index. Zero on an empty store.
    pub fn txn_latest_write_version(&self, txn: &ReadTxn<'_>) -> Result<Versionstamp> {
        let (begin, end) = self.inner.ttv.range();
        let kvs = txn.get_range(
            &begin,
            &end,
            RangeOptions {
                limit: Some(1),
                reverse: true,
            },
        )?;
        match kvs.first() {
            Some((_, value)) => crate::keys::value_to_versionstamp(value),
            None => Ok(crate::keys::ZERO_VERSIONSTAMP),
        }
    }

    pub(crate) fn begin_read(&self, ctx: &CancellationToken) -> ReadTxn<'_> {
        ReadTxn::new(self, ctx.clone())
    }

    pub(crate) fn begin_write(&self, ctx: &CancellationToken) -> WriteTxn<'_> {
        WriteTxn::new(self, ctx.clone())
    }
}
