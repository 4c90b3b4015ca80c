use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error};
use parking_lot::Mutex;
use rocksdb::{DB, IteratorMode, Options, WriteBatch, WriteOptions};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::SpaceError;
use crate::space::Result;
use crate::space::durability::Durability;
use crate::space::entry::RenewHook;

const PLAIN: u8 = 0;
const LEASED: u8 = 1;
const HEADER_LEN: usize = 9;

/// Tuning knobs for a RocksDB-backed space.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistentOptions {
    /// fsync every write (or every committed batch).
    pub sync_writes: bool,
    /// Write each mutation immediately. When off, mutations accumulate until
    /// [`Space::commit`](crate::space::Space::commit).
    pub auto_commit: bool,
}

impl Default for PersistentOptions {
    fn default() -> Self {
        Self {
            sync_writes: false,
            auto_commit: true,
        }
    }
}

/// An entry read back from disk while reopening a space.
pub(crate) struct Restored<V> {
    pub(crate) seq: i64,
    pub(crate) value: V,
    pub(crate) expires_at: Option<u64>,
    pub(crate) hook: Option<RenewHook>,
}

struct Store {
    db: DB,
    sync_writes: bool,
    auto_commit: AtomicBool,
    pending: Mutex<WriteBatch>,
}

impl Store {
    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.auto_commit.load(Ordering::Acquire) {
            self.db.put_opt(key, value, &self.write_options())?;
        } else {
            self.pending.lock().put(key, value);
        }
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        if self.auto_commit.load(Ordering::Acquire) {
            self.db.delete_opt(key, &self.write_options())?;
        } else {
            self.pending.lock().delete(key);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }
        debug!("Committing {} staged space mutations", batch.len());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }
}

/// Durability backed by a RocksDB instance.
///
/// Each entry is one record. The record key is the length-prefixed bincode
/// encoding of the space key followed by the entry's sequence number in an
/// order-preserving big-endian form, so a full scan yields every queue
/// contiguously and in order.
pub struct RocksDurability<K, V> {
    store: Arc<Store>,
    _types: PhantomData<fn(&K, &V)>,
}

impl<K, V> RocksDurability<K, V> {
    pub fn open<P: AsRef<Path>>(path: P, options: PersistentOptions) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            store: Arc::new(Store {
                db,
                sync_writes: options.sync_writes,
                auto_commit: AtomicBool::new(options.auto_commit),
                pending: Mutex::new(WriteBatch::default()),
            }),
            _types: PhantomData,
        })
    }

    /// Reads every stored entry, grouped by key, each group in queue order.
    pub(crate) fn restore(&self) -> Result<Vec<(K, Vec<Restored<V>>)>>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
    {
        let mut groups: Vec<(K, Vec<Restored<V>>)> = Vec::new();
        let mut current: Option<Vec<u8>> = None;
        for item in self.store.db.iterator(IteratorMode::Start) {
            let (raw_key, raw_value) = item?;
            let (key_bytes, seq) = split_entry_key(&raw_key)?;
            let (expires_at, value_bytes) = split_entry_value(&raw_value)?;
            let value: V = bincode::deserialize(value_bytes)?;
            let hook = expires_at.map(|_| renew_hook(&self.store, raw_key.to_vec(), value_bytes.to_vec()));
            let restored = Restored {
                seq,
                value,
                expires_at,
                hook,
            };
            if current.as_deref() == Some(key_bytes) {
                if let Some((_, entries)) = groups.last_mut() {
                    entries.push(restored);
                    continue;
                }
            }
            let key: K = bincode::deserialize(key_bytes)?;
            current = Some(key_bytes.to_vec());
            groups.push((key, vec![restored]));
        }
        Ok(groups)
    }
}

impl<K, V> Durability<K, V> for RocksDurability<K, V>
where
    K: Serialize,
    V: Serialize,
{
    fn record(&self, key: &K, seq: i64, value: &V, expires_at: Option<u64>) -> Result<Option<RenewHook>> {
        let record_key = entry_key(&bincode::serialize(key)?, seq);
        let value_bytes = bincode::serialize(value)?;
        self.store.put(&record_key, &entry_value(expires_at, &value_bytes))?;
        Ok(expires_at.map(|_| renew_hook(&self.store, record_key, value_bytes)))
    }

    fn erase(&self, key: &K, seq: i64) -> Result<()> {
        self.store.delete(&entry_key(&bincode::serialize(key)?, seq))
    }

    fn commit(&self) -> Result<()> {
        self.store.flush()
    }

    fn set_auto_commit(&self, auto_commit: bool) {
        let was = self.store.auto_commit.swap(auto_commit, Ordering::AcqRel);
        if auto_commit && !was {
            if let Err(e) = self.store.flush() {
                error!("Failed to flush staged mutations when enabling auto-commit: {}", e);
            }
        }
    }

    fn is_durable(&self) -> bool {
        true
    }
}

fn renew_hook(store: &Arc<Store>, record_key: Vec<u8>, value_bytes: Vec<u8>) -> RenewHook {
    let store: Weak<Store> = Arc::downgrade(store);
    Box::new(move |deadline| {
        let store = store
            .upgrade()
            .ok_or_else(|| SpaceError::Storage("space has been closed".to_string()))?;
        store.put(&record_key, &entry_value(Some(deadline), &value_bytes))
    })
}

fn order_preserving(seq: i64) -> u64 {
    (seq as u64) ^ (1 << 63)
}

fn entry_key(key_bytes: &[u8], seq: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + key_bytes.len() + 8);
    out.extend_from_slice(&(key_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(key_bytes);
    out.extend_from_slice(&order_preserving(seq).to_be_bytes());
    out
}

fn split_entry_key(raw: &[u8]) -> Result<(&[u8], i64)> {
    let corrupt = || SpaceError::Storage(format!("corrupt entry key of {} bytes", raw.len()));
    let len_bytes: [u8; 4] = raw.get(..4).and_then(|b| b.try_into().ok()).ok_or_else(corrupt)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let key_bytes = raw.get(4..4 + len).ok_or_else(corrupt)?;
    let seq_bytes: [u8; 8] = raw
        .get(4 + len..)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(corrupt)?;
    let seq = (u64::from_be_bytes(seq_bytes) ^ (1 << 63)) as i64;
    Ok((key_bytes, seq))
}

fn entry_value(expires_at: Option<u64>, value_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + value_bytes.len());
    match expires_at {
        Some(deadline) => {
            out.push(LEASED);
            out.extend_from_slice(&deadline.to_be_bytes());
        }
        None => {
            out.push(PLAIN);
            out.extend_from_slice(&0u64.to_be_bytes());
        }
    }
    out.extend_from_slice(value_bytes);
    out
}

fn split_entry_value(raw: &[u8]) -> Result<(Option<u64>, &[u8])> {
    if raw.len() < HEADER_LEN {
        return Err(SpaceError::Storage(format!("corrupt entry value of {} bytes", raw.len())));
    }
    let mut deadline = [0u8; 8];
    deadline.copy_from_slice(&raw[1..HEADER_LEN]);
    let expires_at = match raw[0] {
        LEASED => Some(u64::from_be_bytes(deadline)),
        _ => None,
    };
    Ok((expires_at, &raw[HEADER_LEN..]))
}
