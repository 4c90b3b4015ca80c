use crate::space::entry::RenewHook;
use crate::space::Result;

/// Write-through hook a [`LocalSpace`](crate::space::LocalSpace) calls for
/// every mutation of its in-memory queues.
///
/// Implementations must be safe to call while the space holds its queue lock;
/// they must not call back into the space.
pub trait Durability<K, V>: Send + Sync {
    /// Records a newly deposited entry. Leased entries may get a hook back so
    /// later renewals reach the store too.
    fn record(&self, key: &K, seq: i64, value: &V, expires_at: Option<u64>) -> Result<Option<RenewHook>>;

    /// Forgets a previously recorded entry.
    fn erase(&self, key: &K, seq: i64) -> Result<()>;

    /// Flushes mutations staged while auto-commit is off.
    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn set_auto_commit(&self, _auto_commit: bool) {}

    fn is_durable(&self) -> bool {
        false
    }
}

/// Process-lifetime storage: nothing is written anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct Volatile;

impl<K, V> Durability<K, V> for Volatile {
    fn record(&self, _key: &K, _seq: i64, _value: &V, _expires_at: Option<u64>) -> Result<Option<RenewHook>> {
        Ok(None)
    }

    fn erase(&self, _key: &K, _seq: i64) -> Result<()> {
        Ok(())
    }
}
