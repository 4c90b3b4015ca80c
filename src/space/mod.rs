//! The space: a concurrent, optionally durable, key-addressed multi-map.
//!
//! Every key holds a FIFO queue of values. Producers `out` (or `push`) values,
//! consumers `take` or `read` them, blocking until something arrives if they
//! ask to. The same primitive serves as an inter-thread queue, a write-ahead
//! journal and a coordination token store.

pub mod durability;
pub mod entry;
pub mod listener;
pub mod local;
#[cfg(feature = "persistent")]
pub mod persistent;
pub mod registry;
pub mod template;

use std::sync::Arc;
use std::time::Duration;

pub use durability::{Durability, Volatile};
pub use entry::Lease;
pub use listener::SpaceListener;
pub use local::{LocalSpace, SweeperHandle};
#[cfg(feature = "persistent")]
pub use persistent::PersistentOptions;
pub use registry::{Scheme, SpaceRegistry, SpaceUri};
pub use template::{Digest, Equals, Matcher, Template};

pub type Result<T> = std::result::Result<T, crate::errors::SpaceError>;

/// How long a fetch may block waiting for a matching entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Probe and return immediately.
    No,
    /// Block up to the given duration.
    For(Duration),
    /// Block until an entry arrives.
    Forever,
}

/// Whether a fetch removes the entry it finds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Take,
    Read,
}

/// Where a deposit lands in its key's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Behind every existing entry (`out`).
    Tail,
    /// Ahead of every existing entry (`push`).
    Head,
}

/// Uniform interface over transient and persistent spaces.
///
/// Callers never need to know which backend they hold. All operations are
/// safe to call concurrently; a deposited entry is delivered to at most one
/// taker.
pub trait Space<K, V>: Send + Sync {
    /// Stores `value` under `key`, firing the key's listeners first.
    fn deposit(&self, key: K, value: V, position: Position) -> Result<()>;

    /// Stores `value` under `key` for `ttl`; once the lease lapses the entry is
    /// logically gone.
    fn deposit_leased(&self, key: K, value: V, ttl: Duration, position: Position) -> Result<Lease>;

    /// Finds the oldest live entry under `key` accepted by `matcher` (any entry
    /// when `None`), optionally removing it. Expired entries met on the way
    /// are dropped.
    fn fetch(&self, key: &K, matcher: Option<&dyn Matcher<V>>, access: Access, wait: Wait) -> Result<Option<V>>;

    /// Replaces every entry under `key` with `value`.
    fn put(&self, key: K, value: V) -> Result<()>;

    /// Keys currently holding at least one live entry.
    fn keys(&self) -> Vec<K>;

    /// Number of live entries under `key`.
    fn count(&self, key: &K) -> usize;

    /// Reclaims expired entries, empty keys and lapsed listener registrations.
    /// Returns the number of entries reclaimed.
    fn gc(&self) -> Result<usize>;

    /// Registers `listener` on `key`. With a `window`, the registration itself
    /// is leased and silently dropped once the window elapses.
    fn add_listener(&self, key: K, listener: Arc<dyn SpaceListener<K, V>>, window: Option<Duration>);

    fn remove_listener(&self, key: &K, listener: &Arc<dyn SpaceListener<K, V>>) -> bool;

    /// Flushes staged mutations on a durable backend running with auto-commit
    /// off. A no-op elsewhere.
    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn set_auto_commit(&self, _auto_commit: bool) {}

    fn out(&self, key: K, value: V) -> Result<()> {
        self.deposit(key, value, Position::Tail)
    }

    fn out_leased(&self, key: K, value: V, ttl: Duration) -> Result<Lease> {
        self.deposit_leased(key, value, ttl, Position::Tail)
    }

    fn push(&self, key: K, value: V) -> Result<()> {
        self.deposit(key, value, Position::Head)
    }

    fn push_leased(&self, key: K, value: V, ttl: Duration) -> Result<Lease> {
        self.deposit_leased(key, value, ttl, Position::Head)
    }

    /// Removes and returns the oldest entry, blocking until one exists.
    fn take(&self, key: &K) -> Result<V> {
        loop {
            if let Some(value) = self.fetch(key, None, Access::Take, Wait::Forever)? {
                return Ok(value);
            }
        }
    }

    fn take_timeout(&self, key: &K, timeout: Duration) -> Result<Option<V>> {
        self.fetch(key, None, Access::Take, Wait::For(timeout))
    }

    fn try_take(&self, key: &K) -> Result<Option<V>> {
        self.fetch(key, None, Access::Take, Wait::No)
    }

    /// Returns a copy of the oldest entry, blocking until one exists.
    fn read(&self, key: &K) -> Result<V> {
        loop {
            if let Some(value) = self.fetch(key, None, Access::Read, Wait::Forever)? {
                return Ok(value);
            }
        }
    }

    fn read_timeout(&self, key: &K, timeout: Duration) -> Result<Option<V>> {
        self.fetch(key, None, Access::Read, Wait::For(timeout))
    }

    fn try_read(&self, key: &K) -> Result<Option<V>> {
        self.fetch(key, None, Access::Read, Wait::No)
    }

    fn take_matching(&self, template: &Template<K, V>) -> Result<V> {
        loop {
            if let Some(value) = self.fetch(template.key(), Some(template.matcher()), Access::Take, Wait::Forever)? {
                return Ok(value);
            }
        }
    }

    fn take_matching_timeout(&self, template: &Template<K, V>, timeout: Duration) -> Result<Option<V>> {
        self.fetch(template.key(), Some(template.matcher()), Access::Take, Wait::For(timeout))
    }

    fn try_take_matching(&self, template: &Template<K, V>) -> Result<Option<V>> {
        self.fetch(template.key(), Some(template.matcher()), Access::Take, Wait::No)
    }

    fn read_matching(&self, template: &Template<K, V>) -> Result<V> {
        loop {
            if let Some(value) = self.fetch(template.key(), Some(template.matcher()), Access::Read, Wait::Forever)? {
                return Ok(value);
            }
        }
    }

    fn read_matching_timeout(&self, template: &Template<K, V>, timeout: Duration) -> Result<Option<V>> {
        self.fetch(template.key(), Some(template.matcher()), Access::Read, Wait::For(timeout))
    }

    fn try_read_matching(&self, template: &Template<K, V>) -> Result<Option<V>> {
        self.fetch(template.key(), Some(template.matcher()), Access::Read, Wait::No)
    }
}
