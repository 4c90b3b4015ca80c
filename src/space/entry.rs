use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::warn;
use parking_lot::Mutex;

use crate::space::Result;

/// Callback a durable backend attaches to a lease so renewals reach disk.
/// It receives the new absolute expiration in milliseconds since the epoch.
pub type RenewHook = Box<dyn Fn(u64) -> Result<()> + Send + Sync>;

/// Wall clock in milliseconds since the Unix epoch.
///
/// Lease deadlines are absolute wall-clock instants so that they keep their
/// meaning across a restart of a persistent space.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub(crate) fn deadline_after(ttl: Duration) -> u64 {
    now_millis().saturating_add(ttl.as_millis() as u64)
}

/// Shared state between a stored entry and the [`Lease`] handle given to the
/// depositor.
pub(crate) struct LeaseState {
    expires_at: AtomicU64,
    /// Held across a renewal so a take cannot erase the record halfway.
    released: Mutex<bool>,
    on_renew: OnceLock<RenewHook>,
}

impl LeaseState {
    pub(crate) fn new(expires_at: u64) -> Arc<Self> {
        Arc::new(Self {
            expires_at: AtomicU64::new(expires_at),
            released: Mutex::new(false),
            on_renew: OnceLock::new(),
        })
    }

    pub(crate) fn attach(&self, hook: RenewHook) {
        // A lease is attached to exactly one backend record.
        let _ = self.on_renew.set(hook);
    }

    pub(crate) fn expires_at(&self) -> u64 {
        self.expires_at.load(Ordering::Acquire)
    }

    pub(crate) fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at()
    }

    /// Marks the lease as detached from its entry (taken or swept). Waits for
    /// a renewal in flight, so the backend record must be erased after this.
    pub(crate) fn release(&self) {
        *self.released.lock() = true;
    }
}

/// Handle to a leased entry.
///
/// Returned by [`Space::out_leased`](crate::space::Space::out_leased) and
/// [`Space::push_leased`](crate::space::Space::push_leased). The entry stays
/// visible until its deadline passes; `renew` pushes the deadline out again as
/// long as the entry is still alive.
#[derive(Clone)]
pub struct Lease {
    state: Arc<LeaseState>,
}

impl Lease {
    pub(crate) fn new(state: Arc<LeaseState>) -> Self {
        Self { state }
    }

    /// Extends the lease to expire `duration` from now.
    ///
    /// Returns `false` when the lease already expired, when its entry has been
    /// taken or swept, or when the backend could not record the new deadline.
    /// Renewal racing with expiry is expected, so it is not an error.
    pub fn renew(&self, duration: Duration) -> bool {
        let released = self.state.released.lock();
        if *released || self.is_expired() {
            return false;
        }
        let deadline = deadline_after(duration);
        if let Some(hook) = self.state.on_renew.get() {
            if let Err(e) = hook(deadline) {
                warn!("Lease renewal could not be persisted: {}", e);
                return false;
            }
        }
        self.state.expires_at.store(deadline, Ordering::Release);
        true
    }

    /// Returns `true` once the deadline has passed.
    pub fn is_expired(&self) -> bool {
        self.state.is_expired_at(now_millis())
    }

    /// Returns `true` while the leased entry is still stored and unexpired.
    pub fn is_live(&self) -> bool {
        !*self.state.released.lock() && !self.is_expired()
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        Duration::from_millis(self.state.expires_at().saturating_sub(now_millis()))
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("expires_at", &self.state.expires_at())
            .field("released", &*self.state.released.lock())
            .finish()
    }
}

/// A stored value: either plain or wrapped with a lease.
///
/// The wrapper never leaves the space; reads and takes hand out the inner
/// value only.
pub(crate) struct Slot<V> {
    pub(crate) seq: i64,
    pub(crate) value: V,
    pub(crate) lease: Option<Arc<LeaseState>>,
}

impl<V> Slot<V> {
    pub(crate) fn plain(seq: i64, value: V) -> Self {
        Self {
            seq,
            value,
            lease: None,
        }
    }

    pub(crate) fn leased(seq: i64, value: V, lease: Arc<LeaseState>) -> Self {
        Self {
            seq,
            value,
            lease: Some(lease),
        }
    }

    pub(crate) fn is_expired_at(&self, now: u64) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_expired_at(now))
    }

    /// Detaches the lease, if any. Call before erasing the backend record.
    pub(crate) fn release(&self) {
        if let Some(lease) = &self.lease {
            lease.release();
        }
    }

    pub(crate) fn into_value(self) -> V {
        self.release();
        self.value
    }
}
