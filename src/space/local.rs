use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use crossbeam_channel::{self as channel, RecvTimeoutError};
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

use crate::space::durability::{Durability, Volatile};
use crate::space::entry::{Lease, LeaseState, Slot, deadline_after, now_millis};
use crate::space::listener::{Listeners, SpaceListener};
use crate::space::template::Matcher;
use crate::space::{Access, Position, Result, Space, Wait};

type Queues<K, V> = HashMap<K, VecDeque<Slot<V>>>;

/// In-process space implementation.
///
/// All queues live in memory behind one lock; blocked takers park on a
/// condition variable and are woken by every deposit. Durability is delegated
/// to a pluggable [`Durability`]: [`LocalSpace::transient`] keeps nothing,
/// [`LocalSpace::persistent`] writes every mutation through to RocksDB and
/// restores the queues on reopen.
pub struct LocalSpace<K, V> {
    queues: Mutex<Queues<K, V>>,
    arrivals: Condvar,
    listeners: Listeners<K, V>,
    durability: Box<dyn Durability<K, V>>,
}

impl<K, V> LocalSpace<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a memory-only space that lives as long as the process.
    pub fn transient() -> Self {
        Self::with_durability(Box::new(Volatile))
    }

    pub fn with_durability(durability: Box<dyn Durability<K, V>>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            arrivals: Condvar::new(),
            listeners: Listeners::new(),
            durability,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durability.is_durable()
    }

    /// Starts a background thread running [`Space::gc`] every `interval`.
    ///
    /// The thread holds only a weak reference and exits once the space is
    /// dropped or the returned handle is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> std::io::Result<SweeperHandle> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let space: Weak<Self> = Arc::downgrade(self);
        let thread = thread::Builder::new()
            .name("space-sweeper".to_string())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(space) = space.upgrade() else {
                                break;
                            };
                            if let Err(e) = space.gc() {
                                error!("Space sweep failed: {}", e);
                            }
                        }
                        _ => break,
                    }
                }
                debug!("Space sweeper exiting");
            })?;
        Ok(SweeperHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    fn next_seq(queue: Option<&VecDeque<Slot<V>>>, position: Position) -> i64 {
        match (queue, position) {
            (Some(queue), Position::Tail) => queue.back().map_or(0, |slot| slot.seq + 1),
            (Some(queue), Position::Head) => queue.front().map_or(0, |slot| slot.seq - 1),
            (None, _) => 0,
        }
    }

    /// Runs the key's listeners. Called without the queue lock held so a
    /// listener may use the space itself.
    fn fire(&self, key: &K, value: &V) {
        for listener in self.listeners.active(key) {
            listener.notify(key, value);
        }
    }

    fn insert(&self, key: K, value: V, lease: Option<Arc<LeaseState>>, position: Position) -> Result<()> {
        let mut queues = self.queues.lock();
        let seq = Self::next_seq(queues.get(&key), position);
        let expires_at = lease.as_ref().map(|l| l.expires_at());
        let hook = self.durability.record(&key, seq, &value, expires_at)?;
        let slot = match lease {
            Some(lease) => {
                if let Some(hook) = hook {
                    lease.attach(hook);
                }
                Slot::leased(seq, value, lease)
            }
            None => Slot::plain(seq, value),
        };
        let queue = queues.entry(key).or_default();
        match position {
            Position::Tail => queue.push_back(slot),
            Position::Head => queue.push_front(slot),
        }
        drop(queues);
        self.arrivals.notify_all();
        Ok(())
    }

    /// Looks for the first live entry under `key` accepted by `matcher`,
    /// dropping expired entries it walks past.
    fn scan(
        &self,
        queues: &mut Queues<K, V>,
        key: &K,
        matcher: Option<&dyn Matcher<V>>,
        access: Access,
    ) -> Result<Option<V>> {
        let Some(queue) = queues.get_mut(key) else {
            return Ok(None);
        };
        let now = now_millis();
        let mut found = None;
        let mut index = 0;
        while index < queue.len() {
            if queue[index].is_expired_at(now) {
                queue[index].release();
                self.durability.erase(key, queue[index].seq)?;
                if let Some(expired) = queue.remove(index) {
                    expired.into_value();
                }
                continue;
            }
            if matcher.is_none_or(|m| m.matches(&queue[index].value)) {
                found = Some(index);
                break;
            }
            index += 1;
        }
        let result = match (found, access) {
            (None, _) => None,
            (Some(index), Access::Read) => Some(queue[index].value.clone()),
            (Some(index), Access::Take) => {
                queue[index].release();
                self.durability.erase(key, queue[index].seq)?;
                queue.remove(index).map(Slot::into_value)
            }
        };
        if queue.is_empty() {
            queues.remove(key);
        }
        Ok(result)
    }
}

#[cfg(feature = "persistent")]
impl<K, V> LocalSpace<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static,
    V: Clone + Send + Sync + serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    /// Opens (or creates) a RocksDB-backed space at `path`, restoring every
    /// stored queue in order.
    pub fn persistent<P: AsRef<std::path::Path>>(
        path: P,
        options: crate::space::persistent::PersistentOptions,
    ) -> Result<Self> {
        use crate::space::persistent::RocksDurability;

        let path = path.as_ref();
        let durability = RocksDurability::<K, V>::open(path, options)?;
        let mut queues: Queues<K, V> = HashMap::new();
        let mut entries = 0;
        for (key, restored) in durability.restore()? {
            let queue: VecDeque<Slot<V>> = restored
                .into_iter()
                .map(|r| match r.expires_at {
                    Some(deadline) => {
                        let lease = LeaseState::new(deadline);
                        if let Some(hook) = r.hook {
                            lease.attach(hook);
                        }
                        Slot::leased(r.seq, r.value, lease)
                    }
                    None => Slot::plain(r.seq, r.value),
                })
                .collect();
            entries += queue.len();
            queues.insert(key, queue);
        }
        debug!("Opened persistent space at {} with {} entries", path.display(), entries);
        Ok(Self {
            queues: Mutex::new(queues),
            arrivals: Condvar::new(),
            listeners: Listeners::new(),
            durability: Box::new(durability),
        })
    }
}

impl<K, V> Default for LocalSpace<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::transient()
    }
}

impl<K, V> Space<K, V> for LocalSpace<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn deposit(&self, key: K, value: V, position: Position) -> Result<()> {
        self.fire(&key, &value);
        self.insert(key, value, None, position)
    }

    fn deposit_leased(&self, key: K, value: V, ttl: Duration, position: Position) -> Result<Lease> {
        self.fire(&key, &value);
        let lease = LeaseState::new(deadline_after(ttl));
        self.insert(key, value, Some(Arc::clone(&lease)), position)?;
        Ok(Lease::new(lease))
    }

    fn fetch(&self, key: &K, matcher: Option<&dyn Matcher<V>>, access: Access, wait: Wait) -> Result<Option<V>> {
        let deadline = match wait {
            Wait::For(timeout) => Instant::now().checked_add(timeout),
            _ => None,
        };
        let mut queues = self.queues.lock();
        loop {
            if let Some(value) = self.scan(&mut queues, key, matcher, access)? {
                return Ok(Some(value));
            }
            match (wait, deadline) {
                (Wait::No, _) => return Ok(None),
                (Wait::For(_), Some(deadline)) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    self.arrivals.wait_until(&mut queues, deadline);
                }
                // Timeouts too large to represent behave like `Forever`.
                (Wait::For(_), None) | (Wait::Forever, _) => self.arrivals.wait(&mut queues),
            }
        }
    }

    fn put(&self, key: K, value: V) -> Result<()> {
        self.fire(&key, &value);
        let mut queues = self.queues.lock();
        if let Some(previous) = queues.get(&key) {
            for slot in previous {
                slot.release();
                self.durability.erase(&key, slot.seq)?;
            }
        }
        if let Some(previous) = queues.remove(&key) {
            previous.into_iter().for_each(|slot| {
                slot.into_value();
            });
        }
        self.durability.record(&key, 0, &value, None)?;
        queues.insert(key, VecDeque::from([Slot::plain(0, value)]));
        drop(queues);
        self.arrivals.notify_all();
        Ok(())
    }

    fn keys(&self) -> Vec<K> {
        let now = now_millis();
        self.queues
            .lock()
            .iter()
            .filter(|(_, queue)| queue.iter().any(|slot| !slot.is_expired_at(now)))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn count(&self, key: &K) -> usize {
        let now = now_millis();
        self.queues
            .lock()
            .get(key)
            .map_or(0, |queue| queue.iter().filter(|slot| !slot.is_expired_at(now)).count())
    }

    fn gc(&self) -> Result<usize> {
        let now = now_millis();
        let mut reclaimed = 0;
        let mut queues = self.queues.lock();
        for (key, queue) in queues.iter_mut() {
            let mut index = 0;
            while index < queue.len() {
                if !queue[index].is_expired_at(now) {
                    index += 1;
                    continue;
                }
                queue[index].release();
                self.durability.erase(key, queue[index].seq)?;
                if let Some(expired) = queue.remove(index) {
                    expired.into_value();
                }
                reclaimed += 1;
            }
        }
        queues.retain(|_, queue| !queue.is_empty());
        drop(queues);
        let listeners = self.listeners.sweep();
        if reclaimed > 0 || listeners > 0 {
            debug!("Space gc reclaimed {} entries and {} listener registrations", reclaimed, listeners);
        }
        Ok(reclaimed)
    }

    fn add_listener(&self, key: K, listener: Arc<dyn SpaceListener<K, V>>, window: Option<Duration>) {
        self.listeners.add(key, listener, window);
    }

    fn remove_listener(&self, key: &K, listener: &Arc<dyn SpaceListener<K, V>>) -> bool {
        self.listeners.remove(key, listener)
    }

    fn commit(&self) -> Result<()> {
        self.durability.commit()
    }

    fn set_auto_commit(&self, auto_commit: bool) {
        self.durability.set_auto_commit(auto_commit);
    }
}

/// Handle to a background sweeper started by [`LocalSpace::spawn_sweeper`].
/// Dropping it stops the sweeper.
pub struct SweeperHandle {
    stop: Option<channel::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Disconnecting the channel wakes the sweeper immediately.
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Space sweeper thread panicked");
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_lands_ahead_of_queued_entries() {
        let space: LocalSpace<&str, u32> = LocalSpace::transient();
        space.out("k", 1).unwrap();
        space.out("k", 2).unwrap();
        space.push("k", 0).unwrap();
        assert_eq!(space.try_take(&"k").unwrap(), Some(0));
        assert_eq!(space.try_take(&"k").unwrap(), Some(1));
        assert_eq!(space.try_take(&"k").unwrap(), Some(2));
        assert_eq!(space.try_take(&"k").unwrap(), None);
    }

    #[test]
    fn put_replaces_every_entry() {
        let space: LocalSpace<&str, u32> = LocalSpace::transient();
        space.out("counter", 1).unwrap();
        space.out("counter", 2).unwrap();
        space.put("counter", 9).unwrap();
        assert_eq!(space.count(&"counter"), 1);
        assert_eq!(space.try_read(&"counter").unwrap(), Some(9));
    }

    #[test]
    fn emptied_keys_disappear() {
        let space: LocalSpace<&str, u32> = LocalSpace::transient();
        space.out("a", 1).unwrap();
        space.out("b", 2).unwrap();
        assert_eq!(space.take(&"a").unwrap(), 1);
        assert_eq!(space.keys(), vec!["b"]);
    }

    #[test]
    fn sweeper_reclaims_expired_entries() {
        let space: Arc<LocalSpace<&str, u32>> = Arc::new(LocalSpace::transient());
        space.out_leased("short", 1, Duration::from_millis(20)).unwrap();
        let sweeper = space.spawn_sweeper(Duration::from_millis(10)).unwrap();
        thread::sleep(Duration::from_millis(120));
        sweeper.stop();
        assert!(space.queues.lock().is_empty());
    }
}
