//! Journal layout and access.
//!
//! The transaction manager keeps all recovery state in a space keyed by
//! strings. Counters and states are single-entry keys. Group selections and
//! joined participants are queued one entry each, in the order they happened.
//!
//! A journal belongs to one running manager: ids come from the shared `$HEAD`
//! counter and the per-id keys carry no queue name.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::SpaceError;
use crate::space::{self, Space, Template};

/// Next id to assign.
pub const HEAD: &str = "$HEAD";
/// Lowest id not yet purged.
pub const TAIL: &str = "$TAIL";

pub fn context_key(id: u64) -> String {
    format!("$CONTEXT.{}", id)
}

pub fn state_key(id: u64) -> String {
    format!("$STATE.{}", id)
}

pub fn groups_key(id: u64) -> String {
    format!("$GROUPS.{}", id)
}

pub fn joined_key(id: u64) -> String {
    format!("$JOINED.{}", id)
}

/// Key of the tail-advancement token, suffixed with a fingerprint of the
/// queue.
pub fn tail_lock_key(queue: &str) -> String {
    let digest = blake3::hash(queue.as_bytes()).to_hex();
    format!("$TAILLOCK.{}", &digest[..16])
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Preparing,
    Committing,
    Done,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TxnState::Preparing => "PREPARING",
            TxnState::Committing => "COMMITTING",
            TxnState::Done => "DONE",
        })
    }
}

/// Position of a participant in the manager's configuration: its index in
/// the default pipeline (`group == None`) or in a named group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub group: Option<String>,
    pub index: usize,
}

impl Member {
    pub fn pipeline(index: usize) -> Self {
        Self { group: None, index }
    }

    pub fn group(name: impl Into<String>, index: usize) -> Self {
        Self {
            group: Some(name.into()),
            index,
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "{}[{}]", group, self.index),
            None => write!(f, "[{}]", self.index),
        }
    }
}

/// Everything stored in a journal space.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum JournalValue {
    Counter(u64),
    State(TxnState),
    /// bincode encoding of the transaction context.
    Context(Vec<u8>),
    Group(String),
    /// A participant that joined the commit or abort walk.
    Joined(Member),
    Token,
}

pub type JournalSpace = Arc<dyn Space<String, JournalValue>>;

/// Typed access to a journal space with bounded retries on store failures.
pub(crate) struct Journal {
    space: JournalSpace,
    retries: u32,
    backoff: Duration,
}

impl Journal {
    pub(crate) fn new(space: JournalSpace, retries: u32, backoff: Duration) -> Self {
        Self {
            space,
            retries,
            backoff,
        }
    }

    fn retry<T>(&self, what: &str, op: impl Fn() -> space::Result<T>) -> space::Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!("Journal {} failed (attempt {}/{}): {}", what, attempt, self.retries, e);
                    thread::sleep(self.backoff * attempt);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read(&self, key: String) -> space::Result<Option<JournalValue>> {
        self.retry("read", || self.space.try_read(&key))
    }

    fn put(&self, key: String, value: JournalValue) -> space::Result<()> {
        self.retry("write", || self.space.put(key.clone(), value.clone()))
    }

    pub(crate) fn counter(&self, key: &str) -> space::Result<Option<u64>> {
        match self.read(key.to_string())? {
            Some(JournalValue::Counter(n)) => Ok(Some(n)),
            None => Ok(None),
            Some(other) => Err(unexpected(key, &other)),
        }
    }

    pub(crate) fn set_counter(&self, key: &str, value: u64) -> space::Result<()> {
        self.put(key.to_string(), JournalValue::Counter(value))
    }

    pub(crate) fn state(&self, id: u64) -> space::Result<Option<TxnState>> {
        let key = state_key(id);
        match self.read(key.clone())? {
            Some(JournalValue::State(state)) => Ok(Some(state)),
            None => Ok(None),
            Some(other) => Err(unexpected(&key, &other)),
        }
    }

    pub(crate) fn set_state(&self, id: u64, state: TxnState) -> space::Result<()> {
        self.put(state_key(id), JournalValue::State(state))
    }

    pub(crate) fn context(&self, id: u64) -> space::Result<Option<Vec<u8>>> {
        let key = context_key(id);
        match self.read(key.clone())? {
            Some(JournalValue::Context(bytes)) => Ok(Some(bytes)),
            None => Ok(None),
            Some(other) => Err(unexpected(&key, &other)),
        }
    }

    pub(crate) fn set_context(&self, id: u64, bytes: Vec<u8>) -> space::Result<()> {
        self.put(context_key(id), JournalValue::Context(bytes))
    }

    pub(crate) fn add_group(&self, id: u64, group: &str) -> space::Result<()> {
        let key = groups_key(id);
        self.retry("write", || self.space.out(key.clone(), JournalValue::Group(group.to_string())))
    }

    /// Group names recorded for `id`, in selection order.
    pub(crate) fn groups(&self, id: u64) -> space::Result<Vec<String>> {
        let key = groups_key(id);
        self.entries(&key)?
            .into_iter()
            .map(|value| match value {
                JournalValue::Group(name) => Ok(name),
                other => Err(unexpected(&key, &other)),
            })
            .collect()
    }

    pub(crate) fn add_joined(&self, id: u64, member: &Member) -> space::Result<()> {
        let key = joined_key(id);
        self.retry("write", || self.space.out(key.clone(), JournalValue::Joined(member.clone())))
    }

    /// Participants that joined `id`, in join order.
    pub(crate) fn joined(&self, id: u64) -> space::Result<Vec<Member>> {
        let key = joined_key(id);
        self.entries(&key)?
            .into_iter()
            .map(|value| match value {
                JournalValue::Joined(member) => Ok(member),
                other => Err(unexpected(&key, &other)),
            })
            .collect()
    }

    /// Every entry queued under `key`, in order. Leaves them stored.
    fn entries(&self, key: &str) -> space::Result<Vec<JournalValue>> {
        let key = key.to_string();
        let mut entries = Vec::new();
        for index in 0..self.space.count(&key) {
            let entry = self.retry("read", || {
                // Matches the entry at `index` by counting the entries walked past.
                let walked = AtomicUsize::new(0);
                let template = Template::with(key.clone(), move |_: &JournalValue| {
                    walked.fetch_add(1, Ordering::Relaxed) == index
                });
                self.space.try_read_matching(&template)
            })?;
            match entry {
                Some(value) => entries.push(value),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Removes every record of `id`.
    pub(crate) fn purge(&self, id: u64) -> space::Result<()> {
        for key in [context_key(id), state_key(id), groups_key(id), joined_key(id)] {
            while self.retry("purge", || self.space.try_take(&key))?.is_some() {}
        }
        Ok(())
    }

    /// Re-seeds the token; a crash while it was held leaves it missing.
    pub(crate) fn seed_token(&self, key: &str) -> space::Result<()> {
        self.put(key.to_string(), JournalValue::Token)
    }

    pub(crate) fn acquire(&self, key: &str) -> space::Result<()> {
        let key = key.to_string();
        self.retry("lock", || self.space.take(&key)).map(|_| ())
    }

    pub(crate) fn release(&self, key: &str) -> space::Result<()> {
        self.retry("unlock", || self.space.out(key.to_string(), JournalValue::Token))
    }
}

fn unexpected(key: &str, value: &JournalValue) -> SpaceError {
    SpaceError::Storage(format!("unexpected journal value {:?} under {}", value, key))
}
