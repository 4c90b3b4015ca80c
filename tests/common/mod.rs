//! Common utilities for txnspace integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use txnspace::prelude::*;

/// Installs a test logger once per test binary.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `condition` every 10ms until it holds or `timeout_ms` elapses.
pub fn wait_for_condition<F>(condition: F, timeout_ms: u64) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    condition()
}

pub fn journal_space() -> Arc<dyn Space<String, JournalValue>> {
    Arc::new(LocalSpace::<String, JournalValue>::transient())
}

/// A journal whose writes of selected values fail while armed.
pub struct FailingJournal {
    inner: Arc<dyn Space<String, JournalValue>>,
    fails: Box<dyn Fn(&JournalValue) -> bool + Send + Sync>,
    armed: AtomicBool,
}

impl FailingJournal {
    pub fn new<F>(inner: Arc<dyn Space<String, JournalValue>>, fails: F) -> Arc<Self>
    where
        F: Fn(&JournalValue) -> bool + Send + Sync + 'static,
    {
        Arc::new(Self {
            inner,
            fails: Box::new(fails),
            armed: AtomicBool::new(true),
        })
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    fn check(&self, value: &JournalValue) -> Result<(), SpaceError> {
        if self.armed.load(Ordering::SeqCst) && (self.fails)(value) {
            return Err(SpaceError::Storage(format!("refusing to write {:?}", value)));
        }
        Ok(())
    }
}

impl Space<String, JournalValue> for FailingJournal {
    fn deposit(&self, key: String, value: JournalValue, position: Position) -> Result<(), SpaceError> {
        self.check(&value)?;
        self.inner.deposit(key, value, position)
    }

    fn deposit_leased(
        &self,
        key: String,
        value: JournalValue,
        ttl: Duration,
        position: Position,
    ) -> Result<Lease, SpaceError> {
        self.check(&value)?;
        self.inner.deposit_leased(key, value, ttl, position)
    }

    fn fetch(
        &self,
        key: &String,
        matcher: Option<&dyn Matcher<JournalValue>>,
        access: Access,
        wait: Wait,
    ) -> Result<Option<JournalValue>, SpaceError> {
        self.inner.fetch(key, matcher, access, wait)
    }

    fn put(&self, key: String, value: JournalValue) -> Result<(), SpaceError> {
        self.check(&value)?;
        self.inner.put(key, value)
    }

    fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    fn count(&self, key: &String) -> usize {
        self.inner.count(key)
    }

    fn gc(&self) -> Result<usize, SpaceError> {
        self.inner.gc()
    }

    fn add_listener(
        &self,
        key: String,
        listener: Arc<dyn SpaceListener<String, JournalValue>>,
        window: Option<Duration>,
    ) {
        self.inner.add_listener(key, listener, window)
    }

    fn remove_listener(&self, key: &String, listener: &Arc<dyn SpaceListener<String, JournalValue>>) -> bool {
        self.inner.remove_listener(key, listener)
    }
}

/// Calls made on a [`Recorder`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Prepare(u64),
    PrepareForAbort(u64),
    Commit(u64, String),
    Abort(u64, String),
    Recover(u64, bool),
}

/// Shared trail of `name:phase:id` lines across several recorders.
pub type Trail = Arc<Mutex<Vec<String>>>;

pub fn new_trail() -> Trail {
    Arc::new(Mutex::new(Vec::new()))
}

/// A configurable participant over `String` contexts that records every call.
pub struct Recorder {
    name: String,
    vote: Vote,
    abort_vote: Option<Vote>,
    groups: Vec<String>,
    fail_prepare: bool,
    panic_prepare: bool,
    fail_commit: bool,
    append: Option<String>,
    rebuild: bool,
    calls: Mutex<Vec<Call>>,
    trail: Option<Trail>,
}

impl Recorder {
    /// A participant voting `PREPARED` that joins and resnapshots.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            vote: Vote::PREPARED,
            abort_vote: None,
            groups: Vec::new(),
            fail_prepare: false,
            panic_prepare: false,
            fail_commit: false,
            append: None,
            rebuild: false,
            calls: Mutex::new(Vec::new()),
            trail: None,
        }
    }

    pub fn vote(mut self, vote: Vote) -> Self {
        self.vote = vote;
        self
    }

    /// Vote returned from `prepare_for_abort`; without one the trait default
    /// applies.
    pub fn abort_vote(mut self, vote: Vote) -> Self {
        self.abort_vote = Some(vote);
        self
    }

    pub fn select(mut self, groups: &[&str]) -> Self {
        self.groups = groups.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn failing_prepare(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    pub fn panicking_prepare(mut self) -> Self {
        self.panic_prepare = true;
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    /// Appends `suffix` to the context during prepare.
    pub fn appending(mut self, suffix: &str) -> Self {
        self.append = Some(suffix.to_string());
        self
    }

    /// Appends `+recovered` to the context in the recovery callback.
    pub fn rebuilding(mut self) -> Self {
        self.rebuild = true;
        self
    }

    pub fn traced(mut self, trail: &Trail) -> Self {
        self.trail = Some(Arc::clone(trail));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commits(&self) -> Vec<(u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Commit(id, ctx) => Some((id, ctx)),
                _ => None,
            })
            .collect()
    }

    pub fn aborts(&self) -> Vec<(u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Abort(id, ctx) => Some((id, ctx)),
                _ => None,
            })
            .collect()
    }

    pub fn prepares(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Prepare(_))).count()
    }

    fn record(&self, call: Call, phase: &str, id: u64) {
        self.calls.lock().unwrap().push(call);
        if let Some(trail) = &self.trail {
            trail.lock().unwrap().push(format!("{}:{}:{}", self.name, phase, id));
        }
    }
}

impl Participant<String> for Recorder {
    fn prepare(&self, id: u64, context: &mut String) -> Result<Vote, ParticipantError> {
        self.record(Call::Prepare(id), "prepare", id);
        if self.panic_prepare {
            panic!("{} exploded in prepare", self.name);
        }
        if self.fail_prepare {
            return Err(ParticipantError::Failed(format!("{} refused", self.name)));
        }
        if let Some(suffix) = &self.append {
            context.push_str(suffix);
        }
        Ok(self.vote)
    }

    fn prepare_for_abort(&self, id: u64, _context: &mut String) -> Result<Vote, ParticipantError> {
        self.record(Call::PrepareForAbort(id), "prepare_for_abort", id);
        Ok(self.abort_vote.unwrap_or(Vote::ABORTED | Vote::NO_JOIN))
    }

    fn commit(&self, id: u64, context: &String) -> Result<(), ParticipantError> {
        self.record(Call::Commit(id, context.clone()), "commit", id);
        if self.fail_commit {
            return Err(ParticipantError::Failed(format!("{} could not commit", self.name)));
        }
        Ok(())
    }

    fn abort(&self, id: u64, context: &String) -> Result<(), ParticipantError> {
        self.record(Call::Abort(id, context.clone()), "abort", id);
        Ok(())
    }

    fn select(&self, _id: u64, _context: &String) -> Vec<String> {
        self.groups.clone()
    }

    fn recover(&self, id: u64, context: String, commit: bool) -> String {
        self.record(Call::Recover(id, commit), "recover", id);
        if self.rebuild {
            format!("{}+recovered", context)
        } else {
            context
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
