use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TxnError};
use crate::journal::{self, Journal, JournalSpace, JournalValue, Member, TxnState};
use crate::participant::{Participant, Vote};
use crate::space::{LocalSpace, Space};

/// Work items a manager can carry: anything that can be journaled and handed
/// between threads.
pub trait Context: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> Context for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// An item of the input queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Request<C> {
    Process(C),
    /// Unblocks an idle session during shutdown; never processed.
    Wakeup,
}

pub type InputSpace<C> = Arc<dyn Space<String, Request<C>>>;
pub type ParticipantRef<C> = Arc<dyn Participant<C>>;

/// Running totals of a manager's outcomes.
#[derive(Debug, Default)]
pub struct TransactionStats {
    committed: AtomicU64,
    aborted: AtomicU64,
    no_join: AtomicU64,
    recovered_commits: AtomicU64,
    recovered_aborts: AtomicU64,
    rejected: AtomicU64,
    restarts: AtomicU64,
}

impl TransactionStats {
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.aborted.load(Ordering::Relaxed)
    }

    /// Transactions that prepared with no participant joining.
    pub fn no_join(&self) -> u64 {
        self.no_join.load(Ordering::Relaxed)
    }

    pub fn recovered_commits(&self) -> u64 {
        self.recovered_commits.load(Ordering::Relaxed)
    }

    pub fn recovered_aborts(&self) -> u64 {
        self.recovered_aborts.load(Ordering::Relaxed)
    }

    /// Work items discarded because their context could not be journaled.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Session loops restarted after a journal or queue failure.
    pub fn restarts(&self) -> u64 {
        self.restarts.load(Ordering::Relaxed)
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Shared<C> {
    queue: String,
    sessions: usize,
    max_participants: usize,
    initial_tail: u64,
    restart_backoff: Duration,
    input: InputSpace<C>,
    journal: Journal,
    participants: Vec<ParticipantRef<C>>,
    groups: HashMap<String, Vec<ParticipantRef<C>>>,
    /// Serializes id assignment together with the durable HEAD write.
    head_lock: Mutex<()>,
    head: AtomicU64,
    tail: AtomicU64,
    tail_lock: String,
    running: AtomicBool,
    stats: TransactionStats,
}

impl<C: Context> Shared<C> {
    fn run_session(&self, session: usize) {
        debug!("Session {} waiting on {}", session, self.queue);
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.serve() {
                error!("Session {} on {} failed: {}; restarting", session, self.queue, e);
                TransactionStats::bump(&self.stats.restarts);
                thread::sleep(self.restart_backoff);
            }
        }
        debug!("Session {} on {} exiting", session, self.queue);
    }

    /// Takes one item off the input queue and drives it to completion.
    fn serve(&self) -> Result<()> {
        let context = match self.input.take(&self.queue)? {
            Request::Process(context) => context,
            Request::Wakeup => return Ok(()),
        };
        let snapshot = match bincode::serialize(&context) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Rejecting work item from {}: {}", self.queue, e);
                TransactionStats::bump(&self.stats.rejected);
                return Ok(());
            }
        };
        let id = match self.begin(snapshot) {
            Ok(id) => id,
            Err(e) => {
                // Nothing ran yet, so the item can go back to the front.
                if let Err(requeue) = self.input.push(self.queue.clone(), Request::Process(context)) {
                    error!("Work item from {} lost after journal failure: {}", self.queue, requeue);
                }
                return Err(e);
            }
        };
        self.process(id, context)
    }

    /// Assigns the next id and writes the initial snapshot.
    fn begin(&self, snapshot: Vec<u8>) -> Result<u64> {
        let id = {
            let _head = self.head_lock.lock();
            let id = self.head.load(Ordering::SeqCst);
            self.journal.set_counter(journal::HEAD, id + 1)?;
            self.head.store(id + 1, Ordering::SeqCst);
            id
        };
        let written = self
            .journal
            .set_context(id, snapshot)
            .and_then(|_| self.journal.set_state(id, TxnState::Preparing));
        if let Err(e) = written {
            // The id is burned; mark it done so the tail can move past it.
            if self.journal.set_state(id, TxnState::Done).is_ok() {
                if let Err(advance) = self.finished(id) {
                    error!("Txn {} could not advance the tail: {}", id, advance);
                }
            }
            return Err(e.into());
        }
        debug!("Txn {} started on {}", id, self.queue);
        Ok(id)
    }

    fn process(&self, id: u64, mut context: C) -> Result<()> {
        let mut joined = Vec::new();
        let settled = self
            .prepare(id, &mut context, &mut joined)
            .and_then(|prepared| self.settle(id, &context, &joined, prepared));
        if let Err(e) = settled {
            // Nothing has committed yet and the journal still reads PREPARING,
            // so aborting here is what recovery would do.
            error!("Txn {} lost a journal write, aborting: {}", id, e);
            self.conclude(id, &context, &joined, false);
            TransactionStats::bump(&self.stats.aborted);
        }
        self.mark_done(id)?;
        debug!("Txn {} done", id);
        self.finished(id)
    }

    fn settle(&self, id: u64, context: &C, joined: &[ParticipantRef<C>], prepared: bool) -> Result<()> {
        match (prepared, joined.is_empty()) {
            (true, true) => {
                debug!("Txn {} prepared with no participant joined", id);
                TransactionStats::bump(&self.stats.no_join);
            }
            (true, false) => {
                self.journal.set_state(id, TxnState::Committing)?;
                self.conclude(id, context, joined, true);
                TransactionStats::bump(&self.stats.committed);
            }
            (false, _) => {
                self.conclude(id, context, joined, false);
                TransactionStats::bump(&self.stats.aborted);
            }
        }
        Ok(())
    }

    /// Keeps retrying while the manager runs; an id that never reaches DONE
    /// holds the tail back until the next recovery.
    fn mark_done(&self, id: u64) -> Result<()> {
        loop {
            match self.journal.set_state(id, TxnState::Done) {
                Ok(()) => return Ok(()),
                Err(e) if self.running.load(Ordering::SeqCst) => {
                    error!("Txn {} could not be marked done, retrying: {}", id, e);
                    thread::sleep(self.restart_backoff);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Walks the pipeline collecting votes into `joined`, journaling each join.
    /// Group selections replace the remaining work-list; the configured
    /// default list is never touched. Returns whether every vote prepared.
    fn prepare(&self, id: u64, context: &mut C, joined: &mut Vec<ParticipantRef<C>>) -> Result<bool> {
        let mut pending: VecDeque<(Member, ParticipantRef<C>)> = self
            .participants
            .iter()
            .enumerate()
            .map(|(index, p)| (Member::pipeline(index), Arc::clone(p)))
            .collect();
        let mut aborting = false;
        let mut visited = 0;
        while let Some((member, participant)) = pending.pop_front() {
            visited += 1;
            if visited > self.max_participants {
                warn!(
                    "Txn {} visited more than {} participants, forcing abort",
                    id, self.max_participants
                );
                aborting = true;
                break;
            }

            let vote = self.vote(id, participant.as_ref(), context, aborting);
            if !vote.is_prepared() {
                aborting = true;
            }
            if vote.joins() {
                joined.push(Arc::clone(&participant));
                self.journal.add_joined(id, &member)?;
            }
            if !vote.is_readonly() {
                match bincode::serialize(&*context) {
                    Ok(bytes) => self.journal.set_context(id, bytes)?,
                    Err(e) => {
                        warn!("Txn {} context no longer serializes after {}: {}", id, participant.name(), e);
                        aborting = true;
                    }
                }
            }
            if aborting {
                continue;
            }

            let selected = participant.select(id, context);
            if selected.is_empty() {
                continue;
            }
            pending.clear();
            for group in selected {
                self.journal.add_group(id, &group)?;
                match self.groups.get(&group) {
                    Some(members) => pending.extend(
                        members
                            .iter()
                            .enumerate()
                            .map(|(index, p)| (Member::group(group.as_str(), index), Arc::clone(p))),
                    ),
                    None => warn!("Txn {} selected unknown group {}", id, group),
                }
            }
        }
        Ok(!aborting)
    }

    fn vote(&self, id: u64, participant: &dyn Participant<C>, context: &mut C, aborting: bool) -> Vote {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            if aborting {
                participant.prepare_for_abort(id, context)
            } else {
                participant.prepare(id, context)
            }
        }));
        match result {
            Ok(Ok(vote)) => {
                debug!("Txn {} {} voted {:?}", id, participant.name(), vote);
                vote
            }
            Ok(Err(e)) => {
                warn!("Txn {} prepare failed in {}: {}", id, participant.name(), e);
                Vote::ABORTED
            }
            Err(panic) => {
                warn!(
                    "Txn {} prepare panicked in {}: {}",
                    id,
                    participant.name(),
                    panic_message(panic.as_ref())
                );
                Vote::ABORTED
            }
        }
    }

    /// Runs commit or abort on every participant in order. Failures are
    /// collected and logged; they never stop the walk.
    fn conclude(&self, id: u64, context: &C, participants: &[ParticipantRef<C>], commit: bool) -> usize {
        let phase = if commit { "commit" } else { "abort" };
        let failures: Vec<String> = participants
            .iter()
            .filter_map(|participant| {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    if commit {
                        participant.commit(id, context)
                    } else {
                        participant.abort(id, context)
                    }
                }));
                let failure = match result {
                    Ok(Ok(())) => return None,
                    Ok(Err(e)) => e.to_string(),
                    Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
                };
                Some(format!("{}: {}", participant.name(), failure))
            })
            .collect();
        for failure in &failures {
            warn!("Txn {} {} failed in {}", id, phase, failure);
        }
        failures.len()
    }

    fn finished(&self, id: u64) -> Result<()> {
        if id == self.tail.load(Ordering::SeqCst) {
            self.advance_tail()?;
        }
        Ok(())
    }

    /// Purges contiguous DONE records from the tail under the journal token.
    fn advance_tail(&self) -> Result<()> {
        self.journal.acquire(&self.tail_lock)?;
        let swept = self.sweep_done();
        let released = self.journal.release(&self.tail_lock);
        swept?;
        released?;
        Ok(())
    }

    fn sweep_done(&self) -> Result<()> {
        let start = self.tail.load(Ordering::SeqCst);
        let mut tail = start;
        while self.journal.state(tail)? == Some(TxnState::Done) {
            self.journal.purge(tail)?;
            tail += 1;
            // Published before the next state is read, so a session finishing
            // `tail` right now either sees it and sweeps, or is seen done here.
            self.tail.store(tail, Ordering::SeqCst);
        }
        if tail != start {
            self.journal.set_counter(journal::TAIL, tail)?;
            debug!("Tail of {} advanced {} -> {}", self.queue, start, tail);
        }
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        self.journal.seed_token(&self.tail_lock)?;
        let tail = self.journal.counter(journal::TAIL)?.unwrap_or(self.initial_tail);
        let head = self.journal.counter(journal::HEAD)?.unwrap_or(tail).max(tail);
        if head > tail {
            info!("Recovering transactions {}..{} of {}", tail, head, self.queue);
        }
        for id in tail..head {
            self.recover_one(id)?;
        }
        self.journal.set_counter(journal::HEAD, head)?;
        self.journal.set_counter(journal::TAIL, head)?;
        self.head.store(head, Ordering::SeqCst);
        self.tail.store(head, Ordering::SeqCst);
        self.advance_tail()
    }

    fn recover_one(&self, id: u64) -> Result<()> {
        match self.journal.state(id)? {
            Some(TxnState::Done) => debug!("Txn {} was done, purging", id),
            Some(state) => {
                let commit = state == TxnState::Committing;
                match self.journal.context(id)?.map(|bytes| bincode::deserialize::<C>(&bytes)) {
                    Some(Ok(context)) => {
                        let pipeline = self.pipeline_of(id)?;
                        let context = pipeline
                            .iter()
                            .fold(context, |context, p| self.recover_context(id, p.as_ref(), context, commit));
                        info!(
                            "Txn {} was {}, replaying {} on {} participants",
                            id,
                            state,
                            if commit { "commit" } else { "abort" },
                            pipeline.len()
                        );
                        self.conclude(id, &context, &pipeline, commit);
                        if commit {
                            TransactionStats::bump(&self.stats.recovered_commits);
                        } else {
                            TransactionStats::bump(&self.stats.recovered_aborts);
                        }
                    }
                    Some(Err(e)) => error!("Txn {} context cannot be decoded, not replayed: {}", id, e),
                    None => warn!("Txn {} was {} without a context, not replayed", id, state),
                }
            }
            None => {
                if self.journal.context(id)?.is_some() {
                    debug!("Dropping orphan context of txn {}", id);
                }
            }
        }
        self.journal.purge(id)?;
        Ok(())
    }

    /// The participants that joined `id`, in join order.
    fn pipeline_of(&self, id: u64) -> Result<Vec<ParticipantRef<C>>> {
        let groups = self.journal.groups(id)?;
        if !groups.is_empty() {
            debug!("Txn {} had selected groups {:?}", id, groups);
        }
        let mut pipeline = Vec::new();
        for member in self.journal.joined(id)? {
            match self.resolve(&member) {
                Some(participant) => pipeline.push(participant),
                None => warn!("Txn {} joined participant {} is no longer configured", id, member),
            }
        }
        Ok(pipeline)
    }

    fn resolve(&self, member: &Member) -> Option<ParticipantRef<C>> {
        match &member.group {
            None => self.participants.get(member.index).cloned(),
            Some(group) => self.groups.get(group).and_then(|members| members.get(member.index)).cloned(),
        }
    }

    fn recover_context(&self, id: u64, participant: &dyn Participant<C>, context: C, commit: bool) -> C {
        let fallback = context.clone();
        panic::catch_unwind(AssertUnwindSafe(move || participant.recover(id, context, commit))).unwrap_or_else(
            |panic| {
                warn!(
                    "Txn {} recover panicked in {}: {}",
                    id,
                    participant.name(),
                    panic_message(panic.as_ref())
                );
                fallback
            },
        )
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Drives work items from an input queue through a pipeline of participants,
/// journaling every step so a restart can finish what a crash interrupted.
///
/// Each of the configured sessions is an OS thread blocked on the input queue.
/// A dequeued item gets the next id from the durable HEAD counter, is
/// snapshotted as PREPARING, walks the participants' prepare phase, then their
/// commit (after a durable COMMITTING transition) or abort phase, and is
/// finally marked DONE. Journal records are purged contiguously from the TAIL
/// counter once they are done.
///
/// A journal space serves one running manager at a time: ids are handed out
/// from an in-memory copy of `$HEAD`. A stopped manager's journal can be
/// picked up by another one, which continues the id sequence.
///
/// ```no_run
/// use std::sync::Arc;
/// use txnspace::prelude::*;
///
/// struct Echo;
///
/// impl Participant<String> for Echo {
///     fn prepare(&self, _id: u64, _ctx: &mut String) -> Result<Vote, ParticipantError> {
///         Ok(Vote::PREPARED | Vote::READONLY)
///     }
///     fn commit(&self, id: u64, ctx: &String) -> Result<(), ParticipantError> {
///         println!("{} committed {}", id, ctx);
///         Ok(())
///     }
///     fn abort(&self, _id: u64, _ctx: &String) -> Result<(), ParticipantError> {
///         Ok(())
///     }
/// }
///
/// let manager = TransactionManager::<String>::builder("txnmgr")
///     .sessions(2)
///     .participant(Arc::new(Echo))
///     .build()
///     .unwrap();
/// manager.start().unwrap();
/// manager.submit("ping".to_string()).unwrap();
/// manager.stop();
/// ```
pub struct TransactionManager<C: Context> {
    shared: Arc<Shared<C>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<C: Context> TransactionManager<C> {
    pub fn builder(queue: impl Into<String>) -> TransactionManagerBuilder<C> {
        TransactionManagerBuilder::new(queue)
    }

    /// Recovers the journal, then spawns the worker sessions.
    pub fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(TxnError::AlreadyRunning);
        }
        if let Err(e) = self.shared.recover() {
            error!("Recovery of {} failed: {}", self.shared.queue, e);
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e);
        }
        let mut workers = self.workers.lock();
        for session in 0..self.shared.sessions {
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("{}-session-{}", self.shared.queue, session))
                .spawn(move || shared.run_session(session));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    drop(workers);
                    self.stop();
                    return Err(e.into());
                }
            }
        }
        info!(
            "Transaction manager on {} started with {} sessions (head {}, tail {})",
            self.shared.queue,
            self.shared.sessions,
            self.head(),
            self.tail()
        );
        Ok(())
    }

    /// Wakes every idle session with a sentinel and waits for all of them to
    /// exit. Transactions in flight run to completion first.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for _ in 0..self.shared.sessions {
            if let Err(e) = self.shared.input.out(self.shared.queue.clone(), Request::Wakeup) {
                error!("Could not wake a session of {}: {}", self.shared.queue, e);
            }
        }
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("A session thread of {} panicked", self.shared.queue);
            }
        }
        info!("Transaction manager on {} stopped", self.shared.queue);
    }

    /// Enqueues a work item on the input queue.
    pub fn submit(&self, context: C) -> Result<()> {
        self.shared.input.out(self.shared.queue.clone(), Request::Process(context))?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &str {
        &self.shared.queue
    }

    /// Next id to be assigned.
    pub fn head(&self) -> u64 {
        self.shared.head.load(Ordering::SeqCst)
    }

    /// Lowest id whose journal records have not been purged.
    pub fn tail(&self) -> u64 {
        self.shared.tail.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &TransactionStats {
        &self.shared.stats
    }

    pub fn input_space(&self) -> &InputSpace<C> {
        &self.shared.input
    }
}

impl<C: Context> Drop for TransactionManager<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Programmatic configuration of a [`TransactionManager`].
pub struct TransactionManagerBuilder<C> {
    queue: String,
    sessions: usize,
    initial_tail: u64,
    max_participants: usize,
    journal_retries: u32,
    retry_backoff: Duration,
    input: Option<InputSpace<C>>,
    journal: Option<JournalSpace>,
    participants: Vec<ParticipantRef<C>>,
    groups: HashMap<String, Vec<ParticipantRef<C>>>,
}

impl<C: Context> TransactionManagerBuilder<C> {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            sessions: 1,
            initial_tail: 1,
            max_participants: 1000,
            journal_retries: 3,
            retry_backoff: Duration::from_millis(100),
            input: None,
            journal: None,
            participants: Vec::new(),
            groups: HashMap::new(),
        }
    }

    pub fn sessions(mut self, sessions: usize) -> Self {
        self.sessions = sessions;
        self
    }

    /// First id used by a fresh journal.
    pub fn initial_tail(mut self, tail: u64) -> Self {
        self.initial_tail = tail;
        self
    }

    /// Cap on participants visited by one prepare walk; exceeding it aborts.
    pub fn max_participants(mut self, max: usize) -> Self {
        self.max_participants = max;
        self
    }

    pub fn journal_retries(mut self, retries: u32) -> Self {
        self.journal_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Appends a participant to the default pipeline.
    pub fn participant(mut self, participant: ParticipantRef<C>) -> Self {
        self.participants.push(participant);
        self
    }

    /// Appends a participant to the named group.
    pub fn group_participant(mut self, group: impl Into<String>, participant: ParticipantRef<C>) -> Self {
        self.groups.entry(group.into()).or_default().push(participant);
        self
    }

    pub fn group(mut self, group: impl Into<String>, members: Vec<ParticipantRef<C>>) -> Self {
        self.groups.entry(group.into()).or_default().extend(members);
        self
    }

    /// Defaults to a private transient space.
    pub fn input_space(mut self, space: InputSpace<C>) -> Self {
        self.input = Some(space);
        self
    }

    /// Defaults to a private transient space, which survives no restart.
    /// Must not be shared with another running manager.
    pub fn journal_space(mut self, space: JournalSpace) -> Self {
        self.journal = Some(space);
        self
    }

    pub fn build(self) -> Result<TransactionManager<C>> {
        if self.queue.is_empty() {
            return Err(TxnError::Config("queue name must not be empty".to_string()));
        }
        if self.sessions == 0 {
            return Err(TxnError::Config("at least one session is required".to_string()));
        }
        if self.max_participants == 0 {
            return Err(TxnError::Config("max_participants must be positive".to_string()));
        }
        let input: InputSpace<C> = match self.input {
            Some(space) => space,
            None => Arc::new(LocalSpace::<String, Request<C>>::transient()),
        };
        let journal: JournalSpace = match self.journal {
            Some(space) => space,
            None => Arc::new(LocalSpace::<String, JournalValue>::transient()),
        };
        let shared = Shared {
            tail_lock: journal::tail_lock_key(&self.queue),
            queue: self.queue,
            sessions: self.sessions,
            max_participants: self.max_participants,
            initial_tail: self.initial_tail,
            restart_backoff: self.retry_backoff,
            input,
            journal: Journal::new(journal, self.journal_retries, self.retry_backoff),
            participants: self.participants,
            groups: self.groups,
            head_lock: Mutex::new(()),
            head: AtomicU64::new(self.initial_tail),
            tail: AtomicU64::new(self.initial_tail),
            running: AtomicBool::new(false),
            stats: TransactionStats::default(),
        };
        Ok(TransactionManager {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
        })
    }
}
