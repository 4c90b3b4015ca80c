use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::ParticipantError;

/// Outcome of a prepare call: a bit-set over the vote and its modifiers.
///
/// `PREPARED` and `ABORTED` decide the vote (an outcome without the
/// `PREPARED` bit is an abort). `READONLY` skips the context resnapshot after
/// the step; `NO_JOIN` keeps the participant out of the commit or abort walk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vote(u8);

impl Vote {
    pub const ABORTED: Vote = Vote(0);
    pub const PREPARED: Vote = Vote(1);
    pub const READONLY: Vote = Vote(2);
    pub const NO_JOIN: Vote = Vote(4);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Vote) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_prepared(self) -> bool {
        self.contains(Vote::PREPARED)
    }

    pub const fn is_readonly(self) -> bool {
        self.contains(Vote::READONLY)
    }

    /// Whether the participant takes part in the commit or abort walk.
    pub const fn joins(self) -> bool {
        !self.contains(Vote::NO_JOIN)
    }
}

impl BitOr for Vote {
    type Output = Vote;

    fn bitor(self, rhs: Vote) -> Vote {
        Vote(self.0 | rhs.0)
    }
}

impl BitOrAssign for Vote {
    fn bitor_assign(&mut self, rhs: Vote) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_prepared() { "PREPARED" } else { "ABORTED" })?;
        if self.is_readonly() {
            f.write_str("|READONLY")?;
        }
        if !self.joins() {
            f.write_str("|NO_JOIN")?;
        }
        Ok(())
    }
}

/// One step of a transaction pipeline.
///
/// `prepare` runs for every transaction until some participant votes abort;
/// from then on `prepare_for_abort` runs instead. Participants that joined
/// then see exactly one of `commit` or `abort`, in join order.
///
/// Errors and panics raised from `prepare` count as an abort vote. Errors and
/// panics raised from `commit` or `abort` are logged and never stop the walk.
pub trait Participant<C>: Send + Sync {
    fn prepare(&self, id: u64, context: &mut C) -> Result<Vote, ParticipantError>;

    /// Called in place of `prepare` once an upstream participant voted abort.
    /// Participants that do not override it stay out of the abort walk.
    fn prepare_for_abort(&self, _id: u64, _context: &mut C) -> Result<Vote, ParticipantError> {
        Ok(Vote::ABORTED | Vote::NO_JOIN)
    }

    fn commit(&self, id: u64, context: &C) -> Result<(), ParticipantError>;

    fn abort(&self, id: u64, context: &C) -> Result<(), ParticipantError>;

    /// Group selection. Consulted after a `PREPARED` vote while the
    /// transaction is not aborting; a non-empty answer replaces the rest of the
    /// pipeline with the named groups, in order.
    fn select(&self, _id: u64, _context: &C) -> Vec<String> {
        Vec::new()
    }

    /// Gives the participant a chance to rebuild the journaled context before
    /// recovery replays `commit` (`commit == true`) or `abort`.
    fn recover(&self, _id: u64, context: C, _commit: bool) -> C {
        context
    }

    /// Name used in the transaction log trail.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Gives a participant the name of its configuration descriptor.
pub struct Named<C> {
    name: String,
    inner: Arc<dyn Participant<C>>,
}

impl<C> Named<C> {
    pub fn new(name: impl Into<String>, inner: Arc<dyn Participant<C>>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }
}

impl<C> Participant<C> for Named<C> {
    fn prepare(&self, id: u64, context: &mut C) -> Result<Vote, ParticipantError> {
        self.inner.prepare(id, context)
    }

    fn prepare_for_abort(&self, id: u64, context: &mut C) -> Result<Vote, ParticipantError> {
        self.inner.prepare_for_abort(id, context)
    }

    fn commit(&self, id: u64, context: &C) -> Result<(), ParticipantError> {
        self.inner.commit(id, context)
    }

    fn abort(&self, id: u64, context: &C) -> Result<(), ParticipantError> {
        self.inner.abort(id, context)
    }

    fn select(&self, id: u64, context: &C) -> Vec<String> {
        self.inner.select(id, context)
    }

    fn recover(&self, id: u64, context: C, commit: bool) -> C {
        self.inner.recover(id, context, commit)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
