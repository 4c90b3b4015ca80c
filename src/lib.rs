//! Txnspace: a crash-recoverable transaction pipeline driven by a persistent
//! associative space.
//!
//! The [`space`] module provides the coordination primitive: a concurrent,
//! optionally durable, key-addressed multi-map with blocking take/read, leases,
//! templates and listeners. The [`manager`] module builds the
//! [`TransactionManager`] on top of it: worker sessions pull work items off an
//! input space and drive them through a configurable pipeline of
//! [`Participant`]s, journaling every step into a second space so that a restart
//! finishes whatever a crash interrupted.

pub mod config;
pub mod errors;
pub mod journal;
pub mod manager;
pub mod participant;
pub mod space;

// Re-export key types for easier access
pub use config::{ParticipantDescriptor, ParticipantRegistry, TransactionManagerConfig};
pub use errors::{ParticipantError, Result, SpaceError, TxnError};
pub use journal::{JournalValue, Member, TxnState};
pub use manager::{Context, Request, TransactionManager, TransactionManagerBuilder, TransactionStats};
pub use participant::{Participant, Vote};
pub use space::{LocalSpace, Space, SpaceRegistry};

/// Txnspace Prelude
pub mod prelude {
    pub use crate::config::*;
    pub use crate::errors::{ParticipantError, SpaceError, TxnError};
    pub use crate::journal::{JournalValue, Member, TxnState};
    pub use crate::manager::*;
    pub use crate::participant::*;
    pub use crate::space::{
        Access, Digest, Equals, Lease, LocalSpace, Matcher, Position, Space, SpaceListener, SpaceRegistry,
        SpaceUri, Template, Wait,
    };
    #[cfg(feature = "persistent")]
    pub use crate::space::PersistentOptions;
}
