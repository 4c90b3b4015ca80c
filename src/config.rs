use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::{ParticipantError, Result, TxnError};
use crate::journal::JournalValue;
use crate::manager::{Context, ParticipantRef, Request, TransactionManagerBuilder};
use crate::participant::Named;
use crate::space::SpaceRegistry;

/// Names a participant implementation and carries its own settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ParticipantDescriptor {
    pub class: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ParticipantDescriptor {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Default::default()
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

fn default_sessions() -> usize {
    1
}

fn default_initial_tail() -> u64 {
    1
}

fn default_max_participants() -> usize {
    1000
}

fn default_journal_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

/// Declarative transaction manager configuration, typically read from JSON.
///
/// ```json
/// {
///   "queue": "txnmgr",
///   "sessions": 4,
///   "input_space": "tspace:default",
///   "journal_space": "jdbm:journal:/var/lib/txnmgr",
///   "participants": [{ "class": "validate" }, { "class": "route" }],
///   "groups": { "credit": [{ "class": "post", "name": "post-credit" }] }
/// }
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TransactionManagerConfig {
    pub queue: String,
    #[serde(default = "default_sessions")]
    pub sessions: usize,
    #[serde(default = "default_initial_tail")]
    pub initial_tail: u64,
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,
    #[serde(default = "default_journal_retries")]
    pub journal_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Space URI of the input queue; a private transient space when absent.
    #[serde(default)]
    pub input_space: Option<String>,
    /// Space URI of the journal; a private transient space when absent.
    #[serde(default)]
    pub journal_space: Option<String>,
    #[serde(default)]
    pub participants: Vec<ParticipantDescriptor>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<ParticipantDescriptor>>,
}

impl TransactionManagerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            sessions: default_sessions(),
            initial_tail: default_initial_tail(),
            max_participants: default_max_participants(),
            journal_retries: default_journal_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            input_space: None,
            journal_space: None,
            participants: Vec::new(),
            groups: BTreeMap::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Resolves spaces and participants into a ready builder.
    pub fn builder<C: Context>(
        &self,
        participants: &ParticipantRegistry<C>,
        spaces: &SpaceRegistry,
    ) -> Result<TransactionManagerBuilder<C>> {
        let mut builder = TransactionManagerBuilder::new(self.queue.clone())
            .sessions(self.sessions)
            .initial_tail(self.initial_tail)
            .max_participants(self.max_participants)
            .journal_retries(self.journal_retries)
            .retry_backoff(Duration::from_millis(self.retry_backoff_ms));
        if let Some(uri) = &self.input_space {
            builder = builder.input_space(spaces.lookup::<String, Request<C>>(uri)?);
        }
        if let Some(uri) = &self.journal_space {
            builder = builder.journal_space(spaces.lookup::<String, JournalValue>(uri)?);
        }
        for descriptor in &self.participants {
            builder = builder.participant(participants.create(descriptor)?);
        }
        for (group, members) in &self.groups {
            for descriptor in members {
                builder = builder.group_participant(group.clone(), participants.create(descriptor)?);
            }
        }
        Ok(builder)
    }
}

pub type ParticipantFactory<C> =
    Box<dyn Fn(&ParticipantDescriptor) -> std::result::Result<ParticipantRef<C>, ParticipantError> + Send + Sync>;

/// Maps participant class names to constructors.
pub struct ParticipantRegistry<C> {
    factories: HashMap<String, ParticipantFactory<C>>,
}

impl<C: 'static> Default for ParticipantRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: 'static> ParticipantRegistry<C> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, class: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&ParticipantDescriptor) -> std::result::Result<ParticipantRef<C>, ParticipantError> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Box::new(factory));
        self
    }

    /// Registers one shared instance under `class`.
    pub fn register_instance(&mut self, class: impl Into<String>, participant: ParticipantRef<C>) -> &mut Self {
        self.register(class, move |_| Ok(Arc::clone(&participant)))
    }

    pub fn create(&self, descriptor: &ParticipantDescriptor) -> Result<ParticipantRef<C>> {
        let factory = self
            .factories
            .get(&descriptor.class)
            .ok_or_else(|| TxnError::UnknownParticipant(descriptor.class.clone()))?;
        let participant = factory(descriptor)?;
        debug!("Created participant {}", descriptor.name.as_deref().unwrap_or(&descriptor.class));
        let participant: ParticipantRef<C> = match &descriptor.name {
            Some(name) => Arc::new(Named::new(name.clone(), participant)),
            None => participant,
        };
        Ok(participant)
    }
}
