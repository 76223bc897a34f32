//! # store
//!
//! why: the replicated state machine itself
//! relations: owned by the service's apply task, fed committed commands in index order
//! what: KvStore with get/put/cas and a strict in-order apply

use std::collections::BTreeMap;

use tracing::trace;

use crate::command::{Command, CommandKind, CommandResult};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
    last_applied: u64,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> CommandResult {
        match self.data.get(key) {
            Some(value) => CommandResult {
                value: value.clone(),
                key_found: true,
            },
            None => CommandResult::default(),
        }
    }

    /// Set `key`, returning the previous value if there was one
    pub fn put(&mut self, key: &str, value: &str) -> CommandResult {
        match self.data.insert(key.to_string(), value.to_string()) {
            Some(prev) => CommandResult {
                value: prev,
                key_found: true,
            },
            None => CommandResult::default(),
        }
    }

    /// Set `key` to `value` only if it currently holds `compare`.
    ///
    /// Always returns what the key held before the call.
    pub fn cas(&mut self, key: &str, compare: &str, value: &str) -> CommandResult {
        match self.data.get_mut(key) {
            Some(current) => {
                let prev = current.clone();
                if prev == compare {
                    *current = value.to_string();
                }
                CommandResult {
                    value: prev,
                    key_found: true,
                }
            }
            None => CommandResult::default(),
        }
    }

    /// Apply the command committed at `index`, which must directly follow the
    /// last one applied.
    pub fn apply(&mut self, index: u64, command: &Command) -> Result<CommandResult> {
        if index != self.last_applied + 1 {
            return Err(Error::Fatal(format!(
                "commit index {index} does not follow last applied {}",
                self.last_applied
            )));
        }
        self.last_applied = index;

        let result = match command.kind {
            CommandKind::Get => self.get(&command.key),
            CommandKind::Put => self.put(&command.key, &command.value),
            CommandKind::Cas => self.cas(&command.key, &command.compare, &command.value),
        };
        trace!(index, kind = ?command.kind, key = %command.key, "applied");
        Ok(result)
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy of the current contents, for diagnostics
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }
}
